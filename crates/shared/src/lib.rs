pub mod domain;
pub mod envelope;
pub mod error;
pub mod protocol;

pub use envelope::{Outcome, OutcomeExt};
pub use error::{AppError, ErrorCode};
