//! Building blocks for feature screens: single-shot and streaming
//! operations, a cache/origin reconciliation store, and a per-screen
//! controller that binds them together.

pub mod cache;
pub mod config;
pub mod context;
pub mod controller;
pub mod operation;
pub mod origin;
pub mod store;
pub mod stream_operation;

pub use cache::{Cache, MemoryCache};
pub use config::{load_settings, ClientSettings, SettingsError};
pub use context::BackgroundContext;
pub use controller::{Controller, EventScope, EventToken, Screen, ScreenEvent};
pub use operation::{operation_fn, FnOperation, Operation};
pub use origin::{HttpOrigin, JsonClient, Origin};
pub use shared::{AppError, ErrorCode, Outcome, OutcomeExt};
pub use store::{StoreOperation, SynchronizedStore};
pub use stream_operation::{stream_fn, FnStreamOperation, StreamOperation};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
