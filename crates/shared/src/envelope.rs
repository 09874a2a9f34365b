//! Result envelope moved between every layer of the client core.

use crate::error::AppError;

/// Exactly one of a value or a classified failure.
pub type Outcome<T> = Result<T, AppError>;

pub trait OutcomeExt<T> {
    fn error_message(&self) -> Option<&str>;
    fn inspect_failure(self, f: impl FnOnce(&AppError)) -> Self;
}

impl<T> OutcomeExt<T> for Outcome<T> {
    fn error_message(&self) -> Option<&str> {
        self.as_ref().err().map(AppError::message)
    }

    fn inspect_failure(self, f: impl FnOnce(&AppError)) -> Self {
        if let Err(err) = &self {
            f(err);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_is_exposed() {
        let failed: Outcome<u32> = Err(AppError::network("connection reset"));
        assert_eq!(failed.error_message(), Some("connection reset"));
        assert_eq!(Ok::<u32, AppError>(3).error_message(), None);
    }

    #[test]
    fn inspect_failure_only_sees_failures() {
        let mut seen = Vec::new();
        let _ = Ok::<u32, AppError>(1).inspect_failure(|err| seen.push(err.code()));
        let _ = Err::<u32, _>(AppError::timeout("slow")).inspect_failure(|err| seen.push(err.code()));
        assert_eq!(seen, vec![crate::ErrorCode::Timeout]);
    }
}
