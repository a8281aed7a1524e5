use std::sync::Arc;

/// Failures surfaced by blocking task, channel and choice operations.
///
/// Programmer misuse, such as attaching a channel end to a second choice,
/// is a contract violation and panics instead of returning a variant here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The channel, or an alternative of the choice, has been poisoned
    /// and no buffered data remains.
    #[error("channel poisoned")]
    Poisoned,
    /// The task has been cancelled.
    #[error("task cancelled: {}", .cause.as_deref().unwrap_or("no cause given"))]
    Cancelled {
        /// The message of the failure that triggered cancellation, if
        /// cancellation was caused by a panic escaping a task body.
        cause: Option<Arc<str>>,
    },
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_cause() {
        let plain = Error::Cancelled { cause: None };
        assert_eq!(plain.to_string(), "task cancelled: no cause given");
        let caused = Error::Cancelled {
            cause: Some(Arc::from("worker exploded")),
        };
        assert_eq!(caused.to_string(), "task cancelled: worker exploded");
        assert_eq!(Error::Poisoned.to_string(), "channel poisoned");
    }
}
