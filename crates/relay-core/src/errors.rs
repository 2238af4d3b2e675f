//! Error types shared across relay crates.

use thiserror::Error;

use crate::topic::TopicKind;

/// Failure to build a [`TopicId`](crate::topic::TopicId) from user input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseTopicError {
    /// Empty topic string.
    #[error("topic is empty")]
    Empty,
    /// Prefix is not one of `execution`, `user`, `workspace`, `global`.
    #[error("unknown topic kind: {0}")]
    UnknownKind(String),
    /// A scoped kind was given without a scope identifier.
    #[error("{0} topic requires a scope identifier")]
    MissingScope(TopicKind),
    /// The global topic was given a scope.
    #[error("global topic does not take a scope")]
    UnexpectedScope,
    /// User topics are keyed by integer principal IDs.
    #[error("user topic scope must be an integer user id, got {0:?}")]
    InvalidUserScope(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(ParseTopicError::Empty.to_string(), "topic is empty");
        assert_eq!(
            ParseTopicError::MissingScope(TopicKind::Execution).to_string(),
            "execution topic requires a scope identifier"
        );
        assert_eq!(
            ParseTopicError::UnknownKind("room".into()).to_string(),
            "unknown topic kind: room"
        );
    }
}
