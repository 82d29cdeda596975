//! Supervision strategy for errors caught by the source stage

use crate::consumer::error::{ErrorClass, SourceError};
use std::fmt;
use std::sync::Arc;

/// What the stage does after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Drop the error and keep polling
    Resume,
    /// Keep polling; the client retries on its own
    Retry,
    /// Fail the stage with the error
    Stop,
}

type DeciderFn = dyn Fn(&SourceError) -> Directive + Send + Sync;

/// Maps a caught error to a [`Directive`]
///
/// The default strategy resumes, keeping the stream alive on recoverable
/// broker and deserialization errors.
#[derive(Clone)]
pub struct SupervisionStrategy {
    decider: Arc<DeciderFn>,
    name: &'static str,
}

impl SupervisionStrategy {
    /// Resume on every error
    pub fn resuming() -> Self {
        Self {
            decider: Arc::new(|_| Directive::Resume),
            name: "resuming",
        }
    }

    /// Retry on every error
    pub fn retrying() -> Self {
        Self {
            decider: Arc::new(|_| Directive::Retry),
            name: "retrying",
        }
    }

    /// Stop on every error
    pub fn stopping() -> Self {
        Self {
            decider: Arc::new(|_| Directive::Stop),
            name: "stopping",
        }
    }

    /// Custom decider
    pub fn from_fn<F>(decider: F) -> Self
    where
        F: Fn(&SourceError) -> Directive + Send + Sync + 'static,
    {
        Self {
            decider: Arc::new(decider),
            name: "custom",
        }
    }

    /// Ask the decider, without classification
    pub fn decide(&self, error: &SourceError) -> Directive {
        (self.decider)(error)
    }

    /// Decide for a broker error reported outside of a record
    ///
    /// Retriable errors never reach the decider, fatal ones always stop.
    pub fn decide_broker(&self, error: &SourceError) -> Directive {
        match error.as_broker().map(|e| e.class) {
            Some(ErrorClass::Retriable) => Directive::Resume,
            Some(ErrorClass::Fatal) => Directive::Stop,
            Some(ErrorClass::NonRetriable) | None => self.decide(error),
        }
    }
}

impl Default for SupervisionStrategy {
    fn default() -> Self {
        Self::resuming()
    }
}

impl fmt::Debug for SupervisionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisionStrategy")
            .field("decider", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::error::BrokerError;
    use rstest::rstest;

    fn broker(class: ErrorClass) -> SourceError {
        SourceError::Broker(BrokerError::new("Code", "reason", class))
    }

    #[test]
    fn test_default_is_resuming() {
        let strategy = SupervisionStrategy::default();
        let err = SourceError::Client("boom".to_string());
        assert_eq!(strategy.decide(&err), Directive::Resume);
        assert_eq!(format!("{:?}", strategy), "SupervisionStrategy { decider: \"resuming\" }");
    }

    #[rstest]
    #[case(ErrorClass::Retriable, Directive::Resume)]
    #[case(ErrorClass::NonRetriable, Directive::Stop)]
    #[case(ErrorClass::Fatal, Directive::Stop)]
    fn test_stopping_decider_with_classification(
        #[case] class: ErrorClass,
        #[case] expected: Directive,
    ) {
        let strategy = SupervisionStrategy::stopping();
        assert_eq!(strategy.decide_broker(&broker(class)), expected);
    }

    #[rstest]
    #[case(ErrorClass::Retriable, Directive::Resume)]
    #[case(ErrorClass::NonRetriable, Directive::Retry)]
    #[case(ErrorClass::Fatal, Directive::Stop)]
    fn test_fatal_overrides_decider(#[case] class: ErrorClass, #[case] expected: Directive) {
        let strategy = SupervisionStrategy::retrying();
        assert_eq!(strategy.decide_broker(&broker(class)), expected);
    }

    #[test]
    fn test_custom_decider() {
        let strategy = SupervisionStrategy::from_fn(|e| match e {
            SourceError::Deserialization { .. } => Directive::Stop,
            _ => Directive::Resume,
        });
        let err = SourceError::Deserialization {
            topic: "t".to_string(),
            partition: 0,
            offset: 1,
            reason: "bad".to_string(),
        };
        assert_eq!(strategy.decide(&err), Directive::Stop);
        assert_eq!(strategy.decide(&SourceError::Commit("rejected".to_string())), Directive::Resume);
    }
}
