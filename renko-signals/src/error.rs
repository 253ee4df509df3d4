use crate::instrument::InstrumentKey;
use thiserror::Error;

/// All errors generated in `renko-signals`.
///
/// Insufficient history and malformed prices are not errors: indicators return `None` and the
/// aggregators ignore the update.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to fetch history for {instrument}: {message}")]
    UpstreamFetch {
        instrument: InstrumentKey,
        message: String,
    },

    #[error("signal persistence failed: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tick dispatcher shard {shard} is closed")]
    ShardClosed { shard: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Determine if an error is isolated to a single instrument or write, such that the engine
    /// can continue processing everything else.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::UpstreamFetch { .. } => true,
            EngineError::Persistence(_) => true,
            _ => false,
        }
    }

    pub fn upstream(instrument: &InstrumentKey, message: impl Into<String>) -> Self {
        Self::UpstreamFetch {
            instrument: instrument.clone(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_is_recoverable() {
        struct TestCase {
            input: EngineError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: fetch failure only skips the instrument
                input: EngineError::upstream(&InstrumentKey::from("NSE_EQ|INE002A01018"), "429"),
                expected: true,
            },
            TestCase {
                // TC1: persistence failure never rolls back engine state
                input: EngineError::Persistence("disk full".to_string()),
                expected: true,
            },
            TestCase {
                // TC2: configuration errors stop startup
                input: EngineError::Config("time_frame3.lbp must be > 1".to_string()),
                expected: false,
            },
            TestCase {
                // TC3: a closed shard means the dispatcher is shutting down
                input: EngineError::ShardClosed { shard: 2 },
                expected: false,
            },
            TestCase {
                // TC4: I/O errors propagate
                input: EngineError::from(std::io::Error::other("closed")),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_recoverable();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_upstream_error_display() {
        let error = EngineError::upstream(&InstrumentKey::from("NSE_EQ|INE155A01022"), "timeout");
        assert_eq!(
            error.to_string(),
            "failed to fetch history for NSE_EQ|INE155A01022: timeout"
        );
    }
}
