use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported range '{0}'. Use day, month, or year.")]
    InvalidRange(String),

    #[error("invalid power spec: {0}")]
    InvalidSpec(String),

    #[error("source '{0}' has no metrics backend mapping")]
    UnknownSource(String),

    #[error("metrics backend unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("malformed response from metrics backend: {0}")]
    MalformedResponse(String),

    #[error("cache not warmed yet for {source_name}/{range} (spec {spec_hash})")]
    CacheMiss {
        source_name: String,
        range: String,
        spec_hash: String,
    },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

impl AppError {
    /// Errors on the computation path that are answered with synthetic data
    /// instead of being surfaced to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamUnavailable(_)
                | AppError::MalformedResponse(_)
                | AppError::UnknownSource(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_computation_errors_are_recoverable() {
        assert!(AppError::UpstreamUnavailable("timeout".into()).is_recoverable());
        assert!(AppError::MalformedResponse("no data".into()).is_recoverable());
        assert!(AppError::UnknownSource("lab".into()).is_recoverable());

        assert!(!AppError::InvalidRange("week".into()).is_recoverable());
        assert!(!AppError::PersistenceFailure("locked".into()).is_recoverable());
        assert!(!AppError::CacheMiss {
            source_name: "clf".into(),
            range: "day".into(),
            spec_hash: "abc".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn cache_miss_message_is_actionable() {
        let err = AppError::CacheMiss {
            source_name: "clf".into(),
            range: "day".into(),
            spec_hash: "abc".into(),
        };
        assert!(err.to_string().contains("cache not warmed yet for clf/day"));
    }
}
