#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// The broadcast exists but has not gone live yet. Retryable; the
    /// pre-start loop polls until this clears.
    #[error("livestream has not started yet")]
    NotStarted,

    #[error("invalid broadcast URL `{input}`")]
    InvalidUrl { input: String },

    #[error("failed to spawn resolver binary `{binary}`: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("resolver exited with {status}: {output}")]
    CommandFailed { status: String, output: String },

    #[error("failed to parse resolver output: {reason}")]
    Parse { reason: String },

    #[error("no qualities offered for the broadcast")]
    NoQualities,

    #[error("resolver produced no playlist URL: {output}")]
    NoPlaylist { output: String },
}

impl ResolverError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Only [`ResolverError::NotStarted`] is worth another pre-start poll;
    /// everything else fails the job.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotStarted)
    }
}
