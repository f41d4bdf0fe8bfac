use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("capture cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("failed to resolve playlist URL: {reason}")]
    UrlResolve { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("playlist fetch failed after {attempts} attempts: {reason}")]
    PlaylistFetchExhausted { attempts: u32, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl HlsError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn url_resolve(reason: impl Into<String>) -> Self {
        Self::UrlResolve {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Whether another poll attempt against a refreshed playlist URL can
    /// still succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::InvalidUrl { .. } | Self::Io { .. } => false,
            Self::UrlResolve { .. }
            | Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::Playlist { .. }
            | Self::PlaylistFetchExhausted { .. } => true,
        }
    }
}
