use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("fetch of {request} failed (last remote status: {status}): {reason}")]
    Fetch {
        request: String,
        status: String,
        reason: String,
    },

    #[error("integrity error: expected {expected} bytes, got {actual}")]
    Integrity { expected: u64, actual: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn fetch(request: impl Into<String>, status: impl Into<String>, reason: impl ToString) -> Self {
        Error::Fetch {
            request: request.into(),
            status: status.into(),
            reason: reason.to_string(),
        }
    }

    /// Integrity failures are a subtype of fetch failures and are always retried.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }

    /// Process exit status for an error that ends the invocation.
    pub fn exit_code(&self) -> u8 {
        if self.is_configuration() { 2 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_taxonomy() {
        assert_eq!(Error::config("missing bounds").exit_code(), 2);
        assert_eq!(Error::fetch("req", "failed", "boom").exit_code(), 1);
        assert_eq!(Error::Integrity { expected: 10, actual: 9 }.exit_code(), 1);
        assert_eq!(Error::Storage("denied".into()).exit_code(), 1);
    }

    #[test]
    fn fetch_error_carries_last_status() {
        let e = Error::fetch("era5-ka-2m_temperature", "failed", "job rejected");
        let msg = e.to_string();
        assert!(msg.contains("last remote status: failed"));
        assert!(msg.contains("era5-ka-2m_temperature"));
        assert!(!e.is_integrity());
    }
}
