/// HTTP status codes treated as temporary: the server asked us to back off
/// (429) or an intermediary timed out (Cloudflare 520/524). Everything else
/// non-2xx is permanent.
pub fn http_temp_failure(code: u16) -> bool {
    matches!(code, 429 | 520 | 524)
}

/// Errors surfaced by the transfer engine.
#[derive(Debug)]
pub enum TransferError {
    /// The server answered with a non-2xx status that is not retriable.
    Status { url: String, code: u16 },
    /// Transport-level failure: DNS, connection refused, TLS, mid-body abort.
    Network { url: String, msg: String },
    /// The server does not advertise support for HTTP range requests.
    RangeUnsupported(String),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Status { url, code } => {
                write!(f, "HTTP {} for {}", code, url)
            }
            TransferError::Network { url, msg } => {
                write!(f, "transfer failed for {}: {}", url, msg)
            }
            TransferError::RangeUnsupported(url) => {
                write!(f, "server does not support HTTP range requests: {}", url)
            }
        }
    }
}

impl std::error::Error for TransferError {}

impl TransferError {
    /// Whether retrying after a delay could succeed. Only the documented
    /// temporary HTTP statuses qualify; transport failures and other statuses
    /// surface to the caller.
    pub fn is_temporary(&self) -> bool {
        match self {
            TransferError::Status { code, .. } => http_temp_failure(*code),
            TransferError::Network { .. } | TransferError::RangeUnsupported(_) => false,
        }
    }
}

/// Errors surfaced by the block cache.
#[derive(Debug)]
pub enum CacheError {
    /// The file needs more segments than `--max-seg-count` allows.
    TooManySegments { path: String, need: u64, max: u32 },
    /// Local metadata or data file I/O failed.
    Io(String, std::io::Error),
    /// Fetching a missing segment from the server failed.
    Fetch(TransferError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::TooManySegments { path, need, max } => {
                write!(f, "{} needs {} segments, the limit is {}", path, need, max)
            }
            CacheError::Io(what, e) => write!(f, "{}: {}", what, e),
            CacheError::Fetch(e) => write!(f, "segment download failed: {}", e),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(_, e) => Some(e),
            CacheError::Fetch(e) => Some(e),
            CacheError::TooManySegments { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_failure_taxonomy() {
        assert!(http_temp_failure(429));
        assert!(http_temp_failure(520));
        assert!(http_temp_failure(524));
        assert!(!http_temp_failure(404));
        assert!(!http_temp_failure(500));
        assert!(!http_temp_failure(200));
    }

    #[test]
    fn status_error_classification() {
        let e = TransferError::Status { url: "http://x/".into(), code: 429 };
        assert!(e.is_temporary());
        let e = TransferError::Status { url: "http://x/".into(), code: 404 };
        assert!(!e.is_temporary());
        let e = TransferError::Network { url: "http://x/".into(), msg: "refused".into() };
        assert!(!e.is_temporary());
    }
}
