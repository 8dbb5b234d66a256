use thiserror::Error;

/// Error taxonomy shared across the gateway (§7): validation, auth,
/// policy, resource, upstream, and timeout failures. Every handler
/// converts one of these into `rpc.res{ok:false, error:{code,message}}`
/// rather than panicking.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid params: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Authorization(String),

    #[error("denied by {gate}: {reason}")]
    Policy { gate: String, reason: String },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("node disconnected: {0}")]
    NodeDisconnected(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// A short machine-readable code for the `rpc.res` error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io-error",
            Error::Json(_) => "bad-json",
            Error::Validation(_) => "validation",
            Error::Authorization(_) => "unauthorized",
            Error::Policy { .. } => "policy-denied",
            Error::Resource(_) => "resource-error",
            Error::Upstream(_) => "upstream-error",
            Error::Timeout(_) => "timeout",
            Error::NodeDisconnected(_) => "node-disconnected",
            Error::Config(_) => "config-error",
            Error::Other(_) => "error",
        }
    }

    /// Whether retrying this error (with jittered backoff, ≤3 attempts)
    /// is sanctioned by §7 — only idempotent upstream failures qualify.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Upstream(_) | Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Validation("x".into()).code(), "validation");
        assert_eq!(
            Error::Policy {
                gate: "security".into(),
                reason: "deny".into()
            }
            .code(),
            "policy-denied"
        );
    }

    #[test]
    fn only_upstream_and_timeout_retriable() {
        assert!(Error::Upstream("x".into()).is_retriable());
        assert!(Error::Timeout("x".into()).is_retriable());
        assert!(!Error::Validation("x".into()).is_retriable());
        assert!(!Error::NodeDisconnected("n1".into()).is_retriable());
    }
}
