use thiserror::Error;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Error taxonomy the monitor loops branch on. Cloneable so that coalesced
/// waiters receive the same kind the executing request saw.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// HTTP 429 or a body flagged as rate limited. Recovered by monitor
    /// backoff, never surfaced as a bot failure.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Connection, timeout, or 5xx. One in-line retry at the network layer;
    /// further attempts are driven by the monitor cadence.
    #[error("transient: {0}")]
    Transient(String),

    /// Payload shape unexpected. The response is discarded and caches are
    /// not poisoned.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Unknown order / deleted entity. Idempotent reconciliation paths
    /// treat this as success.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other exchange-reported error.
    #[error("exchange api error ({code}): {message}")]
    Api { code: String, message: String },

    /// Bad credentials or signing failure; a configuration problem, not a
    /// runtime one.
    #[error("signing: {0}")]
    Signing(String),
}

impl ExchangeError {
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classifies an exchange error body by its code field.
    #[must_use]
    pub fn from_api_body(status: u16, code: String, message: String) -> Self {
        if status == 429 || code.eq_ignore_ascii_case("RATE_LIMIT_EXCEEDED") {
            return Self::RateLimited(message);
        }
        if status == 404 || code.eq_ignore_ascii_case("RESOURCE_NOT_FOUND") {
            return Self::NotFound(message);
        }
        if status >= 500 {
            return Self::Transient(format!("{code}: {message}"));
        }
        Self::Api { code, message }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// True when an `anyhow` chain bottoms out in a rate-limit error. Monitor
/// callbacks return `anyhow::Result`, so the engine classifies through the
/// chain rather than at the call site.
#[must_use]
pub fn is_rate_limit_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<ExchangeError>()
            .is_some_and(ExchangeError::is_rate_limited)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_classifies_as_rate_limited() {
        let e = ExchangeError::from_api_body(429, "TOO_FAST".into(), "slow down".into());
        assert!(e.is_rate_limited());
    }

    #[test]
    fn rate_limit_code_classifies_regardless_of_status() {
        let e = ExchangeError::from_api_body(400, "RATE_LIMIT_EXCEEDED".into(), "limit".into());
        assert!(e.is_rate_limited());
    }

    #[test]
    fn not_found_and_server_errors() {
        assert!(ExchangeError::from_api_body(404, "X".into(), "gone".into()).is_not_found());
        assert!(matches!(
            ExchangeError::from_api_body(503, "X".into(), "down".into()),
            ExchangeError::Transient(_)
        ));
        assert!(matches!(
            ExchangeError::from_api_body(400, "INVALID_ORDER".into(), "bad".into()),
            ExchangeError::Api { .. }
        ));
    }

    #[test]
    fn rate_limit_detected_through_anyhow_chain() {
        let inner = ExchangeError::RateLimited("429".into());
        let wrapped = anyhow::Error::new(inner).context("while scanning orphans");
        assert!(is_rate_limit_error(&wrapped));

        let other = anyhow::anyhow!("plain failure");
        assert!(!is_rate_limit_error(&other));
    }
}
