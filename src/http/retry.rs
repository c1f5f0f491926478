//! Retry policy for registry and download requests.

use reqwest::StatusCode;
use thiserror::Error;

/// Maximum number of attempts for one network operation.
pub const MAX_RETRIES: usize = 3;

/// Delay between attempts in milliseconds.
pub const RETRY_DELAY_MS: u64 = 1000;

/// HTTP failures that will not succeed by asking again.
#[derive(Debug, Error)]
pub enum NonRetryableError {
    #[error("Rate limit exceeded: {0}. Try again later")]
    RateLimitExceeded(String),
    #[error("Authentication failed: {0}. Check FWPM_AUTH_TOKEN")]
    AuthenticationFailed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Access forbidden: {0}")]
    Forbidden(String),
    #[error("Request error: {0}")]
    ClientError(String),
}

/// Map a status error to a [`NonRetryableError`], or `Ok(())` if retrying may help.
pub fn classify_error(error: &reqwest::Error) -> Result<(), NonRetryableError> {
    let Some(status) = error.status() else {
        // Connection errors, timeouts, etc.
        return Ok(());
    };
    let url = error
        .url()
        .map(|u| u.to_string())
        .unwrap_or_else(|| "request".to_string());
    match status {
        StatusCode::UNAUTHORIZED => Err(NonRetryableError::AuthenticationFailed(url)),
        StatusCode::FORBIDDEN => Err(NonRetryableError::Forbidden(url)),
        StatusCode::TOO_MANY_REQUESTS => Err(NonRetryableError::RateLimitExceeded(url)),
        StatusCode::NOT_FOUND => Err(NonRetryableError::NotFound(url)),
        s if s.is_client_error() => Err(NonRetryableError::ClientError(format!(
            "HTTP {} for {}",
            s.as_u16(),
            url
        ))),
        _ => Ok(()),
    }
}

/// Convert an `error_for_status()` failure into an `anyhow::Error`, tagging
/// failures that must not be retried.
pub fn check_retryable(error: reqwest::Error) -> anyhow::Error {
    match classify_error(&error) {
        Ok(()) => anyhow::Error::from(error),
        Err(non_retryable) => anyhow::Error::from(non_retryable),
    }
}

/// Whether an error came back as HTTP 404.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<NonRetryableError>(),
        Some(NonRetryableError::NotFound(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn status_error(status: usize) -> reqwest::Error {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .with_status(status)
            .create_async()
            .await;

        let response = reqwest::Client::new()
            .get(server.url())
            .send()
            .await
            .unwrap();
        response.error_for_status().unwrap_err()
    }

    #[test]
    fn test_non_retryable_error_display() {
        let err = NonRetryableError::RateLimitExceeded("registry".to_string());
        assert!(err.to_string().contains("Rate limit"));

        let err = NonRetryableError::AuthenticationFailed("registry".to_string());
        assert!(err.to_string().contains("FWPM_AUTH_TOKEN"));

        let err = NonRetryableError::ClientError("HTTP 400".to_string());
        assert!(err.to_string().contains("Request error: HTTP 400"));
    }

    #[tokio::test]
    async fn test_classify_client_errors() {
        assert!(matches!(
            classify_error(&status_error(401).await),
            Err(NonRetryableError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            classify_error(&status_error(403).await),
            Err(NonRetryableError::Forbidden(_))
        ));
        assert!(matches!(
            classify_error(&status_error(429).await),
            Err(NonRetryableError::RateLimitExceeded(_))
        ));
        assert!(matches!(
            classify_error(&status_error(404).await),
            Err(NonRetryableError::NotFound(_))
        ));
        assert!(matches!(
            classify_error(&status_error(400).await),
            Err(NonRetryableError::ClientError(_))
        ));
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        assert!(classify_error(&status_error(500).await).is_ok());

        let err = check_retryable(status_error(503).await);
        assert!(err.downcast_ref::<NonRetryableError>().is_none());
    }

    #[tokio::test]
    async fn test_is_not_found() {
        let err = check_retryable(status_error(404).await);
        assert!(is_not_found(&err));
        assert!(!is_not_found(&anyhow::anyhow!("boom")));
    }
}
