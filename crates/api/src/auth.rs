//! Bearer token authentication.
//!
//! Tokens listed in `API_TOKENS` are accepted locally. Anything else goes to
//! the auth service through a [`ResilientCaller`], so a struggling auth
//! service trips its breaker instead of stalling every request.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use resilience::{ResilienceError, ResilientCaller, Retryable, is_client_error_status};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Breaker name of the auth service dependency.
pub const AUTH_SERVICE: &str = "auth-service";

/// What the auth service knows about a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// False for unknown, revoked or expired tokens.
    pub active: bool,
    /// Who the token was issued to, when the service says.
    pub subject: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credentials {
    fn local() -> Self {
        Self {
            active: true,
            subject: Some("api-token".to_string()),
            scopes: Vec::new(),
        }
    }
}

/// Failures talking to the auth service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthServiceError {
    #[error("auth service unreachable: {0}")]
    Unreachable(String),

    #[error("auth service returned status {0}")]
    Status(u16),
}

impl Retryable for AuthServiceError {
    fn is_retryable(&self) -> bool {
        match self {
            AuthServiceError::Unreachable(_) => true,
            AuthServiceError::Status(status) => !is_client_error_status(*status),
        }
    }
}

/// Remote token validation endpoint.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Asks the service about `token`. An inactive token is `Ok`, not an error.
    async fn validate(&self, token: &str) -> Result<Credentials, AuthServiceError>;
}

/// Used when no auth service is configured: every unknown token is inactive.
#[derive(Debug, Clone, Default)]
pub struct DenyAllValidator;

#[async_trait]
impl CredentialValidator for DenyAllValidator {
    async fn validate(&self, _token: &str) -> Result<Credentials, AuthServiceError> {
        Ok(Credentials {
            active: false,
            subject: None,
            scopes: Vec::new(),
        })
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing or invalid authorization header")]
    InvalidHeader,

    #[error("Invalid or expired token")]
    InactiveToken,

    #[error("Auth service unavailable")]
    ServiceUnavailable,

    #[error("Token validation failed")]
    ValidationFailed,
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn extract_bearer_token(header: &str) -> Result<&str, AuthError> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidHeader)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::InvalidHeader);
    }
    Ok(token)
}

/// Decides whether a request may proceed.
pub struct Authenticator {
    required: bool,
    tokens: HashSet<String>,
    validator: Arc<dyn CredentialValidator>,
    caller: ResilientCaller,
}

impl Authenticator {
    /// `tokens` are accepted locally; anything else goes to `validator`
    /// through `caller`.
    pub fn new(
        required: bool,
        tokens: HashSet<String>,
        validator: Arc<dyn CredentialValidator>,
        caller: ResilientCaller,
    ) -> Self {
        Self {
            required,
            tokens,
            validator,
            caller,
        }
    }

    /// Whether requests without credentials are refused.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Checks the raw `Authorization` header value.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Credentials, AuthError> {
        let token = extract_bearer_token(header.ok_or(AuthError::InvalidHeader)?)?;
        if self.tokens.contains(token) {
            return Ok(Credentials::local());
        }

        debug!("token not known locally, asking the auth service");
        match self.caller.call(|| self.validator.validate(token)).await {
            Ok(credentials) if credentials.active => Ok(credentials),
            Ok(_) => Err(AuthError::InactiveToken),
            Err(ResilienceError::CircuitOpen { .. }) => {
                warn!(dependency = AUTH_SERVICE, "circuit open, rejecting request");
                Err(AuthError::ServiceUnavailable)
            }
            Err(err) => {
                warn!(dependency = AUTH_SERVICE, error = %err, "token validation failed");
                Err(AuthError::ValidationFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};

    use super::*;

    struct FlakyValidator {
        calls: AtomicU32,
        outcome: Result<Credentials, AuthServiceError>,
    }

    #[async_trait]
    impl CredentialValidator for FlakyValidator {
        async fn validate(&self, _token: &str) -> Result<Credentials, AuthServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn authenticator(
        outcome: Result<Credentials, AuthServiceError>,
    ) -> (Authenticator, Arc<FlakyValidator>) {
        let validator = Arc::new(FlakyValidator {
            calls: AtomicU32::new(0),
            outcome,
        });
        let caller = ResilientCaller::new(
            Arc::new(CircuitBreaker::new(AUTH_SERVICE, CircuitBreakerConfig::default())),
            RetryPolicy::new(2, Duration::from_millis(10)),
            Duration::from_secs(1),
        );
        let tokens = HashSet::from(["local-token".to_string()]);
        (
            Authenticator::new(true, tokens, validator.clone(), caller),
            validator,
        )
    }

    fn active() -> Credentials {
        Credentials {
            active: true,
            subject: Some("user-1".to_string()),
            scopes: vec!["orders:write".to_string()],
        }
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(extract_bearer_token("Bearer abc"), Ok("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), Err(AuthError::InvalidHeader));
        assert_eq!(extract_bearer_token("Bearer "), Err(AuthError::InvalidHeader));
    }

    #[tokio::test]
    async fn test_local_token_skips_the_auth_service() {
        let (auth, validator) = authenticator(Ok(active()));

        let credentials = auth.authenticate(Some("Bearer local-token")).await.unwrap();

        assert!(credentials.active);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_validation() {
        let (auth, _) = authenticator(Ok(active()));
        let credentials = auth.authenticate(Some("Bearer remote")).await.unwrap();
        assert_eq!(credentials.subject.as_deref(), Some("user-1"));

        let (auth, _) = authenticator(Ok(Credentials {
            active: false,
            subject: None,
            scopes: Vec::new(),
        }));
        assert_eq!(
            auth.authenticate(Some("Bearer remote")).await,
            Err(AuthError::InactiveToken)
        );
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (auth, validator) = authenticator(Err(AuthServiceError::Status(401)));

        let result = auth.authenticate(Some("Bearer remote")).await;

        assert_eq!(result, Err(AuthError::ValidationFailed));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_rejects_without_calling() {
        let (auth, validator) =
            authenticator(Err(AuthServiceError::Unreachable("refused".to_string())));
        for _ in 0..5 {
            assert_eq!(
                auth.authenticate(Some("Bearer remote")).await,
                Err(AuthError::ValidationFailed)
            );
        }
        let calls = validator.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 15);

        let result = auth.authenticate(Some("Bearer remote")).await;

        assert_eq!(result, Err(AuthError::ServiceUnavailable));
        assert_eq!(validator.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_missing_header_is_rejected() {
        let (auth, _) = authenticator(Ok(active()));
        assert_eq!(auth.authenticate(None).await, Err(AuthError::InvalidHeader));
    }
}
