use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Startup configuration errors. None of these are recoverable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("user password {0}: syntax wrong, should be username:password[:port]")]
    MalformedCredential(String),

    #[error("duplicate user: {0}")]
    DuplicateUser(String),

    #[error("error opening user passwd file {}: {source}", path.display())]
    CredentialFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("allowed client syntax error: {0}")]
    MalformedAllowlist(String),
}

/// Outcome of authenticating one request, other than success.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Wrong password, unknown user, stale nonce, digest or port mismatch.
    /// The client only ever sees a new 407.
    #[error("authentication required")]
    AuthRequired,

    #[error("malformed Proxy-Authorization header: {0}")]
    MalformedAuthHeader(String),

    #[error("invalid base64 credentials: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("malformed basic auth user:passwd")]
    MalformedBasicCredentials,

    #[error("empty authorization list")]
    EmptyAuthList,

    #[error("invalid nonce {0:?}")]
    InvalidNonce(String),

    #[error("qop wrong: {0:?}")]
    UnsupportedQop(String),

    #[error("no request-digest response")]
    MissingResponseDigest,

    #[error("method {0} unsupported, must use digest")]
    UnsupportedAuthScheme(String),

    #[error("send auth response error: {0}")]
    ChallengeWriteFailed(#[source] io::Error),

    #[error("error generating auth response")]
    InternalTemplateError,
}

impl AuthError {
    /// Client sent authorization data we cannot use. Re-challenging will not
    /// help, so these are answered with 400.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            AuthError::MalformedAuthHeader(_)
                | AuthError::InvalidEncoding(_)
                | AuthError::MalformedBasicCredentials
                | AuthError::EmptyAuthList
                | AuthError::InvalidNonce(_)
                | AuthError::UnsupportedQop(_)
                | AuthError::MissingResponseDigest
                | AuthError::UnsupportedAuthScheme(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_required_is_not_bad_request() {
        assert!(!AuthError::AuthRequired.is_bad_request());
    }

    #[test]
    fn test_protocol_errors_are_bad_request() {
        assert!(AuthError::MalformedAuthHeader("x".to_string()).is_bad_request());
        assert!(AuthError::MalformedBasicCredentials.is_bad_request());
        assert!(AuthError::EmptyAuthList.is_bad_request());
        assert!(AuthError::InvalidNonce("zz".to_string()).is_bad_request());
        assert!(AuthError::UnsupportedQop("auth-int".to_string()).is_bad_request());
        assert!(AuthError::MissingResponseDigest.is_bad_request());
        assert!(AuthError::UnsupportedAuthScheme("ntlm".to_string()).is_bad_request());
    }

    #[test]
    fn test_transport_errors_are_not_bad_request() {
        let err = AuthError::ChallengeWriteFailed(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!err.is_bad_request());
        assert!(!AuthError::InternalTemplateError.is_bad_request());
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::DuplicateUser("alice".to_string());
        assert_eq!(err.to_string(), "duplicate user: alice");
        let err = ConfigError::MalformedAllowlist("mask number should <= 32".to_string());
        assert!(err.to_string().contains("<= 32"));
    }
}
