//! Error types for gateway operations
//!
//! NIST 800-53: SI-11 (Error Handling), AU-3 (Content of Audit Records)
//! Implementation: Tagged error kinds with a client-safe message; the full
//! detail stays in the `Display` form that goes to operational logs and audit.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a session token was rejected
///
/// Kept for logging and audit only. Clients always receive the same message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Wrong segment count or undecodable segments
    Malformed,
    /// Header names an algorithm other than the one the service signs with
    UnsupportedAlgorithm,
    /// Signature does not match header and payload
    BadSignature,
    /// Claims could not be parsed or are inconsistent
    InvalidClaims,
    /// Token is past its expiry
    Expired,
    /// Token id was revoked by logout
    Revoked,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Malformed => "malformed",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::BadSignature => "bad signature",
            Self::InvalidClaims => "invalid claims",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        };
        f.write_str(reason)
    }
}

/// Stable error codes carried in error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Path or security rule violation
    SecurityViolation,
    /// Resource does not exist
    NotFound,
    /// Malformed or missing parameter
    InvalidParameter,
    /// Content cannot be searched as text
    UnsupportedFormat,
    /// Archive could not be read
    ArchiveCorrupted,
    /// Filesystem failure
    IoError,
    /// Operation exceeded its time budget
    Timeout,
    /// Credentials rejected
    AuthenticationFailed,
    /// Too many failed attempts
    AccountLocked,
    /// Session token rejected
    TokenInvalid,
    /// Operation not permitted for the caller's roles
    AccessDenied,
    /// Feature switched off in configuration
    FeatureDisabled,
    /// Concurrency cap reached
    TooManyOperations,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// Wire form of the code
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::ArchiveCorrupted => "ARCHIVE_CORRUPTED",
            Self::IoError => "IO_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::FeatureDisabled => "FEATURE_DISABLED",
            Self::TooManyOperations => "TOO_MANY_OPERATIONS",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Gateway error kinds
///
/// NIST 800-53: SI-11 (Error Handling)
/// STIG: V-222566
/// Implementation: Error kinds that carry context for logs without exposing it to clients
#[derive(Error, Debug)]
pub enum Error {
    /// Traversal, excluded path or symlink escape
    ///
    /// NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// File or resource absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed parameters, blank required fields, oversized inputs
    ///
    /// NIST 800-53: SI-10 (Input Validation)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Binary or otherwise non-text content requested for text search
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Archive container could not be parsed
    #[error("Archive corrupted: {0}")]
    ArchiveCorrupted(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded its time budget
    ///
    /// NIST 800-53: AC-12 (Session Termination)
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Credentials rejected, whatever the root cause
    ///
    /// NIST 800-53: IA-2 (Identification and Authentication)
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Rate limiter tripped
    ///
    /// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    #[error("Account locked for {remaining_secs} more seconds")]
    LockedOut {
        /// Seconds until the lockout lifts
        remaining_secs: u64,
    },

    /// Malformed, tampered, revoked or expired token
    #[error("Token invalid: {0}")]
    TokenInvalid(TokenError),

    /// Caller's roles do not grant the operation
    ///
    /// NIST 800-53: AC-6 (Least Privilege)
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Feature switched off in configuration
    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    /// Concurrency cap reached
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Directory service failure; never shown to unauthenticated callers
    #[error("Directory service error: {0}")]
    Directory(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable code for the error body
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::SecurityViolation(_) => ErrorCode::SecurityViolation,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidInput(_) => ErrorCode::InvalidParameter,
            Error::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            Error::ArchiveCorrupted(_) => ErrorCode::ArchiveCorrupted,
            Error::Io(_) => ErrorCode::IoError,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::AuthFailure(_) | Error::Directory(_) => ErrorCode::AuthenticationFailed,
            Error::LockedOut { .. } => ErrorCode::AccountLocked,
            Error::TokenInvalid(_) => ErrorCode::TokenInvalid,
            Error::AccessDenied(_) => ErrorCode::AccessDenied,
            Error::FeatureDisabled(_) => ErrorCode::FeatureDisabled,
            Error::ResourceExhaustion(_) => ErrorCode::TooManyOperations,
            Error::Config(_) | Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if error has security implications
    ///
    /// # NIST 800-53: AU-2 (Audit Events)
    /// # Implementation: Identifies errors recorded as security violations
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::SecurityViolation(_) | Error::AccessDenied(_) | Error::TokenInvalid(_)
        )
    }

    /// Check if error is due to client input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::SecurityViolation(_)
                | Error::NotFound(_)
                | Error::InvalidInput(_)
                | Error::UnsupportedFormat(_)
                | Error::ArchiveCorrupted(_)
                | Error::AuthFailure(_)
                | Error::LockedOut { .. }
                | Error::TokenInvalid(_)
                | Error::AccessDenied(_)
        )
    }

    /// Get sanitized error message for client
    ///
    /// # NIST 800-53: SI-11 (Error Handling)
    /// # STIG: V-222566
    /// # Implementation: Removes rule names, infrastructure state and failure causes
    pub fn sanitized_message(&self) -> String {
        match self {
            // Never reveal which rule matched
            Error::SecurityViolation(_) => {
                "Access to the requested path is not permitted".to_string()
            }
            // Unknown user, wrong secret and directory outage all look the same
            Error::AuthFailure(_) | Error::Directory(_) => "Invalid credentials".to_string(),
            Error::LockedOut { remaining_secs } => format!(
                "Account temporarily locked. Try again in {remaining_secs} seconds"
            ),
            Error::TokenInvalid(_) => "Invalid or expired token".to_string(),
            Error::AccessDenied(_) => "Operation not permitted".to_string(),
            Error::Io(_) => "I/O error while accessing the resource".to_string(),
            Error::Config(_) | Error::Internal(_) => "Internal server error".to_string(),
            Error::ResourceExhaustion(_) => {
                "Too many concurrent operations, retry later".to_string()
            }
            _ => self.to_string(),
        }
    }
}

// Additional error constructors and helpers
impl Error {
    /// Create timeout error with context
    pub fn timeout(context: impl Into<String>) -> Self {
        Error::Timeout(context.into())
    }

    /// Create invalid input error
    pub fn invalid(context: impl Into<String>) -> Self {
        Error::InvalidInput(context.into())
    }

    /// Create security violation error
    pub fn violation(context: impl Into<String>) -> Self {
        Error::SecurityViolation(context.into())
    }

    /// Create resource exhaustion error
    pub fn resource_exhaustion(context: impl Into<String>) -> Self {
        Error::ResourceExhaustion(context.into())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::ArchiveCorrupted(err.to_string())
    }
}

impl From<ldap3::LdapError> for Error {
    fn from(err: ldap3::LdapError) -> Self {
        Error::Directory(err.to_string())
    }
}
