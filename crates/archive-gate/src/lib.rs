//! # Archive Gate
//!
//! Audited, authenticated access to a sandboxed set of directories and the
//! archives inside them.
//!
//! ## Features
//!
//! - Path sandbox with allowed and excluded roots
//! - Wildcard file search and line-oriented content search, including
//!   zip/jar/war/ear/tar/tar.gz entries
//! - LDAP / Active Directory authentication with group to role mapping
//! - HMAC-signed session tokens with optional revocation
//! - Per (identity, origin) lockout after repeated failures
//! - Security audit trail with pluggable sinks
//!
//! ## NIST 800-53 Controls
//!
//! - AC-3: Access Enforcement (sandbox, role checks)
//! - AC-7: Unsuccessful Logon Attempts (rate limiter)
//! - AC-12: Session Termination (token expiry)
//! - AU-2 / AU-3 / AU-12: Audit Events, Content and Generation
//! - IA-2: Identification and Authentication
//! - SI-10: Information Input Validation

pub mod audit;
pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod rate_limit;
pub mod sandbox;
pub mod search;
pub mod token;

pub use audit::{AuditEntry, AuditLog, AuditOperation};
pub use auth::{AuthenticationGateway, Principal};
pub use config::Config;
pub use directory::{DirectoryClient, LdapDirectory, StaticDirectory};
pub use error::{Error, ErrorCode, Result};
pub use gateway::{ArchiveGateway, RequestContext};
pub use rate_limit::RateLimiter;
pub use sandbox::PathSandbox;
pub use search::SearchEngine;
pub use token::TokenService;
