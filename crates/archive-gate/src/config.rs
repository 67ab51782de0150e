//! Configuration for the archive gateway

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub server: ServerConfig,
    /// Path sandbox roots and limits
    pub sandbox: SandboxConfig,
    /// Search limits
    pub search: SearchConfig,
    /// Directory service connection and role mapping
    pub directory: DirectoryConfig,
    /// Failed-login lockout policy (NIST 800-53: AC-7)
    pub rate_limit: RateLimitSettings,
    /// Session token settings
    pub session: SessionConfig,
    /// Upload settings
    pub upload: UploadConfig,
    /// Audit sinks
    pub audit: AuditConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// TLS settings; plain HTTP when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Take the client address from `X-Forwarded-For` (only behind a trusted proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// TLS certificate and key locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM PKCS#8 private key
    pub key_path: PathBuf,
}

/// Path sandbox roots and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Roots that may be reached. Empty rejects every path.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    /// Roots that may never be reached, even below an allowed root
    #[serde(default)]
    pub excluded_paths: Vec<PathBuf>,

    /// Largest file that may be downloaded or searched, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

/// Search limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Archive search and download endpoints are served
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cap on returned file entries and content matches
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    /// Budget for a single search, content search or download open
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,

    /// Budget for streaming one download body
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Concurrent search/download operations
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    /// Recursion bound for file search
    #[serde(default = "default_max_directory_depth")]
    pub max_directory_depth: usize,

    /// List matching entries inside archives during file search
    #[serde(default = "default_true")]
    pub search_archives: bool,
}

/// Which directory backend answers authentication requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryKind {
    /// LDAP / Active Directory over the network
    #[default]
    Ldap,
    /// In-process users (development and tests)
    Static,
}

/// Directory service connection and role mapping
///
/// NIST 800-53: IA-2 (Identification and Authentication), AC-2 (Account Management)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Backend selection
    #[serde(default)]
    pub kind: DirectoryKind,

    /// Directory URL (`ldap://` or `ldaps://`)
    #[serde(default = "default_directory_url")]
    pub url: String,

    /// Base DN of the directory tree
    #[serde(default)]
    pub base_dn: String,

    /// Subtree searched for user entries; falls back to `base_dn`
    #[serde(default)]
    pub search_base: String,

    /// User search filter; `{0}` is replaced with the escaped identity
    #[serde(default = "default_search_filter")]
    pub search_filter: String,

    /// Service account used for identity resolution and attribute lookup
    #[serde(default)]
    pub bind_dn: Option<String>,

    /// Service account secret
    #[serde(default)]
    pub bind_password: Option<String>,

    /// TCP connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-operation read timeout
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Attribute holding the display name
    #[serde(default = "default_display_name_attribute")]
    pub display_name_attribute: String,

    /// Attribute holding the email address
    #[serde(default = "default_email_attribute")]
    pub email_attribute: String,

    /// Attribute holding the department
    #[serde(default = "default_department_attribute")]
    pub department_attribute: String,

    /// Attribute holding group memberships
    #[serde(default = "default_group_attribute")]
    pub group_attribute: String,

    /// Group (CN or full DN) to application roles
    #[serde(default = "default_group_role_mappings")]
    pub group_role_mappings: BTreeMap<String, Vec<String>>,

    /// Role to granted operations
    #[serde(default = "default_role_permissions")]
    pub role_permissions: BTreeMap<String, Vec<String>>,

    /// Role that grants every operation
    #[serde(default = "default_admin_role")]
    pub admin_role: String,

    /// Lifetime of cached principal attributes
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Users served by the static backend
    #[serde(default)]
    pub users: Vec<StaticUser>,
}

/// A user entry for the static directory backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticUser {
    /// Login identity
    pub identity: String,
    /// Hex SHA-256 digest of the secret
    pub secret_sha256: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Email address
    #[serde(default)]
    pub email: String,
    /// Department
    #[serde(default)]
    pub department: String,
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Failed-login lockout policy as written in the file
///
/// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
/// Non-positive values fall back to defaults when the limiter is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Failures before lockout
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: i64,

    /// Lockout length
    #[serde(default = "default_lockout_duration_minutes")]
    pub lockout_duration_minutes: i64,
}

/// Session token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// HMAC signing secret; a random key is generated when absent
    #[serde(default)]
    pub secret: Option<String>,

    /// Token lifetime
    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: i64,

    /// `iss` claim
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Track revoked token ids so logout takes effect immediately
    #[serde(default)]
    pub revocation_enabled: bool,
}

/// Upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Upload endpoint is served
    #[serde(default)]
    pub enabled: bool,

    /// Directory uploads land in; must also be inside an allowed root
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Accepted file extensions, without the dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Largest accepted upload, in bytes
    #[serde(default = "default_max_upload_size")]
    pub max_size: u64,
}

/// Audit sinks
///
/// NIST 800-53: AU-9 (Protection of Audit Information)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append audit entries as JSON lines to this file
    #[serde(default)]
    pub json_file: Option<PathBuf>,

    /// Entries retained in memory for the status endpoint
    #[serde(default = "default_audit_memory_capacity")]
    pub memory_capacity: usize,
}

/// Logging configuration
///
/// NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for SIEM integration
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            tls: None,
            trust_forwarded_for: false,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            excluded_paths: Vec::new(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_search_results: default_max_search_results(),
            search_timeout_secs: default_search_timeout(),
            download_timeout_secs: default_download_timeout(),
            max_concurrent_operations: default_max_concurrent_operations(),
            max_directory_depth: default_max_directory_depth(),
            search_archives: true,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            kind: DirectoryKind::default(),
            url: default_directory_url(),
            base_dn: String::new(),
            search_base: String::new(),
            search_filter: default_search_filter(),
            bind_dn: None,
            bind_password: None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            display_name_attribute: default_display_name_attribute(),
            email_attribute: default_email_attribute(),
            department_attribute: default_department_attribute(),
            group_attribute: default_group_attribute(),
            group_role_mappings: default_group_role_mappings(),
            role_permissions: default_role_permissions(),
            admin_role: default_admin_role(),
            cache_ttl_secs: default_cache_ttl(),
            users: Vec::new(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_login_attempts: default_max_login_attempts(),
            lockout_duration_minutes: default_lockout_duration_minutes(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            session_timeout_minutes: default_session_timeout_minutes(),
            issuer: default_issuer(),
            revocation_enabled: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            allowed_extensions: default_allowed_extensions(),
            max_size: default_max_upload_size(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            json_file: None,
            memory_capacity: default_audit_memory_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// Rate-limit and session values are not checked here; their builders
    /// fall back to safe defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting
    pub fn validate(&self) -> crate::Result<()> {
        if self.sandbox.allowed_paths.is_empty() {
            tracing::warn!(
                event = "sandbox_fail_closed",
                "No allowed paths configured; every path will be rejected"
            );
        }

        for root in self
            .sandbox
            .allowed_paths
            .iter()
            .chain(self.sandbox.excluded_paths.iter())
        {
            if !root.is_absolute() {
                return Err(crate::Error::Config(format!(
                    "Sandbox roots must be absolute: {}",
                    root.display()
                )));
            }
        }

        if self.sandbox.max_file_size == 0 {
            return Err(crate::Error::Config(
                "sandbox.max_file_size must be greater than zero".to_string(),
            ));
        }

        if self.search.max_search_results == 0 || self.search.max_concurrent_operations == 0 {
            return Err(crate::Error::Config(
                "search limits must be greater than zero".to_string(),
            ));
        }

        if self.search.search_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "search.search_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.search.download_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "search.download_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.directory.kind == DirectoryKind::Ldap {
            let url = &self.directory.url;
            if !(url.starts_with("ldap://") || url.starts_with("ldaps://")) {
                return Err(crate::Error::Config(format!(
                    "Unsupported directory URL scheme: {}",
                    self.directory.url
                )));
            }
            if !self.directory.search_filter.contains("{0}") {
                return Err(crate::Error::Config(
                    "directory.search_filter must contain the {0} placeholder".to_string(),
                ));
            }
        }

        if let Some(secret) = &self.session.secret {
            if secret.len() < 32 {
                return Err(crate::Error::Config(
                    "session.secret must be at least 32 bytes".to_string(),
                ));
            }
        }

        if self.upload.enabled {
            match &self.upload.directory {
                Some(dir) if dir.is_absolute() => {}
                _ => {
                    return Err(crate::Error::Config(
                        "upload.directory must be an absolute path when uploads are enabled"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_max_search_results() -> usize {
    1000
}

fn default_search_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    300
}

fn default_max_concurrent_operations() -> usize {
    10
}

fn default_max_directory_depth() -> usize {
    10
}

fn default_directory_url() -> String {
    "ldap://localhost:389".to_string()
}

fn default_search_filter() -> String {
    "(sAMAccountName={0})".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    10
}

fn default_display_name_attribute() -> String {
    "displayName".to_string()
}

fn default_email_attribute() -> String {
    "mail".to_string()
}

fn default_department_attribute() -> String {
    "department".to_string()
}

fn default_group_attribute() -> String {
    "memberOf".to_string()
}

fn default_group_role_mappings() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("archive-admins".to_string(), vec!["admin".to_string()]),
        ("archive-operators".to_string(), vec!["operator".to_string()]),
        ("archive-users".to_string(), vec!["reader".to_string()]),
    ])
}

fn default_role_permissions() -> BTreeMap<String, Vec<String>> {
    let reader = vec![
        "search".to_string(),
        "content-search".to_string(),
        "download".to_string(),
    ];
    let mut operator = reader.clone();
    operator.push("upload".to_string());
    BTreeMap::from([
        ("reader".to_string(), reader),
        ("operator".to_string(), operator),
    ])
}

fn default_admin_role() -> String {
    "admin".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
// Default: 5 attempts before lockout
fn default_max_login_attempts() -> i64 {
    5
}

// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
// Default: 15 minute lockout
fn default_lockout_duration_minutes() -> i64 {
    15
}

// NIST 800-53: AC-12 (Session Termination)
fn default_session_timeout_minutes() -> i64 {
    30
}

fn default_issuer() -> String {
    "archive-gate".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    ["sql", "txt", "log", "csv", "ctl", "dat"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_upload_size() -> u64 {
    10 * 1024 * 1024
}

fn default_audit_memory_capacity() -> usize {
    1000
}
