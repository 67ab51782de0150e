//! Request orchestration
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-7 (Unsuccessful Logon Attempts),
//! AU-12 (Audit Generation)
//! Implementation: Every operation runs token check, then path check, then
//! role check before touching the filesystem, and produces exactly one audit
//! entry whatever the outcome.

use crate::audit::{AuditEntry, AuditLog, AuditOperation, AuditStats};
use crate::auth::{AuthenticationGateway, OP_CONTENT_SEARCH, OP_DOWNLOAD, OP_SEARCH, OP_UPLOAD};
use crate::config::{Config, DirectoryKind, UploadConfig};
use crate::directory::{DirectoryClient, LdapDirectory, StaticDirectory};
use crate::error::TokenError;
use crate::rate_limit::{AttemptRefused, RateLimitConfig, RateLimiter};
use crate::sandbox::PathSandbox;
use crate::search::archive::SUPPORTED_EXTENSIONS;
use crate::search::{ContentQuery, ContentSearchResult, Download, FileSearchResult, SearchEngine};
use crate::token::{Claims, TokenService};
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const MAX_FILE_NAME_LEN: usize = 255;

/// Caller context extracted at the transport boundary
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client origin address
    pub origin: String,
    /// Bearer token, if one was presented
    pub bearer: Option<String>,
}

impl RequestContext {
    /// Context for `origin` with an optional token
    pub fn new(origin: impl Into<String>, bearer: Option<String>) -> Self {
        Self {
            origin: origin.into(),
            bearer,
        }
    }
}

/// Successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Session token
    pub token: String,
    /// Authenticated identity
    pub identity: String,
    /// Token lifetime
    pub expires_in_seconds: i64,
    /// Operations the token grants
    pub permissions: Vec<String>,
}

/// Result of token introspection
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// Token is currently valid
    pub valid: bool,
    /// Subject of a valid token
    pub identity: Option<String>,
    /// Seconds to expiry of a valid token
    pub remaining_seconds: Option<i64>,
    /// Reason a token is not valid
    pub message: Option<String>,
}

/// An upload as received from the client
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Client-supplied file name
    pub file_name: String,
    /// Directory below the upload directory; the upload directory itself when absent
    pub target_path: Option<String>,
    /// Replace an existing file
    pub overwrite: bool,
    /// Free-text description, audited
    pub description: Option<String>,
    /// File content
    pub data: Bytes,
}

/// Completed upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Stored file name
    pub file_name: String,
    /// Canonical destination
    pub target_path: PathBuf,
    /// Bytes written
    pub file_size: u64,
    /// Uploading identity
    pub uploaded_by: String,
    /// Completion time
    pub uploaded_at: DateTime<Utc>,
}

/// Capability and limit summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Search and download endpoints are served
    pub search_enabled: bool,
    /// Upload endpoint is served
    pub upload_enabled: bool,
    /// Result cap
    pub max_search_results: usize,
    /// Per-operation time budget
    pub search_timeout_secs: u64,
    /// Time budget for streaming one download
    pub download_timeout_secs: u64,
    /// Concurrency cap
    pub max_concurrent_operations: usize,
    /// Operations that could start now
    pub available_operation_slots: usize,
    /// Recursion bound
    pub max_directory_depth: usize,
    /// Largest searchable or downloadable file
    pub max_file_size: u64,
    /// Largest accepted upload
    pub max_upload_size: u64,
    /// Accepted upload extensions
    pub allowed_upload_extensions: Vec<String>,
    /// Archive formats searched
    pub supported_archive_types: Vec<String>,
    /// Logout revokes tokens immediately
    pub revocation_enabled: bool,
    /// Rate-limit keys tracked
    pub tracked_rate_limit_keys: usize,
    /// Rate-limit keys locked out
    pub locked_rate_limit_keys: usize,
    /// Audit counters
    pub audit: AuditStats,
}

/// What a maintenance pass removed
#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceReport {
    /// Rate-limit records
    pub rate_limit_records: usize,
    /// Cached principals
    pub cached_principals: usize,
    /// Revoked token ids
    pub revocations: usize,
}

/// The access-control and search gateway
pub struct ArchiveGateway {
    sandbox: Arc<PathSandbox>,
    engine: SearchEngine,
    auth: AuthenticationGateway,
    limiter: RateLimiter,
    tokens: TokenService,
    audit: Arc<AuditLog>,
    search_enabled: bool,
    upload: UploadConfig,
}

impl ArchiveGateway {
    /// Build every component from configuration
    ///
    /// # Errors
    ///
    /// `Error::Config` for invalid settings, `Error::Io` if an audit file
    /// cannot be opened
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let directory: Arc<dyn DirectoryClient> = match config.directory.kind {
            DirectoryKind::Ldap => Arc::new(LdapDirectory::new(&config.directory)),
            DirectoryKind::Static => {
                warn!(
                    event = "static_directory_enabled",
                    users = config.directory.users.len(),
                    "Static directory backend in use; not for production"
                );
                Arc::new(StaticDirectory::new(&config.directory.users))
            }
        };
        let audit = Arc::new(AuditLog::from_config(&config.audit)?);
        Self::with_directory(config, directory, audit)
    }

    /// Build with an explicit directory client and audit log
    ///
    /// # Errors
    ///
    /// `Error::Config` if the token service cannot be initialised
    pub fn with_directory(
        config: &Config,
        directory: Arc<dyn DirectoryClient>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        let sandbox = Arc::new(PathSandbox::new(&config.sandbox));
        Ok(Self {
            engine: SearchEngine::new(Arc::clone(&sandbox), &config.search),
            sandbox,
            auth: AuthenticationGateway::new(directory, &config.directory),
            limiter: RateLimiter::new(RateLimitConfig::from_settings(&config.rate_limit)),
            tokens: TokenService::new(&config.session)?,
            audit,
            search_enabled: config.search.enabled,
            upload: config.upload.clone(),
        })
    }

    /// Path sandbox
    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    /// Rate limiter
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Token service
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Authentication gateway
    pub fn auth(&self) -> &AuthenticationGateway {
        &self.auth
    }

    /// Audit log
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Record the single audit entry for an operation and pass the result through
    fn finish<T>(
        &self,
        entry: AuditEntry,
        result: Result<T>,
        describe: impl FnOnce(&T) -> String,
    ) -> Result<T> {
        match &result {
            Ok(value) => self.audit.record(entry.succeeded(describe(value))),
            Err(err) if err.is_security_event() => {
                let detail = format!("{}: {err}", entry.operation.as_str());
                let mut entry = entry.failed(detail);
                entry.operation = AuditOperation::SecurityViolation;
                self.audit.record(entry);
            }
            Err(err) => self.audit.record(entry.failed(err.to_string())),
        }
        result
    }

    fn verify_token(&self, ctx: &RequestContext, entry: &mut AuditEntry) -> Result<Claims> {
        let token = ctx
            .bearer
            .as_deref()
            .ok_or(Error::TokenInvalid(TokenError::Malformed))?;
        let claims = self.tokens.verify(token)?;
        entry.identity = Some(claims.sub.clone());
        entry.session_id = Some(claims.jti.clone());
        Ok(claims)
    }

    /// Token, then path, then role
    ///
    /// NIST 800-53: AC-3 (Access Enforcement)
    fn authorize(
        &self,
        ctx: &RequestContext,
        path: Option<&str>,
        operation: &str,
        entry: &mut AuditEntry,
    ) -> Result<Claims> {
        let claims = self.verify_token(ctx, entry)?;
        if let Some(path) = path {
            let sanitized = self.sandbox.sanitize(path)?;
            entry.resource = sanitized.path().display().to_string();
        }
        if !self.auth.policy().grants(&claims.roles, operation) {
            return Err(Error::AccessDenied(format!(
                "{} lacks permission {operation}",
                claims.sub
            )));
        }
        Ok(claims)
    }

    fn ensure_search_enabled(&self) -> Result<()> {
        if self.search_enabled {
            Ok(())
        } else {
            Err(Error::FeatureDisabled("archive search is disabled".to_string()))
        }
    }

    /// Authenticate and issue a session token
    ///
    /// # NIST 800-53: IA-2, AC-7
    ///
    /// # Errors
    ///
    /// `Error::AuthFailure` for any credential or directory problem,
    /// `Error::LockedOut` while the (identity, origin) key is locked
    pub async fn login(
        &self,
        ctx: &RequestContext,
        identity: &str,
        secret: &str,
    ) -> Result<LoginOutcome> {
        let identity = identity.trim();
        let entry = AuditEntry::new(AuditOperation::LoginFailure, &ctx.origin).resource(identity);

        if identity.is_empty() || secret.is_empty() {
            return self.finish(
                entry,
                Err(Error::AuthFailure("blank identity or secret".to_string())),
                |_| String::new(),
            );
        }
        let entry = entry.identity(identity);

        // Booked under the key's lock before the directory is contacted
        let attempt = match self.limiter.begin_attempt(identity, &ctx.origin) {
            Ok(attempt) => attempt,
            Err(AttemptRefused::LockedOut { remaining_secs }) => {
                let mut entry = entry;
                entry.operation = AuditOperation::AccountLocked;
                return self.finish(entry, Err(Error::LockedOut { remaining_secs }), |_| {
                    String::new()
                });
            }
            Err(AttemptRefused::Saturated { locked }) => {
                let mut detail = "refused: earlier attempts still pending".to_string();
                if locked {
                    detail.push_str("; lockout engaged");
                }
                self.audit.record(entry.failed(detail));
                return Err(Error::AuthFailure("attempt threshold reached".to_string()));
            }
        };

        let principal = match self.auth.authenticate(identity, secret).await {
            Ok(principal) => principal,
            Err(err) => {
                let locked = attempt.failed();
                let mut detail = err.to_string();
                if locked {
                    detail.push_str("; lockout engaged");
                }
                self.audit.record(entry.failed(detail));
                return Err(match err {
                    Error::Directory(_) => Error::AuthFailure("directory unavailable".to_string()),
                    other => other,
                });
            }
        };

        let roles: Vec<String> = principal.roles.iter().cloned().collect();
        let issued = match self.tokens.issue(&principal.identity, &roles) {
            Ok(issued) => issued,
            Err(err) => return self.finish(entry, Err(err), |_| String::new()),
        };
        attempt.succeeded();

        let mut entry = entry.session(issued.claims.jti.clone());
        entry.operation = AuditOperation::LoginSuccess;
        let outcome = LoginOutcome {
            permissions: self.auth.policy().permissions(&roles),
            expires_in_seconds: issued.expires_in_seconds(),
            identity: principal.identity,
            token: issued.token,
        };
        self.finish(entry, Ok(outcome), |_| format!("roles={}", roles.join(",")))
    }

    /// End a session, revoking the token when revocation is enabled
    ///
    /// # Errors
    ///
    /// `Error::TokenInvalid` for a missing or invalid token
    pub async fn logout(&self, ctx: &RequestContext) -> Result<bool> {
        let mut entry = AuditEntry::new(AuditOperation::Logout, &ctx.origin).resource("session");
        let result = self
            .verify_token(ctx, &mut entry)
            .map(|claims| self.tokens.revoke(&claims));
        self.finish(entry, result, |revoked| {
            if *revoked {
                "token revoked".to_string()
            } else {
                "token expires naturally".to_string()
            }
        })
    }

    /// Introspect the presented token; never fails
    pub async fn validate(&self, ctx: &RequestContext) -> ValidationOutcome {
        let mut entry =
            AuditEntry::new(AuditOperation::TokenValidation, &ctx.origin).resource("session");
        let Some(token) = ctx.bearer.as_deref() else {
            self.audit.record(entry.failed("no token presented"));
            return ValidationOutcome {
                valid: false,
                identity: None,
                remaining_seconds: None,
                message: Some("No token provided".to_string()),
            };
        };

        match self.tokens.verify(token) {
            Ok(claims) => {
                let remaining = self.tokens.remaining_seconds(token);
                entry.session_id = Some(claims.jti.clone());
                self.audit.record(entry.identity(claims.sub.clone()).succeeded("token valid"));
                ValidationOutcome {
                    valid: true,
                    identity: Some(claims.sub),
                    remaining_seconds: Some(remaining),
                    message: None,
                }
            }
            Err(err) => {
                let message = err.sanitized_message();
                self.audit.record(entry.failed(err.to_string()));
                ValidationOutcome {
                    valid: false,
                    identity: None,
                    remaining_seconds: None,
                    message: Some(message),
                }
            }
        }
    }

    /// Wildcard file search
    ///
    /// # Errors
    ///
    /// Token, sandbox, authorization and search errors
    pub async fn search_files(
        &self,
        ctx: &RequestContext,
        root: &str,
        pattern: &str,
    ) -> Result<FileSearchResult> {
        let mut entry = AuditEntry::new(AuditOperation::Search, &ctx.origin).resource(root);
        let result = async {
            self.ensure_search_enabled()?;
            self.authorize(ctx, Some(root), OP_SEARCH, &mut entry)?;
            self.engine.search_files(root, pattern).await
        }
        .await;
        self.finish(entry, result, |r| {
            format!("pattern={pattern} results={} truncated={}", r.total_count, r.truncated)
        })
    }

    /// Content search in a file or archive
    ///
    /// # Errors
    ///
    /// Token, sandbox, authorization and search errors
    pub async fn content_search(
        &self,
        ctx: &RequestContext,
        path: &str,
        query: ContentQuery,
    ) -> Result<ContentSearchResult> {
        let mut entry = AuditEntry::new(AuditOperation::ContentSearch, &ctx.origin).resource(path);
        let term_chars = query.term.chars().count();
        let result = async {
            self.ensure_search_enabled()?;
            self.authorize(ctx, Some(path), OP_CONTENT_SEARCH, &mut entry)?;
            self.engine.search_content(path, query).await
        }
        .await;
        self.finish(entry, result, |r| {
            format!(
                "term_chars={term_chars} matches={} truncated={}",
                r.total_matches, r.truncated
            )
        })
    }

    /// Open a file for streaming download
    ///
    /// # Errors
    ///
    /// Token, sandbox, authorization and accessibility errors
    pub async fn download(&self, ctx: &RequestContext, path: &str) -> Result<Download> {
        let mut entry = AuditEntry::new(AuditOperation::Download, &ctx.origin).resource(path);
        let result = async {
            self.ensure_search_enabled()?;
            self.authorize(ctx, Some(path), OP_DOWNLOAD, &mut entry)?;
            self.engine.open_download(path).await
        }
        .await;
        self.finish(entry, result, |d| format!("bytes={}", d.size))
    }

    /// Store an uploaded file
    ///
    /// # Errors
    ///
    /// `FeatureDisabled` when uploads are off, token/sandbox/authorization
    /// errors, `InvalidInput` for bad names, extensions, sizes or an existing
    /// file without `overwrite`, `NotFound` for a missing target directory
    pub async fn upload(
        &self,
        ctx: &RequestContext,
        request: UploadRequest,
    ) -> Result<UploadOutcome> {
        let target = request.target_path.clone().filter(|t| !t.trim().is_empty());
        let mut entry = AuditEntry::new(AuditOperation::Upload, &ctx.origin)
            .resource(target.clone().unwrap_or_else(|| request.file_name.clone()));
        let description = request.description.clone().unwrap_or_default();

        let result = async {
            if !self.upload.enabled {
                return Err(Error::FeatureDisabled("upload is disabled".to_string()));
            }
            let upload_root = self
                .upload
                .directory
                .as_ref()
                .ok_or_else(|| {
                    Error::FeatureDisabled("no upload directory configured".to_string())
                })?
                .display()
                .to_string();
            let target_raw = target.as_deref().unwrap_or(&upload_root);

            let claims = self.authorize(ctx, Some(target_raw), OP_UPLOAD, &mut entry)?;
            self.store_upload(&claims, &upload_root, target_raw, request).await
        }
        .await;

        self.finish(entry, result, |o| {
            format!("bytes={} file={} description={description}", o.file_size, o.file_name)
        })
    }

    async fn store_upload(
        &self,
        claims: &Claims,
        upload_root: &str,
        target_raw: &str,
        request: UploadRequest,
    ) -> Result<UploadOutcome> {
        let file_name = validate_file_name(&request.file_name)?;
        check_extension(&file_name, &self.upload.allowed_extensions)?;

        let size = request.data.len() as u64;
        if size == 0 {
            return Err(Error::invalid("Uploaded file is empty"));
        }
        if size > self.upload.max_size {
            return Err(Error::invalid(format!(
                "Upload of {size} bytes exceeds the maximum of {} bytes",
                self.upload.max_size
            )));
        }

        let root = self.sandbox.sanitize(upload_root)?.into_path();
        let dir = self.sandbox.sanitize(target_raw)?.into_path();
        if !dir.starts_with(&root) {
            return Err(Error::violation(format!(
                "{} is outside the upload directory",
                dir.display()
            )));
        }
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Err(Error::invalid("Upload target is not a directory")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(dir.display().to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        }

        let destination = dir.join(&file_name);
        let destination = self
            .sandbox
            .sanitize(&destination.display().to_string())?
            .into_path();

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if request.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = options.open(&destination).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::invalid(format!("{file_name} already exists"))
            } else {
                Error::Io(e)
            }
        })?;
        file.write_all(&request.data).await?;
        file.flush().await?;

        info!(
            event = "upload_stored",
            identity = %claims.sub,
            path = %destination.display(),
            bytes = size,
            "Upload stored"
        );

        Ok(UploadOutcome {
            file_name,
            target_path: destination,
            file_size: size,
            uploaded_by: claims.sub.clone(),
            uploaded_at: Utc::now(),
        })
    }

    /// Capability and limit summary for an authenticated caller
    ///
    /// # Errors
    ///
    /// `Error::TokenInvalid` for a missing or invalid token
    pub async fn status(&self, ctx: &RequestContext) -> Result<StatusReport> {
        let mut entry = AuditEntry::new(AuditOperation::Status, &ctx.origin).resource("status");
        let result = self.verify_token(ctx, &mut entry).map(|_| self.status_report());
        self.finish(entry, result, |_| "status reported".to_string())
    }

    fn status_report(&self) -> StatusReport {
        let limits = self.engine.limits();
        StatusReport {
            search_enabled: self.search_enabled,
            upload_enabled: self.upload.enabled,
            max_search_results: limits.max_results,
            search_timeout_secs: limits.timeout.as_secs(),
            download_timeout_secs: limits.download_timeout.as_secs(),
            max_concurrent_operations: limits.max_concurrent,
            available_operation_slots: self.engine.available_permits(),
            max_directory_depth: limits.max_depth,
            max_file_size: self.sandbox.max_file_size(),
            max_upload_size: self.upload.max_size,
            allowed_upload_extensions: self.upload.allowed_extensions.clone(),
            supported_archive_types: SUPPORTED_EXTENSIONS
                .iter()
                .map(|e| (*e).to_string())
                .collect(),
            revocation_enabled: self.tokens.revocation_enabled(),
            tracked_rate_limit_keys: self.limiter.tracked_keys(),
            locked_rate_limit_keys: self.limiter.locked_keys(),
            audit: self.audit.stats(),
        }
    }

    /// Purge expired rate-limit records, cached principals and revocations
    pub fn maintenance(&self) -> MaintenanceReport {
        MaintenanceReport {
            rate_limit_records: self.limiter.cleanup_expired(),
            cached_principals: self.auth.purge_expired(),
            revocations: self.tokens.purge_expired_revocations(),
        }
    }
}

/// Accept a plain file name only
fn validate_file_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::invalid("File name must not be empty"));
    }
    if name.chars().count() > MAX_FILE_NAME_LEN {
        return Err(Error::invalid("File name is too long"));
    }
    let plain = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == name);
    if !plain
        || name.contains(['/', '\\'])
        || name.contains("..")
        || name.starts_with('.')
        || name.chars().any(char::is_control)
    {
        return Err(Error::violation(format!("{name:?} is not a plain file name")));
    }
    Ok(name.to_string())
}

fn check_extension(name: &str, allowed: &[String]) -> Result<()> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
        Ok(())
    } else {
        Err(Error::invalid(format!("Extension {ext:?} is not accepted")))
    }
}
