//! Archive-aware search engine
//!
//! NIST 800-53: AC-3 (Access Enforcement), SC-5 (Denial of Service Protection)
//! Implementation: File and content search over plain directories and archive
//! containers. Every visited path passes the sandbox, every operation runs
//! under a deadline, and a shared semaphore caps concurrent operations.

pub mod archive;
pub mod content;
pub mod pattern;

use crate::config::SearchConfig;
use crate::sandbox::PathSandbox;
use crate::{Error, Result};
use archive::{ArchiveKind, EntryView, Flow};
use chrono::{DateTime, Utc};
use content::{LineMatcher, MatchCollector, SNIFF_LEN};
use pattern::WildcardPattern;
use serde::Serialize;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Extra time the async side waits for a blocking worker to notice its deadline
const WORKER_GRACE: Duration = Duration::from_millis(500);

/// Cooperative deadline shared with blocking workers
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// Deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort the worker at its next check
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Fail once the budget is spent or the deadline was cancelled
    ///
    /// # Errors
    ///
    /// `Error::Timeout`
    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) || Instant::now() >= self.at {
            return Err(Error::timeout("search exceeded its time budget"));
        }
        Ok(())
    }
}

/// What a file entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    /// Plain file
    File,
    /// Directory
    Directory,
    /// Entry inside an archive container
    ArchiveEntry,
}

/// A file search result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Canonical path; archive entries are `<archive>!/<entry>`
    pub path: String,
    /// Path relative to the search root
    pub relative_path: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub last_modified: Option<DateTime<Utc>>,
    /// Entry kind
    pub kind: EntryKind,
}

/// Result of a file search
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSearchResult {
    /// Canonical search root
    pub root: PathBuf,
    /// Matches in traversal order
    pub entries: Vec<FileEntry>,
    /// Number of returned entries
    pub total_count: usize,
    /// The result cap was reached
    pub truncated: bool,
}

/// A single content search hit
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    /// Owning file (the archive, for archive entries)
    pub file: String,
    /// Entry name inside the archive
    pub entry: Option<String>,
    /// 1-based line number
    pub line_number: u64,
    /// Line excerpt
    pub line: String,
    /// Matched text as it appears in the line
    pub matched_text: String,
    /// 0-based start column
    pub column_start: usize,
    /// 0-based end column, exclusive
    pub column_end: usize,
}

/// Result of a content search
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSearchResult {
    /// Hits in file/line/column order
    pub matches: Vec<SearchMatch>,
    /// Number of returned hits
    pub total_matches: usize,
    /// The result cap was reached
    pub truncated: bool,
    /// Archive entries skipped as binary
    pub skipped_entries: usize,
}

/// Parameters of a content search
#[derive(Debug, Clone)]
pub struct ContentQuery {
    /// Text sought
    pub term: String,
    /// Compare case exactly
    pub case_sensitive: bool,
    /// Require word boundaries on both sides
    pub whole_word: bool,
}

/// Limits applied by the engine
#[derive(Debug, Clone)]
pub struct SearchLimits {
    /// Cap on returned entries and hits
    pub max_results: usize,
    /// Budget per operation
    pub timeout: Duration,
    /// Budget for streaming one download body
    pub download_timeout: Duration,
    /// Maximum recursion depth below the root
    pub max_depth: usize,
    /// Concurrent operations
    pub max_concurrent: usize,
    /// List archive entries during file search
    pub search_archives: bool,
}

impl From<&SearchConfig> for SearchLimits {
    fn from(config: &SearchConfig) -> Self {
        Self {
            max_results: config.max_search_results,
            timeout: Duration::from_secs(config.search_timeout_secs),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            max_depth: config.max_directory_depth,
            max_concurrent: config.max_concurrent_operations,
            search_archives: config.search_archives,
        }
    }
}

/// An opened download
///
/// Holds a concurrency permit until dropped.
#[derive(Debug)]
pub struct Download {
    /// Canonical file path
    pub path: PathBuf,
    /// File name for content-disposition
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type inferred from the extension
    pub content_type: &'static str,
    /// File stream
    pub reader: GuardedFile,
}

type PermitSlot = Arc<Mutex<Option<OwnedSemaphorePermit>>>;

fn release(slot: &PermitSlot) -> bool {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .is_some()
}

/// File handle bounded by the download budget
///
/// The concurrency permit is released on drop, or by a watchdog once the
/// budget is spent, whichever comes first. Reads after the budget fail with
/// `TimedOut`.
#[derive(Debug)]
pub struct GuardedFile {
    file: tokio::fs::File,
    expires_at: Instant,
    permit: PermitSlot,
    watchdog: JoinHandle<()>,
}

impl GuardedFile {
    fn new(file: tokio::fs::File, permit: OwnedSemaphorePermit, budget: Duration) -> Self {
        let expires_at = Instant::now() + budget;
        let permit: PermitSlot = Arc::new(Mutex::new(Some(permit)));
        let slot = Arc::clone(&permit);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if release(&slot) {
                warn!(
                    event = "download_timeout",
                    budget_secs = budget.as_secs(),
                    "Download exceeded its time budget; permit reclaimed"
                );
            }
        });
        Self {
            file,
            expires_at,
            permit,
            watchdog,
        }
    }
}

impl AsyncRead for GuardedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if Instant::now() >= this.expires_at {
            release(&this.permit);
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "download exceeded its time budget",
            )));
        }
        Pin::new(&mut this.file).poll_read(cx, buf)
    }
}

impl Drop for GuardedFile {
    fn drop(&mut self) {
        self.watchdog.abort();
        release(&self.permit);
    }
}

/// Search and download service
pub struct SearchEngine {
    sandbox: Arc<PathSandbox>,
    limits: SearchLimits,
    permits: Arc<Semaphore>,
}

impl SearchEngine {
    /// Create an engine from configuration
    pub fn new(sandbox: Arc<PathSandbox>, config: &SearchConfig) -> Self {
        Self::with_limits(sandbox, SearchLimits::from(config))
    }

    /// Create an engine from explicit limits
    pub fn with_limits(sandbox: Arc<PathSandbox>, limits: SearchLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent.max(1)));
        Self {
            sandbox,
            limits,
            permits,
        }
    }

    /// Active limits
    pub fn limits(&self) -> &SearchLimits {
        &self.limits
    }

    /// Operations currently able to start
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            warn!(
                event = "concurrency_cap_reached",
                max_concurrent = self.limits.max_concurrent,
                "Rejecting operation"
            );
            Error::resource_exhaustion("concurrent operation limit reached")
        })
    }

    /// Run blocking work under a permit and the operation deadline
    async fn run_blocking<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Deadline) -> Result<T> + Send + 'static,
    {
        let permit = self.acquire()?;
        let deadline = Deadline::after(self.limits.timeout);
        let worker_deadline = deadline.clone();
        // The worker owns the permit so a timed-out search holds its slot until it stops
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work(&worker_deadline)
        });

        match tokio::time::timeout(self.limits.timeout + WORKER_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::Internal(format!(
                "{operation} worker failed: {join_error}"
            ))),
            Err(_) => {
                deadline.cancel();
                warn!(event = "operation_timeout", operation, "Operation timed out");
                Err(Error::timeout(format!("{operation} exceeded its time budget")))
            }
        }
    }

    /// Wildcard file search below `root`
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a bad pattern or non-directory root, sandbox errors
    /// for the root, `NotFound`, `Timeout`, `ResourceExhaustion`
    pub async fn search_files(&self, root: &str, pattern: &str) -> Result<FileSearchResult> {
        let pattern = WildcardPattern::new(pattern)?;
        let sandbox = Arc::clone(&self.sandbox);
        let limits = self.limits.clone();
        let root = root.to_string();

        let result = self
            .run_blocking("file_search", move |deadline| {
                walk_and_match(&sandbox, &limits, &root, &pattern, deadline)
            })
            .await?;

        info!(
            event = "file_search_completed",
            root = %result.root.display(),
            total = result.total_count,
            truncated = result.truncated,
            "File search completed"
        );
        Ok(result)
    }

    /// Line-oriented content search in a text file or archive
    ///
    /// # Errors
    ///
    /// `InvalidInput`, sandbox errors, `NotFound`, `UnsupportedFormat` for
    /// binary files, `ArchiveCorrupted`, `Timeout`, `ResourceExhaustion`
    pub async fn search_content(
        &self,
        path: &str,
        query: ContentQuery,
    ) -> Result<ContentSearchResult> {
        let matcher = LineMatcher::new(&query.term, query.case_sensitive, query.whole_word)?;
        let sandbox = Arc::clone(&self.sandbox);
        let max_results = self.limits.max_results;
        let path = path.to_string();

        let result = self
            .run_blocking("content_search", move |deadline| {
                scan_target(&sandbox, &path, &matcher, max_results, deadline)
            })
            .await?;

        info!(
            event = "content_search_completed",
            total = result.total_matches,
            truncated = result.truncated,
            "Content search completed"
        );
        Ok(result)
    }

    /// Open a file for streaming download
    ///
    /// # Errors
    ///
    /// Sandbox errors, `NotFound`, `InvalidInput` for directories and
    /// oversized files, `Timeout`, `ResourceExhaustion`
    pub async fn open_download(&self, path: &str) -> Result<Download> {
        let permit = self.acquire()?;
        let sandbox = Arc::clone(&self.sandbox);
        let raw = path.to_string();

        let open = async move {
            let accessible = tokio::task::spawn_blocking(move || sandbox.check_accessible(&raw))
                .await
                .map_err(|e| Error::Internal(format!("download worker failed: {e}")))??;
            let file = tokio::fs::File::open(accessible.path.path()).await?;
            Ok::<_, Error>((accessible, file))
        };

        let (accessible, file) = tokio::time::timeout(self.limits.timeout, open)
            .await
            .map_err(|_| Error::timeout("download exceeded its time budget"))??;

        let path = accessible.path.into_path();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        Ok(Download {
            content_type: content_type_for(&path),
            file_name,
            size: accessible.metadata.len(),
            path,
            reader: GuardedFile::new(file, permit, self.limits.download_timeout),
        })
    }
}

fn modified_of(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

fn relative_display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn walk_and_match(
    sandbox: &PathSandbox,
    limits: &SearchLimits,
    raw_root: &str,
    pattern: &WildcardPattern,
    deadline: &Deadline,
) -> Result<FileSearchResult> {
    let root = sandbox.sanitize(raw_root)?.into_path();
    match std::fs::metadata(&root) {
        Ok(m) if m.is_dir() => {}
        Ok(_) => return Err(Error::invalid("Search path is not a directory")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(root.display().to_string()));
        }
        Err(e) => return Err(Error::Io(e)),
    }

    let mut entries = Vec::new();
    let mut truncated = false;

    let mut walker = WalkDir::new(&root)
        .min_depth(1)
        .max_depth(limits.max_depth.max(1))
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(next) = walker.next() {
        deadline.check()?;
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let Some(raw) = entry.path().to_str() else {
            continue;
        };

        // Only paths the sandbox accepts are visited; rejected directories are pruned
        let sanitized = match sandbox.sanitize(raw) {
            Ok(s) => s,
            Err(_) => {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
        };
        let canonical = sanitized.path();
        let Ok(metadata) = std::fs::metadata(canonical) else {
            continue;
        };

        let name = entry.file_name().to_string_lossy();
        if pattern.matches(&name) {
            entries.push(FileEntry {
                path: canonical.display().to_string(),
                relative_path: relative_display(entry.path(), &root),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                last_modified: modified_of(&metadata),
                kind: if metadata.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
            });
            if entries.len() >= limits.max_results {
                truncated = true;
                break;
            }
        }

        if limits.search_archives && metadata.is_file() {
            if let Some(kind) = ArchiveKind::detect(canonical) {
                let relative = relative_display(entry.path(), &root);
                let listed = list_archive_matches(
                    canonical,
                    &relative,
                    kind,
                    pattern,
                    limits.max_results,
                    &mut entries,
                    deadline,
                );
                match listed {
                    Ok(()) => {}
                    Err(Error::Timeout(msg)) => return Err(Error::Timeout(msg)),
                    Err(e) => warn!(
                        event = "archive_listing_failed",
                        archive = %canonical.display(),
                        error = %e,
                        "Skipping unreadable archive"
                    ),
                }
                if entries.len() >= limits.max_results {
                    truncated = true;
                    break;
                }
            }
        }
    }

    Ok(FileSearchResult {
        root,
        total_count: entries.len(),
        entries,
        truncated,
    })
}

fn list_archive_matches(
    archive_path: &Path,
    relative: &str,
    kind: ArchiveKind,
    pattern: &WildcardPattern,
    max_results: usize,
    entries: &mut Vec<FileEntry>,
    deadline: &Deadline,
) -> Result<()> {
    let container_modified = std::fs::metadata(archive_path)
        .ok()
        .and_then(|m| modified_of(&m));

    archive::for_each_entry(archive_path, kind, deadline, |entry: EntryView<'_>| {
        if !is_contained_entry_name(&entry.name) {
            debug!(
                archive = %archive_path.display(),
                entry = %entry.name,
                "Skipping archive entry that escapes its container"
            );
            return Ok(Flow::Continue);
        }
        let base = entry.name.rsplit('/').next().unwrap_or(&entry.name);
        if pattern.matches(base) {
            entries.push(FileEntry {
                path: format!("{}!/{}", archive_path.display(), entry.name),
                relative_path: format!("{relative}!/{}", entry.name),
                size: entry.size,
                last_modified: entry.modified.or(container_modified),
                kind: EntryKind::ArchiveEntry,
            });
        }
        Ok(if entries.len() >= max_results {
            Flow::Stop
        } else {
            Flow::Continue
        })
    })
}

/// Relative entry name with no parent or root components
fn is_contained_entry_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with(['/', '\\']) {
        return false;
    }
    name.split(['/', '\\'])
        .enumerate()
        .all(|(i, part)| part != ".." && !(i == 0 && part.contains(':')))
}

fn scan_target(
    sandbox: &PathSandbox,
    raw: &str,
    matcher: &LineMatcher,
    max_results: usize,
    deadline: &Deadline,
) -> Result<ContentSearchResult> {
    let accessible = sandbox.check_accessible(raw)?;
    let path = accessible.path.path();
    let label = path.display().to_string();
    let mut collector = MatchCollector::new(max_results);
    let mut skipped_entries = 0;

    if let Some(kind) = ArchiveKind::detect(path) {
        let entry_limit = sandbox.max_file_size();
        archive::for_each_entry(path, kind, deadline, |entry: EntryView<'_>| {
            let mut reader = BufReader::with_capacity(SNIFF_LEN, entry.reader.take(entry_limit));
            let sample = reader.fill_buf().map_err(|e| Error::ArchiveCorrupted(e.to_string()))?;
            if content::looks_binary(sample) {
                skipped_entries += 1;
                return Ok(Flow::Continue);
            }
            let scanned = content::scan_lines(
                reader,
                &label,
                Some(&entry.name),
                matcher,
                &mut collector,
                deadline,
            );
            scanned.map_err(|e| match e {
                Error::Io(io) => Error::ArchiveCorrupted(io.to_string()),
                other => other,
            })?;
            Ok(if collector.is_full() {
                Flow::Stop
            } else {
                Flow::Continue
            })
        })?;
    } else {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::with_capacity(64 * 1024, file);
        let sample = reader.fill_buf()?;
        if content::looks_binary(&sample[..sample.len().min(SNIFF_LEN)]) {
            return Err(Error::UnsupportedFormat(format!(
                "{label} is not a text file"
            )));
        }
        content::scan_lines(reader, &label, None, matcher, &mut collector, deadline)?;
    }

    Ok(ContentSearchResult {
        total_matches: collector.matches.len(),
        truncated: collector.truncated,
        matches: collector.matches,
        skipped_entries,
    })
}

/// MIME type for a download, by extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "sql" | "ctl" | "dat" => "text/plain; charset=utf-8",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "jar" | "war" | "ear" => "application/java-archive",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
