//! Path Sandbox Module
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Information Input Validation)
//! STIG: V-222396, V-222596
//! Implementation: The only gate between a request path and the filesystem.
//! Raw input is screened for traversal markers, normalised, canonicalised and
//! then checked against the allowed and excluded roots.

use crate::config::SandboxConfig;
use crate::{Error, Result};
use std::ffi::OsString;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Substrings rejected anywhere in the raw path (compared lowercase)
const FORBIDDEN_SEQUENCES: &[&str] = &[
    "..",
    // single and double percent-encoding of '.', '/', '\' and NUL
    "%2e",
    "%2f",
    "%5c",
    "%00",
    "%25",
    // overlong UTF-8 encodings
    "%c0%ae",
    "%c0%af",
    "%c1%9c",
    "%c1%1c",
    // escaped hex / unicode forms
    "\\x2e",
    "\\x2f",
    "\\x5c",
    "\\u002e",
    "\\u002f",
    "\\u005c",
    "0x2e",
    "0x2f",
    "0x5c",
];

/// Characters that normalise to dots or separators under Unicode folding
const FORBIDDEN_CHARS: &[char] = &[
    '\u{2024}', // one dot leader
    '\u{2025}', // two dot leader
    '\u{FE52}', // small full stop
    '\u{FF0E}', // fullwidth full stop
    '\u{2215}', // division slash
    '\u{2044}', // fraction slash
    '\u{FF0F}', // fullwidth solidus
    '\u{29F5}', // reverse solidus operator
    '\u{FF3C}', // fullwidth reverse solidus
];

/// How strongly a sanitized path is bound to the real filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assurance {
    /// Symlinks resolved against the filesystem
    Full,
    /// Symlink resolution unavailable; normalised absolute path only
    Reduced,
}

/// A path that passed every sandbox check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedPath {
    canonical: PathBuf,
    assurance: Assurance,
}

impl SanitizedPath {
    /// Canonical absolute path
    pub fn path(&self) -> &Path {
        &self.canonical
    }

    /// Consume into the canonical path
    pub fn into_path(self) -> PathBuf {
        self.canonical
    }

    /// Resolution strength
    pub fn assurance(&self) -> Assurance {
        self.assurance
    }
}

/// A regular file that exists, is readable and is within the size limit
#[derive(Debug)]
pub struct AccessibleFile {
    /// Sanitized location
    pub path: SanitizedPath,
    /// Metadata read during the check
    pub metadata: Metadata,
}

/// Allow/deny root enforcement
///
/// NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege)
/// Implementation: Fail-closed; an empty allow list rejects every path
#[derive(Debug, Clone)]
pub struct PathSandbox {
    allowed: Vec<PathBuf>,
    excluded: Vec<PathBuf>,
    max_file_size: u64,
}

impl PathSandbox {
    /// Build a sandbox from configuration
    pub fn new(config: &SandboxConfig) -> Self {
        Self::from_roots(
            &config.allowed_paths,
            &config.excluded_paths,
            config.max_file_size,
        )
    }

    /// Build a sandbox from explicit roots
    ///
    /// Roots are canonicalised once here so comparisons line up with
    /// canonicalised request paths.
    pub fn from_roots(allowed: &[PathBuf], excluded: &[PathBuf], max_file_size: u64) -> Self {
        Self {
            allowed: allowed.iter().filter_map(|r| canonical_root(r)).collect(),
            excluded: excluded.iter().filter_map(|r| canonical_root(r)).collect(),
            max_file_size,
        }
    }

    /// Canonical allowed roots
    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed
    }

    /// Maximum accessible file size in bytes
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Check whether a raw path may be accessed
    pub fn is_allowed(&self, raw: &str) -> bool {
        self.sanitize(raw).is_ok()
    }

    /// Screen, normalise, canonicalise and root-check a raw path
    ///
    /// # Errors
    ///
    /// - `Error::InvalidInput` for blank input
    /// - `Error::SecurityViolation` for traversal markers, encoded separators,
    ///   control characters, dangling links or any path outside the roots
    pub fn sanitize(&self, raw: &str) -> Result<SanitizedPath> {
        if raw.trim().is_empty() {
            return Err(Error::invalid("Path must not be empty"));
        }

        screen_raw(raw)?;

        if self.allowed.is_empty() {
            warn!(event = "sandbox_rejected", reason = "no_allowed_roots", "Path rejected");
            return Err(Error::violation("no allowed roots configured"));
        }

        let normalized = normalize(raw, &self.allowed[0])?;
        let (canonical, assurance) = resolve(&normalized)?;

        if assurance == Assurance::Reduced {
            warn!(
                event = "sandbox_reduced_assurance",
                path = %normalized.display(),
                "Symlink resolution unavailable, checking normalized path"
            );
        }

        self.check_roots(&canonical)?;

        debug!(path = %canonical.display(), "Path accepted by sandbox");
        Ok(SanitizedPath {
            canonical,
            assurance,
        })
    }

    /// Root check on an already-canonical path
    ///
    /// Excluded roots win over allowed roots.
    fn check_roots(&self, canonical: &Path) -> Result<()> {
        if self.excluded.iter().any(|root| is_descendant(canonical, root)) {
            warn!(
                event = "sandbox_rejected",
                reason = "excluded_root",
                path = %canonical.display(),
                "Path rejected"
            );
            return Err(Error::violation(format!(
                "{} is below an excluded root",
                canonical.display()
            )));
        }

        if !self.allowed.iter().any(|root| is_descendant(canonical, root)) {
            warn!(
                event = "sandbox_rejected",
                reason = "outside_allowed_roots",
                path = %canonical.display(),
                "Path rejected"
            );
            return Err(Error::violation(format!(
                "{} is outside every allowed root",
                canonical.display()
            )));
        }

        Ok(())
    }

    /// Sanitize and require an existing, readable regular file within the size limit
    ///
    /// # Errors
    ///
    /// Sandbox errors from [`Self::sanitize`], then `Error::NotFound`,
    /// `Error::InvalidInput` (directory or oversized) or `Error::Io` (unreadable)
    pub fn check_accessible(&self, raw: &str) -> Result<AccessibleFile> {
        let path = self.sanitize(raw)?;

        let metadata = match std::fs::metadata(path.path()) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(path.path().display().to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if !metadata.is_file() {
            return Err(Error::invalid(format!(
                "{} is not a regular file",
                path.path().display()
            )));
        }

        if metadata.len() > self.max_file_size {
            return Err(Error::invalid(format!(
                "File size {} exceeds the maximum of {} bytes",
                metadata.len(),
                self.max_file_size
            )));
        }

        // Readability: open and drop
        std::fs::File::open(path.path())?;

        Ok(AccessibleFile { path, metadata })
    }

    /// Boolean form of [`Self::check_accessible`]
    pub fn is_file_accessible(&self, raw: &str) -> bool {
        self.check_accessible(raw).is_ok()
    }
}

/// Reject raw input carrying traversal markers in any encoding
fn screen_raw(raw: &str) -> Result<()> {
    if raw.chars().any(|c| c.is_control() || FORBIDDEN_CHARS.contains(&c)) {
        warn!(event = "path_traversal_attempt", reason = "forbidden_character", "Path rejected");
        return Err(Error::violation("path contains forbidden characters"));
    }

    let lowered = raw.to_lowercase();
    if let Some(marker) = FORBIDDEN_SEQUENCES.iter().find(|m| lowered.contains(**m)) {
        warn!(
            event = "path_traversal_attempt",
            marker = *marker,
            "Path rejected"
        );
        return Err(Error::violation("path contains a traversal marker"));
    }

    Ok(())
}

/// Unify separators, collapse `//` and `.`, and make the path absolute
///
/// Relative input is anchored at `anchor` (the first allowed root).
fn normalize(raw: &str, anchor: &Path) -> Result<PathBuf> {
    let unified = raw.trim().replace('\\', "/");
    let candidate = PathBuf::from(&unified);

    let absolute = if candidate.is_absolute() {
        candidate
    } else {
        anchor.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                normalized.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                // Already rejected by screen_raw
                return Err(Error::violation("parent directory component"));
            }
        }
    }

    Ok(normalized)
}

/// Resolve symlinks; for paths that do not exist yet, resolve the deepest
/// existing ancestor and re-append the remaining components.
fn resolve(path: &Path) -> Result<(PathBuf, Assurance)> {
    match std::fs::canonicalize(path) {
        Ok(canonical) => Ok((canonical, Assurance::Full)),
        Err(e) if e.kind() == ErrorKind::NotFound => resolve_missing(path),
        Err(e) => {
            debug!(error = %e, "canonicalize failed, using normalized path");
            Ok((path.to_path_buf(), Assurance::Reduced))
        }
    }
}

fn resolve_missing(path: &Path) -> Result<(PathBuf, Assurance)> {
    let mut tail: Vec<OsString> = Vec::new();
    let mut current = path;

    loop {
        // A link whose target is missing must not be treated as a fresh name
        if std::fs::symlink_metadata(current).is_ok() {
            return Err(Error::violation(format!(
                "{} is a dangling link",
                current.display()
            )));
        }

        let Some(name) = current.file_name() else {
            return Ok((path.to_path_buf(), Assurance::Reduced));
        };
        tail.push(name.to_os_string());

        let Some(parent) = current.parent() else {
            return Ok((path.to_path_buf(), Assurance::Reduced));
        };

        match std::fs::canonicalize(parent) {
            Ok(mut base) => {
                for part in tail.iter().rev() {
                    base.push(part);
                }
                return Ok((base, Assurance::Full));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => current = parent,
            Err(_) => return Ok((path.to_path_buf(), Assurance::Reduced)),
        }
    }
}

fn canonical_root(root: &Path) -> Option<PathBuf> {
    let raw = root.to_str()?;
    let anchor = Path::new("/");
    let normalized = normalize(raw, anchor).ok()?;
    resolve(&normalized).ok().map(|(p, _)| p)
}

/// Component-wise descendant check (`/data/a2` is not below `/data/a`)
#[cfg(any(windows, target_os = "macos"))]
fn is_descendant(path: &Path, root: &Path) -> bool {
    let lower = |p: &Path| PathBuf::from(p.to_string_lossy().to_lowercase());
    lower(path).starts_with(lower(root))
}

/// Component-wise descendant check (`/data/a2` is not below `/data/a`)
#[cfg(not(any(windows, target_os = "macos")))]
fn is_descendant(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox_for(dir: &TempDir) -> PathSandbox {
        PathSandbox::from_roots(&[dir.path().to_path_buf()], &[], 1024)
    }

    #[test]
    fn test_rejects_blank_input() {
        let dir = TempDir::new().unwrap();
        let sandbox = sandbox_for(&dir);
        assert!(matches!(sandbox.sanitize(""), Err(Error::InvalidInput(_))));
        assert!(matches!(sandbox.sanitize("   "), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_encoded_traversal() {
        let dir = TempDir::new().unwrap();
        let sandbox = sandbox_for(&dir);
        let root = dir.path().display().to_string();

        for raw in [
            format!("{root}/../etc/passwd"),
            format!("{root}/..\\etc"),
            format!("{root}/%2e%2e/etc"),
            format!("{root}/%2E%2E%2Fetc"),
            format!("{root}/%252e%252e/etc"),
            format!("{root}/a%00.txt"),
            format!("{root}/a\0.txt"),
            format!("{root}/\\x2e\\x2e/etc"),
            format!("{root}/\u{FF0E}\u{FF0E}/etc"),
            format!("{root}/%c0%ae%c0%ae/etc"),
        ] {
            assert!(
                matches!(sandbox.sanitize(&raw), Err(Error::SecurityViolation(_))),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn test_collapses_separators_and_dots() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let sandbox = sandbox_for(&dir);

        let raw = format!("{}//./a.txt", dir.path().display());
        let sanitized = sandbox.sanitize(&raw).unwrap();
        let expected = std::fs::canonicalize(dir.path().join("a.txt")).unwrap();
        assert_eq!(sanitized.path(), expected.as_path());
        assert_eq!(sanitized.assurance(), Assurance::Full);
    }

    #[test]
    fn test_relative_paths_anchor_at_first_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.log"), "x").unwrap();
        let sandbox = sandbox_for(&dir);
        assert!(sandbox.is_allowed("b.log"));
    }

    #[test]
    fn test_sibling_prefix_is_not_descendant() {
        let dir = TempDir::new().unwrap();
        let inside = dir.path().join("data");
        let sibling = dir.path().join("data2");
        std::fs::create_dir_all(&inside).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();

        let sandbox = PathSandbox::from_roots(&[inside], &[], 1024);
        assert!(!sandbox.is_allowed(&sibling.display().to_string()));
    }

    #[test]
    fn test_missing_file_still_sanitizes() {
        let dir = TempDir::new().unwrap();
        let sandbox = sandbox_for(&dir);
        let raw = format!("{}/not/yet/here.txt", dir.path().display());
        assert!(sandbox.sanitize(&raw).is_ok());
        assert!(matches!(
            sandbox.check_accessible(&raw),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_oversized_file_not_accessible() {
        let dir = TempDir::new().unwrap();
        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![b'a'; 2048]).unwrap();
        let sandbox = sandbox_for(&dir);
        assert!(!sandbox.is_file_accessible(&big.display().to_string()));
    }

    #[test]
    fn test_empty_roots_fail_closed() {
        let sandbox = PathSandbox::from_roots(&[], &[], 1024);
        assert!(!sandbox.is_allowed("/tmp"));
        assert!(!sandbox.is_allowed("relative.txt"));
    }
}
