//! Path sandbox integration tests
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Information Input Validation)
//! STIG: V-222396, V-222596
//! Implementation: Traversal, exclusion and link-escape checks against real directories

use archive_gate::sandbox::PathSandbox;
use archive_gate::Error;
use std::fs;
use tempfile::TempDir;

/// Helper to create an allowed root with an excluded subtree and an outside directory
fn create_layout() -> (TempDir, TempDir, PathSandbox) {
    let allowed = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();

    fs::create_dir_all(allowed.path().join("public/logs")).unwrap();
    fs::create_dir_all(allowed.path().join("secret")).unwrap();
    fs::write(allowed.path().join("public/logs/app.log"), "ok\n").unwrap();
    fs::write(allowed.path().join("secret/keys.txt"), "hidden\n").unwrap();
    fs::write(outside.path().join("passwd"), "root:x:0:0\n").unwrap();

    let sandbox = PathSandbox::from_roots(
        &[allowed.path().to_path_buf()],
        &[allowed.path().join("secret")],
        1024 * 1024,
    );
    (allowed, outside, sandbox)
}

/// NIST 800-53: AC-3 - Paths below the allowed root are accepted
#[test]
fn test_allowed_file_is_accepted() {
    let (allowed, _outside, sandbox) = create_layout();
    let raw = allowed.path().join("public/logs/app.log");
    let sanitized = sandbox.sanitize(raw.to_str().unwrap()).unwrap();
    assert!(sanitized.path().ends_with("public/logs/app.log"));
    assert!(sandbox.is_file_accessible(raw.to_str().unwrap()));
}

/// NIST 800-53: AC-3 - Excluded roots win over allowed roots
#[test]
fn test_excluded_root_takes_precedence() {
    let (allowed, _outside, sandbox) = create_layout();
    let raw = allowed.path().join("secret/keys.txt");
    assert!(!sandbox.is_allowed(raw.to_str().unwrap()));

    let raw = allowed.path().join("secret");
    assert!(matches!(
        sandbox.sanitize(raw.to_str().unwrap()),
        Err(Error::SecurityViolation(_))
    ));
}

/// NIST 800-53: AC-3 - Paths outside every allowed root are rejected
#[test]
fn test_outside_root_is_rejected() {
    let (_allowed, outside, sandbox) = create_layout();
    let raw = outside.path().join("passwd");
    assert!(!sandbox.is_allowed(raw.to_str().unwrap()));
    assert!(!sandbox.is_allowed("/etc/passwd"));
}

/// NIST 800-53: SI-10 - Traversal variants rejected regardless of case or separator
#[test]
fn test_traversal_variants_rejected() {
    let (allowed, _outside, sandbox) = create_layout();
    let root = allowed.path().display().to_string();

    for raw in [
        format!("{root}/public/../secret/keys.txt"),
        format!("{root}\\public\\..\\secret"),
        format!("{root}/public/%2E%2e/secret"),
        format!("{root}/public/%252E%252E/secret"),
        format!("{root}/public%2fsecret"),
        format!("{root}/public/\\u002e\\u002e/secret"),
        "../../etc/passwd".to_string(),
        "..".to_string(),
    ] {
        assert!(
            matches!(sandbox.sanitize(&raw), Err(Error::SecurityViolation(_))),
            "expected rejection for {raw:?}"
        );
    }
}

/// NIST 800-53: AC-3 - No allowed roots rejects everything
#[test]
fn test_empty_allowed_roots_fail_closed() {
    let (allowed, _outside, _sandbox) = create_layout();
    let sandbox = PathSandbox::from_roots(&[], &[], 1024);
    let raw = allowed.path().join("public/logs/app.log");
    assert!(!sandbox.is_allowed(raw.to_str().unwrap()));
}

/// NIST 800-53: AC-3 - A link inside the root pointing outside is rejected
#[test]
#[cfg(unix)]
fn test_symlink_escape_is_rejected() {
    let (allowed, outside, sandbox) = create_layout();
    let link = allowed.path().join("public/escape");
    std::os::unix::fs::symlink(outside.path().join("passwd"), &link).unwrap();

    assert!(!sandbox.is_allowed(link.to_str().unwrap()));
    assert!(matches!(
        sandbox.check_accessible(link.to_str().unwrap()),
        Err(Error::SecurityViolation(_))
    ));
}

/// NIST 800-53: AC-3 - A directory link pointing at the excluded subtree is rejected
#[test]
#[cfg(unix)]
fn test_symlink_into_excluded_root_is_rejected() {
    let (allowed, _outside, sandbox) = create_layout();
    let link = allowed.path().join("public/mirror");
    std::os::unix::fs::symlink(allowed.path().join("secret"), &link).unwrap();

    let raw = link.join("keys.txt");
    assert!(!sandbox.is_allowed(raw.to_str().unwrap()));
}

/// NIST 800-53: AC-3 - A dangling link is not treated as a fresh file name
#[test]
#[cfg(unix)]
fn test_dangling_symlink_is_rejected() {
    let (allowed, outside, sandbox) = create_layout();
    let link = allowed.path().join("public/dangling");
    std::os::unix::fs::symlink(outside.path().join("does-not-exist"), &link).unwrap();

    assert!(!sandbox.is_allowed(link.to_str().unwrap()));
}

/// NIST 800-53: SI-10 - Missing files are NotFound, not violations
#[test]
fn test_missing_file_is_not_found() {
    let (allowed, _outside, sandbox) = create_layout();
    let raw = allowed.path().join("public/missing.log");
    assert!(matches!(
        sandbox.check_accessible(raw.to_str().unwrap()),
        Err(Error::NotFound(_))
    ));
}

/// NIST 800-53: SI-10 - Directories are not accessible files
#[test]
fn test_directory_is_not_accessible_file() {
    let (allowed, _outside, sandbox) = create_layout();
    let raw = allowed.path().join("public");
    assert!(matches!(
        sandbox.check_accessible(raw.to_str().unwrap()),
        Err(Error::InvalidInput(_))
    ));
}
