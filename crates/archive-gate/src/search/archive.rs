//! Archive container traversal
//!
//! Entries are visited one at a time from the container stream; nothing is
//! extracted to disk.

use super::Deadline;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Extensions recognised as archives, lowercase
pub const SUPPORTED_EXTENSIONS: &[&str] = &["zip", "jar", "war", "ear", "tar", "tar.gz", "tgz"];

/// Container format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// zip and the jar family
    Zip,
    /// Uncompressed tar
    Tar,
    /// Gzip-compressed tar
    TarGz,
}

impl ArchiveKind {
    /// Detect the container format from the file name
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else if [".zip", ".jar", ".war", ".ear"]
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Whether to keep visiting entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Visit the next entry
    Continue,
    /// Stop traversal
    Stop,
}

/// A regular-file entry handed to the visitor
pub struct EntryView<'a> {
    /// Entry name inside the container
    pub name: String,
    /// Uncompressed size as declared by the container
    pub size: u64,
    /// Modification time, when the container records one
    pub modified: Option<DateTime<Utc>>,
    /// Decompressed entry content
    pub reader: &'a mut dyn Read,
}

fn corrupted(err: impl std::fmt::Display) -> Error {
    Error::ArchiveCorrupted(err.to_string())
}

/// Visit every regular-file entry of an archive in container order
///
/// # Errors
///
/// `Error::ArchiveCorrupted` when the container cannot be parsed,
/// `Error::Timeout` when the deadline passes, or any error the visitor returns
pub fn for_each_entry<F>(
    path: &Path,
    kind: ArchiveKind,
    deadline: &Deadline,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(EntryView<'_>) -> Result<Flow>,
{
    let file = File::open(path)?;

    match kind {
        ArchiveKind::Zip => {
            let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
            for index in 0..archive.len() {
                deadline.check()?;
                let mut entry = archive.by_index(index)?;
                if entry.is_dir() {
                    continue;
                }
                let view = EntryView {
                    name: entry.name().to_string(),
                    size: entry.size(),
                    modified: None,
                    reader: &mut entry,
                };
                if visit(view)? == Flow::Stop {
                    break;
                }
            }
            Ok(())
        }
        ArchiveKind::Tar => tar_entries(BufReader::new(file), deadline, &mut visit),
        ArchiveKind::TarGz => {
            tar_entries(GzDecoder::new(BufReader::new(file)), deadline, &mut visit)
        }
    }
}

fn tar_entries<R, F>(reader: R, deadline: &Deadline, visit: &mut F) -> Result<()>
where
    R: Read,
    F: FnMut(EntryView<'_>) -> Result<Flow>,
{
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(corrupted)?;

    for entry in entries {
        deadline.check()?;
        let mut entry = entry.map_err(corrupted)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .map_err(corrupted)?
            .to_string_lossy()
            .into_owned();
        let size = entry.header().size().map_err(corrupted)?;
        let modified = entry
            .header()
            .mtime()
            .ok()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        let view = EntryView {
            name,
            size,
            modified,
            reader: &mut entry,
        };
        if visit(view)? == Flow::Stop {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_detect_kinds() {
        assert_eq!(ArchiveKind::detect(Path::new("a.ZIP")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("lib.jar")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("b.tar")), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::detect(Path::new("c.tar.gz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("d.tgz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("e.txt")), None);
    }

    #[test]
    fn test_zip_entries_visited_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.zip");
        write_zip(&path, &[("one.txt", "1"), ("two.txt", "22")]);

        let deadline = Deadline::after(Duration::from_secs(5));
        let mut seen = Vec::new();
        for_each_entry(&path, ArchiveKind::Zip, &deadline, |entry| {
            let mut content = String::new();
            entry.reader.read_to_string(&mut content)?;
            seen.push((entry.name, content));
            Ok(Flow::Continue)
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                ("one.txt".to_string(), "1".to_string()),
                ("two.txt".to_string(), "22".to_string())
            ]
        );
    }

    #[test]
    fn test_garbage_zip_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.zip");
        std::fs::write(&path, b"this is not a zip archive at all").unwrap();

        let deadline = Deadline::after(Duration::from_secs(5));
        let result = for_each_entry(&path, ArchiveKind::Zip, &deadline, |_| Ok(Flow::Continue));
        assert!(matches!(result, Err(Error::ArchiveCorrupted(_))));
    }
}
