//! ZIP archive extraction with progress reporting and cooperative
//! cancellation.
//!
//! Extraction is blocking work; the pipeline runs it under
//! `spawn_blocking` and receives progress through a callback. Any failure
//! leaves partially-extracted files in place for debugging.

use crate::error::ExtractError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use zip::ZipArchive;

/// Report progress after every `PROGRESS_EVERY` files and on the last one.
const PROGRESS_EVERY: usize = 10;

/// Result of a completed extraction.
#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub extract_root: PathBuf,
    pub files_written: usize,
    pub bytes_written: u64,
}

/// Extraction either runs to completion or stops at a cancellation
/// check-point.
#[derive(Debug)]
pub enum Extraction {
    Completed(ExtractOutcome),
    Cancelled { files_written: usize },
}

/// Intra-stage progress snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ExtractProgress {
    pub files_done: usize,
    pub files_total: usize,
    /// Integer-rounded percent of uncompressed bytes written.
    pub percent: i32,
}

/// Unpack `archive_path` into `extract_root`.
///
/// The archive is pre-scanned for its total uncompressed size so progress
/// can be reported in bytes. Entries whose normalised path escapes the
/// extract root are rejected. The cancel flag is checked before every
/// entry write.
pub fn extract_archive(
    archive_path: &Path,
    extract_root: &Path,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(ExtractProgress),
) -> Result<Extraction, ExtractError> {
    let file = File::open(archive_path).map_err(|source| ExtractError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = ZipArchive::new(file)
        .map_err(|error| ExtractError::CorruptArchive(error.to_string()))?;

    // Pre-scan for total uncompressed size and file count.
    let mut bytes_total: u64 = 0;
    let mut files_total: usize = 0;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|error| ExtractError::CorruptArchive(error.to_string()))?;
        if !entry.is_dir() {
            bytes_total += entry.size();
            files_total += 1;
        }
    }

    std::fs::create_dir_all(extract_root).map_err(|source| ExtractError::Io {
        path: extract_root.to_path_buf(),
        source,
    })?;

    let mut files_written = 0usize;
    let mut bytes_written = 0u64;

    for index in 0..archive.len() {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!(
                archive = %archive_path.display(),
                files_written,
                "extraction cancelled"
            );
            return Ok(Extraction::Cancelled { files_written });
        }

        let mut entry = archive
            .by_index(index)
            .map_err(|error| ExtractError::CorruptArchive(error.to_string()))?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(ExtractError::PathEscape(entry.name().to_string()));
        };
        let target = extract_root.join(relative);
        if !crate::config::is_within(extract_root, &target) {
            return Err(ExtractError::PathEscape(entry.name().to_string()));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|source| ExtractError::Io {
                path: target.clone(),
                source,
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ExtractError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut output = File::create(&target).map_err(|source| ExtractError::Io {
            path: target.clone(),
            source,
        })?;
        let copied =
            std::io::copy(&mut entry, &mut output).map_err(|source| ExtractError::Io {
                path: target.clone(),
                source,
            })?;

        files_written += 1;
        bytes_written += copied;

        if files_written % PROGRESS_EVERY == 0 || files_written == files_total {
            on_progress(ExtractProgress {
                files_done: files_written,
                files_total,
                percent: percent_of(bytes_written, bytes_total),
            });
        }
    }

    tracing::info!(
        archive = %archive_path.display(),
        extract_root = %extract_root.display(),
        files_written,
        bytes_written,
        "extraction complete"
    );

    Ok(Extraction::Completed(ExtractOutcome {
        extract_root: extract_root.to_path_buf(),
        files_written,
        bytes_written,
    }))
}

fn percent_of(done: u64, total: u64) -> i32 {
    if total == 0 {
        return 100;
    }
    ((done * 100 + total / 2) / total).min(100) as i32
}

/// Verify that a previously-recorded extract tree is still usable for a
/// resumed run: the directory exists and is non-empty.
pub fn extract_tree_is_usable(extract_path: &Path) -> bool {
    std::fs::read_dir(extract_path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use zip::write::SimpleFileOptions;

    fn build_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_a_tree_with_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("export.zip");
        let entries: Vec<(String, Vec<u8>)> = (0..25)
            .map(|index| {
                (
                    format!("export/channels/c{index}/c{index}.txt"),
                    format!("Channel ID: C{index}\n").into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_slice()))
            .collect();
        build_archive(&archive_path, &borrowed);

        let extract_root = tmp.path().join("out");
        let cancel = AtomicBool::new(false);
        let mut percents = Vec::new();
        let result = extract_archive(&archive_path, &extract_root, &cancel, |progress| {
            percents.push(progress.percent);
        })
        .unwrap();

        let Extraction::Completed(outcome) = result else {
            panic!("expected completion");
        };
        assert_eq!(outcome.files_written, 25);
        assert!(extract_root.join("export/channels/c0/c0.txt").is_file());

        // Every 10 files plus the final file.
        assert_eq!(percents.len(), 3);
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*percents.last().unwrap(), 100);
    }

    #[test]
    fn rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("evil.zip");
        build_archive(&archive_path, &[("../evil.txt", b"boom")]);

        let cancel = AtomicBool::new(false);
        let result = extract_archive(&archive_path, &tmp.path().join("out"), &cancel, |_| {});
        assert!(matches!(result, Err(ExtractError::PathEscape(_))));
    }

    #[test]
    fn zero_byte_archive_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("empty.zip");
        File::create(&archive_path).unwrap();

        let cancel = AtomicBool::new(false);
        let result = extract_archive(&archive_path, &tmp.path().join("out"), &cancel, |_| {});
        assert!(matches!(result, Err(ExtractError::CorruptArchive(_))));
    }

    #[test]
    fn cancellation_stops_before_the_next_write() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("export.zip");
        build_archive(&archive_path, &[("a.txt", b"a"), ("b.txt", b"b")]);

        let cancel = AtomicBool::new(true);
        let result =
            extract_archive(&archive_path, &tmp.path().join("out"), &cancel, |_| {}).unwrap();
        assert!(matches!(result, Extraction::Cancelled { files_written: 0 }));
    }

    #[test]
    fn usable_tree_check() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!extract_tree_is_usable(&tmp.path().join("missing")));

        let empty = tmp.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        assert!(!extract_tree_is_usable(&empty));

        let populated = tmp.path().join("populated");
        std::fs::create_dir_all(populated.join("channels")).unwrap();
        assert!(extract_tree_is_usable(&populated));
    }
}
