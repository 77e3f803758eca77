//! Tolerant parser for the plain-text export dialect.
//!
//! [`ExportScanner`] walks an extracted export tree and yields one
//! [`ParsedFile`] per conversation file, in a stable order the indexer
//! relies on for thread-reply attachment.

pub mod file;
pub mod records;
pub mod timestamp;

pub use file::parse_export_file;
pub use records::{
    Conversation, ConversationKind, FailedLine, FileRef, MessageKind, ParsedFile, ParsedMessage,
    Reaction, TopicEntry,
};

use crate::error::Result;
use anyhow::Context as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Subtrees of the export the core does not ingest.
const IGNORED_DIRS: &[&str] = &["huddle_transcripts", "lists"];

/// Walks an extracted export tree.
pub struct ExportScanner {
    root: PathBuf,
    /// `files/<file_id>/<name>` entries, keyed by file id.
    file_index: HashMap<String, PathBuf>,
}

impl ExportScanner {
    /// Open an extract root. Exports often nest everything one directory
    /// deeper (`slack-export-<team>-<ts>/`); that is resolved here.
    pub fn open(extract_root: &Path) -> Result<Self> {
        let root = resolve_export_root(extract_root)?;
        let file_index = index_shared_files(&root);
        Ok(Self { root, file_index })
    }

    /// The resolved export root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All conversation files, channels before DMs, sorted by path.
    pub fn conversation_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for subdir in ["channels", "dms"] {
            let dir = self.root.join(subdir);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut found: Vec<PathBuf> = entries
                .flatten()
                .filter(|entry| entry.path().is_dir())
                .flat_map(|entry| conversation_file_in(&entry.path()))
                .collect();
            found.sort();
            files.extend(found);
        }
        files
    }

    /// Lazily parse every conversation file. Unreadable files yield a single
    /// whole-file failure record and no messages.
    pub fn parse_all(&self) -> impl Iterator<Item = ParsedFile> + '_ {
        self.conversation_files()
            .into_iter()
            .map(|path| self.parse_file(&path))
    }

    /// Parse one conversation file, resolving file-share references against
    /// the shared-file index.
    pub fn parse_file(&self, path: &Path) -> ParsedFile {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let mut parsed = parse_export_file(path, &content);
                for message in &mut parsed.messages {
                    for file_ref in &mut message.files {
                        self.resolve_file_ref(file_ref);
                    }
                }
                parsed
            }
            Err(error) => ParsedFile {
                path: path.to_path_buf(),
                conversation: None,
                messages: Vec::new(),
                failures: vec![FailedLine {
                    file_path: path.to_path_buf(),
                    line_number: -1,
                    error: format!("unreadable file: {error}"),
                }],
            },
        }
    }

    /// Count messages across the tree. Used to size import progress; the
    /// records themselves are discarded.
    pub fn count_messages(&self) -> usize {
        self.parse_all().map(|parsed| parsed.messages.len()).sum()
    }

    /// Fill in the on-disk path and mimetype for a file reference shared by
    /// id, from the export's `files/<file_id>/` tree.
    fn resolve_file_ref(&self, file_ref: &mut FileRef) {
        if file_ref.id.is_empty() {
            return;
        }
        if let Some(path) = self.file_index.get(&file_ref.id) {
            if file_ref.name.is_empty() {
                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    file_ref.name = name.to_string();
                }
            }
            file_ref.mimetype = mime_guess::from_path(path).first().map(|m| m.to_string());
            file_ref.path = Some(path.clone());
        }
    }
}

/// Locate the directory actually containing `channels/` or `dms/`.
fn resolve_export_root(extract_root: &Path) -> Result<PathBuf> {
    let has_export_dirs = |dir: &Path| dir.join("channels").is_dir() || dir.join("dms").is_dir();

    if has_export_dirs(extract_root) {
        return Ok(extract_root.to_path_buf());
    }

    let entries = std::fs::read_dir(extract_root)
        .with_context(|| format!("cannot read extract root {}", extract_root.display()))?;
    let subdirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && !is_ignored(path))
        .collect();

    for subdir in &subdirs {
        if has_export_dirs(subdir) {
            return Ok(subdir.clone());
        }
    }

    // Tolerate an export with neither directory; the scan simply finds no files.
    Ok(extract_root.to_path_buf())
}

fn is_ignored(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| IGNORED_DIRS.contains(&name))
        .unwrap_or(false)
}

/// The conversation file inside a `channels/<name>/` directory is
/// `<name>.txt`; fall back to the first `.txt` file present.
fn conversation_file_in(dir: &Path) -> Option<PathBuf> {
    if let Some(name) = dir.file_name().and_then(|name| name.to_str()) {
        let canonical = dir.join(format!("{name}.txt"));
        if canonical.is_file() {
            return Some(canonical);
        }
    }
    let entries = std::fs::read_dir(dir).ok()?;
    let mut txt_files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    txt_files.sort();
    txt_files.into_iter().next()
}

/// Index `files/<file_id>/<name>` for file-share resolution.
fn index_shared_files(root: &Path) -> HashMap<String, PathBuf> {
    let mut index = HashMap::new();
    let Ok(entries) = std::fs::read_dir(root.join("files")) else {
        return index;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(file_id) = dir.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Ok(children) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = children
            .flatten()
            .map(|child| child.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        if let Some(path) = paths.into_iter().next() {
            index.insert(file_id.to_string(), path);
        }
    }
    index
}
