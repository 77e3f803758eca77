//! Typed records produced by the export parser.
//!
//! The export dialect carries loosely-typed message lines; the parser maps
//! them onto a tagged [`MessageKind`] with a shared envelope so downstream
//! code never branches on stringly-typed fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What kind of conversation an export file describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Channel,
    DirectMessage,
    MultiPartyDm,
    PhoneCall,
}

impl ConversationKind {
    /// Parse the header `Type:` field. Tolerant of casing and punctuation.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.contains("multi") {
            Some(Self::MultiPartyDm)
        } else if lowered.contains("direct") || lowered == "dm" {
            Some(Self::DirectMessage)
        } else if lowered.contains("phone") || lowered.contains("call") {
            Some(Self::PhoneCall)
        } else if lowered.contains("channel") {
            Some(Self::Channel)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::DirectMessage => "direct_message",
            Self::MultiPartyDm => "multi_party_dm",
            Self::PhoneCall => "phone_call",
        }
    }
}

/// Topic or purpose text with attribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicEntry {
    pub text: String,
    pub set_by: Option<String>,
    pub set_at: Option<DateTime<Utc>>,
}

/// Conversation metadata from an export file header block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Channel id from the export (`C` prefix for channels and multi-party DMs,
    /// `D` prefix for DMs).
    pub id: String,
    pub name: String,
    pub kind: ConversationKind,
    pub created: Option<DateTime<Utc>>,
    /// Creator username; channels only.
    pub creator: Option<String>,
    pub topic: Option<TopicEntry>,
    pub purpose: Option<TopicEntry>,
    pub archived: bool,
    pub archived_by: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Member usernames; DMs only.
    pub members: Vec<String>,
}

/// A single emoji reaction with the users who added it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub users: Vec<String>,
}

/// File metadata surfaced by a file-share line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// File id from the export; empty when only a display name was present.
    pub id: String,
    pub name: String,
    pub mimetype: Option<String>,
    /// Path within the extract tree, resolved from `files/<id>/`.
    pub path: Option<PathBuf>,
}

/// The five message shapes the export dialect carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A regular user message.
    Message,
    /// `username joined the channel`.
    Join,
    /// `(channel_archive)` system line.
    Archive,
    /// A shared file, by name or by file id with a text block.
    FileShare,
    /// Any other `(action_name)` system line.
    System,
}

impl MessageKind {
    /// The tag persisted in the document store `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Join => "join",
            Self::Archive => "archive",
            Self::FileShare => "file_share",
            Self::System => "system",
        }
    }
}

/// A parsed message with its envelope fields.
///
/// `username` is the single canonical author field; it is always present for
/// `Message` and `FileShare` lines and may be absent for system-shaped lines.
/// The dialect carries no stable user ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub conversation_id: String,
    /// Always UTC; lines without an explicit zone are combined with the last
    /// seen date header.
    pub ts: DateTime<Utc>,
    /// Position in file emission order. Disambiguates system messages that
    /// share a timestamp.
    pub ordinal: u32,
    pub kind: MessageKind,
    pub username: Option<String>,
    pub text: String,
    pub is_edited: bool,
    pub reactions: Vec<Reaction>,
    pub files: Vec<FileRef>,
    /// Timestamp of the thread parent, when this is a reply.
    pub thread_ts: Option<DateTime<Utc>>,
    pub reply_count: u32,
    pub reply_users_count: u32,
    /// `channel_archive`, `canvas_updated`, and similar, for system-shaped lines.
    pub system_action: Option<String>,
    /// Raw JSON payload trailing a system line, when present and valid.
    pub system_payload: Option<serde_json::Value>,
}

impl ParsedMessage {
    /// Build a bare message of the given kind; the parser fills in the rest.
    pub fn new(conversation_id: &str, ts: DateTime<Utc>, ordinal: u32, kind: MessageKind) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            ts,
            ordinal,
            kind,
            username: None,
            text: String::new(),
            is_edited: false,
            reactions: Vec::new(),
            files: Vec::new(),
            thread_ts: None,
            reply_count: 0,
            reply_users_count: 0,
            system_action: None,
            system_payload: None,
        }
    }
}

/// One unrecoverable parse failure. Never aborts the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedLine {
    pub file_path: PathBuf,
    /// 1-based line number, or -1 when the whole file was unreadable.
    pub line_number: i64,
    pub error: String,
}

/// Everything parsed out of a single export file.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub path: PathBuf,
    pub conversation: Option<Conversation>,
    pub messages: Vec<ParsedMessage>,
    pub failures: Vec<FailedLine>,
}
