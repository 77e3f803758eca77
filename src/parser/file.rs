//! Line-oriented parser for a single export file.
//!
//! A file carries a header block (conversation metadata), a `Messages:`
//! separator, then date headers and message lines. Lines that match no
//! grammar become [`FailedLine`] records; parsing always continues.

use crate::parser::records::{
    Conversation, ConversationKind, FailedLine, FileRef, MessageKind, ParsedFile, ParsedMessage,
    Reaction, TopicEntry,
};
use crate::parser::timestamp::{
    parse_date_header, parse_header_datetime, parse_leading_timestamp,
};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

static SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{4,}\s*$").expect("hardcoded regex"));

static SYSTEM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(([A-Za-z0-9_-]+)\)\s*(?:<([^>]+)>)?\s*(.*)$").expect("hardcoded regex")
});

static FILE_SHARE_NAMED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<([^>]+)> shared a file: (.+)$").expect("hardcoded regex"));

static FILE_SHARE_BY_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+) shared file\(s\) (\S+) with text:$").expect("hardcoded regex")
});

static JOIN_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+) joined the channel$").expect("hardcoded regex"));

static USER_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<([^>]+)>\s?(.*)$").expect("hardcoded regex"));

static REACTION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^:([A-Za-z0-9_+'-]+):\s+(.+)$").expect("hardcoded regex"));

static TOPIC_ATTRIBUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*\(set by (\S+) on ([^)]+)\)$").expect("hardcoded regex")
});

static ARCHIVED_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^by (\S+) on (.+)$").expect("hardcoded regex"));

const EDITED_SUFFIX: &str = " (edited)";

/// Parse one export file into conversation metadata, messages, and failures.
pub fn parse_export_file(path: &Path, content: &str) -> ParsedFile {
    let mut parser = FileParser::new(path);
    for (index, line) in content.lines().enumerate() {
        parser.feed(index + 1, line);
    }
    parser.finish()
}

/// Header fields accumulated before the separator. All optional; only
/// `Channel ID` and `Type` are required to emit a conversation.
#[derive(Default)]
struct HeaderFields {
    name: Option<String>,
    id: Option<String>,
    kind: Option<ConversationKind>,
    created: Option<chrono::DateTime<chrono::Utc>>,
    creator: Option<String>,
    topic: Option<TopicEntry>,
    purpose: Option<TopicEntry>,
    archived: bool,
    archived_by: Option<String>,
    archived_at: Option<chrono::DateTime<chrono::Utc>>,
    members: Vec<String>,
}

enum Section {
    Header,
    /// Between the `####` separator and the `Messages:` line.
    AwaitingMessages,
    Messages,
}

struct FileParser<'a> {
    path: &'a Path,
    section: Section,
    header: HeaderFields,
    current_date: Option<NaiveDate>,
    messages: Vec<ParsedMessage>,
    failures: Vec<FailedLine>,
    /// Index of the last top-level message; thread replies attach here.
    last_parent: Option<usize>,
    /// Index of the last emitted message; reactions attach here.
    last_message: Option<usize>,
    /// Distinct reply authors per parent index.
    reply_users: Vec<HashSet<String>>,
    /// Message index collecting an indented file-share text block.
    pending_block: Option<usize>,
}

impl<'a> FileParser<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            section: Section::Header,
            header: HeaderFields::default(),
            current_date: None,
            messages: Vec::new(),
            failures: Vec::new(),
            last_parent: None,
            last_message: None,
            reply_users: Vec::new(),
            pending_block: None,
        }
    }

    fn feed(&mut self, line_number: usize, line: &str) {
        match self.section {
            Section::Header => self.feed_header(line),
            Section::AwaitingMessages => {
                if line.trim() == "Messages:" {
                    self.section = Section::Messages;
                }
            }
            Section::Messages => self.feed_message(line_number, line),
        }
    }

    fn feed_header(&mut self, line: &str) {
        let trimmed = line.trim_end();
        if SEPARATOR.is_match(trimmed) {
            self.section = Section::AwaitingMessages;
            return;
        }
        if trimmed.trim() == "Messages:" {
            self.section = Section::Messages;
            return;
        }
        if trimmed.is_empty() {
            return;
        }

        if let Some(rest) = trimmed.strip_prefix("Private conversation between ") {
            self.header.members = rest
                .split(',')
                .flat_map(|part| part.split(" and "))
                .map(|part| part.trim().trim_end_matches('.'))
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            return;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            // Header noise is tolerated, not recorded.
            return;
        };
        let value = value.trim();

        match key.trim() {
            "Channel Name" => {
                self.header.name = Some(value.trim_start_matches('#').to_string());
            }
            "Channel ID" => self.header.id = Some(value.to_string()),
            "Type" => self.header.kind = ConversationKind::parse(value),
            "Created" => {
                let (datetime, creator) = match value.split_once(" by ") {
                    Some((datetime, creator)) => (datetime, Some(creator.trim().to_string())),
                    None => (value, None),
                };
                self.header.created = parse_header_datetime(datetime);
                self.header.creator = creator;
            }
            "Topic" => self.header.topic = Some(parse_topic_entry(value)),
            "Purpose" => self.header.purpose = Some(parse_topic_entry(value)),
            "Archived" => {
                self.header.archived = true;
                if let Some(captures) = ARCHIVED_BY.captures(value) {
                    self.header.archived_by = Some(captures[1].to_string());
                    self.header.archived_at = parse_header_datetime(&captures[2]);
                }
            }
            _ => {}
        }
    }

    fn feed_message(&mut self, line_number: usize, line: &str) {
        if line.trim().is_empty() {
            self.pending_block = None;
            return;
        }

        if let Some(date) = parse_date_header(line) {
            self.current_date = Some(date);
            self.pending_block = None;
            return;
        }

        let indented = line.starts_with("    ") || line.starts_with('\t');
        if indented {
            self.feed_indented(line_number, line.trim_start());
            return;
        }

        self.pending_block = None;
        match parse_leading_timestamp(line, self.current_date) {
            Some((ts, rest)) => {
                if let Some(message) = self.parse_message_body(ts, rest) {
                    self.push_top_level(message);
                } else {
                    self.fail(line_number, "message line matches no known grammar");
                }
            }
            None => self.fail(line_number, "expected timestamp, date header, or indented line"),
        }
    }

    fn feed_indented(&mut self, line_number: usize, trimmed: &str) {
        // An open file-share text block swallows everything until a blank line.
        if let Some(index) = self.pending_block {
            let text = &mut self.messages[index].text;
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(trimmed);
            return;
        }

        if let Some(captures) = REACTION_LINE.captures(trimmed) {
            let Some(index) = self.last_message else {
                self.fail(line_number, "reaction with no preceding message");
                return;
            };
            self.messages[index].reactions.push(Reaction {
                emoji: captures[1].to_string(),
                users: captures[2]
                    .split(',')
                    .map(|user| user.trim().to_string())
                    .filter(|user| !user.is_empty())
                    .collect(),
            });
            return;
        }

        if let Some((ts, rest)) = parse_leading_timestamp(trimmed, self.current_date) {
            let Some(parent_index) = self.last_parent else {
                self.fail(line_number, "thread reply with no preceding parent");
                return;
            };
            let Some(mut reply) = self.parse_message_body(ts, rest) else {
                self.fail(line_number, "thread reply matches no known grammar");
                return;
            };
            reply.thread_ts = Some(self.messages[parent_index].ts);
            if let Some(username) = reply.username.clone() {
                self.reply_users[parent_index].insert(username);
            }
            self.messages[parent_index].reply_count += 1;
            self.messages[parent_index].reply_users_count =
                self.reply_users[parent_index].len() as u32;
            let index = self.messages.len();
            self.messages.push(reply);
            self.reply_users.push(HashSet::new());
            self.last_message = Some(index);
            return;
        }

        // Plain continuation of the previous message's text.
        if let Some(index) = self.last_message {
            let text = &mut self.messages[index].text;
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(trimmed);
            return;
        }

        self.fail(line_number, "indented line with no preceding message");
    }

    /// Parse the portion of a message line after the timestamp. The
    /// conversation id is patched in once the header has been resolved.
    fn parse_message_body(
        &mut self,
        ts: chrono::DateTime<chrono::Utc>,
        rest: &str,
    ) -> Option<ParsedMessage> {
        // Ordinals are renumbered in emission order at finish.
        let ordinal = 0;

        if rest.starts_with('(') {
            let captures = SYSTEM_LINE.captures(rest)?;
            let action = captures[1].to_string();
            let kind = if action == "channel_archive" {
                MessageKind::Archive
            } else {
                MessageKind::System
            };
            let mut message = ParsedMessage::new("", ts, ordinal, kind);
            message.username = captures.get(2).map(|user| user.as_str().to_string());
            let payload = captures.get(3).map(|m| m.as_str().trim()).unwrap_or("");
            if !payload.is_empty() {
                match serde_json::from_str::<serde_json::Value>(payload) {
                    Ok(value) => message.system_payload = Some(value),
                    Err(_) => message.text = payload.to_string(),
                }
            }
            message.system_action = Some(action);
            return Some(message);
        }

        if let Some(captures) = FILE_SHARE_NAMED.captures(rest) {
            let mut message = ParsedMessage::new("", ts, ordinal, MessageKind::FileShare);
            message.username = Some(captures[1].to_string());
            message.files.push(FileRef {
                id: String::new(),
                name: captures[2].to_string(),
                mimetype: None,
                path: None,
            });
            return Some(message);
        }

        if let Some(captures) = FILE_SHARE_BY_ID.captures(rest) {
            let mut message = ParsedMessage::new("", ts, ordinal, MessageKind::FileShare);
            message.username = Some(captures[1].to_string());
            message.files.push(FileRef {
                id: captures[2].to_string(),
                name: String::new(),
                mimetype: None,
                path: None,
            });
            self.pending_block = Some(self.messages.len());
            return Some(message);
        }

        if let Some(captures) = JOIN_LINE.captures(rest) {
            let mut message = ParsedMessage::new("", ts, ordinal, MessageKind::Join);
            message.username = Some(captures[1].to_string());
            message.text = rest.to_string();
            return Some(message);
        }

        if let Some(captures) = USER_MESSAGE.captures(rest) {
            let mut message = ParsedMessage::new("", ts, ordinal, MessageKind::Message);
            message.username = Some(captures[1].to_string());
            let mut text = captures[2].to_string();
            if let Some(stripped) = text.strip_suffix(EDITED_SUFFIX) {
                text = stripped.to_string();
                message.is_edited = true;
            }
            message.text = text;
            return Some(message);
        }

        None
    }

    fn push_top_level(&mut self, message: ParsedMessage) {
        let index = self.messages.len();
        let claims_block = self.pending_block.is_some();
        self.messages.push(message);
        self.reply_users.push(HashSet::new());
        self.last_parent = Some(index);
        self.last_message = Some(index);
        if claims_block {
            self.pending_block = Some(index);
        }
    }

    fn fail(&mut self, line_number: usize, error: &str) {
        self.failures.push(FailedLine {
            file_path: self.path.to_path_buf(),
            line_number: line_number as i64,
            error: error.to_string(),
        });
    }

    fn finish(mut self) -> ParsedFile {
        // Thread replies consumed ordinals lazily; renumber in emission order
        // so the ordinal matches position for every message.
        for (index, message) in self.messages.iter_mut().enumerate() {
            message.ordinal = index as u32;
        }

        let conversation = match (self.header.id.take(), self.header.kind.take()) {
            (Some(id), Some(kind)) => {
                for message in &mut self.messages {
                    message.conversation_id = id.clone();
                }
                Some(Conversation {
                    id,
                    name: self.header.name.unwrap_or_default(),
                    kind,
                    created: self.header.created,
                    creator: self.header.creator,
                    topic: self.header.topic,
                    purpose: self.header.purpose,
                    archived: self.header.archived,
                    archived_by: self.header.archived_by,
                    archived_at: self.header.archived_at,
                    members: self.header.members,
                })
            }
            _ => None,
        };

        ParsedFile {
            path: self.path.to_path_buf(),
            conversation,
            messages: self.messages,
            failures: self.failures,
        }
    }
}

fn parse_topic_entry(raw: &str) -> TopicEntry {
    if let Some(captures) = TOPIC_ATTRIBUTION.captures(raw) {
        return TopicEntry {
            text: captures[1].to_string(),
            set_by: Some(captures[2].to_string()),
            set_at: parse_header_datetime(&captures[3]),
        };
    }
    TopicEntry {
        text: raw.to_string(),
        set_by: None,
        set_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use indoc::indoc;
    use std::path::PathBuf;

    fn parse(content: &str) -> ParsedFile {
        parse_export_file(&PathBuf::from("channels/general/general.txt"), content)
    }

    fn format_ts(ts: chrono::DateTime<Utc>) -> String {
        format!("[{}]", ts.format("%Y-%m-%d %H:%M:%S UTC"))
    }

    /// Render a message back into export lines. Inverse of the line grammars
    /// for every [`MessageKind`]; continuation lines are indented four spaces.
    fn serialize_message(message: &ParsedMessage) -> Vec<String> {
        let ts = format_ts(message.ts);
        let username = message.username.as_deref().unwrap_or("unknown");

        let mut lines = match &message.kind {
            MessageKind::Message => {
                let mut text_lines = message.text.split('\n');
                let first = text_lines.next().unwrap_or("");
                let edited = if message.is_edited { EDITED_SUFFIX } else { "" };
                let mut lines = vec![format!("{ts} <{username}> {first}{edited}")];
                lines.extend(text_lines.map(|line| format!("    {line}")));
                lines
            }
            MessageKind::Join => vec![format!("{ts} {username} joined the channel")],
            MessageKind::Archive | MessageKind::System => {
                let action = message.system_action.as_deref().unwrap_or("system");
                let payload = message
                    .system_payload
                    .as_ref()
                    .map(|value| format!(" {value}"))
                    .unwrap_or_default();
                vec![format!("{ts} ({action}) <{username}>{payload}")]
            }
            MessageKind::FileShare => {
                let file = message.files.first();
                match file {
                    Some(file) if !file.id.is_empty() => {
                        let mut lines = vec![format!(
                            "{ts} {username} shared file(s) {} with text:",
                            file.id
                        )];
                        if !message.text.is_empty() {
                            lines
                                .extend(message.text.split('\n').map(|line| format!("    {line}")));
                        }
                        lines
                    }
                    Some(file) => vec![format!("{ts} <{username}> shared a file: {}", file.name)],
                    None => vec![format!("{ts} <{username}> shared a file: unknown")],
                }
            }
        };

        for reaction in &message.reactions {
            lines.push(format!("    :{}: {}", reaction.emoji, reaction.users.join(", ")));
        }

        lines
    }

    #[test]
    fn channel_with_reactions_and_join() {
        let parsed = parse(indoc! {"
            Channel Name: #general
            Channel ID: C01
            Created: 2023-05-01 12:00:00 UTC by alice
            Type: Channel
            ########################################
            Messages:

            ---- 2023-06-22 ----
            [2023-06-22 15:56:54 UTC] <alice> hello :wave:
                :wave: bob
            [2023-06-22 15:57:10 UTC] bob joined the channel
        "});

        let conversation = parsed.conversation.expect("conversation");
        assert_eq!(conversation.id, "C01");
        assert_eq!(conversation.name, "general");
        assert_eq!(conversation.kind, ConversationKind::Channel);
        assert_eq!(conversation.creator.as_deref(), Some("alice"));

        assert_eq!(parsed.messages.len(), 2);
        assert!(parsed.failures.is_empty());

        let first = &parsed.messages[0];
        assert_eq!(first.kind, MessageKind::Message);
        assert_eq!(first.conversation_id, "C01");
        assert_eq!(first.username.as_deref(), Some("alice"));
        assert_eq!(first.text, "hello :wave:");
        assert_eq!(
            first.reactions,
            vec![Reaction {
                emoji: "wave".into(),
                users: vec!["bob".into()],
            }]
        );

        let second = &parsed.messages[1];
        assert_eq!(second.kind, MessageKind::Join);
        assert_eq!(second.username.as_deref(), Some("bob"));
        assert_eq!(
            second.ts,
            Utc.with_ymd_and_hms(2023, 6, 22, 15, 57, 10).unwrap()
        );
    }

    #[test]
    fn direct_message_members() {
        let parsed = parse(indoc! {"
            Channel ID: D02
            Type: Direct Message
            Private conversation between alice, bob
            ########################################
            Messages:

            [2023-07-11 21:17:07 UTC] <alice> hi
        "});

        let conversation = parsed.conversation.expect("conversation");
        assert_eq!(conversation.kind, ConversationKind::DirectMessage);
        assert_eq!(conversation.members, vec!["alice", "bob"]);
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].text, "hi");
    }

    #[test]
    fn ampm_timestamp_uses_date_header() {
        let parsed = parse(indoc! {"
            Channel ID: C03
            Type: Channel
            ########################################
            Messages:

            ---- 2024-01-05 ----
            [8:24 AM] <carol> morning
        "});

        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(
            parsed.messages[0].ts,
            Utc.with_ymd_and_hms(2024, 1, 5, 8, 24, 0).unwrap()
        );
    }

    #[test]
    fn bracketed_token_in_body_is_preserved() {
        let parsed = parse(indoc! {"
            Channel ID: C04
            Type: Channel
            ########################################
            Messages:

            ---- 2024-01-05 ----
            [2024-01-05 10:00:00 UTC] <alice> quoting [8:53 AM] from before
        "});

        assert_eq!(parsed.messages[0].text, "quoting [8:53 AM] from before");
        assert_eq!(
            parsed.messages[0].ts,
            Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn edited_marker_is_stripped() {
        let parsed = parse(indoc! {"
            Channel ID: C05
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] <alice> fixed typo (edited)
        "});

        assert_eq!(parsed.messages[0].text, "fixed typo");
        assert!(parsed.messages[0].is_edited);
    }

    #[test]
    fn archive_and_system_lines() {
        let parsed = parse(indoc! {r#"
            Channel ID: C06
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] (channel_archive) <alice> {"user": "U1"}
            [2024-01-05 10:01:00 UTC] (canvas_updated) <bob> {"canvas": "F9"}
        "#});

        assert_eq!(parsed.messages.len(), 2);
        let archive = &parsed.messages[0];
        assert_eq!(archive.kind, MessageKind::Archive);
        assert_eq!(archive.system_action.as_deref(), Some("channel_archive"));
        assert_eq!(archive.username.as_deref(), Some("alice"));
        assert!(archive.system_payload.is_some());

        let system = &parsed.messages[1];
        assert_eq!(system.kind, MessageKind::System);
        assert_eq!(system.system_action.as_deref(), Some("canvas_updated"));
    }

    #[test]
    fn file_share_with_text_block() {
        let parsed = parse(indoc! {"
            Channel ID: C07
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] alice shared file(s) F0123 with text:
                quarterly numbers attached
                see tab two

            [2024-01-05 10:05:00 UTC] <bob> thanks
        "});

        assert_eq!(parsed.messages.len(), 2);
        let share = &parsed.messages[0];
        assert_eq!(share.kind, MessageKind::FileShare);
        assert_eq!(share.files[0].id, "F0123");
        assert_eq!(share.text, "quarterly numbers attached\nsee tab two");
        assert_eq!(parsed.messages[1].text, "thanks");
    }

    #[test]
    fn file_share_by_name() {
        let parsed = parse(indoc! {"
            Channel ID: C08
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] <alice> shared a file: report.pdf
        "});

        let share = &parsed.messages[0];
        assert_eq!(share.kind, MessageKind::FileShare);
        assert_eq!(share.files[0].name, "report.pdf");
        assert!(share.files[0].id.is_empty());
    }

    #[test]
    fn thread_replies_attach_to_parent() {
        let parsed = parse(indoc! {"
            Channel ID: C09
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] <alice> thoughts on the rollout?
                [2024-01-05 10:02:00 UTC] <bob> looks good
                [2024-01-05 10:03:00 UTC] <carol> ship it
                [2024-01-05 10:04:00 UTC] <bob> confirmed
        "});

        assert_eq!(parsed.messages.len(), 4);
        let parent = &parsed.messages[0];
        assert_eq!(parent.reply_count, 3);
        assert_eq!(parent.reply_users_count, 2);

        for reply in &parsed.messages[1..] {
            assert_eq!(reply.thread_ts, Some(parent.ts));
        }
    }

    #[test]
    fn reaction_on_thread_reply() {
        let parsed = parse(indoc! {"
            Channel ID: C10
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] <alice> question
                [2024-01-05 10:02:00 UTC] <bob> answer
                :+1: alice, carol
        "});

        assert!(parsed.messages[0].reactions.is_empty());
        assert_eq!(
            parsed.messages[1].reactions,
            vec![Reaction {
                emoji: "+1".into(),
                users: vec!["alice".into(), "carol".into()],
            }]
        );
    }

    #[test]
    fn unmatched_lines_become_failures() {
        let parsed = parse(indoc! {"
            Channel ID: C11
            Type: Channel
            ########################################
            Messages:

            this line has no timestamp
            [2024-01-05 10:00:00 UTC] <alice> ok
        "});

        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.failures.len(), 1);
        assert_eq!(parsed.failures[0].line_number, 6);
        assert_eq!(
            parsed.failures[0].file_path,
            PathBuf::from("channels/general/general.txt")
        );
    }

    #[test]
    fn missing_required_header_fields_yield_no_conversation() {
        let parsed = parse(indoc! {"
            Channel Name: #general
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] <alice> hello
        "});

        assert!(parsed.conversation.is_none());
        // The message still parses; its conversation id stays empty.
        assert_eq!(parsed.messages.len(), 1);
        assert!(parsed.messages[0].conversation_id.is_empty());
    }

    #[test]
    fn empty_file_yields_nothing() {
        let parsed = parse("");
        assert!(parsed.conversation.is_none());
        assert!(parsed.messages.is_empty());
        assert!(parsed.failures.is_empty());
    }

    #[test]
    fn topic_attribution() {
        let parsed = parse(indoc! {"
            Channel ID: C12
            Type: Channel
            Topic: Release planning (set by alice on 2023-05-02 09:00:00 UTC)
            Purpose: Coordination
            ########################################
            Messages:
        "});

        let conversation = parsed.conversation.expect("conversation");
        let topic = conversation.topic.expect("topic");
        assert_eq!(topic.text, "Release planning");
        assert_eq!(topic.set_by.as_deref(), Some("alice"));
        assert_eq!(
            topic.set_at,
            Some(Utc.with_ymd_and_hms(2023, 5, 2, 9, 0, 0).unwrap())
        );
        let purpose = conversation.purpose.expect("purpose");
        assert_eq!(purpose.text, "Coordination");
        assert!(purpose.set_by.is_none());
    }

    #[test]
    fn multiline_message_continuation() {
        let parsed = parse(indoc! {"
            Channel ID: C13
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] <alice> first line
                second line
                third line
        "});

        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].text, "first line\nsecond line\nthird line");
    }

    #[test]
    fn ordinals_follow_emission_order() {
        let parsed = parse(indoc! {"
            Channel ID: C14
            Type: Channel
            ########################################
            Messages:

            [2024-01-05 10:00:00 UTC] <alice> one
                [2024-01-05 10:00:00 UTC] <bob> same second reply
            [2024-01-05 10:00:00 UTC] (channel_archive) <alice>
        "});

        let ordinals: Vec<u32> = parsed.messages.iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    fn round_trip(message: &ParsedMessage) -> ParsedMessage {
        let header = indoc! {"
            Channel ID: C99
            Type: Channel
            ########################################
            Messages:

        "};
        let body = serialize_message(message).join("\n");
        let parsed = parse(&format!("{header}{body}\n"));
        assert!(parsed.failures.is_empty(), "round trip produced failures");
        assert_eq!(parsed.messages.len(), 1);
        parsed.messages.into_iter().next().unwrap()
    }

    #[test]
    fn round_trip_all_five_kinds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();

        let mut message = ParsedMessage::new("C99", ts, 0, MessageKind::Message);
        message.username = Some("alice".into());
        message.text = "release is out".into();
        message.is_edited = true;
        message.reactions.push(Reaction {
            emoji: "tada".into(),
            users: vec!["bob".into(), "carol".into()],
        });
        assert_eq!(round_trip(&message), message);

        let mut join = ParsedMessage::new("C99", ts, 0, MessageKind::Join);
        join.username = Some("bob".into());
        join.text = "bob joined the channel".into();
        assert_eq!(round_trip(&join), join);

        let mut archive = ParsedMessage::new("C99", ts, 0, MessageKind::Archive);
        archive.username = Some("alice".into());
        archive.system_action = Some("channel_archive".into());
        archive.system_payload = Some(serde_json::json!({"user": "U1"}));
        assert_eq!(round_trip(&archive), archive);

        let mut system = ParsedMessage::new("C99", ts, 0, MessageKind::System);
        system.username = Some("carol".into());
        system.system_action = Some("canvas_updated".into());
        system.system_payload = Some(serde_json::json!({"canvas": "F9"}));
        assert_eq!(round_trip(&system), system);

        let mut share = ParsedMessage::new("C99", ts, 0, MessageKind::FileShare);
        share.username = Some("alice".into());
        share.text = "numbers attached".into();
        share.files.push(FileRef {
            id: "F0123".into(),
            name: String::new(),
            mimetype: None,
            path: None,
        });
        assert_eq!(round_trip(&share), share);
    }
}
