//! Document store access.
//!
//! Owns the `messages`, `conversations`, `users`, `failed_imports`, and
//! `files` collections. The `uploads` collection belongs to the job store.
//! Index creation runs once per process behind a run-once guard.

use crate::error::{Result, StoreError};
use crate::parser::{Conversation, FailedLine, FileRef, ParsedMessage, Reaction};
use chrono::{DateTime, Utc};
use futures::TryStreamExt as _;
use mongodb::bson::{self, doc};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::{HashMap, HashSet};
use tokio::sync::OnceCell;

/// A message as persisted in the `messages` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<bson::oid::ObjectId>,
    pub conversation_id: String,
    pub ts: bson::DateTime,
    pub ordinal: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub username: Option<String>,
    pub text: String,
    pub is_edited: bool,
    pub reactions: Vec<Reaction>,
    pub files: Vec<StoredFileRef>,
    pub thread_ts: Option<bson::DateTime>,
    pub reply_count: i32,
    pub reply_users_count: i32,
    pub system_action: Option<String>,
    /// Duplicate-suppression key; see [`duplicate_key`].
    pub dup_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFileRef {
    pub id: String,
    pub name: String,
    pub mimetype: Option<String>,
    pub path: Option<String>,
}

impl From<&FileRef> for StoredFileRef {
    fn from(file_ref: &FileRef) -> Self {
        Self {
            id: file_ref.id.clone(),
            name: file_ref.name.clone(),
            mimetype: file_ref.mimetype.clone(),
            path: file_ref.path.as_ref().map(|path| path.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTopic {
    pub text: String,
    pub set_by: Option<String>,
    pub set_at: Option<bson::DateTime>,
}

/// A conversation as persisted in the `conversations` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConversation {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<bson::oid::ObjectId>,
    /// Export channel id; unique.
    pub id: String,
    pub name: String,
    pub kind: String,
    pub created: Option<bson::DateTime>,
    pub creator: Option<String>,
    pub topic: Option<StoredTopic>,
    pub purpose: Option<StoredTopic>,
    pub archived: bool,
    pub archived_by: Option<String>,
    pub archived_at: Option<bson::DateTime>,
    pub members: Vec<String>,
}

/// A failed-import record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedImport {
    #[serde(rename = "_id")]
    pub id: String,
    pub job_id: String,
    pub file_path: String,
    pub line_number: i64,
    pub error: String,
    pub captured_at: bson::DateTime,
}

/// Per-user activity accumulated over a message batch, applied with
/// `$min`/`$max`/`$addToSet`/`$inc` so re-runs converge.
#[derive(Debug, Clone)]
pub struct UserActivity {
    pub username: String,
    pub first_seen: bson::DateTime,
    pub last_seen: bson::DateTime,
    pub conversations: HashSet<String>,
    pub message_count: i64,
}

/// A full-text hit with its lexical score.
#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub message: StoredMessage,
    pub score: f64,
}

pub fn to_bson_datetime(datetime: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(datetime.timestamp_millis())
}

pub fn from_bson_datetime(datetime: bson::DateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(datetime.timestamp_millis())
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Duplicate-suppression key: conversation id, timestamp, and a hash of the
/// text. System messages with identical text and timestamp are told apart
/// by their action.
pub fn duplicate_key(message: &ParsedMessage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.conversation_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(message.ts.timestamp_millis().to_le_bytes());
    hasher.update(b"\x1f");
    hasher.update(message.text.as_bytes());
    if let Some(action) = &message.system_action {
        hasher.update(b"\x1f");
        hasher.update(action.as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl StoredMessage {
    pub fn from_parsed(message: &ParsedMessage) -> Self {
        Self {
            id: None,
            conversation_id: message.conversation_id.clone(),
            ts: to_bson_datetime(message.ts),
            ordinal: i64::from(message.ordinal),
            kind: message.kind.as_str().to_string(),
            username: message.username.clone(),
            text: message.text.clone(),
            is_edited: message.is_edited,
            reactions: message.reactions.clone(),
            files: message.files.iter().map(StoredFileRef::from).collect(),
            thread_ts: message.thread_ts.map(to_bson_datetime),
            reply_count: message.reply_count as i32,
            reply_users_count: message.reply_users_count as i32,
            system_action: message.system_action.clone(),
            dup_key: duplicate_key(message),
        }
    }

    /// The id string used as the vector store key.
    pub fn vector_id(&self) -> Option<String> {
        self.id.map(|object_id| object_id.to_hex())
    }
}

impl StoredConversation {
    pub fn from_parsed(conversation: &Conversation) -> Self {
        let topic = conversation.topic.as_ref().map(|entry| StoredTopic {
            text: entry.text.clone(),
            set_by: entry.set_by.clone(),
            set_at: entry.set_at.map(to_bson_datetime),
        });
        let purpose = conversation.purpose.as_ref().map(|entry| StoredTopic {
            text: entry.text.clone(),
            set_by: entry.set_by.clone(),
            set_at: entry.set_at.map(to_bson_datetime),
        });
        Self {
            doc_id: None,
            id: conversation.id.clone(),
            name: conversation.name.clone(),
            kind: conversation.kind.as_str().to_string(),
            created: conversation.created.map(to_bson_datetime),
            creator: conversation.creator.clone(),
            topic,
            purpose,
            archived: conversation.archived,
            archived_by: conversation.archived_by.clone(),
            archived_at: conversation.archived_at.map(to_bson_datetime),
            members: conversation.members.clone(),
        }
    }
}

/// Handle to the document store.
#[derive(Clone)]
pub struct MongoStore {
    database: Database,
    messages: Collection<StoredMessage>,
    messages_raw: Collection<bson::Document>,
    conversations: Collection<StoredConversation>,
    users: Collection<bson::Document>,
    failed_imports: Collection<FailedImport>,
    files: Collection<bson::Document>,
    indexes_ready: std::sync::Arc<OnceCell<()>>,
}

impl MongoStore {
    pub async fn connect(url: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(url).await.map_err(StoreError::from)?;
        let database = client.database(db_name);
        Ok(Self::new(database))
    }

    pub fn new(database: Database) -> Self {
        Self {
            messages: database.collection("messages"),
            messages_raw: database.collection("messages"),
            conversations: database.collection("conversations"),
            users: database.collection("users"),
            failed_imports: database.collection("failed_imports"),
            files: database.collection("files"),
            indexes_ready: std::sync::Arc::new(OnceCell::new()),
            database,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Create collection indexes. Runs the server round-trips once per
    /// process, on first use.
    pub async fn ensure_indexes(&self) -> Result<()> {
        self.indexes_ready
            .get_or_try_init(|| async {
                self.create_indexes().await?;
                Ok::<(), crate::error::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        let text = IndexModel::builder().keys(doc! {"text": "text"}).build();
        let by_conversation = IndexModel::builder()
            .keys(doc! {"conversation_id": 1, "ts": 1})
            .build();
        let by_ts = IndexModel::builder().keys(doc! {"ts": 1}).build();
        let by_username = IndexModel::builder().keys(doc! {"username": 1}).build();
        let by_dup_key = IndexModel::builder().keys(doc! {"dup_key": 1}).build();
        for index in [text, by_conversation, by_ts, by_username, by_dup_key] {
            self.messages
                .create_index(index)
                .await
                .map_err(StoreError::from)?;
        }

        let unique = IndexOptions::builder().unique(true).build();
        self.conversations
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"id": 1})
                    .options(unique.clone())
                    .build(),
            )
            .await
            .map_err(StoreError::from)?;
        self.users
            .create_index(
                IndexModel::builder()
                    .keys(doc! {"username": 1})
                    .options(unique)
                    .build(),
            )
            .await
            .map_err(StoreError::from)?;

        tracing::debug!("document store indexes ready");
        Ok(())
    }

    /// Upsert a conversation by its export id. The kind never changes after
    /// creation.
    pub async fn upsert_conversation(&self, conversation: &StoredConversation) -> Result<()> {
        let replacement = bson::to_document(conversation).map_err(|e| anyhow::anyhow!(e))?;
        let mut set = replacement.clone();
        set.remove("kind");
        self.conversations
            .update_one(
                doc! {"id": conversation.id.as_str()},
                doc! {
                    "$set": set,
                    "$setOnInsert": {"kind": conversation.kind.as_str()},
                },
            )
            .upsert(true)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Apply accumulated user activity.
    pub async fn upsert_user_activity(&self, activity: &UserActivity) -> Result<()> {
        let conversations: Vec<String> = activity.conversations.iter().cloned().collect();
        self.users
            .update_one(
                doc! {"username": activity.username.as_str()},
                doc! {
                    "$min": {"first_seen": activity.first_seen},
                    "$max": {"last_seen": activity.last_seen},
                    "$addToSet": {"conversations": {"$each": conversations}},
                    "$inc": {"message_count": activity.message_count},
                },
            )
            .upsert(true)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Insert a message batch, skipping duplicates from earlier runs.
    /// Returns how many documents were actually inserted.
    pub async fn insert_messages(&self, batch: &[StoredMessage]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let keys: Vec<&str> = batch.iter().map(|message| message.dup_key.as_str()).collect();
        let cursor = self
            .messages_raw
            .find(doc! {"dup_key": {"$in": keys}})
            .projection(doc! {"dup_key": 1})
            .await
            .map_err(StoreError::from)?;
        let existing: Vec<bson::Document> =
            cursor.try_collect().await.map_err(StoreError::from)?;
        let existing: HashSet<&str> = existing
            .iter()
            .filter_map(|document| document.get_str("dup_key").ok())
            .collect();

        let fresh: Vec<&StoredMessage> = batch
            .iter()
            .filter(|message| !existing.contains(message.dup_key.as_str()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let inserted = fresh.len();
        self.messages
            .insert_many(fresh.into_iter().cloned())
            .await
            .map_err(StoreError::from)?;
        Ok(inserted)
    }

    pub async fn record_failed_import(&self, job_id: &str, failure: &FailedLine) -> Result<()> {
        let record = FailedImport {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            file_path: failure.file_path.display().to_string(),
            line_number: failure.line_number,
            error: failure.error.clone(),
            captured_at: bson::DateTime::now(),
        };
        self.failed_imports
            .insert_one(record)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    pub async fn record_failed_imports(&self, job_id: &str, failures: &[FailedLine]) -> Result<()> {
        for failure in failures {
            self.record_failed_import(job_id, failure).await?;
        }
        Ok(())
    }

    /// Upsert shared-file metadata by export file id.
    pub async fn upsert_file(&self, file_ref: &StoredFileRef) -> Result<()> {
        if file_ref.id.is_empty() {
            return Ok(());
        }
        let document = bson::to_document(file_ref).map_err(|e| anyhow::anyhow!(e))?;
        self.files
            .update_one(doc! {"id": file_ref.id.as_str()}, doc! {"$set": document})
            .upsert(true)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Full-text query over `messages.text`, best-scoring first.
    pub async fn text_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredMessage>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_indexes().await?;

        let cursor = self
            .messages_raw
            .find(doc! {"$text": {"$search": query}})
            .projection(doc! {"score": {"$meta": "textScore"}})
            .sort(doc! {"score": {"$meta": "textScore"}})
            .limit(limit as i64)
            .await
            .map_err(StoreError::from)?;
        let documents: Vec<bson::Document> =
            cursor.try_collect().await.map_err(StoreError::from)?;

        let mut results = Vec::with_capacity(documents.len());
        for mut document in documents {
            let score = document.get_f64("score").unwrap_or(0.0);
            document.remove("score");
            let message: StoredMessage =
                bson::from_document(document).map_err(|e| anyhow::anyhow!(e))?;
            results.push(ScoredMessage { message, score });
        }
        Ok(results)
    }

    /// Stream every message in deterministic training order.
    pub async fn stream_messages_for_training(
        &self,
    ) -> Result<mongodb::Cursor<StoredMessage>> {
        self.messages
            .find(doc! {})
            .sort(doc! {"conversation_id": 1, "ts": 1, "ordinal": 1})
            .await
            .map_err(|e| StoreError::from(e).into())
    }

    /// Every message document id, as vector-store key strings.
    pub async fn all_message_ids(&self) -> Result<HashSet<String>> {
        let cursor = self
            .messages_raw
            .find(doc! {})
            .projection(doc! {"_id": 1})
            .await
            .map_err(StoreError::from)?;
        let documents: Vec<bson::Document> =
            cursor.try_collect().await.map_err(StoreError::from)?;
        Ok(documents
            .iter()
            .filter_map(|document| document.get_object_id("_id").ok())
            .map(|object_id| object_id.to_hex())
            .collect())
    }

    pub async fn message_count(&self) -> Result<u64> {
        self.messages
            .count_documents(doc! {})
            .await
            .map_err(|e| StoreError::from(e).into())
    }

    pub async fn conversation_count(&self) -> Result<u64> {
        self.conversations
            .count_documents(doc! {})
            .await
            .map_err(|e| StoreError::from(e).into())
    }

    pub async fn failed_import_count(&self) -> Result<u64> {
        self.failed_imports
            .count_documents(doc! {})
            .await
            .map_err(|e| StoreError::from(e).into())
    }

    /// All conversations, by display name.
    pub async fn list_conversations(&self) -> Result<Vec<StoredConversation>> {
        let cursor = self
            .conversations
            .find(doc! {})
            .sort(doc! {"name": 1})
            .await
            .map_err(StoreError::from)?;
        cursor
            .try_collect()
            .await
            .map_err(|e| StoreError::from(e).into())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<StoredConversation>> {
        self.conversations
            .find_one(doc! {"id": id})
            .await
            .map_err(|e| StoreError::from(e).into())
    }

    /// One page of a conversation's messages in time order, optionally
    /// filtered by a full-text query.
    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
        query: Option<&str>,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<StoredMessage>> {
        let mut filter = doc! {"conversation_id": conversation_id};
        if let Some(query) = query.filter(|query| !query.trim().is_empty()) {
            self.ensure_indexes().await?;
            filter.insert("$text", doc! {"$search": query});
        }
        let cursor = self
            .messages
            .find(filter)
            .sort(doc! {"ts": 1, "ordinal": 1})
            .skip(page.saturating_mul(page_size))
            .limit(page_size as i64)
            .await
            .map_err(StoreError::from)?;
        cursor
            .try_collect()
            .await
            .map_err(|e| StoreError::from(e).into())
    }

    /// Truncate message-derived collections. The caller clears the vector
    /// store in the same operation to preserve the dual-write invariant.
    pub async fn clear_messages(&self) -> Result<u64> {
        let deleted = self
            .messages
            .delete_many(doc! {})
            .await
            .map_err(StoreError::from)?
            .deleted_count;
        self.conversations
            .delete_many(doc! {})
            .await
            .map_err(StoreError::from)?;
        self.users
            .delete_many(doc! {})
            .await
            .map_err(StoreError::from)?;
        self.files
            .delete_many(doc! {})
            .await
            .map_err(StoreError::from)?;
        tracing::info!(deleted, "message collections cleared");
        Ok(deleted)
    }

    pub async fn clear_failed_imports(&self) -> Result<u64> {
        let result = self
            .failed_imports
            .delete_many(doc! {})
            .await
            .map_err(StoreError::from)?;
        Ok(result.deleted_count)
    }

    /// Failed imports for a job, newest first.
    pub async fn failed_imports_for_job(&self, job_id: &str) -> Result<Vec<FailedImport>> {
        let cursor = self
            .failed_imports
            .find(doc! {"job_id": job_id})
            .sort(doc! {"captured_at": -1})
            .await
            .map_err(StoreError::from)?;
        cursor
            .try_collect()
            .await
            .map_err(|e| StoreError::from(e).into())
    }
}

/// Accumulate user activity over a batch of messages.
pub fn accumulate_user_activity(messages: &[&ParsedMessage]) -> Vec<UserActivity> {
    let mut by_user: HashMap<String, UserActivity> = HashMap::new();
    for message in messages {
        let Some(username) = &message.username else {
            continue;
        };
        let ts = to_bson_datetime(message.ts);
        let entry = by_user
            .entry(username.clone())
            .or_insert_with(|| UserActivity {
                username: username.clone(),
                first_seen: ts,
                last_seen: ts,
                conversations: HashSet::new(),
                message_count: 0,
            });
        entry.first_seen = entry.first_seen.min(ts);
        entry.last_seen = entry.last_seen.max(ts);
        entry.conversations.insert(message.conversation_id.clone());
        entry.message_count += 1;
    }
    let mut activity: Vec<UserActivity> = by_user.into_values().collect();
    activity.sort_by(|a, b| a.username.cmp(&b.username));
    activity
}
