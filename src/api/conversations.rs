//! Read-only conversation views over the document store.

use super::ApiError;
use crate::context::AppContext;
use crate::parser::Reaction;
use crate::store::{StoredConversation, StoredFileRef, StoredMessage, from_bson_datetime};
use axum::Json;
use axum::extract::{Path, Query, State};
use mongodb::bson;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Messages per page in the conversation detail view.
const PAGE_SIZE: u64 = 50;

#[derive(Serialize)]
pub(super) struct TopicView {
    text: String,
    set_by: Option<String>,
    set_at: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ConversationView {
    id: String,
    name: String,
    kind: String,
    created: Option<String>,
    creator: Option<String>,
    topic: Option<TopicView>,
    purpose: Option<TopicView>,
    archived: bool,
    archived_by: Option<String>,
    archived_at: Option<String>,
    members: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct MessageView {
    id: Option<String>,
    conversation_id: String,
    ts: String,
    #[serde(rename = "type")]
    kind: String,
    username: Option<String>,
    text: String,
    is_edited: bool,
    reactions: Vec<Reaction>,
    files: Vec<StoredFileRef>,
    thread_ts: Option<String>,
    reply_count: i32,
    reply_users_count: i32,
    system_action: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ConversationListResponse {
    count: usize,
    conversations: Vec<ConversationView>,
}

#[derive(Serialize)]
pub(super) struct ConversationDetailResponse {
    conversation: ConversationView,
    page: u64,
    page_size: u64,
    messages: Vec<MessageView>,
}

#[derive(Deserialize)]
pub(super) struct DetailParams {
    q: Option<String>,
    #[serde(default)]
    page: u64,
}

fn rfc3339(datetime: bson::DateTime) -> String {
    from_bson_datetime(datetime).to_rfc3339()
}

fn conversation_view(conversation: StoredConversation) -> ConversationView {
    let topic = conversation.topic.map(|topic| TopicView {
        text: topic.text,
        set_by: topic.set_by,
        set_at: topic.set_at.map(rfc3339),
    });
    let purpose = conversation.purpose.map(|purpose| TopicView {
        text: purpose.text,
        set_by: purpose.set_by,
        set_at: purpose.set_at.map(rfc3339),
    });
    ConversationView {
        id: conversation.id,
        name: conversation.name,
        kind: conversation.kind,
        created: conversation.created.map(rfc3339),
        creator: conversation.creator,
        topic,
        purpose,
        archived: conversation.archived,
        archived_by: conversation.archived_by,
        archived_at: conversation.archived_at.map(rfc3339),
        members: conversation.members,
    }
}

fn message_view(message: StoredMessage) -> MessageView {
    MessageView {
        id: message.id.map(|object_id| object_id.to_hex()),
        conversation_id: message.conversation_id,
        ts: rfc3339(message.ts),
        kind: message.kind,
        username: message.username,
        text: message.text,
        is_edited: message.is_edited,
        reactions: message.reactions,
        files: message.files,
        thread_ts: message.thread_ts.map(rfc3339),
        reply_count: message.reply_count,
        reply_users_count: message.reply_users_count,
        system_action: message.system_action,
    }
}

/// `GET /conversations`.
pub(super) async fn list(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let conversations = context.mongo.list_conversations().await?;
    let conversations: Vec<ConversationView> =
        conversations.into_iter().map(conversation_view).collect();
    Ok(Json(ConversationListResponse {
        count: conversations.len(),
        conversations,
    }))
}

/// `GET /conversations/{id}?q=&page=`: one page of messages in time order,
/// optionally filtered by a text query.
pub(super) async fn detail(
    State(context): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(params): Query<DetailParams>,
) -> Result<Json<ConversationDetailResponse>, ApiError> {
    let Some(conversation) = context.mongo.get_conversation(&id).await? else {
        return Err(ApiError::not_found(format!("conversation not found: {id}")));
    };

    let messages = context
        .mongo
        .conversation_messages(&id, params.q.as_deref(), params.page, PAGE_SIZE)
        .await?;

    Ok(Json(ConversationDetailResponse {
        conversation: conversation_view(conversation),
        page: params.page,
        page_size: PAGE_SIZE,
        messages: messages.into_iter().map(message_view).collect(),
    }))
}
