//! Persistence: document store and vector store.

pub mod chroma;
pub mod mongo;

pub use chroma::{ChromaStore, VectorHit, VectorMetadata, VectorRecord, snippet};
pub use mongo::{
    FailedImport, MongoStore, ScoredMessage, StoredConversation, StoredFileRef, StoredMessage,
    UserActivity, accumulate_user_activity, duplicate_key, from_bson_datetime, to_bson_datetime,
};
