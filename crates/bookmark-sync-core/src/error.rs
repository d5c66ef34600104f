use crate::bookmarks::BookmarkError;
use crate::remote::RemoteError;
use crate::store::StoreError;
use crate::tree::TreeError;
use thiserror::Error;

/// Errors surfaced by the coordinator and the pipelines.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Bookmark store error: {0}")]
    Bookmarks(#[from] BookmarkError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Local state error: {0}")]
    Store(#[from] StoreError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Refusing to replace {before} bookmarks with an empty tree")]
    DestructiveWrite { before: usize },

    #[error("No conflict to resolve")]
    NotInConflict,

    #[error("A conflict is waiting to be resolved")]
    ConflictPending,

    #[error("Not signed in")]
    NoSession,
}

pub type Result<T> = std::result::Result<T, SyncError>;
