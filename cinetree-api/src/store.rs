use async_trait::async_trait;

use crate::{Comment, CommentId, Path, Subject};

/// Order in which the threads about a subject are listed
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootOrder {
    /// By creation date, newest first, ties broken by descending path
    #[default]
    NewestFirst,
    /// By creation date, oldest first, ties broken by ascending path
    OldestFirst,
}

/// Slice of an ordered listing
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Window {
    pub offset: u64,
    pub limit: u64,
}

/// Reason a store refused to write a new comment
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertConflict {
    /// Another comment already has this path, the caller should allocate again
    PathTaken,

    /// The comment's parent no longer exists
    ParentMissing,
}

/// Backing storage of the comment forest.
///
/// Each method is a single round trip to the store. Every listing is ordered
/// by path unless stated otherwise. `parent: None` stands for the level of
/// root comments.
#[async_trait]
pub trait TreeStore: Send {
    async fn get(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>>;

    async fn get_by_path(&mut self, path: &Path) -> anyhow::Result<Option<Comment>>;

    /// Path of the last direct child of `parent`
    async fn last_child(&mut self, parent: Option<&Path>) -> anyhow::Result<Option<Path>>;

    /// Direct children of `parent`
    async fn children(&mut self, parent: Option<&Path>) -> anyhow::Result<Vec<Comment>>;

    /// The comment at `root` and all its descendants
    async fn subtree(&mut self, root: &Path) -> anyhow::Result<Vec<Comment>>;

    /// Every comment
    async fn forest(&mut self) -> anyhow::Result<Vec<Comment>>;

    /// Root comments about `subject`, ordered by `order`
    async fn roots_for(
        &mut self,
        subject: Subject,
        order: RootOrder,
        window: Option<Window>,
    ) -> anyhow::Result<Vec<Comment>>;

    async fn count_roots_for(&mut self, subject: Subject) -> anyhow::Result<u64>;

    /// Writes `comment` at its path, which must be free. `parent` is the
    /// comment it replies to, which must still be at the parent path:
    /// `ParentMissing` if it is gone, `PathTaken` if it moved.
    async fn insert(
        &mut self,
        comment: &Comment,
        parent: Option<CommentId>,
    ) -> anyhow::Result<Result<(), InsertConflict>>;

    /// Frees `comment.path` by moving `displaced`, the sibling holding it,
    /// and every later sibling, one segment to the right along with their
    /// subtrees, then writes `comment` there. Atomic. Fails with `PathTaken`
    /// if `displaced` is no longer at `comment.path`, otherwise checks
    /// `parent` like `insert`.
    async fn insert_shifting(
        &mut self,
        comment: &Comment,
        parent: Option<CommentId>,
        displaced: CommentId,
    ) -> anyhow::Result<Result<(), InsertConflict>>;

    /// Removes comment `root` and all its descendants, atomically, returning
    /// the number of comments removed. `None` if `root` is no longer at
    /// `path`, having moved or been deleted.
    async fn delete_subtree(
        &mut self,
        root: CommentId,
        path: &Path,
    ) -> anyhow::Result<Option<u64>>;
}
