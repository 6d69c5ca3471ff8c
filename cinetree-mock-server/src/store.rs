use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use cinetree_api::{
    Comment, CommentId, InsertConflict, Path, RootOrder, Subject, TreeStore,
    Uuid, Window,
};
use parking_lot::Mutex;

/// In-memory comment forest, shared between all its clones
#[derive(Clone, Debug, Default)]
pub struct MockStore(Arc<Mutex<Inner>>);

#[derive(Debug, Default)]
struct Inner {
    comments: BTreeMap<Path, Comment>,

    /// Number of upcoming insertions that will lose a race against a
    /// concurrent writer
    pending_races: usize,
}

impl Inner {
    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            None => true,
            Some(p) => self.comments.contains_key(&p),
        }
    }

    /// Checks `parent` is still the comment right above `path`
    fn check_parent(
        &self,
        path: &Path,
        parent: Option<CommentId>,
    ) -> Result<(), InsertConflict> {
        let (expected, parent) = match (path.parent(), parent) {
            (None, _) => return Ok(()),
            (Some(p), Some(id)) => (p, id),
            (Some(_), None) => return Err(InsertConflict::ParentMissing),
        };
        match self.comments.values().find(|c| c.id == parent) {
            None => Err(InsertConflict::ParentMissing),
            Some(c) if c.path != expected => Err(InsertConflict::PathTaken),
            Some(_) => Ok(()),
        }
    }

    /// Simulates a concurrent request that allocated the same path and
    /// committed first
    fn run_pending_race(&mut self, comment: &Comment) {
        if self.pending_races == 0 {
            return;
        }
        self.pending_races -= 1;
        if self.comments.contains_key(&comment.path) || !self.parent_exists(&comment.path) {
            return;
        }
        let racer = Comment {
            id: CommentId(Uuid::new_v4()),
            ..comment.clone()
        };
        self.comments.insert(racer.path.clone(), racer);
    }

    fn children(&self, parent: Option<&Path>) -> Vec<Comment> {
        match parent {
            None => self
                .comments
                .values()
                .filter(|c| c.depth() == 1)
                .cloned()
                .collect(),
            Some(p) => self
                .comments
                .range(p.clone()..)
                .take_while(|(k, _)| p.covers(k))
                .filter(|(k, _)| p.is_parent_of(k))
                .map(|(_, c)| c.clone())
                .collect(),
        }
    }
}

impl MockStore {
    pub fn new() -> MockStore {
        MockStore::default()
    }

    /// Makes the next `count` insertions find their path taken by a
    /// concurrent writer, as if it had allocated the same segment first
    pub fn inject_races(&self, count: usize) {
        self.0.lock().pending_races += count;
    }

    pub fn len(&self) -> usize {
        self.0.lock().comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().comments.is_empty()
    }

    /// Every stored path, in order
    pub fn paths(&self) -> Vec<Path> {
        self.0.lock().comments.keys().cloned().collect()
    }

    /// Every stored comment, in order
    pub fn comments(&self) -> Vec<Comment> {
        self.0.lock().comments.values().cloned().collect()
    }

    /// Writes a comment as-is, bypassing path allocation
    pub fn force_insert(&self, comment: Comment) {
        self.0.lock().comments.insert(comment.path.clone(), comment);
    }
}

#[async_trait]
impl TreeStore for MockStore {
    async fn get(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        Ok(self
            .0
            .lock()
            .comments
            .values()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn get_by_path(&mut self, path: &Path) -> anyhow::Result<Option<Comment>> {
        Ok(self.0.lock().comments.get(path).cloned())
    }

    async fn last_child(&mut self, parent: Option<&Path>) -> anyhow::Result<Option<Path>> {
        Ok(self
            .0
            .lock()
            .children(parent)
            .into_iter()
            .next_back()
            .map(|c| c.path))
    }

    async fn children(&mut self, parent: Option<&Path>) -> anyhow::Result<Vec<Comment>> {
        Ok(self.0.lock().children(parent))
    }

    async fn subtree(&mut self, root: &Path) -> anyhow::Result<Vec<Comment>> {
        Ok(self
            .0
            .lock()
            .comments
            .range(root.clone()..)
            .take_while(|(k, _)| root.covers(k))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn forest(&mut self) -> anyhow::Result<Vec<Comment>> {
        Ok(self.0.lock().comments.values().cloned().collect())
    }

    async fn roots_for(
        &mut self,
        subject: Subject,
        order: RootOrder,
        window: Option<Window>,
    ) -> anyhow::Result<Vec<Comment>> {
        let mut roots = self
            .0
            .lock()
            .children(None)
            .into_iter()
            .filter(|c| c.subject == subject)
            .collect::<Vec<_>>();
        match order {
            RootOrder::NewestFirst => roots.sort_by(|a, b| {
                (b.created_date, &b.path).cmp(&(a.created_date, &a.path))
            }),
            RootOrder::OldestFirst => {
                roots.sort_by(|a, b| (a.created_date, &a.path).cmp(&(b.created_date, &b.path)))
            }
        }
        Ok(match window {
            None => roots,
            Some(w) => roots
                .into_iter()
                .skip(usize::try_from(w.offset).unwrap_or(usize::MAX))
                .take(usize::try_from(w.limit).unwrap_or(usize::MAX))
                .collect(),
        })
    }

    async fn count_roots_for(&mut self, subject: Subject) -> anyhow::Result<u64> {
        Ok(self
            .0
            .lock()
            .comments
            .values()
            .filter(|c| c.depth() == 1 && c.subject == subject)
            .count() as u64)
    }

    async fn insert(
        &mut self,
        comment: &Comment,
        parent: Option<CommentId>,
    ) -> anyhow::Result<Result<(), InsertConflict>> {
        // a round trip to the store, lets concurrent requests interleave
        tokio::task::yield_now().await;
        let mut this = self.0.lock();
        this.run_pending_race(comment);
        if let Err(conflict) = this.check_parent(&comment.path, parent) {
            return Ok(Err(conflict));
        }
        if this.comments.contains_key(&comment.path) {
            return Ok(Err(InsertConflict::PathTaken));
        }
        this.comments.insert(comment.path.clone(), comment.clone());
        Ok(Ok(()))
    }

    async fn insert_shifting(
        &mut self,
        comment: &Comment,
        parent: Option<CommentId>,
        displaced: CommentId,
    ) -> anyhow::Result<Result<(), InsertConflict>> {
        tokio::task::yield_now().await;
        let mut this = self.0.lock();
        this.run_pending_race(comment);
        if let Err(conflict) = this.check_parent(&comment.path, parent) {
            return Ok(Err(conflict));
        }
        let hole = &comment.path;
        if this.comments.get(hole).map(|c| c.id) != Some(displaced) {
            return Ok(Err(InsertConflict::PathTaken));
        }
        let depth = hole.depth();
        let moving = this
            .comments
            .keys()
            .filter(|k| {
                k.prefix(depth)
                    .map_or(false, |p| p.parent() == hole.parent() && p >= *hole)
            })
            .cloned()
            .collect::<Vec<_>>();
        let mut moved = Vec::with_capacity(moving.len());
        for old in moving {
            match old.shifted_at(depth) {
                Some(new) => moved.push((old, new)),
                // the level filled up since the hole was allocated
                None => return Ok(Err(InsertConflict::PathTaken)),
            }
        }
        let mut shifted = Vec::with_capacity(moved.len());
        for (old, new) in moved {
            if let Some(mut c) = this.comments.remove(&old) {
                c.path = new;
                shifted.push(c);
            }
        }
        for c in shifted {
            this.comments.insert(c.path.clone(), c);
        }
        this.comments.insert(hole.clone(), comment.clone());
        Ok(Ok(()))
    }

    async fn delete_subtree(
        &mut self,
        root: CommentId,
        path: &Path,
    ) -> anyhow::Result<Option<u64>> {
        tokio::task::yield_now().await;
        let mut this = self.0.lock();
        if this.comments.get(path).map(|c| c.id) != Some(root) {
            return Ok(None);
        }
        let doomed = this
            .comments
            .range(path.clone()..)
            .take_while(|(k, _)| path.covers(k))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for k in &doomed {
            this.comments.remove(k);
        }
        Ok(Some(doomed.len() as u64))
    }
}
