use std::{fmt, str::FromStr};

use anyhow::Context;
use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use crate::{
    comment::validate_text, Comment, CommentId, DumpNode, Error, InsertConflict, Page, Paginated,
    Path, RootOrder, Segment, Subject, TreeStore, UserId,
};

/// Number of times a write is attempted before a conflict with concurrent
/// writers is reported to the caller
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// Where a sibling goes relative to its reference comment
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    FirstSibling,
    Left,
    Right,
    LastSibling,
    /// Among the siblings, in ascending comment id order
    SortedSibling,
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Position, Error> {
        match s {
            "first-sibling" => Ok(Position::FirstSibling),
            "left" => Ok(Position::Left),
            "right" => Ok(Position::Right),
            "last-sibling" => Ok(Position::LastSibling),
            "sorted-sibling" => Ok(Position::SortedSibling),
            _ => Err(Error::InvalidPosition(String::from(s))),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Position::FirstSibling => "first-sibling",
            Position::Left => "left",
            Position::Right => "right",
            Position::LastSibling => "last-sibling",
            Position::SortedSibling => "sorted-sibling",
        })
    }
}

/// Where a new comment goes. Relatives are named by id and followed to
/// wherever concurrent sibling insertions shift them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    Root,
    Child {
        parent: CommentId,
    },
    Sibling {
        reference: CommentId,
        position: Position,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminPosition {
    SortedChild,
    Sibling(Position),
}

impl FromStr for AdminPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<AdminPosition, Error> {
        match s {
            "sorted-child" => Ok(AdminPosition::SortedChild),
            s => s.parse().map(AdminPosition::Sibling),
        }
    }
}

/// Placement chosen in the administrative interface. Without a reference,
/// or if the reference is gone, the comment becomes a new root.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AdminPlacement {
    pub reference: Option<CommentId>,
    pub position: AdminPosition,
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error(transparent)]
    Api(#[from] Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TreeError {
    /// Collapses store failures into an opaque client-facing error
    pub fn into_api(self) -> Error {
        match self {
            TreeError::Api(e) => e,
            TreeError::Store(e) => Error::Unknown(format!("{e:#}")),
        }
    }
}

/// Path allocated for a new comment, with what the store must still find
/// around it when writing
struct Slot {
    path: Path,
    parent: Option<CommentId>,
    /// Sibling holding `path`, to be shifted right
    displaced: Option<CommentId>,
}

/// Materialized-path comment forest on top of a `TreeStore`
pub struct CommentTree<S> {
    store: S,
}

impl<S: TreeStore> CommentTree<S> {
    pub fn new(store: S) -> CommentTree<S> {
        CommentTree { store }
    }

    pub fn store(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub async fn get(&mut self, id: CommentId) -> Result<Comment, TreeError> {
        self.store
            .get(id)
            .await
            .with_context(|| format!("fetching comment {id:?}"))?
            .ok_or(TreeError::Api(Error::CommentNotFound(id.0)))
    }

    pub async fn get_by_path(&mut self, path: &Path) -> Result<Comment, TreeError> {
        self.store
            .get_by_path(path)
            .await
            .with_context(|| format!("fetching comment at {path}"))?
            .ok_or_else(|| TreeError::Api(Error::PathNotFound(path.to_string())))
    }

    pub async fn add_root(
        &mut self,
        author: UserId,
        subject: Subject,
        text: String,
    ) -> Result<Comment, TreeError> {
        self.insert(Placement::Root, author, subject, text).await
    }

    pub async fn add_child(
        &mut self,
        parent: &Path,
        author: UserId,
        subject: Subject,
        text: String,
    ) -> Result<Comment, TreeError> {
        validate_text(&text)?;
        let parent = self.get_by_path(parent).await?.id;
        self.insert(Placement::Child { parent }, author, subject, text)
            .await
    }

    pub async fn add_sibling(
        &mut self,
        reference: &Path,
        author: UserId,
        subject: Subject,
        text: String,
        position: Position,
    ) -> Result<Comment, TreeError> {
        validate_text(&text)?;
        let reference = self.get_by_path(reference).await?.id;
        self.insert(
            Placement::Sibling {
                reference,
                position,
            },
            author,
            subject,
            text,
        )
        .await
    }

    /// Inserts following an administrative placement
    pub async fn add_admin(
        &mut self,
        placement: AdminPlacement,
        author: UserId,
        subject: Subject,
        text: String,
    ) -> Result<Comment, TreeError> {
        let reference = match placement.reference {
            None => None,
            Some(id) => self
                .store
                .get(id)
                .await
                .with_context(|| format!("fetching reference comment {id:?}"))?,
        };
        let placement = match (reference, placement.position) {
            (None, _) => Placement::Root,
            (Some(r), AdminPosition::SortedChild) => Placement::Child { parent: r.id },
            (Some(r), AdminPosition::Sibling(position)) => Placement::Sibling {
                reference: r.id,
                position,
            },
        };
        self.insert(placement, author, subject, text).await
    }

    /// Allocates a path for a new comment and writes it, retrying if a
    /// concurrent insertion takes the allocated path first
    pub async fn insert(
        &mut self,
        placement: Placement,
        author: UserId,
        subject: Subject,
        text: String,
    ) -> Result<Comment, TreeError> {
        validate_text(&text)?;
        let id = CommentId(Uuid::new_v4());
        // stores keep microseconds
        let created_date = Utc::now().trunc_subsecs(6);
        let mut last_conflict = None;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let slot = self.allocate(placement, id, subject).await?;
            let comment = Comment {
                id,
                path: slot.path,
                author,
                subject,
                text: text.clone(),
                created_date,
            };
            let res = match slot.displaced {
                None => self.store.insert(&comment, slot.parent).await,
                Some(displaced) => {
                    self.store
                        .insert_shifting(&comment, slot.parent, displaced)
                        .await
                }
            }
            .with_context(|| format!("inserting comment {id:?} at {}", comment.path))?;
            match res {
                Ok(()) => return Ok(comment),
                Err(InsertConflict::PathTaken) => {
                    tracing::debug!(path = %comment.path, attempt, "comment path was taken or moved concurrently");
                    last_conflict = Some(comment.path);
                }
                Err(InsertConflict::ParentMissing) => {
                    let parent = comment
                        .path
                        .parent()
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    return Err(Error::PathNotFound(parent).into());
                }
            }
        }
        let path = last_conflict.map(|p| p.to_string()).unwrap_or_default();
        tracing::warn!(%path, "giving up on comment insertion after repeated conflicts");
        Err(Error::Conflict(path).into())
    }

    async fn allocate(
        &mut self,
        placement: Placement,
        id: CommentId,
        subject: Subject,
    ) -> Result<Slot, TreeError> {
        let (reference, position) = match placement {
            Placement::Root => {
                return Ok(Slot {
                    path: self.after_last_child(None).await?,
                    parent: None,
                    displaced: None,
                })
            }
            Placement::Child { parent } => {
                let parent = self.relative(parent, subject).await?;
                return Ok(Slot {
                    path: self.after_last_child(Some(&parent.path)).await?,
                    parent: Some(parent.id),
                    displaced: None,
                });
            }
            Placement::Sibling {
                reference,
                position,
            } => (self.relative(reference, subject).await?, position),
        };

        let parent_path = reference.path.parent();
        let parent = match &parent_path {
            None => None,
            Some(p) => Some(self.get_by_path(p).await?.id),
        };
        match position {
            Position::LastSibling => self.last_slot(parent_path.as_ref(), parent).await,
            Position::FirstSibling => {
                let first = self
                    .children(parent_path.as_ref())
                    .await?
                    .into_iter()
                    .next();
                match first {
                    Some(first) => self.hole_at(first, parent).await,
                    None => self.last_slot(parent_path.as_ref(), parent).await,
                }
            }
            Position::Left => self.hole_at(reference, parent).await,
            Position::Right => {
                let next = reference
                    .path
                    .last()
                    .next()
                    .ok_or(Error::CapacityExceeded(reference.depth()))?;
                let path = reference.path.with_last(next);
                let occupant = self
                    .store
                    .get_by_path(&path)
                    .await
                    .with_context(|| format!("checking whether {path} is free"))?;
                match occupant {
                    Some(occupant) => self.hole_at(occupant, parent).await,
                    None => Ok(Slot {
                        path,
                        parent,
                        displaced: None,
                    }),
                }
            }
            Position::SortedSibling => {
                let after = self
                    .children(parent_path.as_ref())
                    .await?
                    .into_iter()
                    .find(|c| c.id > id);
                match after {
                    Some(after) => self.hole_at(after, parent).await,
                    None => self.last_slot(parent_path.as_ref(), parent).await,
                }
            }
        }
    }

    /// The comment a new one is placed against. A thread stays about a
    /// single title.
    async fn relative(&mut self, id: CommentId, subject: Subject) -> Result<Comment, TreeError> {
        let relative = self.get(id).await?;
        if relative.subject != subject {
            return Err(Error::InvalidSubject(format!(
                "comment at {} is about another title",
                relative.path
            ))
            .into());
        }
        Ok(relative)
    }

    async fn after_last_child(&mut self, parent: Option<&Path>) -> Result<Path, TreeError> {
        let depth = parent.map_or(1, |p| p.depth() + 1);
        let segment = match self
            .store
            .last_child(parent)
            .await
            .with_context(|| format!("fetching last child of {parent:?}"))?
        {
            None => Segment::FIRST,
            Some(last) => last.last().next().ok_or(Error::CapacityExceeded(depth))?,
        };
        Ok(match parent {
            None => Path::root(segment),
            Some(p) => p.child(segment),
        })
    }

    async fn last_slot(
        &mut self,
        parent_path: Option<&Path>,
        parent: Option<CommentId>,
    ) -> Result<Slot, TreeError> {
        Ok(Slot {
            path: self.after_last_child(parent_path).await?,
            parent,
            displaced: None,
        })
    }

    /// Slot held by `occupant`, provided it and its later siblings can all
    /// move right
    async fn hole_at(
        &mut self,
        occupant: Comment,
        parent: Option<CommentId>,
    ) -> Result<Slot, TreeError> {
        let last = self
            .store
            .last_child(occupant.path.parent().as_ref())
            .await
            .with_context(|| format!("fetching last sibling of {}", occupant.path))?;
        if let Some(last) = last {
            if last >= occupant.path && last.last().next().is_none() {
                return Err(Error::CapacityExceeded(occupant.depth()).into());
            }
        }
        Ok(Slot {
            path: occupant.path,
            parent,
            displaced: Some(occupant.id),
        })
    }

    async fn children(&mut self, parent: Option<&Path>) -> Result<Vec<Comment>, TreeError> {
        Ok(self
            .store
            .children(parent)
            .await
            .with_context(|| format!("listing children of {parent:?}"))?)
    }

    /// Direct replies to a comment, in sibling order
    pub async fn children_of(&mut self, id: CommentId) -> Result<Vec<Comment>, TreeError> {
        let node = self.get(id).await?;
        self.children(Some(&node.path)).await
    }

    /// A comment followed by all its descendants, in pre-order
    pub async fn subtree_of(&mut self, id: CommentId) -> Result<Vec<Comment>, TreeError> {
        let node = self.get(id).await?;
        Ok(self
            .store
            .subtree(&node.path)
            .await
            .with_context(|| format!("fetching subtree at {}", node.path))?)
    }

    /// Every thread about `subject`
    pub async fn roots_for(
        &mut self,
        subject: Subject,
        order: RootOrder,
    ) -> Result<Vec<Comment>, TreeError> {
        Ok(self
            .store
            .roots_for(subject, order, None)
            .await
            .with_context(|| format!("listing threads about {subject:?}"))?)
    }

    /// One page of the threads about `subject`, each one fully nested
    pub async fn page_of_threads(
        &mut self,
        subject: Subject,
        order: RootOrder,
        page: Page,
    ) -> Result<Paginated<Vec<DumpNode>>, TreeError> {
        let count = self
            .store
            .count_roots_for(subject)
            .await
            .with_context(|| format!("counting threads about {subject:?}"))?;
        let roots = self
            .store
            .roots_for(subject, order, Some(page.window()))
            .await
            .with_context(|| format!("listing threads about {subject:?}"))?;
        let mut results = Vec::with_capacity(roots.len());
        for r in roots {
            let subtree = self
                .store
                .subtree(&r.path)
                .await
                .with_context(|| format!("fetching subtree at {}", r.path))?;
            results.push(DumpNode::nest(subtree));
        }
        Ok(page.wrap(count, results)?)
    }

    /// Nested form of the subtree at `id`, or of the whole forest
    pub async fn dump_bulk(&mut self, id: Option<CommentId>) -> Result<Vec<DumpNode>, TreeError> {
        let comments = match id {
            Some(id) => self.subtree_of(id).await?,
            None => self
                .store
                .forest()
                .await
                .context("fetching the whole comment forest")?,
        };
        Ok(DumpNode::nest(comments))
    }

    /// Removes a comment and all its replies. Surviving siblings keep their
    /// paths.
    pub async fn delete(&mut self, id: CommentId) -> Result<u64, TreeError> {
        let mut last_conflict = None;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let node = self.get(id).await?;
            let removed = self
                .store
                .delete_subtree(id, &node.path)
                .await
                .with_context(|| format!("deleting subtree at {}", node.path))?;
            match removed {
                Some(removed) => {
                    tracing::debug!(path = %node.path, removed, "deleted comment subtree");
                    return Ok(removed);
                }
                None => {
                    tracing::debug!(path = %node.path, attempt, "comment moved while being deleted");
                    last_conflict = Some(node.path);
                }
            }
        }
        let path = last_conflict.map(|p| p.to_string()).unwrap_or_default();
        tracing::warn!(%path, "giving up on comment deletion after repeated conflicts");
        Err(Error::Conflict(path).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_parse() {
        for p in [
            Position::FirstSibling,
            Position::Left,
            Position::Right,
            Position::LastSibling,
            Position::SortedSibling,
        ] {
            assert_eq!(p.to_string().parse(), Ok(p));
            assert_eq!(
                p.to_string().parse::<AdminPosition>(),
                Ok(AdminPosition::Sibling(p))
            );
        }
        assert_eq!("sorted-child".parse(), Ok(AdminPosition::SortedChild));
        assert!("middle".parse::<Position>().is_err());
    }

    #[test]
    fn admin_placement_wire_format() {
        let p: AdminPlacement =
            serde_json::from_str(r#"{"reference": null, "position": "sorted-child"}"#).unwrap();
        assert_eq!(
            p,
            AdminPlacement {
                reference: None,
                position: AdminPosition::SortedChild
            }
        );
        let p: AdminPlacement =
            serde_json::from_str(r#"{"reference": null, "position": {"sibling": "left"}}"#)
                .unwrap();
        assert_eq!(p.position, AdminPosition::Sibling(Position::Left));
    }
}
