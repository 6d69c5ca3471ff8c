use uuid::Uuid;

use crate::{AdminPlacement, Error, FilmId, Path, Subject, SubjectKind, SubjectRef, Time, TvId, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

/// A node of a comment tree
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub path: Path,
    pub author: UserId,
    pub subject: Subject,
    pub text: String,
    pub created_date: Time,
}

impl Comment {
    pub fn depth(&self) -> usize {
        self.path.depth()
    }

    pub fn view(&self) -> CommentView {
        CommentView {
            id: self.id,
            film: self.subject.film(),
            tv: self.subject.tv(),
            created_date: self.created_date,
            text: self.text.clone(),
            path: self.path.clone(),
        }
    }
}

/// What a client gets back after posting a comment
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentView {
    pub id: CommentId,
    pub film: Option<FilmId>,
    pub tv: Option<TvId>,
    pub created_date: Time,
    pub text: String,
    pub path: Path,
}

pub(crate) fn validate_text(text: &str) -> Result<(), Error> {
    crate::validate_string(text)?;
    if text.trim().is_empty() {
        return Err(Error::EmptyText);
    }
    Ok(())
}

/// A comment as posted by a user. An empty `path` starts a new thread,
/// otherwise the comment replies to the one at `path`.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    #[serde(default)]
    pub film: Option<SubjectRef>,
    #[serde(default)]
    pub tv: Option<SubjectRef>,
    pub text: String,
    #[serde(default)]
    pub path: String,
}

impl NewComment {
    /// Returns the subject and the parent path, if any
    pub fn validate(&self) -> Result<(Subject, Option<Path>), Error> {
        validate_text(&self.text)?;
        let subject = Subject::from_refs(self.film, self.tv)?;
        let parent = match self.path.as_str() {
            "" => None,
            p => Some(p.parse()?),
        };
        Ok((subject, parent))
    }
}

/// A comment placed through the administrative interface
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct AdminNewComment {
    pub author: UserId,
    pub subject: Subject,
    pub text: String,
    pub placement: AdminPlacement,
}

impl AdminNewComment {
    pub fn validate(&self) -> Result<(), Error> {
        validate_text(&self.text)
    }
}

/// Query string of the comment listing
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ListComments {
    pub subject_id: Uuid,
    pub subject_type: String,
    #[serde(default)]
    pub page: Option<u64>,
}

impl ListComments {
    pub fn subject(&self) -> Result<Subject, Error> {
        Ok(Subject::new(
            self.subject_type.parse::<SubjectKind>()?,
            self.subject_id,
        ))
    }
}
