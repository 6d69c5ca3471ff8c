use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Name already used {0}")]
    NameAlreadyUsed(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid character in name {0:?}")]
    InvalidName(String),

    #[error("Comment text must not be empty")]
    EmptyText,

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Invalid comment path {0:?}")]
    InvalidPath(String),

    #[error("Invalid comment position {0:?}")]
    InvalidPosition(String),

    #[error("No comment with id {0}")]
    CommentNotFound(Uuid),

    #[error("No comment with path {0}")]
    PathNotFound(String),

    #[error("No user with id {0}")]
    UserNotFound(Uuid),

    #[error("No film or tv with id {0}")]
    SubjectNotFound(Uuid),

    #[error("Invalid page {0}")]
    PageNotFound(u64),

    #[error("Concurrent insertion kept taking path {0}")]
    Conflict(String),

    #[error("No free segment left at depth {0}")]
    CapacityExceeded(usize),
}

impl Error {
    /// Errors caused by malformed client input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NullByteInString(_)
                | Error::InvalidName(_)
                | Error::EmptyText
                | Error::InvalidSubject(_)
                | Error::InvalidPath(_)
                | Error::InvalidPosition(_)
        )
    }

    /// Errors that may go away if the request is simply sent again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::UuidAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NameAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::InvalidName(_) => StatusCode::BAD_REQUEST,
            Error::EmptyText => StatusCode::BAD_REQUEST,
            Error::InvalidSubject(_) => StatusCode::BAD_REQUEST,
            Error::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Error::InvalidPosition(_) => StatusCode::BAD_REQUEST,
            Error::CommentNotFound(_) => StatusCode::NOT_FOUND,
            Error::PathNotFound(_) => StatusCode::NOT_FOUND,
            Error::UserNotFound(_) => StatusCode::NOT_FOUND,
            Error::SubjectNotFound(_) => StatusCode::NOT_FOUND,
            Error::PageNotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::CapacityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::Unauthenticated => json!({
                "message": "authentication required",
                "type": "unauthenticated",
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "message": "uuid conflict",
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::NameAlreadyUsed(n) => json!({
                "message": "name already used",
                "type": "conflict-name",
                "name": n,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidName(n) => json!({
                "message": "there was an invalid character in a user name",
                "type": "invalid-name",
                "name": n,
            }),
            Error::EmptyText => json!({
                "message": "comment text must not be empty",
                "type": "empty-text",
            }),
            Error::InvalidSubject(msg) => json!({
                "message": msg,
                "type": "invalid-subject",
            }),
            Error::InvalidPath(p) => json!({
                "message": "malformed comment path",
                "type": "invalid-path",
                "path": p,
            }),
            Error::InvalidPosition(p) => json!({
                "message": "unknown comment position",
                "type": "invalid-position",
                "position": p,
            }),
            Error::CommentNotFound(id) => json!({
                "message": "no comment with such id",
                "type": "comment-not-found",
                "id": id,
            }),
            Error::PathNotFound(p) => json!({
                "message": "no comment with such path",
                "type": "path-not-found",
                "path": p,
            }),
            Error::UserNotFound(id) => json!({
                "message": "no user with such id",
                "type": "user-not-found",
                "id": id,
            }),
            Error::SubjectNotFound(id) => json!({
                "message": "no such film or tv",
                "type": "subject-not-found",
                "id": id,
            }),
            Error::PageNotFound(page) => json!({
                "message": "invalid page",
                "type": "page-not-found",
                "page": page,
            }),
            Error::Conflict(p) => json!({
                "message": "concurrent insertion conflict, please retry",
                "type": "conflict-path",
                "path": p,
            }),
            Error::CapacityExceeded(depth) => json!({
                "message": "no free comment slot left at this depth",
                "type": "capacity-exceeded",
                "depth": depth,
            }),
        })
        .expect("serializing error")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let field = |name: &str| -> anyhow::Result<String> {
            data.get(name)
                .and_then(|f| f.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error contents has no string field {name:?}"))
        };
        let uuid_field = |name: &str| -> anyhow::Result<Uuid> {
            Uuid::from_str(&field(name)?)
                .with_context(|| format!("error contents field {name:?} is not a uuid"))
        };
        let int_field = |name: &str| -> anyhow::Result<u64> {
            data.get(name)
                .and_then(|f| f.as_u64())
                .ok_or_else(|| anyhow!("error contents has no integer field {name:?}"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(field("message").unwrap_or_default()),
                "permission-denied" => Error::PermissionDenied,
                "unauthenticated" => Error::Unauthenticated,
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid_field("uuid")?),
                "conflict-name" => Error::NameAlreadyUsed(field("name")?),
                "null-byte" => Error::NullByteInString(field("string")?),
                "invalid-name" => Error::InvalidName(field("name")?),
                "empty-text" => Error::EmptyText,
                "invalid-subject" => Error::InvalidSubject(field("message")?),
                "invalid-path" => Error::InvalidPath(field("path")?),
                "invalid-position" => Error::InvalidPosition(field("position")?),
                "comment-not-found" => Error::CommentNotFound(uuid_field("id")?),
                "path-not-found" => Error::PathNotFound(field("path")?),
                "user-not-found" => Error::UserNotFound(uuid_field("id")?),
                "subject-not-found" => Error::SubjectNotFound(uuid_field("id")?),
                "page-not-found" => Error::PageNotFound(int_field("page")?),
                "conflict-path" => Error::Conflict(field("path")?),
                "capacity-exceeded" => Error::CapacityExceeded(
                    usize::try_from(int_field("depth")?).context("depth out of range")?,
                ),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}
