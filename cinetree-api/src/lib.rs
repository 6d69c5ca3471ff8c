mod auth;
pub use auth::{AuthToken, NewSession};

mod comment;
pub use comment::{AdminNewComment, Comment, CommentId, CommentView, ListComments, NewComment};

mod dump;
pub use dump::{DumpData, DumpNode};

mod error;
pub use error::Error;

mod page;
pub use page::{Page, Paginated, DEFAULT_PAGE_SIZE};

pub mod path;
pub use path::{Path, Segment};

mod store;
pub use store::{InsertConflict, RootOrder, TreeStore, Window};

mod subject;
pub use subject::{FilmId, NewSubject, Subject, SubjectKind, SubjectRef, TvId};

mod tree;
pub use tree::{
    AdminPlacement, AdminPosition, CommentTree, Placement, Position, TreeError,
    MAX_WRITE_ATTEMPTS,
};

mod user;
pub use user::{NewUser, User, UserId};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<chrono::Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::NullByteInString(String::from(s))),
        false => Ok(()),
    }
}
