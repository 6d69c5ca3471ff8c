use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use cinetree_api::{
    AuthToken, Comment, CommentId, FilmId, InsertConflict, NewSession, NewSubject, NewUser, Path,
    RootOrder, Subject, Time, TreeStore, TvId, User, UserId, Uuid, Window,
};
use sqlx::{postgres::PgRow, Connection, Row};

use crate::Error;

const COMMENT_COLUMNS: &str = "id, path, depth, author_id, film_id, tv_id, text, created_date";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(e) if e.code().as_deref() == Some("23505"))
}

fn violated_constraint(e: &sqlx::Error) -> Option<&str> {
    match e {
        sqlx::Error::Database(e) => e.constraint(),
        _ => None,
    }
}

fn subject_column(subject: Subject) -> &'static str {
    match subject {
        Subject::Film(_) => "film_id",
        Subject::Tv(_) => "tv_id",
    }
}

/// Prefix shared by the paths of every comment of the subtree at `path`,
/// the empty string standing for the whole forest
fn like_prefix(path: Option<&Path>) -> String {
    path.map(|p| p.to_string()).unwrap_or_default()
}

fn comment_from_row(row: &PgRow) -> anyhow::Result<Comment> {
    let path: String = row.try_get("path").context("retrieving the path field")?;
    let path = path
        .parse::<Path>()
        .with_context(|| format!("parsing stored comment path {path:?}"))?;
    let depth: i32 = row.try_get("depth").context("retrieving the depth field")?;
    if usize::try_from(depth).ok() != Some(path.depth()) {
        return Err(anyhow!("comment at {path} is stored with depth {depth}"));
    }
    let film: Option<Uuid> = row.try_get("film_id").context("retrieving the film_id field")?;
    let tv: Option<Uuid> = row.try_get("tv_id").context("retrieving the tv_id field")?;
    let subject = match (film, tv) {
        (Some(f), None) => Subject::Film(FilmId(f)),
        (None, Some(t)) => Subject::Tv(TvId(t)),
        _ => return Err(anyhow!("comment at {path} must have exactly one subject")),
    };
    Ok(Comment {
        id: CommentId(row.try_get("id").context("retrieving the id field")?),
        path,
        author: UserId(
            row.try_get("author_id")
                .context("retrieving the author_id field")?,
        ),
        subject,
        text: row.try_get("text").context("retrieving the text field")?,
        created_date: row
            .try_get::<Time, _>("created_date")
            .context("retrieving the created_date field")?,
    })
}

fn comments_from_rows(rows: Vec<PgRow>) -> anyhow::Result<Vec<Comment>> {
    rows.iter().map(comment_from_row).collect()
}

/// Checks `parent` is still the comment right above `path`, and keeps it
/// from moving or being deleted until the end of the transaction
async fn lock_parent(
    conn: &mut sqlx::PgConnection,
    path: &Path,
    parent: Option<CommentId>,
) -> anyhow::Result<Result<(), InsertConflict>> {
    let (expected, parent) = match (path.parent(), parent) {
        (None, _) => return Ok(Ok(())),
        (Some(p), Some(id)) => (p, id),
        (Some(_), None) => return Ok(Err(InsertConflict::ParentMissing)),
    };
    let current: Option<String> =
        sqlx::query_scalar("SELECT path FROM comments WHERE id = $1 FOR SHARE")
            .bind(parent.0)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("locking parent comment {parent:?}"))?;
    Ok(match current {
        None => Err(InsertConflict::ParentMissing),
        Some(current) if current != expected.to_string() => Err(InsertConflict::PathTaken),
        Some(_) => Ok(()),
    })
}

/// Locks the comments under `prefix` whose ancestor at the depth of `from`
/// is `from` or a later sibling, returning their ids and paths. Later
/// siblings come first, and descendants before their ancestors. Runs again
/// until no new comment shows up, as a statement does not see the rows
/// committed while it waited for its locks.
async fn lock_from(
    conn: &mut sqlx::PgConnection,
    prefix: &str,
    from: &Path,
) -> anyhow::Result<Vec<(Uuid, String)>> {
    let depth = from.depth();
    let mut locked = Vec::new();
    loop {
        let rows = sqlx::query(
            "
                SELECT id, path FROM comments
                WHERE path LIKE $1 || '%'
                AND depth >= $2
                AND substr(path, 1, $3) >= $4
                ORDER BY path DESC
                FOR UPDATE
            ",
        )
        .bind(prefix)
        .bind(depth as i32)
        .bind((depth * cinetree_api::path::SEGMENT_WIDTH) as i32)
        .bind(from.to_string())
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("locking the comments from {from}"))?
        .iter()
        .map(|row| -> anyhow::Result<(Uuid, String)> {
            Ok((
                row.try_get("id").context("retrieving the id field")?,
                row.try_get("path").context("retrieving the path field")?,
            ))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
        if rows == locked {
            return Ok(locked);
        }
        locked = rows;
    }
}

async fn insert_row(
    conn: &mut sqlx::PgConnection,
    c: &Comment,
) -> anyhow::Result<Result<(), InsertConflict>> {
    let res = sqlx::query(
        "
            INSERT INTO comments
            (id, path, depth, author_id, film_id, tv_id, text, created_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ",
    )
    .bind(c.id.0)
    .bind(c.path.to_string())
    .bind(c.depth() as i32)
    .bind(c.author.0)
    .bind(c.subject.film().map(|f| f.0))
    .bind(c.subject.tv().map(|t| t.0))
    .bind(&c.text)
    .bind(c.created_date)
    .execute(&mut *conn)
    .await;
    match res {
        Ok(_) => Ok(Ok(())),
        Err(e) if violated_constraint(&e) == Some("comments_path_key") => {
            Ok(Err(InsertConflict::PathTaken))
        }
        Err(e) => Err(e).with_context(|| format!("inserting comment {:?} at {}", c.id, c.path)),
    }
}

fn is_deadlock(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(e) if e.code().as_deref() == Some("40P01"))
}

/// Reports a write transaction aborted by a deadlock between concurrent
/// writers as `conflict`, for the caller to try again
fn deadlock_as<T>(res: anyhow::Result<T>, conflict: T) -> anyhow::Result<T> {
    match res {
        Err(e) if e.downcast_ref::<sqlx::Error>().map_or(false, is_deadlock) => {
            tracing::debug!(error = ?e, "comment write deadlocked");
            Ok(conflict)
        }
        res => res,
    }
}

async fn insert_tx(
    conn: &mut sqlx::PgConnection,
    comment: &Comment,
    parent: Option<CommentId>,
) -> anyhow::Result<Result<(), InsertConflict>> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    if let Err(conflict) = lock_parent(&mut tx, &comment.path, parent).await? {
        return Ok(Err(conflict));
    }
    if let Err(conflict) = insert_row(&mut tx, comment).await? {
        return Ok(Err(conflict));
    }
    tx.commit().await.context("committing transaction")?;
    Ok(Ok(()))
}

async fn insert_shifting_tx(
    conn: &mut sqlx::PgConnection,
    comment: &Comment,
    parent: Option<CommentId>,
    displaced: CommentId,
) -> anyhow::Result<Result<(), InsertConflict>> {
    let hole = &comment.path;
    let depth = hole.depth();
    let mut tx = conn.begin().await.context("starting transaction")?;
    if let Err(conflict) = lock_parent(&mut tx, hole, parent).await? {
        return Ok(Err(conflict));
    }

    let moving = lock_from(&mut tx, &like_prefix(hole.parent().as_ref()), hole).await?;
    let hole_str = hole.to_string();
    if !moving
        .iter()
        .any(|(id, path)| *id == displaced.0 && *path == hole_str)
    {
        return Ok(Err(InsertConflict::PathTaken));
    }

    for (id, path) in moving {
        let path = path
            .parse::<Path>()
            .with_context(|| format!("parsing stored comment path {path:?}"))?;
        let shifted = match path.shifted_at(depth) {
            Some(p) => p,
            None => return Ok(Err(InsertConflict::PathTaken)),
        };
        let res = sqlx::query("UPDATE comments SET path = $1 WHERE id = $2")
            .bind(shifted.to_string())
            .bind(id)
            .execute(&mut tx)
            .await;
        match res {
            Ok(_) => (),
            Err(e) if is_unique_violation(&e) => return Ok(Err(InsertConflict::PathTaken)),
            Err(e) => {
                return Err(e).with_context(|| format!("moving comment {path} to {shifted}"))
            }
        }
    }

    if let Err(conflict) = insert_row(&mut tx, comment).await? {
        return Ok(Err(conflict));
    }
    tx.commit().await.context("committing transaction")?;
    Ok(Ok(()))
}

async fn delete_subtree_tx(
    conn: &mut sqlx::PgConnection,
    root: CommentId,
    path: &Path,
) -> anyhow::Result<Option<u64>> {
    let mut tx = conn.begin().await.context("starting transaction")?;
    let locked = lock_from(&mut tx, &path.to_string(), path).await?;
    // a comment never moves below its own former path
    if !locked.iter().any(|(id, _)| *id == root.0) {
        return Ok(None);
    }
    let removed = sqlx::query("DELETE FROM comments WHERE path LIKE $1 || '%'")
        .bind(path.to_string())
        .execute(&mut tx)
        .await
        .with_context(|| format!("deleting subtree at {path}"))?
        .rows_affected();
    tx.commit().await.context("committing transaction")?;
    Ok(Some(removed))
}

/// Comment forest stored in the `comments` table
pub struct PostgresStore<'a> {
    pub conn: &'a mut sqlx::PgConnection,
}

#[async_trait]
impl<'a> TreeStore for PostgresStore<'a> {
    async fn get(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        sqlx::query(&format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&mut *self.conn)
            .await
            .with_context(|| format!("fetching comment {id:?}"))?
            .as_ref()
            .map(comment_from_row)
            .transpose()
    }

    async fn get_by_path(&mut self, path: &Path) -> anyhow::Result<Option<Comment>> {
        sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments WHERE path = $1"
        ))
        .bind(path.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("fetching comment at {path}"))?
        .as_ref()
        .map(comment_from_row)
        .transpose()
    }

    async fn last_child(&mut self, parent: Option<&Path>) -> anyhow::Result<Option<Path>> {
        let depth = parent.map_or(1, |p| p.depth() + 1);
        let path: Option<String> = sqlx::query_scalar(
            "
                SELECT path FROM comments
                WHERE depth = $1 AND path LIKE $2 || '%'
                ORDER BY path DESC
                LIMIT 1
            ",
        )
        .bind(depth as i32)
        .bind(like_prefix(parent))
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("fetching last child of {parent:?}"))?;
        path.map(|p| {
            p.parse()
                .with_context(|| format!("parsing stored comment path {p:?}"))
        })
        .transpose()
    }

    async fn children(&mut self, parent: Option<&Path>) -> anyhow::Result<Vec<Comment>> {
        let depth = parent.map_or(1, |p| p.depth() + 1);
        let rows = sqlx::query(&format!(
            "
                SELECT {COMMENT_COLUMNS} FROM comments
                WHERE depth = $1 AND path LIKE $2 || '%'
                ORDER BY path
            "
        ))
        .bind(depth as i32)
        .bind(like_prefix(parent))
        .fetch_all(&mut *self.conn)
        .await
        .with_context(|| format!("listing children of {parent:?}"))?;
        comments_from_rows(rows)
    }

    async fn subtree(&mut self, root: &Path) -> anyhow::Result<Vec<Comment>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments WHERE path LIKE $1 || '%' ORDER BY path"
        ))
        .bind(root.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .with_context(|| format!("fetching subtree at {root}"))?;
        comments_from_rows(rows)
    }

    async fn forest(&mut self) -> anyhow::Result<Vec<Comment>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments ORDER BY path"
        ))
        .fetch_all(&mut *self.conn)
        .await
        .context("fetching all comments")?;
        comments_from_rows(rows)
    }

    async fn roots_for(
        &mut self,
        subject: Subject,
        order: RootOrder,
        window: Option<Window>,
    ) -> anyhow::Result<Vec<Comment>> {
        let order = match order {
            RootOrder::NewestFirst => "created_date DESC, path DESC",
            RootOrder::OldestFirst => "created_date ASC, path ASC",
        };
        let rows = sqlx::query(&format!(
            "
                SELECT {COMMENT_COLUMNS} FROM comments
                WHERE depth = 1 AND {} = $1
                ORDER BY {order}
                LIMIT $2 OFFSET $3
            ",
            subject_column(subject),
        ))
        .bind(subject.id())
        .bind(window.map(|w| i64::try_from(w.limit).unwrap_or(i64::MAX)))
        .bind(window.map_or(0, |w| i64::try_from(w.offset).unwrap_or(i64::MAX)))
        .fetch_all(&mut *self.conn)
        .await
        .with_context(|| format!("listing threads about {subject:?}"))?;
        comments_from_rows(rows)
    }

    async fn count_roots_for(&mut self, subject: Subject) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM comments WHERE depth = 1 AND {} = $1",
            subject_column(subject),
        ))
        .bind(subject.id())
        .fetch_one(&mut *self.conn)
        .await
        .with_context(|| format!("counting threads about {subject:?}"))?;
        u64::try_from(count).context("negative row count")
    }

    async fn insert(
        &mut self,
        comment: &Comment,
        parent: Option<CommentId>,
    ) -> anyhow::Result<Result<(), InsertConflict>> {
        deadlock_as(
            insert_tx(&mut *self.conn, comment, parent).await,
            Err(InsertConflict::PathTaken),
        )
    }

    async fn insert_shifting(
        &mut self,
        comment: &Comment,
        parent: Option<CommentId>,
        displaced: CommentId,
    ) -> anyhow::Result<Result<(), InsertConflict>> {
        deadlock_as(
            insert_shifting_tx(&mut *self.conn, comment, parent, displaced).await,
            Err(InsertConflict::PathTaken),
        )
    }

    async fn delete_subtree(
        &mut self,
        root: CommentId,
        path: &Path,
    ) -> anyhow::Result<Option<u64>> {
        deadlock_as(delete_subtree_tx(&mut *self.conn, root, path).await, None)
    }
}

pub async fn create_user(conn: &mut sqlx::PgConnection, user: NewUser) -> Result<(), Error> {
    let res = sqlx::query("INSERT INTO users (id, name, password_hash) VALUES ($1, $2, $3)")
        .bind(user.id.0)
        .bind(&user.name)
        .bind(&user.initial_password_hash)
        .execute(conn)
        .await;
    match res {
        Ok(_) => Ok(()),
        Err(e) => match violated_constraint(&e) {
            Some("users_pkey") => Err(Error::uuid_already_used(user.id.0)),
            Some("users_name_key") => Err(Error::name_already_used(user.name)),
            _ => Err(Error::Anyhow(
                anyhow::Error::from(e).context(format!("creating user {:?}", user.name)),
            )),
        },
    }
}

pub async fn user_exists(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<bool> {
    Ok(sqlx::query("SELECT 1 FROM users WHERE id = $1")
        .bind(user.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("checking whether user {user:?} exists"))?
        .is_some())
}

pub async fn fetch_user(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<User> {
    let name: String = sqlx::query_scalar("SELECT name FROM users WHERE id = $1")
        .bind(user.0)
        .fetch_one(conn)
        .await
        .with_context(|| format!("fetching user {user:?}"))?;
    Ok(User { id: user, name })
}

pub async fn login_user(
    conn: &mut sqlx::PgConnection,
    session: &NewSession,
) -> anyhow::Result<Option<AuthToken>> {
    let row = sqlx::query("SELECT id, password_hash FROM users WHERE name = $1")
        .bind(&session.user)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("fetching password hash for {:?}", session.user))?;
    let row = match row {
        None => return Ok(None),
        Some(row) => row,
    };
    let user: Uuid = row.try_get("id").context("retrieving the id field")?;
    let hash: String = row
        .try_get("password_hash")
        .context("retrieving the password_hash field")?;

    // tests don't actually use bcrypt
    #[cfg(test)]
    let verified = session.password == hash;
    #[cfg(not(test))]
    let verified = bcrypt::verify(&session.password, &hash)
        .with_context(|| format!("verifying password for {:?}", session.user))?;
    if !verified {
        return Ok(None);
    }

    let token = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO sessions (id, user_id, name, login_time, last_active) VALUES ($1, $2, $3, $4, $4)",
    )
    .bind(token)
    .bind(user)
    .bind(&session.device)
    .bind(now)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("inserting session for {:?}", session.user))?;
    Ok(Some(AuthToken(token)))
}

pub async fn logout_user(conn: &mut sqlx::PgConnection, token: &AuthToken) -> anyhow::Result<bool> {
    let removed = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(token.0)
        .execute(conn)
        .await
        .with_context(|| format!("logging out session {:?}", token))?
        .rows_affected();
    Ok(removed == 1)
}

pub async fn recover_session(
    conn: &mut sqlx::PgConnection,
    token: AuthToken,
) -> Result<UserId, Error> {
    let user: Option<Uuid> = sqlx::query_scalar(
        "UPDATE sessions SET last_active = $1 WHERE id = $2 RETURNING user_id",
    )
    .bind(Utc::now())
    .bind(token.0)
    .fetch_optional(conn)
    .await
    .with_context(|| format!("recovering session {:?}", token))?;
    user.map(UserId).ok_or_else(Error::unauthenticated)
}

/// Whether a film or a tv already uses `id`
pub async fn subject_id_taken(conn: &mut sqlx::PgConnection, id: Uuid) -> anyhow::Result<bool> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM films WHERE id = $1) OR EXISTS (SELECT 1 FROM tvs WHERE id = $1)",
    )
    .bind(id)
    .fetch_one(conn)
    .await
    .with_context(|| format!("checking whether subject id {id} is taken"))
}

pub async fn register_subject(
    conn: &mut sqlx::PgConnection,
    s: &NewSubject,
) -> Result<(), Error> {
    if subject_id_taken(&mut *conn, s.subject.id()).await? {
        return Err(Error::uuid_already_used(s.subject.id()));
    }
    let query = match s.subject {
        Subject::Film(_) => "INSERT INTO films (id, title) VALUES ($1, $2)",
        Subject::Tv(_) => "INSERT INTO tvs (id, name) VALUES ($1, $2)",
    };
    let res = sqlx::query(query)
        .bind(s.subject.id())
        .bind(&s.title)
        .execute(conn)
        .await;
    match res {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(Error::uuid_already_used(s.subject.id())),
        Err(e) => Err(Error::Anyhow(
            anyhow::Error::from(e).context(format!("registering {:?}", s.subject)),
        )),
    }
}

pub async fn subject_exists(conn: &mut sqlx::PgConnection, subject: Subject) -> anyhow::Result<bool> {
    let query = match subject {
        Subject::Film(_) => "SELECT 1 FROM films WHERE id = $1",
        Subject::Tv(_) => "SELECT 1 FROM tvs WHERE id = $1",
    };
    Ok(sqlx::query(query)
        .bind(subject.id())
        .fetch_optional(conn)
        .await
        .with_context(|| format!("checking whether {subject:?} exists"))?
        .is_some())
}
