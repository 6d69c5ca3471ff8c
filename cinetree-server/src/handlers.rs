use anyhow::Context;
use axum::{
    extract::{self, Query, State},
    http::StatusCode,
    Json,
};
use cinetree_api::{
    AdminNewComment, AuthToken, Comment, CommentId, CommentTree, CommentView, DumpNode,
    ListComments, NewComment, NewSession, NewSubject, NewUser, Page, Paginated, RootOrder, User,
    Uuid,
};

use crate::{
    db::{self, PostgresStore},
    extractors::*,
    Error,
};

fn tree(conn: &mut sqlx::PgConnection) -> CommentTree<PostgresStore<'_>> {
    CommentTree::new(PostgresStore { conn })
}

async fn check_subject(
    conn: &mut sqlx::PgConnection,
    subject: cinetree_api::Subject,
) -> Result<(), Error> {
    match db::subject_exists(conn, subject).await? {
        true => Ok(()),
        false => Err(Error::Api(cinetree_api::Error::SubjectNotFound(subject.id()))),
    }
}

pub async fn admin_create_user(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Json(data): Json<NewUser>,
) -> Result<(), Error> {
    data.validate()?;
    let name = data.name.clone();
    db::create_user(&mut *conn, data).await?;
    tracing::info!(%name, "created user");
    Ok(())
}

pub async fn admin_register_subject(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Json(data): Json<NewSubject>,
) -> Result<(), Error> {
    data.validate()?;
    db::register_subject(&mut *conn, &data).await
}

pub async fn admin_add_comment(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Json(data): Json<AdminNewComment>,
) -> Result<Json<Comment>, Error> {
    data.validate()?;
    if !db::user_exists(&mut *conn, data.author).await? {
        return Err(Error::Api(cinetree_api::Error::UserNotFound(data.author.0)));
    }
    check_subject(&mut *conn, data.subject).await?;
    Ok(Json(
        tree(&mut *conn)
            .add_admin(data.placement, data.author, data.subject, data.text)
            .await?,
    ))
}

#[derive(Debug, serde::Deserialize)]
pub struct DumpQuery {
    root: Option<Uuid>,
}

pub async fn admin_dump(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Query(q): Query<DumpQuery>,
) -> Result<Json<Vec<DumpNode>>, Error> {
    Ok(Json(
        tree(&mut *conn).dump_bulk(q.root.map(CommentId)).await?,
    ))
}

pub async fn auth(
    mut conn: PgConn,
    Json(data): Json<NewSession>,
) -> Result<Json<AuthToken>, Error> {
    data.validate()?;
    Ok(Json(
        db::login_user(&mut *conn, &data)
            .await
            .context("logging user in")?
            .ok_or_else(Error::permission_denied)?,
    ))
}

pub async fn unauth(user: PreAuth, mut conn: PgConn) -> Result<(), Error> {
    match db::logout_user(&mut *conn, &user.0).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::unauthenticated()),
        Err(e) => Err(Error::Anyhow(e)),
    }
}

pub async fn whoami(Auth(user): Auth, mut conn: PgConn) -> Result<Json<User>, Error> {
    Ok(Json(db::fetch_user(&mut *conn, user).await?))
}

pub async fn list_comments(
    State(PageSize(page_size)): State<PageSize>,
    mut conn: PgConn,
    Query(q): Query<ListComments>,
) -> Result<Json<Paginated<Vec<DumpNode>>>, Error> {
    let subject = q.subject()?;
    let page = Page::new(q.page, page_size)?;
    check_subject(&mut *conn, subject).await?;
    Ok(Json(
        tree(&mut *conn)
            .page_of_threads(subject, RootOrder::NewestFirst, page)
            .await?,
    ))
}

pub async fn add_comment(
    Auth(user): Auth,
    mut conn: PgConn,
    Json(data): Json<NewComment>,
) -> Result<(StatusCode, Json<CommentView>), Error> {
    let (subject, parent) = data.validate()?;
    check_subject(&mut *conn, subject).await?;
    let mut tree = tree(&mut *conn);
    let comment = match parent {
        None => tree.add_root(user, subject, data.text).await?,
        Some(parent) => tree.add_child(&parent, user, subject, data.text).await?,
    };
    tracing::debug!(path = %comment.path, ?user, "added comment");
    Ok((StatusCode::CREATED, Json(comment.view())))
}

pub async fn comment_subtree(
    mut conn: PgConn,
    extract::Path(id): extract::Path<Uuid>,
) -> Result<Json<Vec<DumpNode>>, Error> {
    Ok(Json(tree(&mut *conn).dump_bulk(Some(CommentId(id))).await?))
}

pub async fn delete_comment(
    Auth(user): Auth,
    mut conn: PgConn,
    extract::Path(id): extract::Path<Uuid>,
) -> Result<StatusCode, Error> {
    let mut tree = tree(&mut *conn);
    let comment = tree.get(CommentId(id)).await?;
    if comment.author != user {
        return Err(Error::permission_denied());
    }
    tree.delete(CommentId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
