use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use cinetree_api::{AuthToken, Uuid};
use structopt::StructOpt;
use tower_http::trace::TraceLayer;

mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;

use error::Error;
use extractors::*;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, StructOpt)]
#[structopt(name = "cinetree-server")]
struct Opt {
    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Bearer token granting access to the /api/admin routes, which are
    /// disabled when it is not set
    #[structopt(long, env = "ADMIN_TOKEN")]
    admin_token: Option<Uuid>,

    /// Number of threads per page of the comment listing
    #[structopt(long, env = "PAGE_SIZE", default_value = "20")]
    page_size: u64,
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

pub async fn app(db: sqlx::PgPool, admin_token: Option<AuthToken>, page_size: u64) -> Router {
    let state = AppState {
        db: PgPool::new(db),
        admin_token,
        page_size: PageSize(page_size),
    };
    Router::new()
        .route("/api/admin/create-user", post(handlers::admin_create_user))
        .route("/api/admin/subjects", post(handlers::admin_register_subject))
        .route("/api/admin/comments", post(handlers::admin_add_comment))
        .route("/api/admin/dump", get(handlers::admin_dump))
        .route("/api/auth", post(handlers::auth))
        .route("/api/unauth", post(handlers::unauth))
        .route("/api/whoami", get(handlers::whoami))
        .route(
            "/api/comments",
            get(handlers::list_comments).post(handlers::add_comment),
        )
        .route("/api/comments/:id", delete(handlers::delete_comment))
        .route("/api/comments/:id/subtree", get(handlers::comment_subtree))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    if opt.admin_token.is_none() {
        tracing::warn!("no admin token set, the admin interface is disabled");
    }

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&db)
        .await
        .context("applying pending migrations")?;

    let app = app(db, opt.admin_token.map(AuthToken), opt.page_size).await;

    tracing::info!(addr = %opt.listen, page_size = opt.page_size, "listening");
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
