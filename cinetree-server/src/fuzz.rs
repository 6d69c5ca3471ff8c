#![cfg(test)]

use async_recursion::async_recursion;
use bolero::generator::TypeGenerator;
use axum::{
    extract::FromRequestParts,
    http::{self, request},
};
use cinetree_api::{
    AdminNewComment, AdminPlacement, AdminPosition, Comment, CommentId, CommentTree, CommentView,
    DumpNode, Error as ApiError, FilmId, NewComment, NewSession, NewSubject, NewUser, Paginated,
    Position, Subject, SubjectRef, TvId, User, UserId,
};
use cinetree_mock_server::MockServer;
use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe};
use tower::{Service, ServiceExt};

use crate::{db::PostgresStore, extractors::*, *};

const PAGE_SIZE: u64 = 3;

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &std::path::Path) -> Option<postgresfixture::cluster::Cluster> {
    let runtime = postgresfixture::runtime::Runtime::find_on_path()
        .into_iter()
        .filter_map(|r| r.version().ok().map(|v| (v, r)))
        .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(cmp::Ordering::Equal))
        .map(|(_, r)| r)?;
    Some(postgresfixture::cluster::Cluster::new(data, runtime))
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                let _ = tracing_subscriber::fmt::try_init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &std::path::Path = datadir.as_ref();
            let cluster = match build_pg_cluster(datadir_path) {
                Some(cluster) => cluster,
                None => {
                    eprintln!("postgresql is not installed in path, skipping {}", stringify!($name));
                    return;
                }
            };
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                // create test db
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!("postgresql://?host={}&dbname=test_db", datadir_path)).await.expect("creating sqlx pool");
                    MIGRATOR
                        .run(&pool)
                        .await
                        .expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        // run the test
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            // cleanup
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        // resume the panics
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::Unauthenticated)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

// Sorted sibling insertion is left out: it depends on the comment ids, which
// are random and thus differ between the app and the mock.
#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    CreateUser {
        name: u8,
    },
    CreateRawUser {
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        name: String,
    },
    Auth {
        uid: usize,
        #[generator(bolero::generator::gen_with::<String>().len(1..20usize))]
        device: String,
    },
    Unauth {
        sid: usize,
    },
    Whoami {
        sid: usize,
    },
    RegisterSubject {
        tv: bool,
        reuse: Option<usize>,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        title: String,
    },
    AddComment {
        sid: usize,
        subject: usize,
        reply_to: Option<usize>,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        text: String,
    },
    AdminAddComment {
        uid: usize,
        subject: usize,
        reference: Option<usize>,
        position: u8,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        text: String,
    },
    ListComments {
        subject: usize,
        page: Option<u8>,
    },
    Subtree {
        cid: usize,
    },
    Delete {
        sid: usize,
        cid: usize,
    },
    Dump {
        cid: Option<usize>,
    },
}

async fn call<Req, Resp>(
    app: &mut Router,
    req: request::Request<axum::body::Body>,
    req_body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status.is_success() {
        if std::any::TypeId::of::<Resp>() == std::any::TypeId::of::<()>() {
            // the server returns an empty body in this situation, which does not parse with serde_json
            return Ok(serde_json::from_slice(b"null").unwrap());
        }
        return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
            panic!("failed parsing resp body {body:?} for request {req_body:?}: {err}")
        }));
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<Uuid>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {token}")),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    call(app, req, body).await
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

/// A comment stripped of what the app and the mock generate independently
#[derive(Debug, PartialEq)]
struct Shape {
    author: UserId,
    film: Option<FilmId>,
    tv: Option<TvId>,
    text: String,
    children: Vec<Shape>,
}

fn shape(n: DumpNode) -> Shape {
    Shape {
        author: n.data.author,
        film: n.data.film,
        tv: n.data.tv,
        text: n.data.text,
        children: n.children.into_iter().map(shape).collect(),
    }
}

fn shapes(nodes: Vec<DumpNode>) -> Vec<Shape> {
    nodes.into_iter().map(shape).collect()
}

fn placed(c: Comment) -> (String, UserId, Subject, String) {
    (c.path.to_string(), c.author, c.subject, c.text)
}

fn viewed(c: CommentView) -> (String, Option<FilmId>, Option<TvId>, String) {
    (c.path.to_string(), c.film, c.tv, c.text)
}

fn paged(p: Paginated<Vec<DumpNode>>) -> (u64, Option<u64>, Option<u64>, Vec<Vec<Shape>>) {
    (
        p.count,
        p.next,
        p.previous,
        p.results.into_iter().map(shapes).collect(),
    )
}

fn new_comment(subject: Subject, text: String, path: String) -> NewComment {
    let r = SubjectRef { id: subject.id() };
    NewComment {
        film: subject.film().map(|_| r),
        tv: subject.tv().map(|_| r),
        text,
        path,
    }
}

struct Session {
    app: AuthToken,
    mock: AuthToken,
}

struct ComparativeFuzzer {
    admin_token: Uuid,
    app: Router,
    pool: sqlx::PgPool,
    mock: MockServer,
    sessions: Vec<Session>,
}

impl ComparativeFuzzer {
    async fn new(pool: sqlx::PgPool) -> ComparativeFuzzer {
        let admin_token = Uuid::new_v4();
        let app = app(pool.clone(), Some(AuthToken(admin_token)), PAGE_SIZE).await;
        ComparativeFuzzer {
            admin_token,
            app,
            pool,
            mock: MockServer::with_page_size(PAGE_SIZE),
            sessions: Vec::new(),
        }
    }

    fn session(&self, sid: usize) -> Option<&Session> {
        resize_int(sid, ..self.sessions.len()).map(|i| &self.sessions[i])
    }

    fn subject(&self, id: usize) -> Option<Subject> {
        let subjects = self.mock.test_subjects();
        resize_int(id, ..subjects.len()).map(|i| subjects[i])
    }

    /// The mock's comment number `cid` in pre-order, and the id the app gave
    /// the comment at the same path
    async fn comment(&self, cid: usize) -> Option<(Comment, CommentId)> {
        let comments = self.mock.test_comments();
        let mock = comments.get(resize_int(cid, ..comments.len())?)?.clone();
        let app: Uuid = sqlx::query_scalar("SELECT id FROM comments WHERE path = $1")
            .bind(mock.path.to_string())
            .fetch_one(&self.pool)
            .await
            .unwrap_or_else(|e| panic!("app has no comment at {}: {e}", mock.path));
        Some((mock, CommentId(app)))
    }

    async fn check_same_forest(&self) {
        let app: Vec<String> = sqlx::query_scalar("SELECT path FROM comments ORDER BY path")
            .fetch_all(&self.pool)
            .await
            .expect("listing app comment paths");
        let mock = self
            .mock
            .store()
            .paths()
            .into_iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        assert_eq!(app, mock, "app and mock comment forests diverged");
    }

    async fn create_user(&mut self, name: String) {
        // no hashing for tests
        let new_user = NewUser {
            id: UserId(Uuid::new_v4()),
            name,
            initial_password_hash: String::from("password"),
        };
        let pass = new_user.initial_password_hash.clone();
        compare(
            "CreateUser",
            run_on_app(
                &mut self.app,
                "POST",
                "/api/admin/create-user",
                Some(self.admin_token),
                &new_user,
            )
            .await,
            self.mock.admin_create_user(new_user, pass),
        )
    }

    #[async_recursion(?Send)]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::CreateUser { name } => self.create_user(format!("user{name}")).await,
            FuzzOp::CreateRawUser { name } => self.create_user(name).await,
            FuzzOp::Auth { uid, device } => {
                if let Some(uid) = resize_int(uid, ..self.mock.test_num_users()) {
                    let (_, user, password) = self.mock.test_get_user_info(uid);
                    let session = NewSession {
                        user: String::from(user),
                        password: String::from(password),
                        device,
                    };
                    let app_tok =
                        run_on_app(&mut self.app, "POST", "/api/auth", None, &session).await;
                    let mock_tok = self.mock.auth(session);
                    if let (&Ok(app), &Ok(mock)) = (&app_tok, &mock_tok) {
                        self.sessions.push(Session { app, mock });
                    }
                    compare("Auth", app_tok.map(|_| ()), mock_tok.map(|_| ()));
                } else {
                    self.execute_fuzz_op(FuzzOp::CreateUser { name: 0 }).await;
                    self.execute_fuzz_op(FuzzOp::Auth { uid, device }).await;
                }
            }
            FuzzOp::Unauth { sid } => {
                if let Some(s) = self.session(sid) {
                    let (app, mock) = (s.app, s.mock);
                    compare(
                        "Unauth",
                        run_on_app(&mut self.app, "POST", "/api/unauth", Some(app.0), &()).await,
                        self.mock.unauth(mock),
                    );
                }
            }
            FuzzOp::Whoami { sid } => {
                if let Some(s) = self.session(sid) {
                    let (app, mock) = (s.app, s.mock);
                    compare(
                        "Whoami",
                        run_on_app::<_, User>(&mut self.app, "GET", "/api/whoami", Some(app.0), &())
                            .await,
                        self.mock.whoami(mock),
                    );
                }
            }
            FuzzOp::RegisterSubject { tv, reuse, title } => {
                let id = reuse
                    .and_then(|i| self.subject(i))
                    .map_or_else(Uuid::new_v4, |s| s.id());
                let subject = match tv {
                    false => Subject::Film(FilmId(id)),
                    true => Subject::Tv(TvId(id)),
                };
                let new_subject = NewSubject { subject, title };
                compare(
                    "RegisterSubject",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        "/api/admin/subjects",
                        Some(self.admin_token),
                        &new_subject,
                    )
                    .await,
                    self.mock.admin_register_subject(new_subject),
                );
            }
            FuzzOp::AddComment {
                sid,
                subject,
                reply_to,
                text,
            } => {
                let (app_tok, mock_tok) = match self.session(sid) {
                    Some(s) => (s.app, s.mock),
                    None => return,
                };
                let subject = match self.subject(subject) {
                    Some(s) => s,
                    None => return,
                };
                let path = match reply_to {
                    None => String::new(),
                    Some(cid) => match self.comment(cid).await {
                        Some((c, _)) => c.path.to_string(),
                        None => return,
                    },
                };
                let data = new_comment(subject, text, path);
                compare(
                    "AddComment",
                    run_on_app(&mut self.app, "POST", "/api/comments", Some(app_tok.0), &data)
                        .await
                        .map(viewed),
                    self.mock.add_comment(mock_tok, data).await.map(viewed),
                );
            }
            FuzzOp::AdminAddComment {
                uid,
                subject,
                reference,
                position,
                text,
            } => {
                let author = match resize_int(uid, ..self.mock.test_num_users()) {
                    Some(i) => self.mock.test_get_user_info(i).0,
                    None => return,
                };
                let subject = match self.subject(subject) {
                    Some(s) => s,
                    None => return,
                };
                let (app_ref, mock_ref) = match reference {
                    None => (None, None),
                    Some(cid) => match self.comment(cid).await {
                        Some((mock, app)) => (Some(app), Some(mock.id)),
                        // a reference that does not exist on either side
                        None => {
                            let stale = CommentId(Uuid::new_v4());
                            (Some(stale), Some(stale))
                        }
                    },
                };
                let position = match position % 5 {
                    0 => AdminPosition::SortedChild,
                    1 => AdminPosition::Sibling(Position::FirstSibling),
                    2 => AdminPosition::Sibling(Position::Left),
                    3 => AdminPosition::Sibling(Position::Right),
                    _ => AdminPosition::Sibling(Position::LastSibling),
                };
                let data = |reference| AdminNewComment {
                    author,
                    subject,
                    text: text.clone(),
                    placement: AdminPlacement {
                        reference,
                        position,
                    },
                };
                compare(
                    "AdminAddComment",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        "/api/admin/comments",
                        Some(self.admin_token),
                        &data(app_ref),
                    )
                    .await
                    .map(placed),
                    self.mock
                        .admin_add_comment(data(mock_ref))
                        .await
                        .map(placed),
                );
            }
            FuzzOp::ListComments { subject, page } => {
                let subject = match self.subject(subject) {
                    Some(s) => s,
                    None => return,
                };
                let mut uri = format!(
                    "/api/comments?subject_id={}&subject_type={}",
                    subject.id(),
                    subject.kind()
                );
                if let Some(page) = page {
                    uri += &format!("&page={page}");
                }
                let query = cinetree_api::ListComments {
                    subject_id: subject.id(),
                    subject_type: subject.kind().to_string(),
                    page: page.map(u64::from),
                };
                compare(
                    "ListComments",
                    run_on_app(&mut self.app, "GET", &uri, None, &())
                        .await
                        .map(paged),
                    self.mock.list_comments(query).await.map(paged),
                );
            }
            FuzzOp::Subtree { cid } => {
                if let Some((mock, app)) = self.comment(cid).await {
                    compare(
                        "Subtree",
                        run_on_app(
                            &mut self.app,
                            "GET",
                            &format!("/api/comments/{}/subtree", app.0),
                            None,
                            &(),
                        )
                        .await
                        .map(shapes),
                        self.mock.comment_subtree(mock.id).await.map(shapes),
                    );
                }
            }
            FuzzOp::Delete { sid, cid } => {
                let (app_tok, mock_tok) = match self.session(sid) {
                    Some(s) => (s.app, s.mock),
                    None => return,
                };
                if let Some((mock, app)) = self.comment(cid).await {
                    compare(
                        "Delete",
                        run_on_app(
                            &mut self.app,
                            "DELETE",
                            &format!("/api/comments/{}", app.0),
                            Some(app_tok.0),
                            &(),
                        )
                        .await,
                        self.mock
                            .delete_comment(mock_tok, mock.id)
                            .await
                            .map(|_| ()),
                    );
                }
            }
            FuzzOp::Dump { cid } => {
                let (uri, mock_root) = match cid {
                    None => (String::from("/api/admin/dump"), None),
                    Some(cid) => match self.comment(cid).await {
                        Some((mock, app)) => {
                            (format!("/api/admin/dump?root={}", app.0), Some(mock.id))
                        }
                        None => return,
                    },
                };
                compare(
                    "Dump",
                    run_on_app(&mut self.app, "GET", &uri, Some(self.admin_token), &())
                        .await
                        .map(shapes),
                    self.mock.admin_dump(mock_root).await.map(shapes),
                );
            }
        }
        self.check_same_forest().await;
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool: sqlx::PgPool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);

async fn seed(pool: &sqlx::PgPool) -> (UserId, Subject) {
    let mut conn = pool.acquire().await.expect("getting seed connection");
    let user = UserId(Uuid::new_v4());
    db::create_user(
        &mut *conn,
        NewUser {
            id: user,
            name: String::from("seed"),
            initial_password_hash: String::from("password"),
        },
    )
    .await
    .expect("creating seed user");
    let film = Subject::Film(FilmId(Uuid::new_v4()));
    db::register_subject(
        &mut *conn,
        &NewSubject {
            subject: film,
            title: String::from("Nosferatu"),
        },
    )
    .await
    .expect("registering seed film");
    (user, film)
}

async fn paths(pool: &sqlx::PgPool) -> Vec<String> {
    sqlx::query_scalar("SELECT path FROM comments ORDER BY path")
        .fetch_all(pool)
        .await
        .expect("listing comment paths")
}

do_sqlx_test!(
    concurrent_replies_on_postgres,
    bolero::generator::gen::<u8>(),
    |pool: sqlx::PgPool, writers: u8| async move {
        let writers = 2 + writers % 7;
        let (user, film) = seed(&pool).await;
        let root = {
            let mut conn = pool.acquire().await.expect("getting connection");
            CommentTree::new(PostgresStore { conn: &mut *conn })
                .add_root(user, film, String::from("root"))
                .await
                .expect("adding root")
        };
        let replies = (0..writers).map(|i| {
            let pool = pool.clone();
            let parent = root.path.clone();
            async move {
                let mut conn = pool.acquire().await.expect("getting connection");
                CommentTree::new(PostgresStore { conn: &mut *conn })
                    .add_child(&parent, user, film, format!("reply {i}"))
                    .await
                    .map_err(|e| e.into_api())
            }
        });
        let results = futures::future::join_all(replies).await;
        let mut expected = vec![String::from("0000")];
        let mut successes = 0;
        for r in results {
            match r {
                Ok(_) => successes += 1,
                Err(e) => assert!(e.is_retryable(), "unexpected error {e:?}"),
            }
        }
        expected.extend((0..successes).map(|i| format!("0000000{i}")));
        assert_eq!(paths(&pool).await, expected);
    }
);

do_sqlx_test!(
    delete_racing_replies_on_postgres,
    bolero::generator::gen::<u8>(),
    |pool: sqlx::PgPool, writers: u8| async move {
        let writers = 1 + writers % 6;
        let (user, film) = seed(&pool).await;
        let root = {
            let mut conn = pool.acquire().await.expect("getting connection");
            CommentTree::new(PostgresStore { conn: &mut *conn })
                .add_root(user, film, String::from("root"))
                .await
                .expect("adding root")
        };
        let replies = (0..writers).map(|i| {
            let pool = pool.clone();
            let parent = root.path.clone();
            async move {
                let mut conn = pool.acquire().await.expect("getting connection");
                let _ = CommentTree::new(PostgresStore { conn: &mut *conn })
                    .add_child(&parent, user, film, format!("reply {i}"))
                    .await;
            }
        });
        let deletion = async {
            let mut conn = pool.acquire().await.expect("getting connection");
            CommentTree::new(PostgresStore { conn: &mut *conn })
                .delete(root.id)
                .await
                .expect("deleting root");
        };
        futures::join!(futures::future::join_all(replies), deletion);
        let left = paths(&pool).await;
        // replies committed after the deletion have no parent to hang from
        assert!(left.is_empty(), "dangling comments {left:?}");
    }
);

async fn place(
    pool: &sqlx::PgPool,
    (user, film): (UserId, Subject),
    reference: CommentId,
    position: AdminPosition,
    text: String,
) -> Result<Comment, ApiError> {
    let mut conn = pool.acquire().await.expect("getting connection");
    CommentTree::new(PostgresStore { conn: &mut *conn })
        .add_admin(
            AdminPlacement {
                reference: Some(reference),
                position,
            },
            user,
            film,
            text,
        )
        .await
        .map_err(|e| e.into_api())
}

do_sqlx_test!(
    sibling_shifts_racing_replies_on_postgres,
    bolero::generator::gen::<u8>(),
    |pool: sqlx::PgPool, writers: u8| async move {
        let writers = 1 + writers % 4;
        let seeded = seed(&pool).await;
        let root = {
            let mut conn = pool.acquire().await.expect("getting connection");
            CommentTree::new(PostgresStore { conn: &mut *conn })
                .add_root(seeded.0, seeded.1, String::from("root"))
                .await
                .expect("adding root")
        };
        let shifts = (0..writers).map(|i| {
            let left = AdminPosition::Sibling(Position::Left);
            place(&pool, seeded, root.id, left, format!("placed {i}"))
        });
        let replies = (0..writers).map(|i| {
            let child = AdminPosition::SortedChild;
            place(&pool, seeded, root.id, child, format!("reply {i}"))
        });
        let (shifts, replies) = futures::join!(
            futures::future::join_all(shifts),
            futures::future::join_all(replies),
        );

        let mut conn = pool.acquire().await.expect("getting connection");
        let mut tree = CommentTree::new(PostgresStore { conn: &mut *conn });
        let root = tree.get(root.id).await.expect("fetching root");
        for res in shifts.into_iter().chain(replies) {
            match res {
                Ok(c) if c.text.starts_with("reply") => {
                    let c = tree.get(c.id).await.expect("fetching reply");
                    assert!(
                        root.path.is_parent_of(&c.path),
                        "{} ended up at {} with its parent at {}",
                        c.text,
                        c.path,
                        root.path
                    );
                }
                Ok(c) => assert_eq!(c.depth(), 1),
                Err(e) => assert!(e.is_retryable(), "unexpected error {e:?}"),
            }
        }
        for p in paths(&pool).await.iter().filter(|p| p.len() > 4) {
            assert!(p.starts_with(&root.path.to_string()), "reply astray at {p}");
        }
    }
);

do_sqlx_test!(
    sibling_shifts_racing_delete_on_postgres,
    bolero::generator::gen::<u8>(),
    |pool: sqlx::PgPool, writers: u8| async move {
        let writers = 1 + writers % 4;
        let seeded = seed(&pool).await;
        let root = {
            let mut conn = pool.acquire().await.expect("getting connection");
            let mut tree = CommentTree::new(PostgresStore { conn: &mut *conn });
            let root = tree
                .add_root(seeded.0, seeded.1, String::from("root"))
                .await
                .expect("adding root");
            tree.add_child(&root.path, seeded.0, seeded.1, String::from("reply"))
                .await
                .expect("adding reply");
            root
        };
        let shifts = (0..writers).map(|i| {
            let left = AdminPosition::Sibling(Position::Left);
            place(&pool, seeded, root.id, left, format!("placed {i}"))
        });
        let deletion = async {
            let mut conn = pool.acquire().await.expect("getting connection");
            CommentTree::new(PostgresStore { conn: &mut *conn })
                .delete(root.id)
                .await
                .map_err(|e| e.into_api())
        };
        let (shifts, deleted) =
            futures::join!(futures::future::join_all(shifts), deletion);

        let mut placed = 0;
        for res in shifts {
            match res {
                Ok(_) => placed += 1,
                // the reference was deleted between its lookup and the write
                Err(ApiError::CommentNotFound(id)) => assert_eq!(id, root.id.0),
                Err(e) => assert!(e.is_retryable(), "unexpected error {e:?}"),
            }
        }
        match &deleted {
            Ok(removed) => assert_eq!(*removed, 2),
            Err(e) => assert!(e.is_retryable(), "unexpected error {e:?}"),
        }
        let left = paths(&pool).await;
        if deleted.is_ok() {
            assert_eq!(left.len(), placed, "leftovers in {left:?}");
            assert!(left.iter().all(|p| p.len() == 4), "leftovers in {left:?}");
        }
    }
);
