use std::{collections::BTreeSet, panic::AssertUnwindSafe};

use bolero::generator::TypeGenerator;

use chrono::Utc;
use cinetree_api::{
    AdminNewComment, AdminPlacement, AdminPosition, AuthToken, Comment, CommentId, CommentTree,
    Error, FilmId, ListComments, NewComment, NewSession, NewSubject, NewUser, Path, Position,
    Segment, Subject, SubjectRef, TreeError, TvId, UserId, Uuid,
};

use crate::{MockServer, MockStore};

fn path(s: &str) -> Path {
    s.parse().unwrap()
}

fn film() -> Subject {
    Subject::Film(FilmId(Uuid::from_u128(1)))
}

fn tv() -> Subject {
    Subject::Tv(TvId(Uuid::from_u128(2)))
}

fn author() -> UserId {
    UserId(Uuid::from_u128(3))
}

fn tree() -> CommentTree<MockStore> {
    CommentTree::new(MockStore::new())
}

fn api(e: TreeError) -> Error {
    e.into_api()
}

async fn root(t: &mut CommentTree<MockStore>, text: &str) -> Comment {
    t.add_root(author(), film(), String::from(text))
        .await
        .unwrap()
}

async fn child(t: &mut CommentTree<MockStore>, parent: &Comment, text: &str) -> Comment {
    t.add_child(&parent.path, author(), film(), String::from(text))
        .await
        .unwrap()
}

async fn sibling(
    t: &mut CommentTree<MockStore>,
    reference: &Comment,
    text: &str,
    position: Position,
) -> Comment {
    t.add_sibling(&reference.path, author(), film(), String::from(text), position)
        .await
        .unwrap()
}

/// Texts of the children of `parent`, in sibling order
async fn child_texts(t: &mut CommentTree<MockStore>, parent: &Comment) -> Vec<String> {
    t.children_of(parent.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.text)
        .collect()
}

fn assert_well_formed(store: &MockStore) {
    let paths = store.paths();
    let all = paths.iter().collect::<BTreeSet<_>>();
    for p in &paths {
        if let Some(parent) = p.parent() {
            assert!(all.contains(&parent), "{p} has no parent in {paths:?}");
        }
    }
    let mut sorted = paths.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(paths, sorted);
}

#[tokio::test]
async fn first_paths_and_delete() {
    let mut t = tree();
    let r = root(&mut t, "Root.").await;
    assert_eq!(r.path, path("0000"));
    let a = child(&mut t, &r, "First reply.").await;
    let b = child(&mut t, &r, "Second reply.").await;
    assert_eq!(a.path, path("00000000"));
    assert_eq!(b.path, path("00000001"));
    assert_eq!(t.get_by_path(&b.path).await.unwrap().id, b.id);

    assert_eq!(t.delete(r.id).await.unwrap(), 3);
    assert!(t.roots_for(film(), Default::default()).await.unwrap().is_empty());
    assert!(t.store().is_empty());
    for id in [r.id, a.id] {
        assert_eq!(
            t.subtree_of(id).await.map_err(api),
            Err(Error::CommentNotFound(id.0))
        );
    }
    assert_eq!(
        t.delete(r.id).await.map_err(api),
        Err(Error::CommentNotFound(r.id.0))
    );
}

#[tokio::test]
async fn roots_are_listed_newest_first() {
    let mut t = tree();
    let first = root(&mut t, "a").await;
    let second = root(&mut t, "b").await;
    t.add_root(author(), tv(), String::from("elsewhere"))
        .await
        .unwrap();
    assert_eq!(second.path, path("0001"));
    let listed = t.roots_for(film(), Default::default()).await.unwrap();
    assert_eq!(
        listed.into_iter().map(|c| c.id).collect::<Vec<_>>(),
        vec![second.id, first.id]
    );
}

#[tokio::test]
async fn subtrees_come_in_preorder() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    let mut expected = vec![r.id];
    for i in 0..2 {
        let c = child(&mut t, &r, &format!("c{i}")).await;
        expected.push(c.id);
        for j in 0..3 {
            let g = child(&mut t, &c, &format!("g{i}{j}")).await;
            expected.push(g.id);
        }
    }
    let other = root(&mut t, "other").await;
    child(&mut t, &other, "unrelated").await;

    let subtree = t.subtree_of(r.id).await.unwrap();
    assert_eq!(subtree.len(), 9);
    assert_eq!(
        subtree.iter().map(|c| c.id).collect::<Vec<_>>(),
        expected
    );

    let dump = t.dump_bulk(Some(r.id)).await.unwrap();
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0].children.len(), 2);
    assert!(dump[0].children.iter().all(|c| c.children.len() == 3));
    assert_eq!(dump[0].flatten(), expected);

    let whole = t.dump_bulk(None).await.unwrap();
    assert_eq!(whole.len(), 2);
    assert_eq!(whole[1].children.len(), 1);

    let children = t.children_of(r.id).await.unwrap();
    assert!(children.windows(2).all(|w| w[0].path < w[1].path));
    assert_well_formed(t.store());
}

#[tokio::test]
async fn delete_removes_exactly_the_subtree() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    let a = child(&mut t, &r, "a").await;
    let b = child(&mut t, &r, "b").await;
    child(&mut t, &a, "a0").await;
    child(&mut t, &a, "a1").await;
    let b0 = child(&mut t, &b, "b0").await;

    let before = t.store().paths();
    assert_eq!(t.delete(a.id).await.unwrap(), 3);
    let after = t.store().paths();
    let expected = before
        .into_iter()
        .filter(|p| !a.path.covers(p))
        .collect::<Vec<_>>();
    assert_eq!(after, expected);

    // gaps are left as-is
    assert_eq!(t.get(b0.id).await.unwrap().path, path("000000010000"));
    let c = child(&mut t, &r, "c").await;
    assert_eq!(c.path, path("00000002"));
}

#[tokio::test]
async fn concurrent_replies_get_distinct_paths() {
    let store = MockStore::new();
    let mut t = CommentTree::new(store.clone());
    let r = root(&mut t, "r").await;
    let mut t1 = CommentTree::new(store.clone());
    let mut t2 = CommentTree::new(store.clone());
    let (a, b) = futures::join!(
        t1.add_child(&r.path, author(), film(), String::from("a")),
        t2.add_child(&r.path, author(), film(), String::from("b")),
    );
    let mut paths = vec![a.unwrap().path, b.unwrap().path];
    paths.sort();
    assert_eq!(paths, vec![path("00000000"), path("00000001")]);
    assert_well_formed(&store);
}

#[tokio::test]
async fn lost_race_is_retried() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    t.store().inject_races(1);
    let c = child(&mut t, &r, "mine").await;
    assert_eq!(c.path, path("00000001"));
    assert_eq!(t.children_of(r.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn repeated_races_give_up() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    t.store().inject_races(cinetree_api::MAX_WRITE_ATTEMPTS);
    let res = t
        .add_child(&r.path, author(), film(), String::from("unlucky"))
        .await
        .map_err(api);
    assert_eq!(res, Err(Error::Conflict(String::from("00000004"))));
    assert!(res.unwrap_err().is_retryable());
    let texts = child_texts(&mut t, &r).await;
    assert_eq!(texts.len(), cinetree_api::MAX_WRITE_ATTEMPTS);
}

#[tokio::test]
async fn reply_to_deleted_parent() {
    let store = MockStore::new();
    let mut t = CommentTree::new(store.clone());
    let r = root(&mut t, "r").await;
    let mut replier = CommentTree::new(store.clone());
    let mut deleter = CommentTree::new(store.clone());
    let (deleted, reply) = futures::join!(
        deleter.delete(r.id),
        replier.add_child(&r.path, author(), film(), String::from("too late")),
    );
    assert_eq!(deleted.unwrap(), 1);
    assert_eq!(
        reply.map_err(api),
        Err(Error::PathNotFound(String::from("0000")))
    );
    assert!(store.is_empty());
}

#[tokio::test]
async fn reply_follows_parent_shifted_by_sibling() {
    let store = MockStore::new();
    let mut t = CommentTree::new(store.clone());
    let r = root(&mut t, "r").await;
    let mut admin = CommentTree::new(store.clone());
    let mut replier = CommentTree::new(store.clone());
    let (placed, reply) = futures::join!(
        admin.add_sibling(&r.path, author(), film(), String::from("placed"), Position::Left),
        replier.add_child(&r.path, author(), film(), String::from("reply to r")),
    );
    let (placed, reply) = (placed.unwrap(), reply.unwrap());
    let r = t.get(r.id).await.unwrap();
    assert_eq!((&placed.path, &r.path), (&path("0000"), &path("0001")));
    assert_eq!(reply.path, path("00010000"));
    assert_eq!(child_texts(&mut t, &r).await, vec!["reply to r"]);
    assert!(child_texts(&mut t, &placed).await.is_empty());
    assert_well_formed(&store);
}

#[tokio::test]
async fn delete_follows_comment_shifted_by_sibling() {
    let store = MockStore::new();
    let mut t = CommentTree::new(store.clone());
    let r = root(&mut t, "r").await;
    child(&mut t, &r, "r's reply").await;
    let mut admin = CommentTree::new(store.clone());
    let mut deleter = CommentTree::new(store.clone());
    let (placed, removed) = futures::join!(
        admin.add_sibling(&r.path, author(), film(), String::from("placed"), Position::Left),
        deleter.delete(r.id),
    );
    let placed = placed.unwrap();
    assert_eq!(removed.unwrap(), 2);
    let left = store.comments();
    assert_eq!(left.len(), 1);
    assert_eq!((left[0].id, &left[0].path), (placed.id, &path("0000")));
}

#[tokio::test]
async fn sibling_positions() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    let b = child(&mut t, &r, "b").await;
    let d = child(&mut t, &r, "d").await;
    let d0 = child(&mut t, &d, "d0").await;

    let c = sibling(&mut t, &d, "c", Position::Left).await;
    assert_eq!(c.path, path("00000001"));
    assert_eq!(t.get(d.id).await.unwrap().path, path("00000002"));
    assert_eq!(t.get(d0.id).await.unwrap().path, path("000000020000"));

    let a = sibling(&mut t, &c, "a", Position::FirstSibling).await;
    assert_eq!(a.path, path("00000000"));
    let e = sibling(&mut t, &a, "e", Position::LastSibling).await;
    assert_eq!(e.path, path("00000004"));
    let f = sibling(&mut t, &e, "f", Position::Right).await;
    assert_eq!(f.path, path("00000005"));

    // right of a comment whose next slot is taken
    let b = t.get(b.id).await.unwrap();
    sibling(&mut t, &b, "bb", Position::Right).await;
    assert_eq!(
        child_texts(&mut t, &r).await,
        vec!["a", "b", "bb", "c", "d", "e", "f"]
    );
    assert_eq!(t.get(d0.id).await.unwrap().path, path("000000040000"));
    assert_well_formed(t.store());
}

#[tokio::test]
async fn root_siblings() {
    let mut t = tree();
    let second = root(&mut t, "second").await;
    let first = sibling(&mut t, &second, "first", Position::Left).await;
    assert_eq!(first.path, path("0000"));
    assert_eq!(t.get(second.id).await.unwrap().path, path("0001"));
}

#[tokio::test]
async fn sorted_siblings_stay_sorted() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    let first = child(&mut t, &r, "0").await;
    for i in 1..8 {
        sibling(&mut t, &first, &i.to_string(), Position::SortedSibling).await;
    }
    let ids = t
        .children_of(r.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect::<Vec<_>>();
    assert_eq!(ids.len(), 8);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
}

#[tokio::test]
async fn exhausted_levels() {
    let mut t = tree();
    let last = Comment {
        id: CommentId(Uuid::new_v4()),
        path: Path::root(Segment::LAST),
        author: author(),
        subject: film(),
        text: String::from("last"),
        created_date: Utc::now(),
    };
    t.store().force_insert(last.clone());
    assert_eq!(
        t.add_root(author(), film(), String::from("x"))
            .await
            .map_err(api),
        Err(Error::CapacityExceeded(1))
    );
    assert_eq!(
        t.add_sibling(&last.path, author(), film(), String::from("x"), Position::Left)
            .await
            .map_err(api),
        Err(Error::CapacityExceeded(1))
    );
    assert_eq!(
        t.add_sibling(&last.path, author(), film(), String::from("x"), Position::Right)
            .await
            .map_err(api),
        Err(Error::CapacityExceeded(1))
    );
    let reply = child(&mut t, &last, "still fine").await;
    assert_eq!(reply.path.to_string(), "ZZZZ0000");
    assert_eq!(t.store().len(), 2);
}

#[tokio::test]
async fn invalid_insertions_write_nothing() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    assert_eq!(
        t.add_child(&r.path, author(), film(), String::from("  "))
            .await
            .map_err(api),
        Err(Error::EmptyText)
    );
    assert!(matches!(
        t.add_child(&r.path, author(), tv(), String::from("wrong title"))
            .await
            .map_err(api),
        Err(Error::InvalidSubject(_))
    ));
    assert_eq!(
        t.add_child(&path("0005"), author(), film(), String::from("x"))
            .await
            .map_err(api),
        Err(Error::PathNotFound(String::from("0005")))
    );
    assert_eq!(t.store().len(), 1);
}

#[tokio::test]
async fn admin_placement() {
    let mut t = tree();
    let r = root(&mut t, "r").await;
    let placed = |reference, position| AdminPlacement {
        reference,
        position,
    };

    let c = t
        .add_admin(
            placed(Some(r.id), AdminPosition::SortedChild),
            author(),
            film(),
            String::from("child"),
        )
        .await
        .unwrap();
    assert!(r.path.is_parent_of(&c.path));

    let left = t
        .add_admin(
            placed(Some(r.id), AdminPosition::Sibling(Position::Left)),
            author(),
            film(),
            String::from("left"),
        )
        .await
        .unwrap();
    assert_eq!(left.path, path("0000"));

    for reference in [None, Some(CommentId(Uuid::new_v4()))] {
        let fallback = t
            .add_admin(
                placed(reference, AdminPosition::SortedChild),
                author(),
                film(),
                String::from("fallback"),
            )
            .await
            .unwrap();
        assert_eq!(fallback.depth(), 1);
    }
    assert_eq!(t.roots_for(film(), Default::default()).await.unwrap().len(), 3);
}

#[test]
fn random_operations_keep_the_forest_well_formed() {
    #[derive(Clone, Debug, bolero::generator::TypeGenerator)]
    enum Op {
        Root,
        Child(usize),
        Sibling(usize, u8),
        Delete(usize),
        RacedChild(usize),
    }

    let runtime = AssertUnwindSafe(
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("failed initializing tokio runtime"),
    );
    bolero::check!()
        .with_generator(bolero::generator::gen_with::<Vec<Op>>().len(0..64usize))
        .cloned()
        .for_each(|ops| {
            runtime.block_on(async {
                let mut t = tree();
                for op in ops {
                    let comments = t.store().comments();
                    let pick = |i: usize| comments.get(i % comments.len().max(1)).cloned();
                    match op {
                        Op::Root => {
                            root(&mut t, "r").await;
                        }
                        Op::Child(i) => {
                            if let Some(p) = pick(i) {
                                child(&mut t, &p, "c").await;
                            }
                        }
                        Op::Sibling(i, pos) => {
                            if let Some(r) = pick(i) {
                                let position = match pos % 5 {
                                    0 => Position::FirstSibling,
                                    1 => Position::Left,
                                    2 => Position::Right,
                                    3 => Position::LastSibling,
                                    _ => Position::SortedSibling,
                                };
                                sibling(&mut t, &r, "s", position).await;
                            }
                        }
                        Op::Delete(i) => {
                            if let Some(c) = pick(i) {
                                let size = t.subtree_of(c.id).await.unwrap().len() as u64;
                                assert_eq!(t.delete(c.id).await.unwrap(), size);
                            }
                        }
                        Op::RacedChild(i) => {
                            if let Some(p) = pick(i) {
                                t.store().inject_races(1);
                                child(&mut t, &p, "raced").await;
                            }
                        }
                    }
                    assert_well_formed(t.store());
                }
            })
        });
}

async fn server_with_user() -> (MockServer, AuthToken, Subject) {
    let mut s = MockServer::with_page_size(2);
    s.admin_create_user(
        NewUser {
            id: author(),
            name: String::from("alice"),
            initial_password_hash: String::from("pass"),
        },
        String::from("pass"),
    )
    .unwrap();
    s.admin_register_subject(NewSubject {
        subject: film(),
        title: String::from("Metropolis"),
    })
    .unwrap();
    let tok = s
        .auth(NewSession {
            user: String::from("alice"),
            password: String::from("pass"),
            device: String::from("test"),
        })
        .unwrap();
    (s, tok, film())
}

fn post(subject: Subject, text: &str, path: &str) -> NewComment {
    let r = Some(SubjectRef { id: subject.id() });
    NewComment {
        film: subject.film().and(r),
        tv: subject.tv().and(r),
        text: String::from(text),
        path: String::from(path),
    }
}

fn listing(subject: Subject, page: Option<u64>) -> ListComments {
    ListComments {
        subject_id: subject.id(),
        subject_type: subject.kind().to_string(),
        page,
    }
}

#[tokio::test]
async fn server_pages_threads() {
    let (mut s, tok, film) = server_with_user().await;
    for i in 0..3 {
        let root = s.add_comment(tok, post(film, &format!("root {i}"), "")).await.unwrap();
        s.add_comment(tok, post(film, "reply", &root.path.to_string()))
            .await
            .unwrap();
    }

    let first = s.list_comments(listing(film, None)).await.unwrap();
    assert_eq!((first.count, first.next, first.previous), (3, Some(2), None));
    assert_eq!(first.results.len(), 2);
    assert_eq!(first.results[0][0].data.text, "root 2");
    assert_eq!(first.results[0][0].children.len(), 1);

    let second = s.list_comments(listing(film, Some(2))).await.unwrap();
    assert_eq!((second.next, second.previous), (None, Some(1)));
    assert_eq!(second.results.len(), 1);

    for page in [0, 3] {
        assert_eq!(
            s.list_comments(listing(film, Some(page))).await,
            Err(Error::PageNotFound(page))
        );
    }
    assert_eq!(
        s.list_comments(listing(tv(), None)).await,
        Err(Error::SubjectNotFound(tv().id()))
    );
    s.admin_register_subject(NewSubject {
        subject: tv(),
        title: String::from("The Prisoner"),
    })
    .unwrap();
    let empty = s.list_comments(listing(tv(), None)).await.unwrap();
    assert_eq!((empty.count, empty.next, empty.results.len()), (0, None, 0));
}

#[tokio::test]
async fn server_checks_requests() {
    let (mut s, tok, film) = server_with_user().await;
    assert_eq!(
        s.add_comment(AuthToken(Uuid::new_v4()), post(film, "x", "")).await,
        Err(Error::Unauthenticated)
    );
    assert_eq!(
        s.add_comment(tok, post(tv(), "x", "")).await,
        Err(Error::SubjectNotFound(tv().id()))
    );
    assert_eq!(
        s.add_comment(tok, post(film, "x", "0009")).await,
        Err(Error::PathNotFound(String::from("0009")))
    );
    assert_eq!(
        s.add_comment(tok, post(film, "x", "9")).await,
        Err(Error::InvalidPath(String::from("9")))
    );
    let stranger = UserId(Uuid::new_v4());
    assert_eq!(
        s.admin_add_comment(AdminNewComment {
            author: stranger,
            subject: film,
            text: String::from("x"),
            placement: AdminPlacement {
                reference: None,
                position: AdminPosition::SortedChild,
            },
        })
        .await,
        Err(Error::UserNotFound(stranger.0))
    );
    assert!(s.test_comments().is_empty());
}

#[tokio::test]
async fn only_authors_delete() {
    let (mut s, tok, film) = server_with_user().await;
    s.admin_create_user(
        NewUser {
            id: UserId(Uuid::new_v4()),
            name: String::from("bob"),
            initial_password_hash: String::from("hunter2"),
        },
        String::from("hunter2"),
    )
    .unwrap();
    let bob = s
        .auth(NewSession {
            user: String::from("bob"),
            password: String::from("hunter2"),
            device: String::from("phone"),
        })
        .unwrap();
    let c = s.add_comment(tok, post(film, "mine", "")).await.unwrap();
    s.add_comment(bob, post(film, "reply", &c.path.to_string()))
        .await
        .unwrap();
    assert_eq!(s.delete_comment(bob, c.id).await, Err(Error::PermissionDenied));
    assert_eq!(s.comment_subtree(c.id).await.unwrap()[0].flatten().len(), 2);
    assert_eq!(s.delete_comment(tok, c.id).await, Ok(2));
    assert_eq!(
        s.comment_subtree(c.id).await,
        Err(Error::CommentNotFound(c.id.0))
    );
    s.unauth(bob).unwrap();
    assert_eq!(s.whoami(bob), Err(Error::Unauthenticated));
    assert_eq!(s.whoami(tok).unwrap().name, "alice");
}
