use chrono::{Duration, Utc};
use cinetree_api::{NewUser, Path, Segment, Time, UserId};
use rand::{seq::SliceRandom, Rng};
use uuid::Uuid;

const NUM_USERS: usize = 5;
const NUM_FILMS: usize = 10;
const NUM_TVS: usize = 5;

const THREADS_PER_SUBJECT: usize = 30;
const MAX_REPLIES: usize = 4;
const MAX_DEPTH: usize = 5;

const TITLE_WORDS: usize = 3;
const COMMENT_WORDS: usize = 25;

fn gen_n_items(table: &str, columns: &str, items: Vec<String>) {
    if items.is_empty() {
        return;
    }
    println!("INSERT INTO {table} ({columns}) VALUES");
    println!("    {}", items.join(",\n    "));
    println!("ON CONFLICT DO NOTHING;");
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

struct Node {
    path: Path,
    author: UserId,
    film: Option<Uuid>,
    tv: Option<Uuid>,
    date: Time,
}

impl Node {
    fn row(&self) -> String {
        let subject = |s: Option<Uuid>| s.map_or_else(|| String::from("NULL"), |s| quote(&s.to_string()));
        format!(
            "('{}', '{}', {}, '{}', {}, {}, {}, '{}')",
            Uuid::new_v4(),
            self.path,
            self.path.depth(),
            self.author.0,
            subject(self.film),
            subject(self.tv),
            quote(&lipsum::lipsum_words(COMMENT_WORDS)),
            self.date.to_rfc3339(),
        )
    }
}

/// Appends `parent` and a random set of replies to it, in pre-order
fn gen_thread(rng: &mut impl Rng, users: &[UserId], parent: Node, out: &mut Vec<Node>) {
    let replies = match parent.path.depth() < MAX_DEPTH {
        true => rng.gen_range(0..=MAX_REPLIES),
        false => 0,
    };
    let mut children = Vec::with_capacity(replies);
    let mut segment = Segment::FIRST;
    for _ in 0..replies {
        children.push(Node {
            path: parent.path.child(segment),
            author: *users.choose(rng).expect("no users were generated"),
            film: parent.film,
            tv: parent.tv,
            date: parent.date + Duration::minutes(rng.gen_range(1..600)),
        });
        // leave a gap now and then, as deleted replies do
        let step = if rng.gen_bool(0.2) { 2 } else { 1 };
        for _ in 0..step {
            segment = segment.next().expect("segment space is exhausted");
        }
    }
    out.push(parent);
    for c in children {
        gen_thread(rng, users, c, out);
    }
}

fn main() {
    let mut rng = rand::thread_rng();

    println!("-- passwords are the user names");
    let users = (0..NUM_USERS)
        .map(|i| NewUser::new(UserId(Uuid::new_v4()), format!("user{i}"), format!("user{i}")))
        .collect::<Vec<_>>();
    gen_n_items(
        "users",
        "id, name, password_hash",
        users
            .iter()
            .map(|u| format!("('{}', {}, {})", u.id.0, quote(&u.name), quote(&u.initial_password_hash)))
            .collect(),
    );
    let user_ids = users.iter().map(|u| u.id).collect::<Vec<_>>();

    let films = (0..NUM_FILMS).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    gen_n_items(
        "films",
        "id, title",
        films
            .iter()
            .map(|f| format!("('{f}', {})", quote(&lipsum::lipsum_words(TITLE_WORDS))))
            .collect(),
    );
    let tvs = (0..NUM_TVS).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    gen_n_items(
        "tvs",
        "id, name",
        tvs.iter()
            .map(|t| format!("('{t}', {})", quote(&lipsum::lipsum_words(TITLE_WORDS))))
            .collect(),
    );

    let subjects = films
        .iter()
        .map(|f| (Some(*f), None))
        .chain(tvs.iter().map(|t| (None, Some(*t))));
    let mut comments = Vec::new();
    let mut root = Segment::FIRST;
    let start = Utc::now() - Duration::days(365);
    for (film, tv) in subjects {
        for _ in 0..THREADS_PER_SUBJECT {
            let node = Node {
                path: Path::root(root),
                author: *user_ids.choose(&mut rng).expect("no users were generated"),
                film,
                tv,
                date: start + Duration::minutes(rng.gen_range(0..60 * 24 * 365)),
            };
            gen_thread(&mut rng, &user_ids, node, &mut comments);
            root = root.next().expect("root segment space is exhausted");
        }
    }
    gen_n_items(
        "comments",
        "id, path, depth, author_id, film_id, tv_id, text, created_date",
        comments.iter().map(Node::row).collect(),
    );
}
