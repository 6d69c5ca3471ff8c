use anyhow::Context;
use cinetree_api::{
    AdminNewComment, AdminPlacement, AdminPosition, AuthToken, Comment, CommentId, DumpNode,
    FilmId, NewSubject, NewUser, Subject, TvId, UserId, Uuid,
};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, env = "CINETREE_HOST")]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Create a user
    CreateUser {
        /// Username
        name: String,

        /// Initial password
        initial_password: String,
    },

    /// Register a film comments can be posted about
    RegisterFilm {
        title: String,

        /// Defaults to a random id
        #[structopt(long)]
        id: Option<Uuid>,
    },

    /// Register a tv show comments can be posted about
    RegisterTv {
        name: String,

        /// Defaults to a random id
        #[structopt(long)]
        id: Option<Uuid>,
    },

    /// Post a comment on behalf of a user
    AddComment {
        /// Id of the author
        author: Uuid,

        /// "film" or "tv"
        subject_type: String,

        subject_id: Uuid,

        text: String,

        /// Comment to place the new one relative to, a new thread is started
        /// if unset or unknown
        #[structopt(long)]
        reference: Option<Uuid>,

        /// One of sorted-child, first-sibling, left, right, last-sibling or
        /// sorted-sibling
        #[structopt(long, default_value = "sorted-child")]
        position: AdminPosition,
    },

    /// Print comment trees as nested json
    Dump {
        /// Only dump the subtree at this comment
        #[structopt(long)]
        root: Option<Uuid>,
    },
}

fn admin_token() -> anyhow::Result<AuthToken> {
    let tok =
        std::env::var("ADMIN_TOKEN").context("retrieving ADMIN_TOKEN environment variable")?;
    let tok = Uuid::try_parse(&tok).context("parsing ADMIN_TOKEN as an auth token")?;
    Ok(AuthToken(tok))
}

async fn register(
    client: &reqwest::Client,
    host: &str,
    subject: Subject,
    title: String,
) -> anyhow::Result<()> {
    client
        .post(format!("{host}/api/admin/subjects"))
        .json(&NewSubject { subject, title })
        .bearer_auth(admin_token()?.0)
        .send()
        .await?
        .error_for_status()?;
    println!("{}", subject.id());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();

    let client = reqwest::Client::new();

    match opt.cmd {
        Command::CreateUser {
            name,
            initial_password,
        } => {
            let user = NewUser::new(UserId(Uuid::new_v4()), name, initial_password);
            client
                .post(format!("{}/api/admin/create-user", opt.host))
                .json(&user)
                .bearer_auth(admin_token()?.0)
                .send()
                .await?
                .error_for_status()?;
            println!("{}", user.id.0);
        }
        Command::RegisterFilm { title, id } => {
            let film = Subject::Film(FilmId(id.unwrap_or_else(Uuid::new_v4)));
            register(&client, &opt.host, film, title).await?;
        }
        Command::RegisterTv { name, id } => {
            let tv = Subject::Tv(TvId(id.unwrap_or_else(Uuid::new_v4)));
            register(&client, &opt.host, tv, name).await?;
        }
        Command::AddComment {
            author,
            subject_type,
            subject_id,
            text,
            reference,
            position,
        } => {
            let comment = AdminNewComment {
                author: UserId(author),
                subject: Subject::new(subject_type.parse()?, subject_id),
                text,
                placement: AdminPlacement {
                    reference: reference.map(CommentId),
                    position,
                },
            };
            comment.validate()?;
            let comment: Comment = client
                .post(format!("{}/api/admin/comments", opt.host))
                .json(&comment)
                .bearer_auth(admin_token()?.0)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .context("parsing the created comment")?;
            println!("{} {}", comment.id.0, comment.path);
        }
        Command::Dump { root } => {
            let mut req = client
                .get(format!("{}/api/admin/dump", opt.host))
                .bearer_auth(admin_token()?.0);
            if let Some(root) = root {
                req = req.query(&[("root", root)]);
            }
            let dump: Vec<DumpNode> = req
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .context("parsing the comment dump")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&dump).context("rendering the comment dump")?
            );
        }
    }

    Ok(())
}
