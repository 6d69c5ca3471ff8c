use std::collections::{btree_map, BTreeMap, HashMap};

use cinetree_api::{
    AdminNewComment, AuthToken, Comment, CommentId, CommentTree, CommentView, DumpNode, Error,
    ListComments, NewComment, NewSession, NewSubject, NewUser, Page, Paginated, RootOrder,
    Subject, TreeError, User, UserId, Uuid, DEFAULT_PAGE_SIZE,
};

mod store;
pub use store::MockStore;

#[cfg(test)]
mod properties;

/// Behaves like the real server, keeping everything in memory
pub struct MockServer {
    users: BTreeMap<UserId, MockUser>,
    subjects: BTreeMap<Subject, String>,
    store: MockStore,
    page_size: u64,
}

#[derive(Debug)]
struct MockUser {
    name: String,
    pass: String,
    pass_hash: String,
    sessions: HashMap<AuthToken, String>,
}

fn api_error(e: TreeError) -> Error {
    e.into_api()
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: u64) -> MockServer {
        MockServer {
            users: BTreeMap::new(),
            subjects: BTreeMap::new(),
            store: MockStore::new(),
            page_size,
        }
    }

    /// Return name & pass for user number `id`
    pub fn test_get_user_info(&self, id: usize) -> (UserId, &str, &str) {
        let (uid, u) = self
            .users
            .iter()
            .nth(id)
            .unwrap_or_else(|| panic!("getting user {id} among {}", self.users.len()));
        (*uid, &u.name, &u.pass)
    }

    pub fn test_num_users(&self) -> usize {
        self.users.len()
    }

    pub fn test_subjects(&self) -> Vec<Subject> {
        self.subjects.keys().copied().collect()
    }

    /// Every comment, in pre-order
    pub fn test_comments(&self) -> Vec<Comment> {
        self.store.comments()
    }

    pub fn store(&self) -> &MockStore {
        &self.store
    }

    fn tree(&self) -> CommentTree<MockStore> {
        CommentTree::new(self.store.clone())
    }

    pub fn admin_create_user(&mut self, u: NewUser, password: String) -> Result<(), Error> {
        u.validate()?;

        if self.users.values().any(|db| db.name == u.name) {
            return Err(Error::NameAlreadyUsed(u.name));
        }

        match self.users.entry(u.id) {
            btree_map::Entry::Occupied(_) => Err(Error::UuidAlreadyUsed(u.id.0)),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(MockUser {
                    name: u.name,
                    pass: password,
                    pass_hash: u.initial_password_hash,
                    sessions: HashMap::new(),
                });
                Ok(())
            }
        }
    }

    pub fn admin_register_subject(&mut self, s: NewSubject) -> Result<(), Error> {
        s.validate()?;
        if self.subjects.keys().any(|k| k.id() == s.subject.id()) {
            return Err(Error::UuidAlreadyUsed(s.subject.id()));
        }
        self.subjects.insert(s.subject, s.title);
        Ok(())
    }

    pub async fn admin_add_comment(&mut self, c: AdminNewComment) -> Result<Comment, Error> {
        c.validate()?;
        if !self.users.contains_key(&c.author) {
            return Err(Error::UserNotFound(c.author.0));
        }
        self.check_subject(c.subject)?;
        self.tree()
            .add_admin(c.placement, c.author, c.subject, c.text)
            .await
            .map_err(api_error)
    }

    pub async fn admin_dump(&self, root: Option<CommentId>) -> Result<Vec<DumpNode>, Error> {
        self.tree().dump_bulk(root).await.map_err(api_error)
    }

    pub fn auth(&mut self, s: NewSession) -> Result<AuthToken, Error> {
        s.validate()?;
        for u in self.users.values_mut() {
            if u.name == s.user {
                // tests don't actually use bcrypt
                if s.password != u.pass_hash {
                    return Err(Error::PermissionDenied);
                }
                let tok = AuthToken(Uuid::new_v4());
                u.sessions.insert(tok, s.device);
                return Ok(tok);
            }
        }
        Err(Error::PermissionDenied)
    }

    fn resolve(&self, tok: AuthToken) -> Result<UserId, Error> {
        self.users
            .iter()
            .find(|(_, u)| u.sessions.contains_key(&tok))
            .map(|(id, _)| *id)
            .ok_or(Error::Unauthenticated)
    }

    pub fn unauth(&mut self, tok: AuthToken) -> Result<(), Error> {
        let uid = self.resolve(tok)?;
        if let Some(u) = self.users.get_mut(&uid) {
            u.sessions.remove(&tok);
        }
        Ok(())
    }

    pub fn whoami(&self, tok: AuthToken) -> Result<User, Error> {
        let id = self.resolve(tok)?;
        let name = self.users.get(&id).map(|u| u.name.clone()).unwrap_or_default();
        Ok(User { id, name })
    }

    fn check_subject(&self, subject: Subject) -> Result<(), Error> {
        match self.subjects.contains_key(&subject) {
            true => Ok(()),
            false => Err(Error::SubjectNotFound(subject.id())),
        }
    }

    pub async fn add_comment(&mut self, tok: AuthToken, c: NewComment) -> Result<CommentView, Error> {
        let author = self.resolve(tok)?;
        let (subject, parent) = c.validate()?;
        self.check_subject(subject)?;
        let mut tree = self.tree();
        let res = match parent {
            None => tree.add_root(author, subject, c.text).await,
            Some(parent) => tree.add_child(&parent, author, subject, c.text).await,
        };
        res.map(|c| c.view()).map_err(api_error)
    }

    pub async fn list_comments(&self, q: ListComments) -> Result<Paginated<Vec<DumpNode>>, Error> {
        let subject = q.subject()?;
        let page = Page::new(q.page, self.page_size)?;
        self.check_subject(subject)?;
        self.tree()
            .page_of_threads(subject, RootOrder::NewestFirst, page)
            .await
            .map_err(api_error)
    }

    pub async fn comment_subtree(&self, id: CommentId) -> Result<Vec<DumpNode>, Error> {
        self.tree().dump_bulk(Some(id)).await.map_err(api_error)
    }

    /// Returns the number of comments removed
    pub async fn delete_comment(&mut self, tok: AuthToken, id: CommentId) -> Result<u64, Error> {
        let user = self.resolve(tok)?;
        let mut tree = self.tree();
        let c = tree.get(id).await.map_err(api_error)?;
        if c.author != user {
            return Err(Error::PermissionDenied);
        }
        tree.delete(id).await.map_err(api_error)
    }
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}
