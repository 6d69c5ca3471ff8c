use crate::{Comment, CommentId, FilmId, Time, TvId, UserId};

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DumpData {
    pub author: UserId,
    pub film: Option<FilmId>,
    pub tv: Option<TvId>,
    pub text: String,
    pub created_date: Time,
}

/// Nested form of a comment and its replies, as rendered to clients
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DumpNode {
    pub data: DumpData,
    pub id: CommentId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DumpNode>,
}

impl From<Comment> for DumpNode {
    fn from(c: Comment) -> DumpNode {
        DumpNode {
            data: DumpData {
                author: c.author,
                film: c.subject.film(),
                tv: c.subject.tv(),
                text: c.text,
                created_date: c.created_date,
            },
            id: c.id,
            children: Vec::new(),
        }
    }
}

impl DumpNode {
    /// Nests comments given in pre-order. Every comment must come after its
    /// parent, if its parent is part of the input at all.
    pub fn nest(comments: impl IntoIterator<Item = Comment>) -> Vec<DumpNode> {
        let mut roots = Vec::new();
        let mut stack: Vec<(usize, DumpNode)> = Vec::new();
        for c in comments {
            let depth = c.depth();
            while let Some((d, _)) = stack.last() {
                if *d < depth {
                    break;
                }
                pop_into(&mut stack, &mut roots);
            }
            stack.push((depth, DumpNode::from(c)));
        }
        while !stack.is_empty() {
            pop_into(&mut stack, &mut roots);
        }
        roots
    }

    /// Ids of this node and its descendants, in pre-order
    pub fn flatten(&self) -> Vec<CommentId> {
        let mut res = vec![self.id];
        for c in &self.children {
            res.extend(c.flatten());
        }
        res
    }
}

fn pop_into(stack: &mut Vec<(usize, DumpNode)>, roots: &mut Vec<DumpNode>) {
    if let Some((_, node)) = stack.pop() {
        match stack.last_mut() {
            Some((_, parent)) => parent.children.push(node),
            None => roots.push(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::{Subject, TvId};

    fn comment(path: &str) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            path: path.parse().unwrap(),
            author: UserId::stub(),
            subject: Subject::Tv(TvId(Uuid::nil())),
            text: format!("comment at {path}"),
            created_date: Utc::now(),
        }
    }

    #[test]
    fn nests_forest() {
        let comments = ["0000", "00000000", "000000000000", "00000001", "0001", "00010000"]
            .map(comment);
        let ids = comments.iter().map(|c| c.id).collect::<Vec<_>>();
        let dump = DumpNode::nest(comments);
        assert_eq!(dump.len(), 2);
        assert_eq!(dump[0].id, ids[0]);
        assert_eq!(dump[0].children.len(), 2);
        assert_eq!(dump[0].children[0].children.len(), 1);
        assert_eq!(dump[0].children[0].children[0].id, ids[2]);
        assert_eq!(dump[0].children[1].id, ids[3]);
        assert_eq!(dump[1].children.len(), 1);
        let flat = dump.iter().flat_map(|d| d.flatten()).collect::<Vec<_>>();
        assert_eq!(flat, ids);
    }

    #[test]
    fn nests_subtree() {
        let comments = ["00030001", "000300010000", "0003000100000000", "000300010001"]
            .map(comment);
        let dump = DumpNode::nest(comments);
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].children.len(), 2);
        assert_eq!(dump[0].children[0].children.len(), 1);
    }

    #[test]
    fn leaves_have_no_children_key() {
        let c = comment("0000");
        let json = serde_json::to_value(DumpNode::from(c.clone())).unwrap();
        assert_eq!(json.get("children"), None);
        assert_eq!(json["id"], serde_json::json!(c.id));
        assert_eq!(json["data"]["film"], serde_json::Value::Null);
        assert_eq!(json["data"]["text"], serde_json::json!("comment at 0000"));
    }
}
