use std::{fmt, str::FromStr};

use crate::Error;

/// Digits a segment is written with, in ascending order
pub const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Number of digits of one segment
pub const SEGMENT_WIDTH: usize = 4;

const BASE: u32 = ALPHABET.len() as u32;

fn digit_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some(u32::from(c - b'0')),
        b'A'..=b'Z' => Some(u32::from(c - b'A') + 10),
        _ => None,
    }
}

/// Rank of a node among its siblings
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Segment(u32);

impl Segment {
    pub const FIRST: Segment = Segment(0);
    pub const LAST: Segment = Segment(BASE.pow(SEGMENT_WIDTH as u32) - 1);

    pub fn new(value: u32) -> Option<Segment> {
        (value <= Self::LAST.0).then_some(Segment(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// The segment right after this one, or `None` if the level is exhausted
    pub fn next(self) -> Option<Segment> {
        Segment::new(self.0 + 1)
    }

    pub fn prev(self) -> Option<Segment> {
        self.0.checked_sub(1).map(Segment)
    }

    fn write_to(self, out: &mut String) {
        let mut digits = [b'0'; SEGMENT_WIDTH];
        let mut v = self.0;
        for d in digits.iter_mut().rev() {
            *d = ALPHABET[(v % BASE) as usize];
            v /= BASE;
        }
        out.extend(digits.iter().map(|&d| d as char));
    }

    fn read(chunk: &[u8]) -> Option<Segment> {
        chunk
            .iter()
            .try_fold(0u32, |acc, &c| digit_value(c).map(|d| acc * BASE + d))
            .map(Segment)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = String::with_capacity(SEGMENT_WIDTH);
        self.write_to(&mut res);
        f.write_str(&res)
    }
}

/// Position of a comment in its tree: one segment per level, root first.
///
/// Paths are never empty. They compare segment by segment, with a proper
/// prefix sorting before its extensions, so sorting paths yields the
/// pre-order traversal of the forest. This is also the byte order of their
/// encoded form.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path(Vec<Segment>);

impl Path {
    pub fn root(segment: Segment) -> Path {
        Path(vec![segment])
    }

    pub fn child(&self, segment: Segment) -> Path {
        let mut res = self.0.clone();
        res.push(segment);
        Path(res)
    }

    pub fn parent(&self) -> Option<Path> {
        match self.0.len() {
            1 => None,
            n => Some(Path(self.0[..n - 1].to_vec())),
        }
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn last(&self) -> Segment {
        *self.0.last().expect("paths are never empty")
    }

    /// The sibling path ending with `segment`
    pub fn with_last(&self, segment: Segment) -> Path {
        let mut res = self.0.clone();
        *res.last_mut().expect("paths are never empty") = segment;
        Path(res)
    }

    /// This path cut down to its first `depth` segments
    pub fn prefix(&self, depth: usize) -> Option<Path> {
        (depth >= 1 && depth <= self.0.len()).then(|| Path(self.0[..depth].to_vec()))
    }

    /// This path with its segment at level `depth` moved one step right,
    /// or `None` if that level is exhausted
    pub fn shifted_at(&self, depth: usize) -> Option<Path> {
        let mut res = self.0.clone();
        let seg = res.get_mut(depth.checked_sub(1)?)?;
        *seg = seg.next()?;
        Some(Path(res))
    }

    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.0)
    }

    pub fn is_parent_of(&self, other: &Path) -> bool {
        other.0.len() == self.0.len() + 1 && other.0.starts_with(&self.0)
    }

    /// Whether `other` is in the subtree rooted at this path, itself included
    pub fn covers(&self, other: &Path) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = String::with_capacity(self.0.len() * SEGMENT_WIDTH);
        for s in &self.0 {
            s.write_to(&mut res);
        }
        f.write_str(&res)
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Path, Error> {
        let bytes = s.as_bytes();
        if bytes.is_empty() || bytes.len() % SEGMENT_WIDTH != 0 {
            return Err(Error::InvalidPath(String::from(s)));
        }
        bytes
            .chunks(SEGMENT_WIDTH)
            .map(Segment::read)
            .collect::<Option<Vec<_>>>()
            .map(Path)
            .ok_or_else(|| Error::InvalidPath(String::from(s)))
    }
}

impl TryFrom<String> for Path {
    type Error = Error;

    fn try_from(s: String) -> Result<Path, Error> {
        s.parse()
    }
}

impl From<Path> for String {
    fn from(p: Path) -> String {
        p.to_string()
    }
}
