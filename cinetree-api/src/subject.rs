use std::{fmt, str::FromStr};

use uuid::Uuid;

use crate::Error;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct FilmId(pub Uuid);

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct TvId(pub Uuid);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Movie,
    Tv,
}

impl FromStr for SubjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<SubjectKind, Error> {
        match s {
            "movie" | "film" => Ok(SubjectKind::Movie),
            "tv" => Ok(SubjectKind::Tv),
            _ => Err(Error::InvalidSubject(format!("unknown subject type {s:?}"))),
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubjectKind::Movie => "movie",
            SubjectKind::Tv => "tv",
        })
    }
}

/// The title a comment thread is about
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Subject {
    Film(FilmId),
    Tv(TvId),
}

impl Subject {
    pub fn new(kind: SubjectKind, id: Uuid) -> Subject {
        match kind {
            SubjectKind::Movie => Subject::Film(FilmId(id)),
            SubjectKind::Tv => Subject::Tv(TvId(id)),
        }
    }

    /// Builds the subject out of the two optional references a client sends,
    /// exactly one of which must be set
    pub fn from_refs(film: Option<SubjectRef>, tv: Option<SubjectRef>) -> Result<Subject, Error> {
        match (film, tv) {
            (Some(f), None) => Ok(Subject::Film(FilmId(f.id))),
            (None, Some(t)) => Ok(Subject::Tv(TvId(t.id))),
            (None, None) => Err(Error::InvalidSubject(String::from(
                "neither a film nor a tv was given",
            ))),
            (Some(_), Some(_)) => Err(Error::InvalidSubject(String::from(
                "both a film and a tv were given",
            ))),
        }
    }

    pub fn kind(&self) -> SubjectKind {
        match self {
            Subject::Film(_) => SubjectKind::Movie,
            Subject::Tv(_) => SubjectKind::Tv,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Subject::Film(FilmId(id)) | Subject::Tv(TvId(id)) => *id,
        }
    }

    pub fn film(&self) -> Option<FilmId> {
        match self {
            Subject::Film(f) => Some(*f),
            Subject::Tv(_) => None,
        }
    }

    pub fn tv(&self) -> Option<TvId> {
        match self {
            Subject::Film(_) => None,
            Subject::Tv(t) => Some(*t),
        }
    }
}

/// Reference to a film or tv, the way clients write it: `{ "id": ... }`
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SubjectRef {
    pub id: Uuid,
}

/// Registration of a catalogue title comments can be attached to
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewSubject {
    pub subject: Subject,
    pub title: String,
}

impl NewSubject {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_ref() {
        let id = Uuid::new_v4();
        let r = Some(SubjectRef { id });
        assert_eq!(Subject::from_refs(r, None), Ok(Subject::Film(FilmId(id))));
        assert_eq!(Subject::from_refs(None, r), Ok(Subject::Tv(TvId(id))));
        assert!(matches!(
            Subject::from_refs(None, None),
            Err(Error::InvalidSubject(_))
        ));
        assert!(matches!(
            Subject::from_refs(r, r),
            Err(Error::InvalidSubject(_))
        ));
    }

    #[test]
    fn kinds() {
        assert_eq!("movie".parse(), Ok(SubjectKind::Movie));
        assert_eq!("tv".parse(), Ok(SubjectKind::Tv));
        assert!("book".parse::<SubjectKind>().is_err());
        let id = Uuid::new_v4();
        let s = Subject::new(SubjectKind::Tv, id);
        assert_eq!(s.kind(), SubjectKind::Tv);
        assert_eq!(s.id(), id);
        assert_eq!(s.film(), None);
        assert_eq!(s.tv(), Some(TvId(id)));
    }

    #[test]
    fn wire_format() {
        let id = Uuid::new_v4();
        assert_eq!(
            serde_json::to_value(Subject::Film(FilmId(id))).unwrap(),
            serde_json::json!({ "type": "film", "id": id }),
        );
    }
}
