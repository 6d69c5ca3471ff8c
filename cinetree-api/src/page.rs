use crate::{Error, Window};

/// Number of root comments per page when nothing else is configured
pub const DEFAULT_PAGE_SIZE: u64 = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Page {
    pub number: u64,
    pub size: u64,
}

impl Page {
    /// Pages are numbered from 1, and a missing page number means the first one
    pub fn new(number: Option<u64>, size: u64) -> Result<Page, Error> {
        match number.unwrap_or(1) {
            0 => Err(Error::PageNotFound(0)),
            number => Ok(Page {
                number,
                size: size.max(1),
            }),
        }
    }

    pub fn window(&self) -> Window {
        Window {
            offset: (self.number - 1).saturating_mul(self.size),
            limit: self.size,
        }
    }

    /// Wraps the results fetched for this page. The first page always exists,
    /// any other one must start before `count`.
    pub fn wrap<T>(&self, count: u64, results: Vec<T>) -> Result<Paginated<T>, Error> {
        if self.number > 1 && self.window().offset >= count {
            return Err(Error::PageNotFound(self.number));
        }
        let next = (self.number.saturating_mul(self.size) < count).then_some(self.number + 1);
        let previous = (self.number > 1).then_some(self.number - 1);
        Ok(Paginated {
            count,
            next,
            previous,
            results,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Paginated<T> {
    pub count: u64,
    pub next: Option<u64>,
    pub previous: Option<u64>,
    pub results: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows() {
        let p = Page::new(None, 20).unwrap();
        assert_eq!(p.window(), Window { offset: 0, limit: 20 });
        let p = Page::new(Some(3), 20).unwrap();
        assert_eq!(p.window(), Window { offset: 40, limit: 20 });
        assert_eq!(Page::new(Some(0), 20), Err(Error::PageNotFound(0)));
    }

    #[test]
    fn wrapping() {
        let first = Page::new(Some(1), 2).unwrap();
        assert_eq!(
            first.wrap(0, Vec::<()>::new()).unwrap(),
            Paginated {
                count: 0,
                next: None,
                previous: None,
                results: vec![],
            }
        );
        let w = first.wrap(5, vec![1, 2]).unwrap();
        assert_eq!((w.next, w.previous), (Some(2), None));
        let last = Page::new(Some(3), 2).unwrap();
        let w = last.wrap(5, vec![5]).unwrap();
        assert_eq!((w.next, w.previous), (None, Some(2)));
        let beyond = Page::new(Some(4), 2).unwrap();
        assert_eq!(beyond.wrap(5, Vec::<u8>::new()), Err(Error::PageNotFound(4)));
    }
}
