use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() < 2 || path.len() % 2 != 0 {
            return Err(invalid_argument(format!(
                "Document keys must point to a document (even number of segments), got '{path}'"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn is_document_path(path: &ResourcePath) -> bool {
        path.len() >= 2 && path.len() % 2 == 0
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Id of the collection the document lives in.
    pub fn collection_group(&self) -> &str {
        self.path.segment(self.path.len() - 2).unwrap_or_default()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

// Keys order exactly as their paths, so ordered maps of keys can be ranged by path.
impl Borrow<ResourcePath> for DocumentKey {
    fn borrow(&self) -> &ResourcePath {
        &self.path
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("cities/sf").unwrap();
        assert_eq!(key.id(), "sf");
        assert_eq!(key.collection_group(), "cities");
        assert_eq!(key.collection_path().canonical_string(), "cities");
    }

    #[test]
    fn orders_by_path() {
        let a = DocumentKey::from_string("cities/a").unwrap();
        let b = DocumentKey::from_string("cities/b").unwrap();
        let nested = DocumentKey::from_string("cities/a/streets/x").unwrap();
        assert!(a < b);
        assert!(a < nested);
        assert!(nested < b);
    }
}
