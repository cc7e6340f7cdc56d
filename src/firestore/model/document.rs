use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    /// Nothing is known about the document, not even whether it exists.
    Invalid,
    FoundDocument,
    NoDocument,
    /// The document exists on the backend but its contents are not known locally, e.g. after
    /// a patch was acknowledged for a document we never received.
    UnknownDocument,
}

/// A document as stored in the remote document cache, optionally with local changes applied.
///
/// Cache entries are owned by the remote document cache; everything handed out of a local
/// store transaction is a copy.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    state: DocumentState,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            state: DocumentState::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_found(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_unknown(version);
        document
    }

    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        if self.create_time.is_min()
            && matches!(
                self.state,
                DocumentState::NoDocument | DocumentState::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.state = DocumentState::FoundDocument;
        self.data = data;
        self.clear_mutation_flags();
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.state = DocumentState::NoDocument;
        self.data = MapValue::empty();
        self.clear_mutation_flags();
        self
    }

    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.state = DocumentState::UnknownDocument;
        self.data = MapValue::empty();
        self.has_local_mutations = false;
        self.has_committed_mutations = true;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.has_committed_mutations = true;
        self.has_local_mutations = false;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.has_local_mutations = true;
        self.has_committed_mutations = false;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: SnapshotVersion) -> &mut Self {
        self.create_time = create_time;
        self
    }

    fn clear_mutation_flags(&mut self) {
        self.has_local_mutations = false;
        self.has_committed_mutations = false;
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }

    pub fn is_valid_document(&self) -> bool {
        self.state != DocumentState::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.state == DocumentState::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.state == DocumentState::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.state == DocumentState::UnknownDocument
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.key.path().canonical_string().len() + self.data.approximate_byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn conversions_reset_mutation_flags() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let mut doc = Document::new_found(key.clone(), version(1), MapValue::empty());
        doc.set_has_local_mutations();
        assert!(doc.has_pending_writes());
        doc.convert_to_no_document(version(2));
        assert!(doc.is_no_document());
        assert!(!doc.has_pending_writes());
        assert_eq!(doc.version(), version(2));
    }

    #[test]
    fn unknown_documents_count_as_committed() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let doc = Document::new_unknown(key, version(3));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
        assert!(doc.is_valid_document());
    }

    #[test]
    fn create_time_set_on_first_found_version() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let mut doc = Document::new_found(key, version(1), MapValue::empty());
        doc.convert_to_found(version(5), MapValue::empty());
        assert_eq!(doc.create_time(), version(1));
        assert_eq!(doc.version(), version(5));
    }
}
