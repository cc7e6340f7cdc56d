use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    /// Membership under query equality, as used by `array-contains` and `in` filters.
    pub fn contains(&self, value: &FirestoreValue) -> bool {
        self.values.iter().any(|element| element.query_equals(value))
    }
}
