use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Opaque byte string. Also carries resume tokens and write stream tokens.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BytesValue(Vec<u8>);

impl BytesValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_base64(value: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(value).map(Self)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for BytesValue {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_uses_padding() {
        let bytes = BytesValue::new(vec![1, 2, 3, 4]);
        assert_eq!(bytes.to_base64(), "AQIDBA==");
        let decoded = BytesValue::from_base64("AQIDBA==").unwrap();
        assert_eq!(decoded.as_slice(), &[1, 2, 3, 4]);
        assert!(BytesValue::empty().is_empty());
    }
}
