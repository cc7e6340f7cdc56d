use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Bloom filter over document names, as sent with existence filters.
///
/// Hashing follows the backend: the MD5 digest of the name is split into two little-endian
/// 64-bit halves `h1`, `h2` and the `i`-th probe tests bit `(h1 + i * h2) mod bit_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    padding: u32,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            padding: padding as u32,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// Builds a filter containing `values`, sized to `bit_count` bits.
    pub fn from_values<'a>(
        values: impl IntoIterator<Item = &'a str>,
        bit_count: usize,
        hash_count: i32,
    ) -> FirestoreResult<Self> {
        let byte_count = bit_count.div_ceil(8);
        let padding = (byte_count * 8 - bit_count) as i32;
        let mut filter = Self::new(vec![0; byte_count], padding, hash_count)?;
        for value in values {
            filter.insert(value);
        }
        Ok(filter)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> i32 {
        self.padding as i32
    }

    pub fn hash_count(&self) -> i32 {
        self.hash_count as i32
    }

    /// False means `value` is definitely absent; true may be a false positive.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(h1, h2, i)))
    }

    fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = hash_halves(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(u64::from(i))) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_parameters() {
        assert!(BloomFilter::new(vec![1], 8, 1).is_err());
        assert!(BloomFilter::new(vec![1], -1, 1).is_err());
        assert!(BloomFilter::new(vec![1], 0, 0).is_err());
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain("projects/p/databases/d/documents/c/a"));
    }

    #[test]
    fn inserted_values_are_never_reported_absent() {
        let names: Vec<String> = (0..50)
            .map(|i| format!("projects/p/databases/(default)/documents/rooms/{i}"))
            .collect();
        let filter =
            BloomFilter::from_values(names.iter().map(String::as_str), 500, 7).unwrap();
        assert_eq!(filter.bit_count(), 500);
        assert_eq!(filter.padding(), 4);
        for name in &names {
            assert!(filter.might_contain(name), "{name} must be present");
        }
    }

    #[test]
    fn sparse_filter_rejects_most_absent_values() {
        let filter = BloomFilter::from_values(["a"], 1024, 3).unwrap();
        let false_positives = (0..100)
            .filter(|i| filter.might_contain(&format!("absent-{i}")))
            .count();
        assert!(false_positives < 5);
    }
}
