use std::fmt::{self, Display, Formatter};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::firestore::remote::watch_change::BloomFilterParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BloomFilterError {
    InvalidBase64(String),
    InvalidPadding(i32),
    InvalidHashCount(i32),
    PaddingWithoutBitmap(i32),
}

impl Display for BloomFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BloomFilterError::InvalidBase64(err) => write!(f, "bloom filter bitmap is not valid base64: {err}"),
            BloomFilterError::InvalidPadding(padding) => write!(f, "invalid bloom filter padding: {padding}"),
            BloomFilterError::InvalidHashCount(count) => write!(f, "invalid bloom filter hash count: {count}"),
            BloomFilterError::PaddingWithoutBitmap(padding) => {
                write!(f, "bloom filter has padding {padding} but an empty bitmap")
            }
        }
    }
}

impl std::error::Error for BloomFilterError {}

/// Membership filter for the document names a target still contains.
///
/// Bit positions come from md5 double hashing: the digest is split into two little-endian
/// u64 halves `h1`, `h2`, and the i-th probe tests bit `(h1 + i * h2) mod bit_count`.
/// False positives are possible; false negatives are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> Result<Self, BloomFilterError> {
        if !(0..8).contains(&padding) {
            return Err(BloomFilterError::InvalidPadding(padding));
        }
        if hash_count < 0 || (!bitmap.is_empty() && hash_count == 0) {
            return Err(BloomFilterError::InvalidHashCount(hash_count));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError::PaddingWithoutBitmap(padding));
        }
        let bit_count = (bitmap.len() as u64 * 8).saturating_sub(padding as u64);
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn from_params(params: &BloomFilterParams) -> Result<Self, BloomFilterError> {
        let bitmap = STANDARD
            .decode(&params.bitmap)
            .map_err(|err| BloomFilterError::InvalidBase64(err.to_string()))?;
        Self::new(bitmap, params.padding, params.hash_count)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = md5_halves(value);
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(hash1, hash2, index)))
    }

    fn bit_index(&self, hash1: u64, hash2: u64, index: u32) -> u64 {
        hash1.wrapping_add(hash2.wrapping_mul(index as u64)) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    fn insert(&mut self, value: &str) {
        let (hash1, hash2) = md5_halves(value);
        for index in 0..self.hash_count {
            let bit = self.bit_index(hash1, hash2, index);
            self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }
}

fn md5_halves(value: &str) -> (u64, u64) {
    let digest = md5::compute(value.as_bytes()).0;
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    high.copy_from_slice(&digest[8..]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}
