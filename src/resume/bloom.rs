//! Fixed-size bloom filter with SHA-256 double hashing.
//!
//! Probe positions depend only on the key bytes, so a filter restored from
//! disk in a later process answers exactly as the one that was saved.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MIN_BITS: u64 = 64;
const MAX_HASHES: u32 = 32;

/// Probabilistic set membership with no false negatives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: u64,
}

/// Serialized form of a [`BloomFilter`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomSnapshot {
    /// Number of addressable bits
    pub num_bits: u64,
    /// Probes per key
    pub num_hashes: u32,
    /// Distinct keys inserted (approximate: keys that flipped at least one bit)
    pub inserted: u64,
    /// Bit words, little-endian, base64 encoded
    pub bits: String,
}

impl BloomFilter {
    /// Size a filter for `expected_items` keys at the given false-positive rate
    ///
    /// Uses the standard optimum `m = -n ln p / (ln 2)^2`, `k = (m / n) ln 2`.
    pub fn with_rate(expected_items: u64, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(MIN_BITS);
        let num_hashes = ((num_bits as f64 / n) * ln2).round() as u32;

        Self::with_params(num_bits, num_hashes.clamp(1, MAX_HASHES))
    }

    /// Build an empty filter with explicit geometry
    pub fn with_params(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(MIN_BITS);
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes: num_hashes.clamp(1, MAX_HASHES),
            inserted: 0,
        }
    }

    /// Number of addressable bits
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Probes per key
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Keys inserted so far
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Insert a key; returns true if the key was not already (possibly) present
    pub fn insert(&mut self, key: &[u8]) -> bool {
        let mut changed = false;
        for bit in self.probes(key) {
            let (word, mask) = Self::locate(bit);
            if self.bits[word] & mask == 0 {
                self.bits[word] |= mask;
                changed = true;
            }
        }
        if changed {
            self.inserted += 1;
        }
        changed
    }

    /// Whether the key may have been inserted
    pub fn contains(&self, key: &[u8]) -> bool {
        self.probes(key).all(|bit| {
            let (word, mask) = Self::locate(bit);
            self.bits[word] & mask != 0
        })
    }

    /// Expected false-positive rate given the current fill
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.num_hashes as f64;
        let fill = 1.0 - (-k * self.inserted as f64 / self.num_bits as f64).exp();
        fill.powf(k)
    }

    /// Serialize to a snapshot
    pub fn to_snapshot(&self) -> BloomSnapshot {
        let mut bytes = Vec::with_capacity(self.bits.len() * 8);
        for word in &self.bits {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        BloomSnapshot {
            num_bits: self.num_bits,
            num_hashes: self.num_hashes,
            inserted: self.inserted,
            bits: BASE64.encode(bytes),
        }
    }

    /// Rebuild from a snapshot, rejecting inconsistent geometry
    pub fn from_snapshot(snapshot: &BloomSnapshot) -> Result<Self, String> {
        if snapshot.num_bits < MIN_BITS {
            return Err(format!("num_bits {} below minimum", snapshot.num_bits));
        }
        if snapshot.num_hashes == 0 || snapshot.num_hashes > MAX_HASHES {
            return Err(format!("num_hashes {} out of range", snapshot.num_hashes));
        }

        let bytes = BASE64
            .decode(&snapshot.bits)
            .map_err(|e| format!("bad bit data: {e}"))?;
        let words = snapshot.num_bits.div_ceil(64) as usize;
        if bytes.len() != words * 8 {
            return Err(format!(
                "bit data is {} bytes, expected {}",
                bytes.len(),
                words * 8
            ));
        }

        let bits = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();

        Ok(Self {
            bits,
            num_bits: snapshot.num_bits,
            num_hashes: snapshot.num_hashes,
            inserted: snapshot.inserted,
        })
    }

    fn locate(bit: u64) -> (usize, u64) {
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn probes(&self, key: &[u8]) -> impl Iterator<Item = u64> + use<> {
        let digest = Sha256::digest(key);
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(h1);
        // Odd step so successive probes never collapse onto one bit
        let h2 = u64::from_le_bytes(h2) | 1;
        let m = self.num_bits;

        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}
