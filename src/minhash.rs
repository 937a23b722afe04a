//! MinHash signatures and banded LSH over character shingles.
//!
//! A signature is a fixed-length vector of minima over seeded affine
//! permutations of shingle hashes. Signature size and shingle width are
//! fixed at index-build time; a query computed with different parameters
//! does not compare meaningfully, so both build and query paths share
//! one [`MinHasher`] instance.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MERSENNE_PRIME: u64 = (1 << 61) - 1;

// Permutations must agree between index build and every later query,
// including across process restarts, so they derive from a fixed seed.
const PERMUTATION_SEED: u64 = 0x5eed_1dc5;

/// Stable 64-bit FNV-1a. `DefaultHasher` is not guaranteed stable across
/// releases and these hashes are persisted.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Computes MinHash signatures with a fixed permutation set.
#[derive(Debug, Clone)]
pub struct MinHasher {
    signature_size: usize,
    ngram: usize,
    permutations: Vec<(u64, u64)>,
}

impl MinHasher {
    pub fn new(signature_size: usize, ngram: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(PERMUTATION_SEED);
        let permutations = (0..signature_size)
            .map(|_| {
                let a = rng.gen_range(1..MERSENNE_PRIME);
                let b = rng.gen_range(0..MERSENNE_PRIME);
                (a, b)
            })
            .collect();
        Self {
            signature_size,
            ngram,
            permutations,
        }
    }

    pub fn signature_size(&self) -> usize {
        self.signature_size
    }

    /// Character shingles of the lowercased input. A string shorter than
    /// the shingle width yields itself as the single shingle, so short
    /// values still get a usable signature.
    fn shingles(&self, text: &str) -> Vec<u64> {
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();
        if chars.len() < self.ngram {
            return vec![fnv1a64(lowered.as_bytes())];
        }
        chars
            .windows(self.ngram)
            .map(|w| {
                let shingle: String = w.iter().collect();
                fnv1a64(shingle.as_bytes())
            })
            .collect()
    }

    /// MinHash signature: per permutation, the minimum of
    /// `(a*h + b) mod p` over all shingle hashes.
    pub fn signature(&self, text: &str) -> Vec<u64> {
        let shingles = self.shingles(text);
        self.permutations
            .iter()
            .map(|&(a, b)| {
                shingles
                    .iter()
                    .map(|&h| {
                        let v = (a as u128 * h as u128 + b as u128) % MERSENNE_PRIME as u128;
                        v as u64
                    })
                    .min()
                    .unwrap_or(u64::MAX)
            })
            .collect()
    }

    /// Bucket keys for banded LSH: one key per band, hashing the band's
    /// slice of the signature together with the band index.
    pub fn band_keys(&self, signature: &[u64], bands: usize, rows: usize) -> Vec<String> {
        (0..bands)
            .map(|band| {
                let slice = &signature[band * rows..band * rows + rows];
                let mut bytes = Vec::with_capacity(8 + rows * 8);
                bytes.extend_from_slice(&(band as u64).to_le_bytes());
                for &v in slice {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                format!("{band}:{:016x}", fnv1a64(&bytes))
            })
            .collect()
    }
}

/// Exact Jaccard estimate between two signatures: the fraction of equal
/// positions. Signatures of different lengths compare as 0.0.
pub fn jaccard(a: &[u64], b: &[u64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let equal = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    equal as f64 / a.len() as f64
}

/// Pick the `(bands, rows)` split of a signature minimizing weighted
/// false-positive and false-negative probability at the given threshold.
///
/// The probability that two sets with Jaccard similarity `s` share at
/// least one bucket is `1 - (1 - s^rows)^bands`; false positive mass is
/// the integral of that curve below the threshold, false negative mass
/// the integral of its complement above it.
pub fn optimal_band_params(threshold: f64, signature_size: usize) -> (usize, usize) {
    const STEP: f64 = 0.001;

    let mut best = (1, signature_size);
    let mut best_error = f64::MAX;

    for bands in 1..=signature_size {
        let rows = signature_size / bands;
        if rows == 0 || bands * rows > signature_size {
            continue;
        }

        let collide = |s: f64| 1.0 - (1.0 - s.powi(rows as i32)).powi(bands as i32);

        let mut false_pos = 0.0;
        let mut s = 0.0;
        while s < threshold {
            false_pos += collide(s) * STEP;
            s += STEP;
        }

        let mut false_neg = 0.0;
        let mut s = threshold;
        while s < 1.0 {
            false_neg += (1.0 - collide(s)) * STEP;
            s += STEP;
        }

        let error = 0.5 * false_pos + 0.5 * false_neg;
        if error < best_error {
            best_error = error;
            best = (bands, rows);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_self_similarity_is_one() {
        let hasher = MinHasher::new(64, 3);
        for s in ["Marketing", "x", "", "Human Resources", "café"] {
            let sig = hasher.signature(s);
            assert_eq!(jaccard(&sig, &sig), 1.0, "self-similarity for {s:?}");
        }
    }

    #[test]
    fn test_signature_is_deterministic_across_instances() {
        let a = MinHasher::new(100, 3).signature("engineering");
        let b = MinHasher::new(100, 3).signature("engineering");
        assert_eq!(a, b);
    }

    #[test]
    fn test_case_insensitive() {
        let hasher = MinHasher::new(100, 3);
        let a = hasher.signature("Sales");
        let b = hasher.signature("sales");
        assert_eq!(jaccard(&a, &b), 1.0);
    }

    #[test]
    fn test_similar_strings_score_higher_than_dissimilar() {
        let hasher = MinHasher::new(128, 3);
        let base = hasher.signature("marketing department");
        let close = hasher.signature("marketing departmant");
        let far = hasher.signature("quarterly revenue 2024");
        assert!(jaccard(&base, &close) > jaccard(&base, &far));
    }

    #[test]
    fn test_band_params_fit_signature() {
        for &threshold in &[0.01, 0.1, 0.5, 0.9] {
            for &size in &[16usize, 64, 100, 128] {
                let (bands, rows) = optimal_band_params(threshold, size);
                assert!(bands * rows <= size, "threshold={threshold} size={size}");
                assert!(bands >= 1 && rows >= 1);
            }
        }
    }

    #[test]
    fn test_low_threshold_prefers_many_bands() {
        // High-recall bucketing: a very low threshold should pick short
        // rows so near-anything collides into some shared bucket.
        let (bands, rows) = optimal_band_params(0.01, 100);
        assert!(rows <= 2, "got bands={bands} rows={rows}");
    }

    #[test]
    fn test_band_keys_count_matches_bands() {
        let hasher = MinHasher::new(100, 3);
        let sig = hasher.signature("finance");
        let (bands, rows) = optimal_band_params(0.01, 100);
        let keys = hasher.band_keys(&sig, bands, rows);
        assert_eq!(keys.len(), bands);
    }
}
