// crates/manifold-server/src/embeddings/hashed.rs
// Deterministic offline embeddings via token-hash folding

/// Fixed dimension of the hashed backend (matches the small-transformer
/// default the cache format assumes).
const DIMENSIONS: usize = 384;

/// Identifier recorded in the cache. Bump the version whenever the
/// folding scheme changes, so stale vectors are rebuilt.
const MODEL_ID: &str = "hashed-v1-384";

/// Deterministic embeddings with no model and no network.
///
/// Each lowercase token (and each adjacent-token bigram, at half
/// weight) is hashed into one of the vector's buckets with a
/// hash-derived sign, then the vector is L2-normalized. Identical text
/// always folds to identical vectors, which is what the cache
/// invalidation contract and the test suite rely on. Ranking quality
/// is lexical rather than semantic; the remote backends exist for
/// quality.
pub struct HashedEmbeddings;

impl HashedEmbeddings {
    pub fn new() -> Self {
        Self
    }

    pub fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    pub fn model_id(&self) -> &'static str {
        MODEL_ID
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIMENSIONS];
        let tokens: Vec<String> = tokenize(text).collect();

        for token in &tokens {
            fold(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            fold(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        normalize(&mut vector);
        vector
    }
}

impl Default for HashedEmbeddings {
    fn default() -> Self {
        Self::new()
    }
}

fn fold(vector: &mut [f32], feature: &str, weight: f32) {
    let hash = fnv1a(feature.as_bytes());
    let index = (hash % vector.len() as u64) as usize;
    let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
    vector[index] += sign * weight;
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// FNV-1a, 64-bit. std's DefaultHasher is not stable across releases;
/// cached vectors must be.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
