use super::{Embedder, EmbeddingError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Words too common to carry meaning in a bag-of-words vector.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "with",
];

/// Deterministic offline embedder based on signed feature hashing of word tokens.
///
/// Every lower-cased alphanumeric word (minus a small stopword list) is hashed with SHA-256;
/// the digest picks a bucket and a sign. Texts sharing vocabulary therefore land close together
/// under cosine similarity, which is enough for local use and reproducible tests.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Construct an embedder producing vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        for word in terms(text) {
            let digest = Sha256::digest(word.as_bytes());
            let mut bucket_bytes = [0_u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }
        embedding
    }
}

/// Split text into the lower-cased content words used as features.
pub(crate) fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.dimension == 0 {
            return Err(EmbeddingError::InvalidInput(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("no text provided".to_string()));
        }

        let embedding = self.encode(text);
        if embedding.iter().all(|value| *value == 0.0) {
            // Text made only of stopwords or punctuation still needs a usable direction.
            let mut fallback = vec![0.0_f32; self.dimension];
            fallback[0] = 1.0;
            return Ok(fallback);
        }
        Ok(embedding)
    }
}
