//! Fixed-length face feature vectors and their 512-byte wire encoding.

use thiserror::Error;

/// Number of values in every feature vector.
pub const FEATURE_DIM: usize = 128;

/// Encoded size of a feature vector: 128 little-endian `f32`s.
pub const ENCODED_LEN: usize = FEATURE_DIM * std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VectorError {
    #[error("corrupt vector record: expected {ENCODED_LEN} bytes, got {0}")]
    CorruptRecord(usize),
    #[error("expected {FEATURE_DIM}-dim vector, got {0}")]
    WrongDimension(usize),
}

/// A face encoding produced by the external extractor.
///
/// The length is fixed by the type; there is no way to build a vector with
/// anything other than [`FEATURE_DIM`] values.
#[derive(Clone, PartialEq)]
pub struct FeatureVector {
    values: [f32; FEATURE_DIM],
}

impl FeatureVector {
    pub fn new(values: [f32; FEATURE_DIM]) -> Self {
        Self { values }
    }

    /// Copy a slice into a vector, rejecting any other length.
    pub fn from_slice(values: &[f32]) -> Result<Self, VectorError> {
        let values: [f32; FEATURE_DIM] = values
            .try_into()
            .map_err(|_| VectorError::WrongDimension(values.len()))?;
        Ok(Self { values })
    }

    /// Decode the raw little-endian representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VectorError> {
        if bytes.len() != ENCODED_LEN {
            return Err(VectorError::CorruptRecord(bytes.len()));
        }
        let mut values = [0f32; FEATURE_DIM];
        for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self { values })
    }

    /// Encode as 512 bytes, little-endian. Bit-exact inverse of [`from_bytes`](Self::from_bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODED_LEN);
        for value in &self.values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean (L2) distance between two vectors.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for FeatureVector {
    type Error = VectorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::from_slice(&values)
    }
}

impl std::fmt::Debug for FeatureVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 128 floats drown out every log line they appear in.
        f.debug_struct("FeatureVector")
            .field("head", &&self.values[..4])
            .finish_non_exhaustive()
    }
}
