use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The index JSON matched none of the known schema versions (v2/v3/v4).
    #[error("unsupported sprite index format")]
    UnsupportedIndexFormat,
    /// The index document is not valid JSON, or a recognized schema failed to decode.
    #[error("sprite index could not be parsed")]
    IndexParse(#[from] serde_json::Error),
    /// A packed vector payload is not valid base64.
    #[error("vector payload could not be decoded")]
    VectorPayload(#[from] base64::DecodeError),
    /// A decoded vector does not have the expected number of elements.
    #[error("vector {index} has {len} elements, index dimension is {dim}")]
    VectorLength {
        index: usize,
        len: usize,
        dim: usize,
    },
    /// The packed vector array does not hold `count * dim` floats.
    #[error("packed vectors hold {len} floats, expected {expected}")]
    VectorCount { len: usize, expected: usize },
    #[error("sprite index is empty")]
    EmptyIndex,
    /// A query vector was searched against an index of a different dimension.
    #[error("query vector has {len} elements, index dimension is {dim}")]
    DimensionMismatch { len: usize, dim: usize },
    /// A previous load of the shared index cache failed.
    #[error("sprite index load failed: {0}")]
    IndexLoad(String),
    #[error("tile encoder failed: {0}")]
    Encoder(String),
    #[error("analysis cancelled")]
    Cancelled,
    /// Error decoding or writing an image
    #[error("image error")]
    Image(#[from] image::error::ImageError),
    #[error("i/o error")]
    Io(#[from] io::Error),
}
