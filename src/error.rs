use serde::Serialize;
use thiserror::Error;

// --- Error Handling ---

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    #[error("No ranges were given.")]
    EmptyRangeSet,
    #[error("Range {index} ({from}-{to}) is outside pages 1-{total}.")]
    RangeOutOfBounds {
        index: usize,
        from: u32,
        to: u32,
        total: u32,
    },
    #[error("Ranges {first} and {second} overlap.")]
    OverlappingRanges { first: usize, second: usize },
    #[error("Pages per chunk must be at least 1.")]
    InvalidChunkSize,
    #[error("Could not resolve page: {0}")]
    PageResolutionFailed(String),
    #[error("Produced PDF failed validation: {0}")]
    MaterializationFailed(String),
    #[error("Export produced no pages.")]
    NoContentProduced,
    #[error("Backend error: {0}")]
    BackendIo(String),
    #[error("PDF capability unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

// Serialize error as a simple string for the frontend
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
