use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by the chip pipeline.
#[derive(Debug, Error)]
pub enum ChipError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("npy write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
    #[error("npy read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),
    #[error("worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("raster error: {0}")]
    Raster(String),
    #[error("encoder error: {0}")]
    Encoder(String),
    #[error("event table error: {0}")]
    EventTable(String),
}

pub type Result<T> = std::result::Result<T, ChipError>;
