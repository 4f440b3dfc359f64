//! Errors raised to the caller.
//!
//! Scan-time problems (bad directory names, empty stacks, unparsable flats)
//! are not errors; they are collected as [`crate::ScanIssue`]s.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::position_index::StagePosition;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown stack {position}")]
    UnknownStack { position: StagePosition },

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Flat index {index} out of range ({len} flats in catalog)")]
    UnknownFlat { index: usize, len: usize },

    #[error("Invalid offset {0} um: offsets must be finite")]
    InvalidOffset(f64),

    #[error("Invalid stage position '{0}': expected <x_pos>_<y_pos>")]
    InvalidPosition(String),

    #[error("Invalid flat-file pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to decode plane '{path}': {reason}")]
    PlaneDecode { path: PathBuf, reason: String },

    #[error("TIFF error in '{path}': {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("No image directory contains a valid stack")]
    NoStacks,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration '{path}': {reason}")]
    ConfigParse { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
