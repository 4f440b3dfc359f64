//! Non-fatal problems found while scanning and matching.

use std::fmt::Write;
use std::path::PathBuf;

use thiserror::Error;

use crate::position_index::StagePosition;

/// A skipped or degraded entry. The session continues with a partial mosaic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanIssue {
    #[error("Image directory '{path}' skipped: {reason}")]
    UnreadableRoot { path: PathBuf, reason: String },

    #[error("Malformed stack directory '{path}': {reason}")]
    MalformedPath { path: PathBuf, reason: String },

    #[error("Stack directory '{path}' contains no z-plane files")]
    EmptyStack { path: PathBuf },

    #[error("Flat file '{path}' skipped: {reason}")]
    UnparsableFlat { path: PathBuf, reason: String },

    #[error("No flat within {tolerance_microns} um of stack {position}, flat correction disabled")]
    UnmatchedFlat {
        position: StagePosition,
        /// Distance to the nearest flat in microns, if the catalog is not empty.
        nearest_microns: Option<f64>,
        tolerance_microns: f64,
    },

    #[error("Flat-file pattern '{pattern}' matched no files, all stacks uncorrected")]
    GlobExpansion { pattern: String },

    #[error("Stack {position} in '{path}' not shown: position already supplied by '{existing}'")]
    DuplicateStack {
        position: StagePosition,
        path: PathBuf,
        existing: PathBuf,
    },
}

impl ScanIssue {
    fn kind(&self) -> &'static str {
        match self {
            ScanIssue::UnreadableRoot { .. } => "unreadable image directory",
            ScanIssue::MalformedPath { .. } => "malformed path",
            ScanIssue::EmptyStack { .. } => "empty stack",
            ScanIssue::UnparsableFlat { .. } => "unparsable flat",
            ScanIssue::UnmatchedFlat { .. } => "unmatched stack",
            ScanIssue::GlobExpansion { .. } => "empty flat pattern",
            ScanIssue::DuplicateStack { .. } => "duplicate stack",
        }
    }
}

/// Collected scan issues in discovery order.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    issues: Vec<ScanIssue>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an issue and logs it.
    pub fn push(&mut self, issue: ScanIssue) {
        tracing::warn!("{issue}");
        self.issues.push(issue);
    }

    pub(crate) fn extend_quiet(&mut self, issues: Vec<ScanIssue>) {
        self.issues.extend(issues);
    }

    pub fn issues(&self) -> &[ScanIssue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// One line per issue kind with its count, followed by every issue.
    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            return "No scan issues".to_string();
        }

        let mut counts: Vec<(&'static str, usize)> = Vec::new();
        for issue in &self.issues {
            match counts.iter_mut().find(|(kind, _)| *kind == issue.kind()) {
                Some((_, count)) => *count += 1,
                None => counts.push((issue.kind(), 1)),
            }
        }

        let mut out = format!("{} scan issue(s):", self.issues.len());
        for (kind, count) in counts {
            let _ = write!(out, " {kind}: {count};");
        }
        for issue in &self.issues {
            let _ = write!(out, "\n  - {issue}");
        }
        out
    }
}
