//! Error taxonomy for a run.
//!
//! Per-file (`ParseError`, `LoadError`) and per-IP (`ResolutionError`) errors
//! are recoverable: callers turn them into diagnostics on the summary.
//! `ConfigError` and `AnalyzerError::NoValidInput` end the run.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a report document was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseReason {
    MalformedXml,
    MissingRequiredField,
    InvalidCount,
}

impl fmt::Display for ParseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseReason::MalformedXml => "malformed_xml",
            ParseReason::MissingRequiredField => "missing_required_field",
            ParseReason::InvalidCount => "invalid_count",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {detail}")]
pub struct ParseError {
    pub reason: ParseReason,
    pub detail: String,
}

impl ParseError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            reason: ParseReason::MalformedXml,
            detail: detail.into(),
        }
    }

    pub fn missing(field: &str) -> Self {
        Self {
            reason: ParseReason::MissingRequiredField,
            detail: format!("missing <{field}>"),
        }
    }

    pub fn invalid_count(detail: impl Into<String>) -> Self {
        Self {
            reason: ParseReason::InvalidCount,
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open zip archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("no .xml entry in archive {path}")]
    EmptyArchive { path: PathBuf },

    #[error("unsupported file type: {path}")]
    Unsupported { path: PathBuf },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("reverse lookup for {ip} timed out")]
    Timeout { ip: IpAddr },

    #[error("no PTR record for {ip}")]
    NoRecord { ip: IpAddr },

    #[error("reverse lookup for {ip} failed: {message}")]
    Lookup { ip: IpAddr, message: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid time period '{0}' (expected one of 30, 90, 180, 360, all)")]
    InvalidPeriod(String),

    #[error("at least one time period is required")]
    NoPeriods,

    #[error("invalid alignment mode '{0}' (expected relaxed, strict or published)")]
    InvalidAlignmentMode(String),

    #[error("invalid timestamp '{0}' (expected RFC 3339 or YYYY-MM-DD)")]
    InvalidTimestamp(String),

    #[error("input path does not exist: {0}")]
    MissingInput(PathBuf),

    #[error("failed to load public suffix list {path}: {message}")]
    SuffixList { path: PathBuf, message: String },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no valid DMARC reports: {candidates} candidate file(s), {skipped} skipped")]
    NoValidInput { candidates: usize, skipped: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = AnalyzerError> = std::result::Result<T, E>;
