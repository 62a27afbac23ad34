//! Crate-wide error type.
//!
//! Mirrors the shape of a typical CLI/registry-client error enum: one tag per
//! failure kind the caller might want to discriminate on, a `Display` impl for
//! humans, and a handful of `From` impls at the I/O boundaries so `?` works
//! throughout the pipeline.

use std::fmt;
use std::path::PathBuf;

use crate::oci::Digest;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug)]
pub enum BuildError {
    /// Unknown option, contradictory combination, or unreadable config file.
    InvalidConfig(String),
    /// Context path missing or not a directory.
    ProjectNotFound(PathBuf),
    /// Project manifest present but not parseable.
    ProjectMetadataMissing(String),
    /// No entry point determinable (only reachable with fallbacks disabled).
    NoEntryPoint,
    /// Any filesystem failure.
    IoError { path: PathBuf, cause: String },
    /// Archive-escape attempt in the tar writer.
    UnsafePath(PathBuf),
    /// Tar writer invariant violation: the same archive path added twice.
    DuplicateEntry(PathBuf),
    /// Non-retriable HTTP failure from the registry after retries are exhausted.
    RegistryHttpError { status: u16, endpoint: String },
    /// Credentials exhausted without success for a registry host.
    AuthFailure(String),
    /// Integrity violation: computed digest didn't match the expected one.
    DigestMismatch { expected: Digest, actual: Digest },
    /// An image index had no manifest for the requested platform.
    NoMatchingPlatform { wanted: String, offered: Vec<String> },
    /// The build plan's target platform conflicts with the resolved base image.
    PlatformMismatch { wanted: String, base: String },
    /// Terminal push failure after retries.
    PushFailed(String),
    /// Non-fatal: SBOM generation failed but the build otherwise succeeded.
    SBOMGenerationFailed(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            BuildError::ProjectNotFound(path) => {
                write!(f, "project context not found: {}", path.display())
            }
            BuildError::ProjectMetadataMissing(msg) => {
                write!(f, "project manifest could not be parsed: {msg}")
            }
            BuildError::NoEntryPoint => write!(f, "no entry point could be determined"),
            BuildError::IoError { path, cause } => {
                write!(f, "I/O error at {}: {cause}", path.display())
            }
            BuildError::UnsafePath(path) => {
                write!(f, "archive path escapes the archive root: {}", path.display())
            }
            BuildError::DuplicateEntry(path) => {
                write!(f, "duplicate archive entry: {}", path.display())
            }
            BuildError::RegistryHttpError { status, endpoint } => {
                write!(f, "registry returned {status} for {endpoint}")
            }
            BuildError::AuthFailure(host) => write!(f, "authentication failed for {host}"),
            BuildError::DigestMismatch { expected, actual } => write!(
                f,
                "digest mismatch: expected {expected}, computed {actual}"
            ),
            BuildError::NoMatchingPlatform { wanted, offered } => write!(
                f,
                "no manifest for platform {wanted} (index offered: {})",
                offered.join(", ")
            ),
            BuildError::PlatformMismatch { wanted, base } => write!(
                f,
                "requested platform {wanted} is incompatible with base image platform {base}"
            ),
            BuildError::PushFailed(reason) => write!(f, "push failed: {reason}"),
            BuildError::SBOMGenerationFailed(reason) => {
                write!(f, "SBOM generation failed: {reason}")
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::IoError {
            path: PathBuf::new(),
            cause: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::InvalidConfig(format!("invalid JSON: {err}"))
    }
}

impl From<toml::de::Error> for BuildError {
    fn from(err: toml::de::Error) -> Self {
        BuildError::InvalidConfig(format!("invalid TOML: {err}"))
    }
}

impl From<reqwest::Error> for BuildError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BuildError::RegistryHttpError {
                status: 0,
                endpoint: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            BuildError::PushFailed(err.to_string())
        }
    }
}

impl From<url::ParseError> for BuildError {
    fn from(err: url::ParseError) -> Self {
        BuildError::InvalidConfig(format!("invalid URL: {err}"))
    }
}

/// Attach a path to an I/O error, since `From<io::Error>` alone can't know it.
pub fn io_err(path: impl Into<PathBuf>, cause: std::io::Error) -> BuildError {
    BuildError::IoError {
        path: path.into(),
        cause: cause.to_string(),
    }
}
