//! Error types for playlist and guide parsing

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Parse and fetch failures.
///
/// Malformed single records (a broken timestamp, a non-integer
/// `catchup-days`) are never errors: they are logged and replaced with a
/// documented default.
#[derive(Debug, Error)]
pub enum Error {
    /// Structurally invalid playlist, guide or archive. Fatal for the
    /// parse call it came from.
    #[error("{0}")]
    Format(String),

    /// Source unreachable, timed out or unreadable. Fatal for that
    /// source only.
    #[error("{0}")]
    Fetch(String),
}
