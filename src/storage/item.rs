//! Persistent Item Module
//!
//! The record shape stored in and returned from the persistent tier.

use serde::Serialize;

// == Item ==
/// One persistent entry: manifest metadata plus, when requested, the
/// value bytes.
///
/// Exactly one of `filename` and an inline value is populated on disk.
/// Info-only look-ups leave `value` empty regardless of where the bytes
/// live.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    /// Caller-supplied key.
    pub key: String,
    /// Value bytes; `None` for info-only look-ups.
    pub value: Option<Vec<u8>>,
    /// Name of the backing file under `data/`, when stored externally.
    pub filename: Option<String>,
    /// Byte length of the value.
    pub size: u64,
    /// Unix seconds of the last write.
    pub modification_time: i64,
    /// Unix seconds of the last access; never before
    /// `modification_time`.
    pub last_access_time: i64,
    /// Caller-defined metadata stored alongside the value.
    pub extended_data: Option<Vec<u8>>,
}
