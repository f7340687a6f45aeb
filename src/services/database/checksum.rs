//! Per-unit content checksums of a store.
//!
//! Each unit (table) hashes to one aggregate over the concatenation of all
//! its rows, in whatever order the store returns them. That order is not
//! guaranteed to be stable across engines or even across query plans, so a
//! changed checksum is a strong hint of a content change, not a proof.
//!
//! MySQL builds the aggregate with `GROUP_CONCAT`, whose result can be no
//! larger than the server's `max_allowed_packet`. A table past that size
//! cannot be checksummed and reports [`Error::ChecksumOverflow`] instead of
//! a truncated hash.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;

/// Checksum of a unit with no rows.
pub const EMPTY_CHECKSUM: &str = "";

/// A store connection that can enumerate and hash its units.
///
/// Implementations are opened once and reused across collections.
pub trait ChecksumSource: Send + Sync {
    fn list_units(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn unit_checksum(&self, unit: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Unit name to checksum, for one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet(HashMap<String, String>);

impl ChecksumSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unit: &str) -> Option<&str> {
        self.0.get(unit).map(String::as_str)
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.0.contains_key(unit)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ChecksumSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Hash every unit of `source`. All or nothing: the first failing unit
/// aborts the pass with an error naming it.
pub async fn collect<S: ChecksumSource>(source: &S) -> Result<ChecksumSet> {
    let units = source
        .list_units()
        .await
        .map_err(|e| Error::collection(None, e))?;

    let mut checksums = HashMap::with_capacity(units.len());
    for unit in units {
        let checksum = source
            .unit_checksum(&unit)
            .await
            .map_err(|e| Error::collection(Some(unit.as_str()), e))?;
        checksums.insert(unit, checksum);
    }

    tracing::debug!("Collected checksums for {} units", checksums.len());
    Ok(ChecksumSet(checksums))
}
