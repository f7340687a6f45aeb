use crate::error::{Error, Result};
use crate::services::database::ChecksumSet;
use crate::services::dump::DumpSource;
use serde::Serialize;
use std::collections::BTreeSet;

/// Units that appeared, changed or disappeared between two checksum passes.
///
/// The three sets are pairwise disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub created: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl Diff {
    /// Compare `old` against `new`.
    pub fn compute(old: &ChecksumSet, new: &ChecksumSet) -> Self {
        let mut diff = Diff::default();

        for (unit, checksum) in new.iter() {
            match old.get(unit) {
                None => {
                    diff.created.insert(unit.to_string());
                }
                Some(previous) if previous != checksum => {
                    diff.updated.insert(unit.to_string());
                }
                Some(_) => {}
            }
        }

        diff.deleted = old
            .units()
            .filter(|unit| !new.contains(unit))
            .map(str::to_string)
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Units whose content must be (re)created on the receiving side.
    pub fn to_recreate(&self) -> Vec<String> {
        self.created.union(&self.updated).cloned().collect()
    }

    /// SQL that brings a store holding the old state to the new one: a dump
    /// of every created or updated unit followed by a drop per deleted unit.
    pub async fn generate_sql<D: DumpSource>(&self, dumper: &D) -> Result<String> {
        if self.is_empty() {
            return Err(Error::EmptyDiff);
        }

        let mut sql = String::new();

        let recreate = self.to_recreate();
        if !recreate.is_empty() {
            sql.push_str(&dumper.dump_tables(&recreate).await?);
            sql.push('\n');
        }

        let driver = dumper.driver();
        for unit in &self.deleted {
            sql.push_str(&driver.drop_table_statement(unit));
            sql.push_str(";\n");
        }

        Ok(sql.trim_matches(|c| c == ' ' || c == '\n').to_string())
    }
}
