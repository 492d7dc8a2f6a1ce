//! Host-configurable exclusions from synchronization

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fields and keys that stay on this device
///
/// `fields` strips named local fields from every transported payload of a
/// table. `key_prefixes` keeps whole records local when their primary key starts
/// with one of the prefixes (e.g. cached blobs in the `kv` table).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenyList {
    #[serde(default)]
    fields: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    key_prefixes: BTreeMap<String, BTreeSet<String>>,
}

impl DenyList {
    /// Defaults shipped with the engine: large cached values in the kv table
    pub fn builtin() -> Self {
        Self::default()
            .with_key_prefix("kv", "cache.")
            .with_key_prefix("kv", "blob:")
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid deny-list JSON: {error}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let payload = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&payload)
    }

    #[must_use]
    pub fn with_field(mut self, table: &str, field: &str) -> Self {
        self.fields
            .entry(table.to_string())
            .or_default()
            .insert(field.to_string());
        self
    }

    #[must_use]
    pub fn with_key_prefix(mut self, table: &str, prefix: &str) -> Self {
        self.key_prefixes
            .entry(table.to_string())
            .or_default()
            .insert(prefix.to_string());
        self
    }

    /// Merge host-supplied rules on top of these
    pub fn extend(&mut self, other: Self) {
        for (table, fields) in other.fields {
            self.fields.entry(table).or_default().extend(fields);
        }
        for (table, prefixes) in other.key_prefixes {
            self.key_prefixes.entry(table).or_default().extend(prefixes);
        }
    }

    pub fn denies_field(&self, table: &str, field: &str) -> bool {
        self.fields
            .get(table)
            .is_some_and(|fields| fields.contains(field))
    }

    pub fn denies_key(&self, table: &str, primary_key: &str) -> bool {
        self.key_prefixes
            .get(table)
            .is_some_and(|prefixes| prefixes.iter().any(|prefix| primary_key.starts_with(prefix)))
    }

    /// Tables named by any rule, for startup validation against the registry
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .chain(self.key_prefixes.keys())
            .map(String::as_str)
    }
}
