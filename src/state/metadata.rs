//! Cluster metadata: the persisted, versioned part of `ClusterState`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether an index is accepting operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Open,
    Close,
}

/// Metadata for a single index (supplemented per SPEC_FULL §3 — the
/// distilled spec names `IndexMetaData` but not its fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetaData {
    pub name: String,
    pub state: IndexState,
    pub settings_version: u64,
}

impl IndexMetaData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: IndexState::Open,
            settings_version: 1,
        }
    }
}

/// Immutable, versioned cluster metadata (spec §3).
///
/// `version` increases only when persisted content actually changes —
/// callers must not bump it speculatively; the Update Executor does that
/// exactly once per successful CAS persist (spec §4.5 step 3a).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub version: u64,
    pub cluster_uuid: String,
    pub indices: BTreeMap<String, IndexMetaData>,
}

impl MetaData {
    pub fn new(cluster_uuid: impl Into<String>) -> Self {
        Self {
            version: 0,
            cluster_uuid: cluster_uuid.into(),
            indices: BTreeMap::new(),
        }
    }

    pub fn generate_cluster_uuid() -> String {
        Uuid::new_v4().to_string()
    }

    /// Returns a copy with `index` inserted/replaced.
    pub fn with_index(&self, index: IndexMetaData) -> Self {
        let mut indices = self.indices.clone();
        indices.insert(index.name.clone(), index);
        Self {
            version: self.version,
            cluster_uuid: self.cluster_uuid.clone(),
            indices,
        }
    }

    /// Returns a copy with `name` removed.
    pub fn without_index(&self, name: &str) -> Self {
        let mut indices = self.indices.clone();
        indices.remove(name);
        Self {
            version: self.version,
            cluster_uuid: self.cluster_uuid.clone(),
            indices,
        }
    }

    /// Returns a copy with `version` bumped by one. Called by the Update
    /// Executor only, immediately before a successful CAS persist.
    pub fn with_bumped_version(&self) -> Self {
        Self {
            version: self.version + 1,
            cluster_uuid: self.cluster_uuid.clone(),
            indices: self.indices.clone(),
        }
    }

    /// The fixed "persisted" serialisation used to compare `prev`/`next`
    /// metadata for changes (spec §4.5 step 3). Deliberately excludes
    /// `version` itself — otherwise every task would look like a change.
    pub fn persisted_digest(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Persisted<'a> {
            cluster_uuid: &'a str,
            indices: &'a BTreeMap<String, IndexMetaData>,
        }
        serde_json::to_string(&Persisted {
            cluster_uuid: &self.cluster_uuid,
            indices: &self.indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_ignores_version() {
        let a = MetaData::new("uuid-1");
        let b = a.with_bumped_version();
        assert_eq!(a.persisted_digest().unwrap(), b.persisted_digest().unwrap());
    }

    #[test]
    fn digest_changes_with_indices() {
        let a = MetaData::new("uuid-1");
        let b = a.with_index(IndexMetaData::new("logs"));
        assert_ne!(a.persisted_digest().unwrap(), b.persisted_digest().unwrap());
    }

    #[test]
    fn without_index_removes_entry() {
        let a = MetaData::new("uuid-1").with_index(IndexMetaData::new("logs"));
        let b = a.without_index("logs");
        assert!(b.indices.is_empty());
    }
}
