use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Version used when a dependency entry leaves the version blank.
const DEFAULT_VERSION: &str = "latest";

/// A sanitized dependency manifest: package name → version range.
///
/// Names are trimmed, blank names dropped, blank versions become `latest`.
/// The map is ordered by package name, so two manifests with the same
/// entries always encode (and fingerprint) identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(BTreeMap<String, String>);

impl Manifest {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut sanitized = BTreeMap::new();
        for (name, version) in entries {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            let version = version.as_ref().trim();
            let version = if version.is_empty() {
                DEFAULT_VERSION
            } else {
                version
            };
            sanitized.insert(name.to_string(), version.to_string());
        }
        Self(sanitized)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Canonical JSON encoding, entries sorted by package name.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Deterministic digest of the manifest.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha1::digest(self.to_canonical_json().as_bytes()))
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Manifest::new(iter)
    }
}
