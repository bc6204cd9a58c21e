//! Fingerprint tags per target, supplied by an external collaborator.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

#[async_trait]
pub trait FingerprintProvider: Send + Sync + std::fmt::Debug {
    /// Capability tags known for a target; empty when nothing is known
    async fn fingerprint(&self, target: &str) -> BTreeSet<String>;
}

/// Fingerprints from a fixed table, with fallback tags for unknown targets
#[derive(Debug, Clone, Default)]
pub struct StaticFingerprints {
    by_target: HashMap<String, BTreeSet<String>>,
    fallback: BTreeSet<String>,
}

impl StaticFingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags reported for every target without an explicit entry
    pub fn with_fallback<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target<I, S>(mut self, target: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_target
            .insert(target.into(), tags.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl FingerprintProvider for StaticFingerprints {
    async fn fingerprint(&self, target: &str) -> BTreeSet<String> {
        self.by_target
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
