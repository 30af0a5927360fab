//! Scheduling units and per-range scan options.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::KeyRange;

/// Authorization labels a scan runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Authorizations(BTreeSet<String>);

impl Authorizations {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Authorizations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().cloned().collect::<Vec<_>>().join(",");
        f.write_str(&joined)
    }
}

/// Server-side iterator configuration forwarded to the storage client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IteratorSetting {
    pub priority: u32,
    pub name: String,
    #[serde(default)]
    pub options: Vec<(String, String)>,
}

impl IteratorSetting {
    pub fn new(priority: u32, name: impl Into<String>) -> Self {
        Self {
            priority,
            name: name.into(),
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }
}

/// Column filters and iterators applied to every range of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Column families to fetch; empty means all.
    #[serde(default)]
    pub fetch_families: Vec<Vec<u8>>,
    /// Iterators sorted by priority before being handed to storage.
    #[serde(default)]
    pub iterators: Vec<IteratorSetting>,
}

impl ScanOptions {
    pub fn fetch_family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.fetch_families.push(family.into());
        self
    }

    pub fn add_iterator(mut self, setting: IteratorSetting) -> Self {
        self.iterators.push(setting);
        self.iterators.sort_by_key(|setting| setting.priority);
        self
    }

    /// Returns whether entries in `family` pass the column filter.
    pub fn accepts_family(&self, family: &[u8]) -> bool {
        self.fetch_families.is_empty()
            || self
                .fetch_families
                .iter()
                .any(|wanted| wanted.as_slice() == family)
    }
}

/// One schedulable unit of work.
///
/// `last_known_location` is a best-effort affinity hint and the key for
/// per-server failure accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub table: String,
    pub auths: Authorizations,
    pub ranges: Vec<KeyRange>,
    #[serde(default)]
    pub options: ScanOptions,
    #[serde(default)]
    pub last_known_location: Option<String>,
}

impl Chunk {
    pub fn new(table: impl Into<String>, auths: Authorizations, ranges: Vec<KeyRange>) -> Self {
        Self {
            table: table.into(),
            auths,
            ranges,
            options: ScanOptions::default(),
            last_known_location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.last_known_location = Some(location.into());
        self
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Location label used in logs and failure accounting.
    pub fn location_label(&self) -> &str {
        self.last_known_location.as_deref().unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterators_stay_sorted_by_priority() {
        let options = ScanOptions::default()
            .add_iterator(IteratorSetting::new(30, "filter"))
            .add_iterator(IteratorSetting::new(10, "versions").with_option("max", "1"));
        let names = options
            .iterators
            .iter()
            .map(|setting| setting.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["versions", "filter"]);
    }

    #[test]
    fn empty_family_filter_accepts_everything() {
        let options = ScanOptions::default();
        assert!(options.accepts_family(b"any"));
        let options = options.fetch_family("fi");
        assert!(options.accepts_family(b"fi"));
        assert!(!options.accepts_family(b"tf"));
    }

    #[test]
    fn authorizations_render_sorted() {
        let auths = Authorizations::new(["PUBLIC", "A"]);
        assert_eq!(auths.to_string(), "A,PUBLIC");
        assert!(auths.contains("A"));
    }
}
