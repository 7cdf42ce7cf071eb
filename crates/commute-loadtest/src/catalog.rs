//! Workload catalog: the curated transit stops a device can be configured for.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete transit stop a device displays arrivals for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Catalog category (e.g., "cta")
    pub provider: String,

    /// Backend provider identifier (e.g., "cta-subway")
    pub provider_id: String,
    pub line: String,
    pub stop_id: String,

    /// Direction code; empty when the stop id already encodes it
    pub direction: String,
}

impl Target {
    pub fn new(provider: &str, provider_id: &str, line: &str, stop_id: &str, direction: &str) -> Self {
        Self {
            provider: provider.to_string(),
            provider_id: provider_id.to_string(),
            line: line.to_string(),
            stop_id: stop_id.to_string(),
            direction: direction.to_string(),
        }
    }
}

/// Supplies the targets available for each workload category.
pub trait WorkloadCatalog: Send + Sync {
    /// Known category keys.
    fn categories(&self) -> Vec<String>;

    /// Targets for a category, or `None` if the category is unknown.
    fn targets(&self, category: &str) -> Option<&[Target]>;
}

/// In-memory catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticCatalog {
    entries: BTreeMap<String, Vec<Target>>,
}

impl StaticCatalog {
    pub fn new(entries: BTreeMap<String, Vec<Target>>) -> Self {
        Self { entries }
    }

    /// The curated stop lists for the supported transit agencies.
    pub fn transit() -> Self {
        let mut entries = BTreeMap::new();

        let mta = [
            ("A", "A19N"),
            ("A", "A19S"),
            ("L", "L03N"),
            ("L", "L03S"),
            ("1", "127N"),
            ("1", "127S"),
            ("N", "N02N"),
            ("N", "N02S"),
        ]
        .into_iter()
        .map(|(line, stop)| Target::new("mta", "mta-subway", line, stop, ""))
        .collect();
        entries.insert("mta".to_string(), mta);

        let cta = [
            ("Red", "40900", "N"),
            ("Red", "40900", "S"),
            ("Blue", "40380", "S"),
            ("Blue", "40380", "N"),
            ("Brn", "40730", "N"),
            ("Brn", "40730", "S"),
            ("G", "40280", "S"),
            ("G", "40280", "N"),
        ]
        .into_iter()
        .map(|(line, stop, dir)| Target::new("cta", "cta-subway", line, stop, dir))
        .collect();
        entries.insert("cta".to_string(), cta);

        let mbta = [
            ("Red", "place-pktrm", "1"),
            ("Red", "place-pktrm", "0"),
            ("Orange", "place-dwnxg", "0"),
            ("Orange", "place-dwnxg", "1"),
            ("Green-B", "place-kenmore", "0"),
            ("Green-B", "place-kenmore", "1"),
        ]
        .into_iter()
        .map(|(line, stop, dir)| Target::new("mbta", "mbta", line, stop, dir))
        .collect();
        entries.insert("mbta".to_string(), mbta);

        let septa = [
            ("NHSL", "PENN_CENTER", "N"),
            ("NHSL", "PENN_CENTER", "S"),
            ("PAOLI", "30TH_STREET", "E"),
            ("PAOLI", "30TH_STREET", "W"),
        ]
        .into_iter()
        .map(|(line, stop, dir)| Target::new("septa", "septa-rail", line, stop, dir))
        .collect();
        entries.insert("septa".to_string(), septa);

        Self { entries }
    }
}

impl WorkloadCatalog for StaticCatalog {
    fn categories(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn targets(&self, category: &str) -> Option<&[Target]> {
        self.entries.get(category).map(Vec::as_slice)
    }
}
