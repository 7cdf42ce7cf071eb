//! Workload distribution across the simulated fleet.

use crate::catalog::{Target, WorkloadCatalog};
use crate::config::{check_distribution, Distribution};
use crate::error::ConfigError;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// The workload a device exercises for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadAssignment {
    pub category: String,
    pub target: Target,
}

/// Returns `count` category keys distributed according to `distribution`.
///
/// Each category gets `floor(pct * count / 100)` slots. The slots lost to
/// integer division are filled by cycling through the categories in key
/// order until `count` is reached. The result is shuffled so position says
/// nothing about creation order.
pub fn assign_categories(
    rng: &mut impl Rng,
    count: usize,
    distribution: &Distribution,
) -> Result<Vec<String>, ConfigError> {
    check_distribution(distribution)?;

    let mut slots = Vec::with_capacity(count);
    for (category, pct) in distribution {
        let share = (*pct as usize * count) / 100;
        slots.extend(std::iter::repeat(category.clone()).take(share));
    }

    // Remainder from integer division
    let mut filler = distribution.keys().cycle();
    while slots.len() < count {
        match filler.next() {
            Some(category) => slots.push(category.clone()),
            None => break,
        }
    }

    slots.shuffle(rng);
    Ok(slots)
}

/// Picks a target for `category` uniformly at random.
pub fn pick_target(
    rng: &mut impl Rng,
    catalog: &dyn WorkloadCatalog,
    category: &str,
) -> Result<Target, ConfigError> {
    let targets = catalog
        .targets(category)
        .ok_or_else(|| ConfigError::UnknownCategory(category.to_string()))?;
    targets
        .choose(rng)
        .cloned()
        .ok_or_else(|| ConfigError::EmptyCategory(category.to_string()))
}

/// Builds one assignment per device.
pub fn assign_workloads(
    rng: &mut impl Rng,
    count: usize,
    distribution: &Distribution,
    catalog: &dyn WorkloadCatalog,
) -> Result<Vec<WorkloadAssignment>, ConfigError> {
    assign_categories(rng, count, distribution)?
        .into_iter()
        .map(|category| {
            let target = pick_target(rng, catalog, &category)?;
            Ok(WorkloadAssignment { category, target })
        })
        .collect()
}
