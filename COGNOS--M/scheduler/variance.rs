//! Identity variance: how far the agent's identity attributes drifted from the
//! baseline captured at wakeup.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use cognos_kernel::{config::IdentityConfig, services::GraphNode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frozen view of the identity attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    /// Snapshot id.
    pub id: Uuid,
    /// Attribute values.
    pub attributes: IndexMap<String, String>,
    /// Capture time.
    pub taken_at: DateTime<Utc>,
}

impl IdentitySnapshot {
    /// Captures `attributes`.
    #[must_use]
    pub fn capture(attributes: IndexMap<String, String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            attributes,
            taken_at: now,
        }
    }
}

/// Result of one variance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceReport {
    /// Baseline compared against.
    pub baseline_snapshot_id: Uuid,
    /// Snapshot taken for this check.
    pub current_snapshot_id: Uuid,
    /// Differing attributes over all attributes present in either snapshot.
    pub variance_ratio: f64,
    /// Whether the ratio is above the threshold.
    pub exceeds_threshold: bool,
    /// Attributes that changed, appeared or disappeared.
    pub differing_attributes: Vec<String>,
    /// When the check ran.
    pub computed_at: DateTime<Utc>,
}

/// Compares two snapshots.
#[must_use]
pub fn compute_variance(
    baseline: &IdentitySnapshot,
    current: &IdentitySnapshot,
    threshold: f64,
    now: DateTime<Utc>,
) -> VarianceReport {
    let keys: BTreeSet<&String> = baseline
        .attributes
        .keys()
        .chain(current.attributes.keys())
        .collect();
    let differing_attributes: Vec<String> = keys
        .iter()
        .filter(|key| baseline.attributes.get(**key) != current.attributes.get(**key))
        .map(|key| (*key).clone())
        .collect();
    #[allow(clippy::cast_precision_loss)]
    let variance_ratio = if keys.is_empty() {
        0.0
    } else {
        differing_attributes.len() as f64 / keys.len() as f64
    };
    VarianceReport {
        baseline_snapshot_id: baseline.id,
        current_snapshot_id: current.id,
        variance_ratio,
        exceeds_threshold: variance_ratio > threshold,
        differing_attributes,
        computed_at: now,
    }
}

/// Baseline plus the live attribute set updated by identity-scope MEMORIZE.
#[derive(Debug, Clone)]
pub struct IdentityTracker {
    baseline: IdentitySnapshot,
    current: IndexMap<String, String>,
}

impl IdentityTracker {
    /// Baseline from the configured identity.
    #[must_use]
    pub fn from_config(identity: &IdentityConfig, now: DateTime<Utc>) -> Self {
        let mut attributes = identity.attributes.clone();
        attributes.insert("name".into(), identity.name.clone());
        Self {
            current: attributes.clone(),
            baseline: IdentitySnapshot::capture(attributes, now),
        }
    }

    /// Baseline snapshot.
    #[must_use]
    pub const fn baseline(&self) -> &IdentitySnapshot {
        &self.baseline
    }

    /// Folds a memorized identity node into the live attributes.
    ///
    /// String values are stored as-is, `null` removes the attribute, anything
    /// else is stored as its JSON text.
    pub fn apply(&mut self, node: &GraphNode) {
        for (key, value) in &node.attributes {
            match value {
                serde_json::Value::Null => {
                    self.current.shift_remove(key);
                }
                serde_json::Value::String(text) => {
                    self.current.insert(key.clone(), text.clone());
                }
                other => {
                    self.current.insert(key.clone(), other.to_string());
                }
            }
        }
    }

    /// Snapshots the live attributes and compares them with the baseline.
    #[must_use]
    pub fn check(&self, threshold: f64, now: DateTime<Utc>) -> VarianceReport {
        let current = IdentitySnapshot::capture(self.current.clone(), now);
        compute_variance(&self.baseline, &current, threshold, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attributes(count: usize) -> IndexMap<String, String> {
        (0..count).map(|i| (format!("trait_{i}"), format!("value_{i}"))).collect()
    }

    #[test]
    fn three_of_thirteen_exceeds_twenty_percent() {
        let now = Utc::now();
        let baseline = IdentitySnapshot::capture(attributes(13), now);
        let mut changed = attributes(13);
        for key in ["trait_0", "trait_4", "trait_9"] {
            changed.insert(key.into(), "shifted".into());
        }
        let current = IdentitySnapshot::capture(changed, now);
        let report = compute_variance(&baseline, &current, 0.20, now);
        assert!((report.variance_ratio - 3.0 / 13.0).abs() < 1e-9);
        assert!(report.exceeds_threshold);
        assert_eq!(report.differing_attributes, vec!["trait_0", "trait_4", "trait_9"]);

        let calm = compute_variance(&baseline, &baseline, 0.20, now);
        assert_eq!(calm.variance_ratio, 0.0);
        assert!(!calm.exceeds_threshold);
    }

    #[test]
    fn tracker_counts_added_and_removed_attributes() {
        let now = Utc::now();
        let identity = IdentityConfig::default();
        let mut tracker = IdentityTracker::from_config(&identity, now);
        assert_eq!(tracker.baseline().attributes.len(), 4);

        let node = GraphNode::new("identity", "identity")
            .with_attribute("tone", json!("playful"))
            .with_attribute("deferral_policy", serde_json::Value::Null)
            .with_attribute("hobby", json!("astronomy"));
        tracker.apply(&node);
        let report = tracker.check(0.5, now);
        assert_eq!(report.differing_attributes.len(), 3);
        assert!((report.variance_ratio - 0.6).abs() < 1e-9);
        assert!(report.exceeds_threshold);
    }
}
