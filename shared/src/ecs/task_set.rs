//! TaskSet entity.
//!
//! TaskSets share the service Deployment machinery with one extra label
//! dimension. At most one TaskSet per service is primary; the service
//! selector targets primary-labelled pods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StabilityStatus {
    #[serde(rename = "STEADY_STATE")]
    SteadyState,
    #[serde(rename = "STABILIZING")]
    Stabilizing,
    #[serde(rename = "UNSTABLE")]
    Unstable,
}

impl StabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StabilityStatus::SteadyState => "STEADY_STATE",
            StabilityStatus::Stabilizing => "STABILIZING",
            StabilityStatus::Unstable => "UNSTABLE",
        }
    }
}

/// Percentage scale of the parent service's desired count.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scale {
    pub value: f64,
    pub unit: String,
}

impl Default for Scale {
    fn default() -> Self {
        Scale {
            value: 100.0,
            unit: "PERCENT".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSet {
    pub id: String,
    pub task_set_arn: String,
    pub service_arn: String,
    pub cluster_arn: String,
    pub task_definition: String,
    pub scale: Scale,
    /// Replica count computed from the scale against the service's
    /// desired count
    pub computed_desired_count: i32,
    pub stability_status: StabilityStatus,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl TaskSet {
    /// Wire status string: the primary TaskSet reports `PRIMARY`, all
    /// others `ACTIVE`.
    pub fn status_str(&self) -> &'static str {
        if self.primary {
            "PRIMARY"
        } else {
            "ACTIVE"
        }
    }

    /// Replicas for a scale applied to a desired count, rounded up so a
    /// non-zero scale never computes to zero replicas.
    pub fn compute_desired_count(scale: &Scale, service_desired: i32) -> i32 {
        if scale.value <= 0.0 {
            return 0;
        }
        ((f64::from(service_desired) * scale.value) / 100.0).ceil() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_desired_count_rounds_up() {
        let half = Scale {
            value: 50.0,
            unit: "PERCENT".to_string(),
        };
        assert_eq!(2, TaskSet::compute_desired_count(&half, 3));
        assert_eq!(0, TaskSet::compute_desired_count(&half, 0));
        let zero = Scale {
            value: 0.0,
            unit: "PERCENT".to_string(),
        };
        assert_eq!(0, TaskSet::compute_desired_count(&zero, 3));
    }

    #[test]
    fn test_stability_status_wire_values() {
        assert_eq!(
            "\"STEADY_STATE\"",
            serde_json::to_string(&StabilityStatus::SteadyState).unwrap()
        );
    }
}
