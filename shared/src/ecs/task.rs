//! Task entity and its status vocabulary.
//!
//! A task is the ECS projection of a single pod. Its `last_status`
//! advances along a fixed sequence and is never rolled back; once a task
//! reaches `STOPPED` the record is retained forever for post-mortem
//! reads.

use super::KeyValuePair;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Observed task status. The declaration order is the lifecycle order;
/// `ordinal` exposes it so monotonicity is a plain comparison.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskLastStatus {
    #[serde(rename = "PROVISIONING")]
    Provisioning,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ACTIVATING")]
    Activating,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "DEACTIVATING")]
    Deactivating,
    #[serde(rename = "STOPPING")]
    Stopping,
    #[serde(rename = "DEPROVISIONING")]
    Deprovisioning,
    #[serde(rename = "STOPPED")]
    Stopped,
}

impl TaskLastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLastStatus::Provisioning => "PROVISIONING",
            TaskLastStatus::Pending => "PENDING",
            TaskLastStatus::Activating => "ACTIVATING",
            TaskLastStatus::Running => "RUNNING",
            TaskLastStatus::Deactivating => "DEACTIVATING",
            TaskLastStatus::Stopping => "STOPPING",
            TaskLastStatus::Deprovisioning => "DEPROVISIONING",
            TaskLastStatus::Stopped => "STOPPED",
        }
    }

    /// Position in the lifecycle sequence. A transition is legal only
    /// when the ordinal does not decrease.
    pub fn ordinal(&self) -> u8 {
        match self {
            TaskLastStatus::Provisioning => 0,
            TaskLastStatus::Pending => 1,
            TaskLastStatus::Activating => 2,
            TaskLastStatus::Running => 3,
            TaskLastStatus::Deactivating => 4,
            TaskLastStatus::Stopping => 5,
            TaskLastStatus::Deprovisioning => 6,
            TaskLastStatus::Stopped => 7,
        }
    }

    /// Whether moving from `self` to `next` respects the
    /// skip-but-never-reverse rule.
    pub fn may_advance_to(&self, next: TaskLastStatus) -> bool {
        next.ordinal() >= self.ordinal()
    }
}

impl FromStr for TaskLastStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVISIONING" => Ok(TaskLastStatus::Provisioning),
            "PENDING" => Ok(TaskLastStatus::Pending),
            "ACTIVATING" => Ok(TaskLastStatus::Activating),
            "RUNNING" => Ok(TaskLastStatus::Running),
            "DEACTIVATING" => Ok(TaskLastStatus::Deactivating),
            "STOPPING" => Ok(TaskLastStatus::Stopping),
            "DEPROVISIONING" => Ok(TaskLastStatus::Deprovisioning),
            "STOPPED" => Ok(TaskLastStatus::Stopped),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskDesiredStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "STOPPED")]
    Stopped,
}

impl TaskDesiredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskDesiredStatus::Running => "RUNNING",
            TaskDesiredStatus::Stopped => "STOPPED",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStopCode {
    TaskFailedToStart,
    EssentialContainerExited,
    UserInitiated,
    ServiceSchedulerInitiated,
    SpotInterruption,
    TerminationNotice,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchType {
    #[serde(rename = "EC2")]
    Ec2,
    #[serde(rename = "FARGATE")]
    Fargate,
    #[serde(rename = "EXTERNAL")]
    External,
}

impl LaunchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchType::Ec2 => "EC2",
            LaunchType::Fargate => "FARGATE",
            LaunchType::External => "EXTERNAL",
        }
    }
}

impl FromStr for LaunchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EC2" => Ok(LaunchType::Ec2),
            "FARGATE" => Ok(LaunchType::Fargate),
            "EXTERNAL" => Ok(LaunchType::External),
            other => Err(format!("unknown launch type: {}", other)),
        }
    }
}

impl Default for LaunchType {
    fn default() -> Self {
        LaunchType::Fargate
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "UNHEALTHY")]
    Unhealthy,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
}

/// Per-container status snapshot carried on a task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// `PENDING`, `RUNNING` or `STOPPED`
    pub last_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub health_status: HealthStatus,
}

/// Fabricated network attachment recorded for awsvpc tasks. The IDs are
/// synthetic; the underlying network remains the Kubernetes pod network.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    #[serde(rename = "type")]
    pub attachment_type: String,
    pub status: String,
    #[serde(default)]
    pub details: Vec<KeyValuePair>,
}

/// Task entity as persisted in the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_arn: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    pub desired_status: TaskDesiredStatus,
    pub last_status: TaskLastStatus,
    pub launch_type: LaunchType,
    #[serde(default)]
    pub containers: Vec<ContainerSnapshot>,
    /// Stringified JSON of `containers`, retained so describe calls
    /// round-trip the snapshot exactly as it was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers_json: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub connectivity: Connectivity,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_code: Option<TaskStopCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopping_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_instance_arn: Option<String>,
    /// Backing pod, recorded so reconciliation can find the task again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Optimistic concurrency counter, bumped on every store update
    #[serde(default)]
    pub version: i64,
}

impl Task {
    /// Short task ID embedded in the ARN.
    pub fn task_id(&self) -> &str {
        super::arn::resource_id_from_arn(&self.task_arn).unwrap_or(&self.task_arn)
    }

    pub fn is_stopped(&self) -> bool {
        self.last_status == TaskLastStatus::Stopped
    }
}
