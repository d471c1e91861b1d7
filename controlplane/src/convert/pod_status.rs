//! Pod → Task status projection.
//!
//! Computes the next task snapshot from a pod observation. The
//! projection honors the monotonicity rule: a task that has reached
//! `STOPPED` is returned unchanged, and an observation that would move
//! the status backwards keeps the stored status.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kecs_shared::ecs::task::{
    ContainerSnapshot, HealthStatus, Task, TaskDesiredStatus, TaskLastStatus, TaskStopCode,
};

/// Pod phase → task last status.
fn status_from_phase(phase: Option<&str>) -> TaskLastStatus {
    match phase {
        Some("Pending") => TaskLastStatus::Pending,
        Some("Running") => TaskLastStatus::Running,
        Some("Succeeded") | Some("Failed") => TaskLastStatus::Stopped,
        // Unknown and absent phases read as PENDING
        _ => TaskLastStatus::Pending,
    }
}

fn snapshot_from_container_status(status: &ContainerStatus) -> ContainerSnapshot {
    use k8s_openapi::api::core::v1::ContainerState;
    let (last_status, exit_code, reason) = match status.state.as_ref() {
        Some(ContainerState {
            running: Some(_), ..
        }) => ("RUNNING".to_string(), None, None),
        Some(ContainerState {
            terminated: Some(terminated),
            ..
        }) => (
            "STOPPED".to_string(),
            Some(terminated.exit_code),
            terminated.reason.clone(),
        ),
        Some(ContainerState {
            waiting: Some(waiting),
            ..
        }) => ("PENDING".to_string(), None, waiting.reason.clone()),
        _ => ("PENDING".to_string(), None, None),
    };
    let health_status = if last_status == "RUNNING" && status.ready {
        HealthStatus::Healthy
    } else if status.restart_count > 0 || exit_code.map(|c| c != 0).unwrap_or(false) {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Unknown
    };
    ContainerSnapshot {
        name: status.name.clone(),
        container_arn: None,
        image: Some(status.image.clone()),
        last_status,
        exit_code,
        reason,
        health_status,
    }
}

/// Aggregate health: HEALTHY when every container is ready, UNHEALTHY
/// when any container restarted or terminated non-zero, UNKNOWN
/// otherwise.
fn aggregate_health(statuses: &[ContainerStatus]) -> HealthStatus {
    if statuses.is_empty() {
        return HealthStatus::Unknown;
    }
    if statuses.iter().all(|s| s.ready) {
        return HealthStatus::Healthy;
    }
    let unhealthy = statuses.iter().any(|s| {
        s.restart_count > 0
            || s.state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .map(|t| t.exit_code != 0)
                .unwrap_or(false)
    });
    if unhealthy {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Unknown
    }
}

/// Compute the next task snapshot for a pod observation.
pub fn project_pod_onto_task(task: &Task, pod: &Pod, now: DateTime<Utc>) -> Task {
    // terminal state: no observation may move a STOPPED task
    if task.is_stopped() {
        return task.clone();
    }

    let mut updated = task.clone();
    let pod_status = pod.status.as_ref();
    let phase = pod_status.and_then(|s| s.phase.as_deref());
    let observed = status_from_phase(phase);

    // skip-but-never-reverse
    if task.last_status.may_advance_to(observed) {
        updated.last_status = observed;
    }

    if let Some(statuses) = pod_status.and_then(|s| s.container_statuses.as_ref()) {
        updated.containers = statuses.iter().map(snapshot_from_container_status).collect();
        updated.health_status = aggregate_health(statuses);
        if let Ok(json) = serde_json::to_string(&updated.containers) {
            updated.containers_json = Some(json);
        }
    }

    if pod.metadata.deletion_timestamp.is_some() {
        updated.desired_status = TaskDesiredStatus::Stopped;
        if updated.stopping_at.is_none() {
            updated.stopping_at = Some(now);
        }
    }

    // image pull window: opened when the task first goes PENDING,
    // closed once it leaves
    if updated.last_status == TaskLastStatus::Pending && updated.pull_started_at.is_none() {
        updated.pull_started_at = Some(now);
    }
    if updated.last_status.ordinal() > TaskLastStatus::Pending.ordinal()
        && updated.pull_started_at.is_some()
        && updated.pull_stopped_at.is_none()
    {
        updated.pull_stopped_at = Some(now);
    }

    if let Some(start_time) = pod_status.and_then(|s| s.start_time.as_ref()) {
        if updated.started_at.is_none()
            && updated.last_status.ordinal() >= TaskLastStatus::Running.ordinal()
        {
            updated.started_at = Some(start_time.0);
        }
    }

    if updated.last_status == TaskLastStatus::Stopped && task.last_status != TaskLastStatus::Stopped
    {
        updated.desired_status = TaskDesiredStatus::Stopped;
        updated.stopped_at = Some(now);
        updated.execution_stopped_at = Some(now);
        if updated.stop_code.is_none() {
            let failed_to_start = task.started_at.is_none() && updated.started_at.is_none();
            let essential_exit = updated
                .containers
                .iter()
                .any(|c| c.exit_code.map(|code| code != 0).unwrap_or(false));
            updated.stop_code = if failed_to_start {
                Some(TaskStopCode::TaskFailedToStart)
            } else if essential_exit {
                Some(TaskStopCode::EssentialContainerExited)
            } else {
                None
            };
        }
        if updated.stopped_reason.is_none() {
            updated.stopped_reason = Some(match phase {
                Some("Failed") => "Essential container in task exited".to_string(),
                _ => "Task stopped".to_string(),
            });
        }
    }

    updated
}
