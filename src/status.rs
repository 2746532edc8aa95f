//! Validates and applies task state transitions from runner callbacks and
//! operator commands; enforces the state machine (§4.2).

use std::sync::Arc;

use tracing::warn;

use crate::error::{FleetError, Result};
use crate::store::TaskStore;
use crate::types::{Task, TaskId, TaskKind, TaskStatus};

/// Every legal (from, to) pair from the §4.2 table, excluding the two
/// conditioned transitions handled separately below.
const TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    (TaskStatus::PendingApproval, TaskStatus::Pending),
    (TaskStatus::PendingApproval, TaskStatus::Rejected),
    (TaskStatus::Pending, TaskStatus::Assigning),
    (TaskStatus::Assigning, TaskStatus::Running),
    (TaskStatus::Assigning, TaskStatus::Pending),
    (TaskStatus::Running, TaskStatus::Paused),
    (TaskStatus::Paused, TaskStatus::Running),
    (TaskStatus::Running, TaskStatus::Completed),
    (TaskStatus::Running, TaskStatus::Failed),
    (TaskStatus::Running, TaskStatus::Killed),
    (TaskStatus::Running, TaskStatus::KilledOom),
    (TaskStatus::Running, TaskStatus::Stopped),
];

/// Whether `from -> to` is legal for a task of the given kind (§4.2).
///
/// One kind-conditioned carve-out exists beyond the flat table: LOST can
/// recover to RUNNING only for VPS tasks (a COMMAND task has no defined
/// recovery path). STOPPED is terminal (§4.2, T1) for both kinds — a
/// "VPS restart" of a stopped task is a fresh submission, not a transition
/// out of STOPPED.
pub fn is_allowed(from: TaskStatus, to: TaskStatus, kind: TaskKind) -> bool {
    if to == TaskStatus::Lost {
        return !from.is_terminal() && from != TaskStatus::Lost;
    }
    if from == TaskStatus::Lost && to == TaskStatus::Running {
        return kind == TaskKind::Vps;
    }
    TRANSITIONS.contains(&(from, to))
}

pub struct StatusAuthority {
    tasks: Arc<TaskStore>,
}

impl StatusAuthority {
    pub fn new(tasks: Arc<TaskStore>) -> Self {
        Self { tasks }
    }

    /// Attempts `from -> to`, re-checking the precondition under the
    /// per-task lock so a stale update loses to a transition that already
    /// landed. Refused transitions are logged and rejected to the caller,
    /// never treated as a fatal error (§4.2, §7).
    pub async fn transition<F>(&self, id: TaskId, to: TaskStatus, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) + Send + 'static,
    {
        self.tasks
            .update(id, move |task| {
                if !is_allowed(task.status, to, task.kind) {
                    warn!(
                        task_id = id,
                        from = %task.status,
                        to = %to,
                        "refused illegal state transition"
                    );
                    return Err(FleetError::Precondition(format!(
                        "illegal transition {:?} -> {:?} for task {}",
                        task.status, to, id
                    )));
                }
                task.status = to;
                mutate(task);
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r2_suspicion_requeue_then_reassign_is_legal() {
        assert!(is_allowed(
            TaskStatus::Pending,
            TaskStatus::Assigning,
            TaskKind::Command
        ));
        assert!(is_allowed(
            TaskStatus::Assigning,
            TaskStatus::Pending,
            TaskKind::Command
        ));
        assert!(is_allowed(
            TaskStatus::Assigning,
            TaskStatus::Running,
            TaskKind::Command
        ));
    }

    #[test]
    fn b3_lost_to_running_only_for_vps() {
        assert!(is_allowed(TaskStatus::Lost, TaskStatus::Running, TaskKind::Vps));
        assert!(!is_allowed(
            TaskStatus::Lost,
            TaskStatus::Running,
            TaskKind::Command
        ));
    }

    #[test]
    fn any_non_terminal_can_go_lost() {
        for s in [
            TaskStatus::PendingApproval,
            TaskStatus::Pending,
            TaskStatus::Assigning,
            TaskStatus::Running,
            TaskStatus::Paused,
        ] {
            assert!(is_allowed(s, TaskStatus::Lost, TaskKind::Command));
        }
    }

    #[test]
    fn terminal_states_never_transition_out() {
        for s in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Killed,
            TaskStatus::KilledOom,
            TaskStatus::Stopped,
            TaskStatus::Rejected,
        ] {
            for t in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Lost] {
                assert!(!is_allowed(s, t, TaskKind::Vps));
            }
        }
    }

    #[test]
    fn unlisted_pairs_are_refused() {
        assert!(!is_allowed(
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskKind::Command
        ));
        assert!(!is_allowed(
            TaskStatus::PendingApproval,
            TaskStatus::Running,
            TaskKind::Command
        ));
    }
}
