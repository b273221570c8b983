use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Availability of a worker, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Ready to accept work.
    #[default]
    Idle,
    /// Executing at least one task.
    Busy,
    /// Missed its heartbeat deadline.
    Offline,
}

/// Liveness of a registered remote worker, derived from heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Heartbeat within the timeout.
    Healthy,
    /// Heartbeat overdue.
    Unhealthy,
    /// No heartbeat observed yet.
    #[default]
    Unknown,
    /// Connection explicitly lost.
    Disconnected,
}

/// Anything the load balancer can choose between.
///
/// Implemented by the in-process `Worker` and by the registry's `WorkerInfo`
/// so both identities can be ranked by the same strategies without being
/// merged into one type.
pub trait DispatchTarget {
    /// Stable identifier used for circuit-breaker bookkeeping.
    fn target_id(&self) -> &str;

    /// Whether this target can run tasks of `task_type`.
    fn has_capability(&self, task_type: &str) -> bool;

    /// Whether a new task could be handed over right now.
    fn can_accept_task(&self) -> bool;

    /// Number of tasks currently executing.
    fn active_task_count(&self) -> usize;

    /// Relative capacity for weighted strategies.
    fn weight(&self) -> f64 {
        1.0
    }
}

impl<T: DispatchTarget + ?Sized> DispatchTarget for &T {
    fn target_id(&self) -> &str {
        (**self).target_id()
    }

    fn has_capability(&self, task_type: &str) -> bool {
        (**self).has_capability(task_type)
    }

    fn can_accept_task(&self) -> bool {
        (**self).can_accept_task()
    }

    fn active_task_count(&self) -> usize {
        (**self).active_task_count()
    }

    fn weight(&self) -> f64 {
        (**self).weight()
    }
}

impl<T: DispatchTarget + ?Sized> DispatchTarget for Arc<T> {
    fn target_id(&self) -> &str {
        (**self).target_id()
    }

    fn has_capability(&self, task_type: &str) -> bool {
        (**self).has_capability(task_type)
    }

    fn can_accept_task(&self) -> bool {
        (**self).can_accept_task()
    }

    fn active_task_count(&self) -> usize {
        (**self).active_task_count()
    }

    fn weight(&self) -> f64 {
        (**self).weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slot {
        id: String,
        active: usize,
    }

    impl DispatchTarget for Slot {
        fn target_id(&self) -> &str {
            &self.id
        }
        fn has_capability(&self, task_type: &str) -> bool {
            crate::capability_matches(&["shell"], task_type)
        }
        fn can_accept_task(&self) -> bool {
            self.active == 0
        }
        fn active_task_count(&self) -> usize {
            self.active
        }
    }

    #[test]
    fn test_arc_delegates() {
        let slot = Arc::new(Slot {
            id: "s1".into(),
            active: 0,
        });
        assert_eq!(slot.target_id(), "s1");
        assert!(slot.has_capability("shell"));
        assert!(!slot.has_capability("web"));
        assert!(slot.can_accept_task());
        assert_eq!(slot.weight(), 1.0);
    }

    #[test]
    fn test_worker_status_wire_name() {
        let json = serde_json::to_string(&WorkerStatus::Offline).unwrap_or_default();
        assert_eq!(json, "\"offline\"");
    }
}
