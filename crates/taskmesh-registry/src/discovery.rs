use crate::info::WorkerInfo;
use crate::registry::WorkerRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskmesh_core::{capability_matches, WorkerStatus};

/// How [`ServiceDiscovery::find_by_capability`] picks among healthy matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// First healthy match.
    #[default]
    Healthy,
    /// First idle healthy match, else the first healthy match.
    LeastLoaded,
}

impl DiscoveryStrategy {
    /// Parse a strategy name; anything unrecognised means `Healthy`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "least_loaded" => Self::LeastLoaded,
            _ => Self::Healthy,
        }
    }
}

/// Read-only lookup facade over a [`WorkerRegistry`].
#[derive(Clone)]
pub struct ServiceDiscovery {
    registry: Arc<WorkerRegistry>,
}

impl ServiceDiscovery {
    /// Lookups over `registry`.
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    /// The registry being searched.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// One healthy worker that handles `capability`, picked by `strategy`.
    pub async fn find_by_capability(
        &self,
        capability: &str,
        strategy: DiscoveryStrategy,
    ) -> Option<WorkerInfo> {
        let mut workers = self.registry.discover_workers(capability, true).await;
        if workers.is_empty() {
            return None;
        }
        let idx = match strategy {
            DiscoveryStrategy::LeastLoaded => workers
                .iter()
                .position(|w| w.status == WorkerStatus::Idle)
                .unwrap_or(0),
            DiscoveryStrategy::Healthy => 0,
        };
        Some(workers.swap_remove(idx))
    }

    /// Healthy workers matching all (`require_all`) or any of `capabilities`.
    pub async fn find_all_by_capabilities(
        &self,
        capabilities: &[String],
        require_all: bool,
    ) -> Vec<WorkerInfo> {
        self.registry
            .get_healthy_workers()
            .await
            .into_iter()
            .filter(|w| {
                let matches = |cap: &String| capability_matches(&w.capabilities, cap);
                if require_all {
                    capabilities.iter().all(matches)
                } else {
                    capabilities.iter().any(matches)
                }
            })
            .collect()
    }

    /// Number of healthy workers that handle `capability`.
    pub async fn available_count(&self, capability: &str) -> usize {
        self.registry.discover_workers(capability, true).await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn populated() -> ServiceDiscovery {
        let reg = Arc::new(WorkerRegistry::default());
        for (id, caps) in [
            ("busy-shell", vec!["shell", "git"]),
            ("idle-shell", vec!["shell"]),
            ("python", vec!["python"]),
        ] {
            reg.register_worker(WorkerInfo::new(id, caps)).await.unwrap();
            // Distinct registration times keep the ordering stable.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        reg.update_load("busy-shell", 1).await;
        ServiceDiscovery::new(reg)
    }

    #[tokio::test]
    async fn test_find_by_capability_strategies() {
        let discovery = populated().await;
        let first = discovery
            .find_by_capability("shell", DiscoveryStrategy::Healthy)
            .await
            .unwrap();
        assert_eq!(first.worker_id, "busy-shell");

        let idle = discovery
            .find_by_capability("shell", DiscoveryStrategy::from_name("least_loaded"))
            .await
            .unwrap();
        assert_eq!(idle.worker_id, "idle-shell");

        assert!(discovery
            .find_by_capability("rust", DiscoveryStrategy::Healthy)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_find_all_intersection_and_union() {
        let discovery = populated().await;
        let caps = vec!["shell".to_string(), "git".to_string()];

        let all = discovery.find_all_by_capabilities(&caps, true).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].worker_id, "busy-shell");

        let any = discovery.find_all_by_capabilities(&caps, false).await;
        assert_eq!(any.len(), 2);
    }

    #[tokio::test]
    async fn test_available_count() {
        let discovery = populated().await;
        assert_eq!(discovery.available_count("shell").await, 2);
        assert_eq!(discovery.available_count("python").await, 1);
        assert_eq!(discovery.available_count("rust").await, 0);
    }

    #[test]
    fn test_unknown_strategy_means_healthy() {
        assert_eq!(DiscoveryStrategy::from_name("random"), DiscoveryStrategy::Healthy);
    }
}
