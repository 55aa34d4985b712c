use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::health::HealthState;
use crate::schedule::ScheduledTask;
use crate::state::{DataOrchestrator, EntityKind, RefreshOutcome};

/// Polls every entity kind at its own interval.
///
/// All kinds get a task up front; miner-scoped tasks skip their tick while no
/// address is set, so an address switch is picked up on the next tick.
pub struct Refresher {
    token: CancellationToken,
    tasks: Vec<ScheduledTask>,
}

impl Refresher {
    pub fn start(orchestrator: Arc<DataOrchestrator>, health: Arc<HealthState>) -> Self {
        let token = CancellationToken::new();
        let tasks = EntityKind::ALL
            .into_iter()
            .map(|kind| {
                let orchestrator = orchestrator.clone();
                let health = health.clone();
                ScheduledTask::spawn_with_token(
                    format!("poll-{kind}"),
                    token.child_token(),
                    Duration::ZERO,
                    kind.poll_interval(),
                    move || {
                        let orchestrator = orchestrator.clone();
                        let health = health.clone();
                        async move { poll_once(&orchestrator, &health, kind).await }
                    },
                )
            })
            .collect::<Vec<_>>();

        info!(tasks = tasks.len(), "Refresher started");
        Self { token, tasks }
    }

    /// Stop scheduling new polls. Fetches already running complete.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            task.shutdown().await;
        }
        info!("Refresher stopped");
    }
}

async fn poll_once(orchestrator: &DataOrchestrator, health: &HealthState, kind: EntityKind) {
    let outcome = orchestrator.refresh(kind).await;
    match &outcome {
        RefreshOutcome::NotTracked => return,
        RefreshOutcome::Fresh => debug!(entity = %kind, "Refreshed"),
        RefreshOutcome::FromCache { written_at_ms } => {
            debug!(entity = %kind, written_at_ms, "Serving cached value")
        }
        RefreshOutcome::Failed(_) | RefreshOutcome::Coalesced => {}
    }
    health.record(&outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::fetcher::tests::{api_with, RoutedTransport};
    use crate::types::Target;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn each_kind_polls_on_its_own_interval() {
        let transport = Arc::new(RoutedTransport::default());
        transport.route("/api/pool_info", Ok(json!({"sidechain": {"height": 1}})));
        transport.route("/api/shares", Ok(json!([])));
        transport.route("/api/found_blocks", Ok(json!([])));
        transport.route("/simple/price", Ok(json!({"monero": {"usd": 1.0}})));
        let orchestrator = DataOrchestrator::new(
            api_with(transport.clone()),
            LocalCache::disabled(),
            Target::new("http://pool", None),
        );
        let health = Arc::new(HealthState::new());

        let refresher = Refresher::start(orchestrator.clone(), health.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.requests_to("/api/pool_info"), 1);
        assert_eq!(transport.requests_to("/simple/price"), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.requests_to("/api/pool_info"), 3);
        assert_eq!(transport.requests_to("/simple/price"), 1);
        assert_eq!(health.consecutive_failures(), 0);
        assert!(!orchestrator.status().is_loading);

        refresher.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.requests_to("/api/pool_info"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn miner_tasks_idle_without_address() {
        let transport = Arc::new(RoutedTransport::default());
        let orchestrator = DataOrchestrator::new(
            api_with(transport.clone()),
            LocalCache::disabled(),
            Target::new("http://pool", None),
        );
        let health = Arc::new(HealthState::new());

        let refresher = Refresher::start(orchestrator, health);
        tokio::time::sleep(Duration::from_secs(1)).await;
        refresher.stop();

        assert_eq!(transport.requests_to("/api/miner_info"), 0);
        assert_eq!(transport.requests_to("/api/payouts"), 0);
        refresher.shutdown().await;
    }
}
