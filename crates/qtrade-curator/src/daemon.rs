use std::sync::Arc;
use std::time::Duration;

use qtrade_models::config::ConsolidationConfig;
use qtrade_models::memory::ConsolidationReport;
use qtrade_vault::{MemoryVault, VaultError};
use tokio_util::sync::CancellationToken;

use crate::config::CuratorConfig;
use crate::error::CuratorError;

/// The curator daemon. Replays auto-apply memories on start, then runs
/// consolidation on an interval until cancelled.
pub struct Daemon {
    config: CuratorConfig,
    vault: Arc<MemoryVault>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(config: CuratorConfig, vault: Arc<MemoryVault>) -> Self {
        Self {
            config,
            vault,
            cancel: CancellationToken::new(),
        }
    }

    /// Returns a CancellationToken that can be used to trigger shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the daemon until cancelled.
    pub async fn run(&self) -> Result<(), CuratorError> {
        tracing::info!(
            interval_seconds = self.config.interval_seconds,
            "qtrade curator starting"
        );

        if self.config.replay_on_start {
            let reports = self.vault.replay_auto_apply().await?;
            let changes: usize = reports.iter().map(|r| r.changes.len()).sum();
            tracing::info!(replayed = reports.len(), changes, "Replayed auto-apply memories");
        }

        let mut join_set = tokio::task::JoinSet::new();
        {
            let vault = self.vault.clone();
            let policy = self.config.consolidation.clone();
            let interval = Duration::from_secs(self.config.interval_seconds);
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                consolidation_loop(vault, policy, interval, cancel).await;
            });
        }

        while join_set.join_next().await.is_some() {}

        tracing::info!("qtrade curator stopped");
        Ok(())
    }
}

/// Consolidate every `interval` until `cancel` fires.
pub async fn consolidation_loop(
    vault: Arc<MemoryVault>,
    policy: ConsolidationConfig,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Consolidation loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                run_consolidation(&vault, &policy).await;
            }
        }
    }
}

/// One consolidation pass. Failures are logged and the loop carries on.
pub async fn run_consolidation(
    vault: &MemoryVault,
    policy: &ConsolidationConfig,
) -> Option<ConsolidationReport> {
    match vault.consolidate(policy).await {
        Ok(report) => {
            if report.deduplicated + report.pruned + report.strengthened > 0 {
                tracing::info!(
                    groups = report.groups,
                    deduplicated = report.deduplicated,
                    pruned = report.pruned,
                    strengthened = report.strengthened,
                    promoted = report.promoted,
                    elapsed_ms = report.elapsed_ms,
                    "Consolidated vault"
                );
            } else {
                tracing::debug!(groups = report.groups, "Consolidation found nothing to do");
            }
            Some(report)
        }
        Err(VaultError::ConsolidationConflict) => {
            tracing::warn!("Skipping consolidation: another pass is running");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Consolidation failed");
            None
        }
    }
}
