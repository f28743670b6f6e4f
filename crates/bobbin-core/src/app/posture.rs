//! HealthAggregator - GREEN / YELLOW / RED の導出
//!
//! 読むだけで、タスクや DLQ の状態は変えない。
//! HealthMonitor が一定間隔で再計算し、watch channel で丸ごと公開する。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::flags::FlagReader;
use crate::domain::{Check, CheckStatus, Checks, HealthPosture, OperatingMode, Overall};
use crate::ports::{Clock, DlqStore, TaskStore};

pub const HEALTHY: &str = "system healthy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub queue_backlog: usize,
    pub dlq_backlog: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_backlog: 100,
            dlq_backlog: 10,
        }
    }
}

pub struct HealthAggregator {
    flags: FlagReader,
    tasks: Arc<dyn TaskStore>,
    dlq: Arc<dyn DlqStore>,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,
}

impl HealthAggregator {
    pub fn new(
        flags: FlagReader,
        tasks: Arc<dyn TaskStore>,
        dlq: Arc<dyn DlqStore>,
        clock: Arc<dyn Clock>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            flags,
            tasks,
            dlq,
            clock,
            thresholds,
        }
    }

    /// Compute a fresh posture. Never fails: unreadable inputs degrade it.
    pub async fn compute(&self) -> HealthPosture {
        let now = self.clock.now();
        let mut overall = Overall::Green;
        let mut recommendations = Vec::new();
        let mut raise = |level: Overall, recommendation: String| {
            overall = overall.max(level);
            recommendations.push(recommendation);
        };

        // flags
        let stop = self.flags.emergency_stop_active().await;
        let mode = self.flags.operating_mode().await;
        let agents_enabled = self.flags.agents_enabled().await;
        let otel_enabled = self.flags.observability_enabled().await;

        let flags_readable = stop.is_ok() && mode.is_ok();
        let stop_active = stop.as_ref().map_or(true, |s| *s);
        let mode = mode.unwrap_or_else(|_| OperatingMode::Other("unknown".into()));

        if !flags_readable {
            raise(Overall::Red, "restore feature flag store connectivity".into());
        }
        if stop_active {
            raise(Overall::Red, "disable emergency stop to resume operations".into());
        }

        // database
        let counts = self.tasks.counts(None).await;
        let dlq_backlog = self.dlq.count(None).await;
        let live_workers = self.tasks.live_workers(now).await;
        let reachable = counts.is_ok() && dlq_backlog.is_ok() && live_workers.is_ok();
        if !reachable {
            raise(Overall::Red, "restore task store connectivity".into());
        }

        let live = live_workers.as_ref().map_or(0, Vec::len);
        if reachable && live == 0 {
            raise(Overall::Red, "start at least one worker process".into());
        }

        let backlog = counts.as_ref().map_or(0, |c| c.backlog());
        let dlq_count = dlq_backlog.as_ref().map_or(0, |n| *n);
        let backlog_high = backlog > self.thresholds.queue_backlog;
        let dlq_high = dlq_count > self.thresholds.dlq_backlog;
        if backlog_high {
            raise(
                Overall::Yellow,
                format!(
                    "queue backlog {backlog} exceeds {}: add workers or check handler latency",
                    self.thresholds.queue_backlog
                ),
            );
        }
        if dlq_high {
            raise(
                Overall::Yellow,
                format!(
                    "DLQ backlog {dlq_count} exceeds {}: review, replay or quarantine dead-lettered tasks",
                    self.thresholds.dlq_backlog
                ),
            );
        }
        if flags_readable && !mode.is_full() {
            raise(
                Overall::Yellow,
                format!("operating mode is {mode}: switch autonomy.mode to FULL when ready"),
            );
        }

        let agents_on = agents_enabled.as_ref().map_or(false, |v| *v);
        if !agents_on {
            raise(
                Overall::Yellow,
                "enable agents.autonomousEnabled to resume autonomous workers".into(),
            );
        }
        let otel_on = otel_enabled.as_ref().map_or(false, |v| *v);
        if !otel_on {
            raise(
                Overall::Yellow,
                "enable obs.otelEnabled to restore telemetry export".into(),
            );
        }

        if recommendations.is_empty() {
            recommendations.push(HEALTHY.to_string());
        }

        let flags_status = if !flags_readable || stop_active {
            CheckStatus::Fail
        } else if !mode.is_full() {
            CheckStatus::Warn
        } else {
            CheckStatus::Ok
        };
        let agents_status = if reachable && live == 0 {
            CheckStatus::Fail
        } else if !agents_on {
            CheckStatus::Warn
        } else {
            CheckStatus::Ok
        };
        let database_status = if !reachable {
            CheckStatus::Fail
        } else if backlog_high || dlq_high {
            CheckStatus::Warn
        } else {
            CheckStatus::Ok
        };
        let metrics_status = if otel_on {
            CheckStatus::Ok
        } else {
            CheckStatus::Warn
        };

        let counts = counts.ok();
        HealthPosture {
            timestamp: now,
            overall,
            checks: Checks {
                flags: Check::new(
                    flags_status,
                    json!({
                        "readable": flags_readable,
                        "emergency_stop": stop_active,
                        "mode": mode.to_string(),
                        "environment": self.flags.environment(),
                    }),
                ),
                agents: Check::new(
                    agents_status,
                    json!({
                        "live_workers": live,
                        "autonomous_enabled": agents_on,
                    }),
                ),
                database: Check::new(
                    database_status,
                    json!({
                        "reachable": reachable,
                        "backlog": backlog,
                        "in_flight": counts.map(|c| c.in_flight()),
                        "counts": counts,
                        "dlq_backlog": dlq_count,
                    }),
                ),
                metrics: Check::new(metrics_status, json!({ "otel_enabled": otel_on })),
            },
            recommendations,
        }
    }
}

/// Periodic recomputation, published through a watch channel.
pub struct HealthMonitor {
    rx: watch::Receiver<HealthPosture>,
    join: JoinHandle<()>,
}

impl HealthMonitor {
    /// Compute once, then every `interval` until shutdown.
    pub async fn start(
        aggregator: Arc<HealthAggregator>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let initial = aggregator.compute().await;
        let (tx, rx) = watch::channel(initial);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval の最初の tick は即時なので読み捨てる
            ticker.tick().await;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let posture = aggregator.compute().await;
                        if posture.overall != tx.borrow().overall {
                            tracing::info!(overall = %posture.overall, "health posture changed");
                        }
                        if tx.send(posture).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { rx, join }
    }

    pub fn latest(&self) -> HealthPosture {
        self.rx.borrow().clone()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flag::keys;
    use crate::domain::{FlagScope, NewTask, TaskId, TaskRecord, TenantId, WorkerId};
    use crate::impls::{InMemoryDlqStore, InMemoryFlagStore, InMemoryTaskStore};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    struct Fixture {
        clock: FixedClock,
        tasks: Arc<InMemoryTaskStore>,
        flags: FlagReader,
        aggregator: HealthAggregator,
    }

    async fn healthy() -> Fixture {
        let clock = FixedClock::new(chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let tasks = Arc::new(InMemoryTaskStore::new());
        let flags = FlagReader::new(Arc::new(InMemoryFlagStore::new(shared.clone())), "test");
        flags
            .set_bool(keys::EMERGENCY_STOP, FlagScope::Global, false, "t", "")
            .await
            .unwrap();
        let now = clock.now();
        tasks
            .heartbeat(&WorkerId::new("w1"), now, now + chrono::Duration::seconds(30))
            .await
            .unwrap();
        let aggregator = HealthAggregator::new(
            flags.clone(),
            tasks.clone(),
            Arc::new(InMemoryDlqStore::new()),
            shared,
            HealthThresholds {
                queue_backlog: 2,
                dlq_backlog: 10,
            },
        );
        Fixture {
            clock,
            tasks,
            flags,
            aggregator,
        }
    }

    #[tokio::test]
    async fn green_with_single_healthy_recommendation() {
        let f = healthy().await;
        let posture = f.aggregator.compute().await;
        assert_eq!(posture.overall, Overall::Green);
        assert_eq!(posture.recommendations, vec![HEALTHY.to_string()]);
        assert_eq!(posture.checks.agents.detail["live_workers"], 1);
    }

    #[tokio::test]
    async fn red_when_emergency_stop_active() {
        let f = healthy().await;
        f.flags
            .set_bool(keys::EMERGENCY_STOP, FlagScope::Global, true, "t", "")
            .await
            .unwrap();
        let posture = f.aggregator.compute().await;
        assert_eq!(posture.overall, Overall::Red);
        assert_eq!(posture.checks.flags.status, CheckStatus::Fail);
        assert_eq!(
            posture.recommendations[0],
            "disable emergency stop to resume operations"
        );
    }

    #[tokio::test]
    async fn red_when_store_unreachable() {
        let f = healthy().await;
        f.tasks.set_available(false);
        let posture = f.aggregator.compute().await;
        assert_eq!(posture.overall, Overall::Red);
        assert_eq!(posture.checks.database.status, CheckStatus::Fail);
        assert!(
            posture
                .recommendations
                .contains(&"restore task store connectivity".to_string())
        );
    }

    #[tokio::test]
    async fn red_when_no_live_worker() {
        let f = healthy().await;
        f.clock.advance(chrono::Duration::seconds(31));
        let posture = f.aggregator.compute().await;
        assert_eq!(posture.overall, Overall::Red);
        assert_eq!(posture.checks.agents.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn yellow_on_backlog_and_mode() {
        let f = healthy().await;
        for _ in 0..3 {
            f.tasks
                .insert(TaskRecord::new(
                    TaskId::from_ulid(Ulid::new()),
                    NewTask::new(TenantId::parse("t1").unwrap(), "echo", json!({})),
                    f.clock.now(),
                ))
                .await
                .unwrap();
        }
        f.flags
            .set_mode(&OperatingMode::Partial, "t", "")
            .await
            .unwrap();

        let posture = f.aggregator.compute().await;
        assert_eq!(posture.overall, Overall::Yellow);
        assert_eq!(posture.recommendations.len(), 2);
        assert!(posture.recommendations[0].starts_with("queue backlog 3 exceeds 2"));
        assert!(posture.recommendations[1].contains("PARTIAL"));
    }

    #[tokio::test]
    async fn yellow_when_agents_or_telemetry_disabled() {
        let f = healthy().await;
        f.flags
            .set_bool(keys::AGENTS_ENABLED, FlagScope::Global, false, "t", "")
            .await
            .unwrap();
        f.flags
            .set_bool(keys::OBSERVABILITY_ENABLED, FlagScope::Global, false, "t", "")
            .await
            .unwrap();

        let posture = f.aggregator.compute().await;
        assert_eq!(posture.overall, Overall::Yellow);
        assert_eq!(posture.checks.agents.status, CheckStatus::Warn);
        assert_eq!(posture.checks.metrics.status, CheckStatus::Warn);
        assert_eq!(posture.recommendations.len(), 2);
    }

    #[tokio::test]
    async fn monitor_publishes_initial_posture() {
        let f = healthy().await;
        let (tx, rx) = watch::channel(false);
        let monitor =
            HealthMonitor::start(Arc::new(f.aggregator), Duration::from_secs(60), rx).await;
        assert_eq!(monitor.latest().overall, Overall::Green);

        tx.send(true).unwrap();
        monitor.join().await;
    }
}
