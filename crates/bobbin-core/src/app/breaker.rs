//! CircuitBreaker - claim の前段のゲート
//!
//! - global emergency stop → 全 tenant で claim 不可
//! - tenant pause → その tenant だけ claim 不可
//! - flag が読めない → claim 不可（fail closed）
//!
//! 毎回 flag を読むので、flag の変更は次の claim から効く（再起動不要）。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use super::flags::FlagReader;
use crate::domain::flag::keys;
use crate::domain::{AuditAction, AuditEvent, BobbinError, FeatureFlag, FlagScope, TenantId};
use crate::ports::{Clock, EventSink};

/// Point-in-time view of the gate, evaluated inside the atomic claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub emergency_stop: bool,
    pub paused: BTreeSet<TenantId>,
}

impl BreakerSnapshot {
    /// Everything blocked.
    pub fn closed() -> Self {
        Self {
            emergency_stop: true,
            paused: BTreeSet::new(),
        }
    }

    pub fn allows(&self, tenant_id: &TenantId) -> bool {
        !self.emergency_stop && !self.paused.contains(tenant_id)
    }
}

pub struct CircuitBreaker {
    flags: FlagReader,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(flags: FlagReader, events: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            flags,
            events,
            clock,
        }
    }

    pub fn flags(&self) -> &FlagReader {
        &self.flags
    }

    pub async fn allowed_to_claim(&self, tenant_id: &TenantId) -> bool {
        let stopped = match self.flags.emergency_stop_active().await {
            Ok(stopped) => stopped,
            Err(e) => {
                tracing::warn!(error = %e, "emergency stop unreadable, blocking claims");
                return false;
            }
        };
        if stopped {
            return false;
        }
        match self.flags.tenant_paused(tenant_id).await {
            Ok(paused) => !paused,
            Err(e) => {
                tracing::warn!(error = %e, tenant_id = %tenant_id, "tenant pause unreadable, blocking claims");
                false
            }
        }
    }

    /// Read the global flag and every tenant pause once.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let emergency_stop = match self.flags.emergency_stop_active().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "emergency stop unreadable, blocking claims");
                return BreakerSnapshot::closed();
            }
        };
        if emergency_stop {
            return BreakerSnapshot::closed();
        }
        match self.flags.paused_tenants().await {
            Ok(paused) => BreakerSnapshot {
                emergency_stop,
                paused,
            },
            Err(e) => {
                tracing::warn!(error = %e, "tenant pauses unreadable, blocking claims");
                BreakerSnapshot::closed()
            }
        }
    }

    pub async fn set_emergency_stop(
        &self,
        active: bool,
        actor: &str,
        reason: &str,
    ) -> Result<FeatureFlag, BobbinError> {
        let flag = self
            .flags
            .set_bool(keys::EMERGENCY_STOP, FlagScope::Global, active, actor, reason)
            .await?;

        let action = if active {
            AuditAction::EmergencyStop
        } else {
            AuditAction::Resume
        };
        if active {
            tracing::warn!(actor, reason, version = flag.version, "emergency stop activated");
        } else {
            tracing::info!(actor, reason, version = flag.version, "emergency stop cleared");
        }
        self.audit(
            AuditEvent::new(action, self.clock.now(), actor, reason).details(json!({
                "environment": flag.environment,
                "version": flag.version,
            })),
        )
        .await;
        Ok(flag)
    }

    pub async fn set_tenant_paused(
        &self,
        tenant_id: &TenantId,
        paused: bool,
        actor: &str,
        reason: &str,
    ) -> Result<FeatureFlag, BobbinError> {
        let flag = self
            .flags
            .set_bool(
                keys::TENANT_PAUSED,
                FlagScope::Tenant(tenant_id.clone()),
                paused,
                actor,
                reason,
            )
            .await?;

        let action = if paused {
            AuditAction::Pause
        } else {
            AuditAction::Unpause
        };
        tracing::info!(tenant_id = %tenant_id, paused, actor, "tenant pause updated");
        self.audit(
            AuditEvent::new(action, self.clock.now(), actor, reason)
                .tenant(tenant_id.clone())
                .details(json!({ "version": flag.version })),
        )
        .await;
        Ok(flag)
    }

    // flag が正本。監査の失敗で操作は巻き戻さない
    async fn audit(&self, event: AuditEvent) {
        let action = event.action.as_str();
        if let Err(e) = self.events.emit(event).await {
            tracing::error!(action, error = %e, "failed to record audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryFlagStore, MemoryEventSink};
    use crate::ports::SystemClock;

    struct Fixture {
        store: Arc<InMemoryFlagStore>,
        events: Arc<MemoryEventSink>,
        breaker: CircuitBreaker,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryFlagStore::new(clock.clone()));
        let events = Arc::new(MemoryEventSink::new());
        let breaker = CircuitBreaker::new(
            FlagReader::new(store.clone(), "test"),
            events.clone(),
            clock,
        );
        Fixture {
            store,
            events,
            breaker,
        }
    }

    fn tenant(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn blocks_everyone_until_stop_is_cleared() {
        let f = fixture();
        assert!(!f.breaker.allowed_to_claim(&tenant("t1")).await);

        f.breaker
            .set_emergency_stop(false, "ops", "all clear")
            .await
            .unwrap();
        assert!(f.breaker.allowed_to_claim(&tenant("t1")).await);

        f.breaker
            .set_emergency_stop(true, "ops", "incident 42")
            .await
            .unwrap();
        assert!(!f.breaker.allowed_to_claim(&tenant("t1")).await);
        assert!(!f.breaker.snapshot().await.allows(&tenant("t2")));
    }

    #[tokio::test]
    async fn pause_blocks_only_that_tenant() {
        let f = fixture();
        f.breaker.set_emergency_stop(false, "ops", "").await.unwrap();
        f.breaker
            .set_tenant_paused(&tenant("t1"), true, "ops", "maintenance")
            .await
            .unwrap();

        assert!(!f.breaker.allowed_to_claim(&tenant("t1")).await);
        assert!(f.breaker.allowed_to_claim(&tenant("t2")).await);

        let snap = f.breaker.snapshot().await;
        assert!(!snap.allows(&tenant("t1")));
        assert!(snap.allows(&tenant("t2")));
    }

    #[tokio::test]
    async fn unreadable_flags_block_claims() {
        let f = fixture();
        f.breaker.set_emergency_stop(false, "ops", "").await.unwrap();
        f.store.set_available(false);

        assert!(!f.breaker.allowed_to_claim(&tenant("t1")).await);
        assert_eq!(f.breaker.snapshot().await, BreakerSnapshot::closed());
    }

    #[tokio::test]
    async fn stop_and_resume_are_audited() {
        let f = fixture();
        f.breaker
            .set_emergency_stop(true, "alice", "runaway costs")
            .await
            .unwrap();
        f.breaker
            .set_emergency_stop(false, "alice", "fixed")
            .await
            .unwrap();

        let events = f.events.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, AuditAction::EmergencyStop);
        assert_eq!(events[0].reason, "runaway costs");
        assert_eq!(events[0].actor, "alice");
        assert_eq!(events[1].action, AuditAction::Resume);
        assert_eq!(events[1].details["version"], 2);
    }
}
