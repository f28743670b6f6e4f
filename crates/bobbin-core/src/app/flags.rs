//! FlagReader - 型付きの flag 読み出し
//!
//! 既定値の規則はここに集める:
//! - emergency stop が無い → 停止中（fail closed）
//! - tenant pause が無い → 稼働
//! - mode が無い → FULL
//! - agents / observability の switch が無い → 有効

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::flag::keys;
use crate::domain::{BobbinError, FeatureFlag, FlagScope, FlagUpdate, OperatingMode, TenantId};
use crate::ports::FlagStore;

#[derive(Clone)]
pub struct FlagReader {
    store: Arc<dyn FlagStore>,
    environment: String,
}

impl FlagReader {
    pub fn new(store: Arc<dyn FlagStore>, environment: impl Into<String>) -> Self {
        Self {
            store,
            environment: environment.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Boolean flag with a default for a missing row (or a non-bool value).
    pub async fn bool_flag(
        &self,
        key: &str,
        scope: &FlagScope,
        default: bool,
    ) -> Result<bool, BobbinError> {
        let flag = self.store.get(key, scope, &self.environment).await?;
        Ok(match flag {
            None => default,
            Some(flag) => flag.as_bool().unwrap_or_else(|| {
                tracing::warn!(key, value = %flag.value, "non-boolean flag value, using default");
                default
            }),
        })
    }

    pub async fn emergency_stop_active(&self) -> Result<bool, BobbinError> {
        self.bool_flag(keys::EMERGENCY_STOP, &FlagScope::Global, true)
            .await
    }

    pub async fn operating_mode(&self) -> Result<OperatingMode, BobbinError> {
        let flag = self
            .store
            .get(keys::OPERATING_MODE, &FlagScope::Global, &self.environment)
            .await?;
        Ok(flag
            .as_ref()
            .and_then(FeatureFlag::as_str)
            .map_or(OperatingMode::Full, OperatingMode::parse))
    }

    pub async fn agents_enabled(&self) -> Result<bool, BobbinError> {
        self.bool_flag(keys::AGENTS_ENABLED, &FlagScope::Global, true)
            .await
    }

    pub async fn observability_enabled(&self) -> Result<bool, BobbinError> {
        self.bool_flag(keys::OBSERVABILITY_ENABLED, &FlagScope::Global, true)
            .await
    }

    pub async fn tenant_paused(&self, tenant_id: &TenantId) -> Result<bool, BobbinError> {
        self.bool_flag(
            keys::TENANT_PAUSED,
            &FlagScope::Tenant(tenant_id.clone()),
            false,
        )
        .await
    }

    /// Every tenant whose pause flag is set to true.
    pub async fn paused_tenants(&self) -> Result<BTreeSet<TenantId>, BobbinError> {
        let flags = self
            .store
            .list_key(keys::TENANT_PAUSED, &self.environment)
            .await?;
        Ok(flags
            .into_iter()
            .filter(|f| f.as_bool() == Some(true))
            .filter_map(|f| f.scope.tenant().cloned())
            .collect())
    }

    pub async fn set_bool(
        &self,
        key: &str,
        scope: FlagScope,
        value: bool,
        owner: &str,
        reason: &str,
    ) -> Result<FeatureFlag, BobbinError> {
        self.store
            .upsert(
                FlagUpdate::new(key, scope, self.environment.clone(), value.into())
                    .owner(owner)
                    .reason(reason),
            )
            .await
    }

    pub async fn set_mode(
        &self,
        mode: &OperatingMode,
        owner: &str,
        reason: &str,
    ) -> Result<FeatureFlag, BobbinError> {
        self.store
            .upsert(
                FlagUpdate::new(
                    keys::OPERATING_MODE,
                    FlagScope::Global,
                    self.environment.clone(),
                    mode.to_string().into(),
                )
                .owner(owner)
                .reason(reason),
            )
            .await
    }

    pub async fn list(&self) -> Result<Vec<FeatureFlag>, BobbinError> {
        self.store.list(&self.environment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryFlagStore;
    use crate::ports::SystemClock;

    fn reader() -> (Arc<InMemoryFlagStore>, FlagReader) {
        let store = Arc::new(InMemoryFlagStore::new(Arc::new(SystemClock)));
        let reader = FlagReader::new(store.clone(), "test");
        (store, reader)
    }

    #[tokio::test]
    async fn missing_emergency_stop_fails_closed() {
        let (_, reader) = reader();
        assert!(reader.emergency_stop_active().await.unwrap());

        reader
            .set_bool(keys::EMERGENCY_STOP, FlagScope::Global, false, "ops", "go")
            .await
            .unwrap();
        assert!(!reader.emergency_stop_active().await.unwrap());
    }

    #[tokio::test]
    async fn defaults_for_optional_flags() {
        let (_, reader) = reader();
        let t1 = TenantId::parse("t1").unwrap();
        assert!(!reader.tenant_paused(&t1).await.unwrap());
        assert_eq!(reader.operating_mode().await.unwrap(), OperatingMode::Full);
        assert!(reader.agents_enabled().await.unwrap());
        assert!(reader.observability_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn paused_tenants_lists_only_true_flags() {
        let (_, reader) = reader();
        let t1 = TenantId::parse("t1").unwrap();
        let t2 = TenantId::parse("t2").unwrap();
        reader
            .set_bool(keys::TENANT_PAUSED, FlagScope::Tenant(t1.clone()), true, "ops", "")
            .await
            .unwrap();
        reader
            .set_bool(keys::TENANT_PAUSED, FlagScope::Tenant(t2.clone()), false, "ops", "")
            .await
            .unwrap();

        let paused = reader.paused_tenants().await.unwrap();
        assert_eq!(paused.into_iter().collect::<Vec<_>>(), vec![t1]);
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let (store, reader) = reader();
        store.set_available(false);
        assert!(reader.emergency_stop_active().await.is_err());
    }

    #[tokio::test]
    async fn mode_round_trips_through_store() {
        let (_, reader) = reader();
        reader
            .set_mode(&OperatingMode::Partial, "ops", "degraded upstream")
            .await
            .unwrap();
        assert_eq!(
            reader.operating_mode().await.unwrap(),
            OperatingMode::Partial
        );
    }
}
