//! InMemoryFlagStore - 開発・テスト用の FlagStore

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{BobbinError, FeatureFlag, FlagScope, FlagUpdate};
use crate::ports::{Clock, FlagStore};

type FlagKey = (String, FlagScope, String);

pub struct InMemoryFlagStore {
    flags: Mutex<BTreeMap<FlagKey, FeatureFlag>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryFlagStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::from_flags(clock, Vec::new())
    }

    pub fn from_flags(clock: Arc<dyn Clock>, flags: Vec<FeatureFlag>) -> Self {
        let flags = flags
            .into_iter()
            .map(|f| ((f.key.clone(), f.scope.clone(), f.environment.clone()), f))
            .collect();
        Self {
            flags: Mutex::new(flags),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub async fn export(&self) -> Vec<FeatureFlag> {
        self.flags.lock().await.values().cloned().collect()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), BobbinError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BobbinError::StoreUnavailable("flag store offline".into()))
        }
    }
}

#[async_trait]
impl FlagStore for InMemoryFlagStore {
    async fn get(
        &self,
        key: &str,
        scope: &FlagScope,
        environment: &str,
    ) -> Result<Option<FeatureFlag>, BobbinError> {
        self.ensure_available()?;
        let flags = self.flags.lock().await;
        Ok(flags
            .get(&(key.to_string(), scope.clone(), environment.to_string()))
            .cloned())
    }

    async fn upsert(&self, update: FlagUpdate) -> Result<FeatureFlag, BobbinError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut flags = self.flags.lock().await;
        let key = (
            update.key.clone(),
            update.scope.clone(),
            update.environment.clone(),
        );
        let version = flags.get(&key).map_or(1, |f| f.version + 1);
        let flag = FeatureFlag {
            key: update.key,
            scope: update.scope,
            environment: update.environment,
            value: update.value,
            payload: update.payload,
            reason: update.reason,
            owner: update.owner,
            version,
            updated_at: now,
        };
        flags.insert(key, flag.clone());
        Ok(flag)
    }

    async fn list_key(
        &self,
        key: &str,
        environment: &str,
    ) -> Result<Vec<FeatureFlag>, BobbinError> {
        self.ensure_available()?;
        let flags = self.flags.lock().await;
        Ok(flags
            .values()
            .filter(|f| f.key == key && f.environment == environment)
            .cloned()
            .collect())
    }

    async fn list(&self, environment: &str) -> Result<Vec<FeatureFlag>, BobbinError> {
        self.ensure_available()?;
        let flags = self.flags.lock().await;
        Ok(flags
            .values()
            .filter(|f| f.environment == environment)
            .cloned()
            .collect())
    }
}
