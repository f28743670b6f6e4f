//! FlagStore port - feature flag の正本
//!
//! lookup は (key, scope, environment) → 高々 1 件。
//! 型付きの読み出しと既定値は `app::flags::FlagReader` が担う。

use async_trait::async_trait;

use crate::domain::{BobbinError, FeatureFlag, FlagScope, FlagUpdate};

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get(
        &self,
        key: &str,
        scope: &FlagScope,
        environment: &str,
    ) -> Result<Option<FeatureFlag>, BobbinError>;

    /// Insert or overwrite; bumps `version`.
    async fn upsert(&self, update: FlagUpdate) -> Result<FeatureFlag, BobbinError>;

    /// Every flag with `key` in `environment`, all scopes.
    async fn list_key(&self, key: &str, environment: &str)
    -> Result<Vec<FeatureFlag>, BobbinError>;

    async fn list(&self, environment: &str) -> Result<Vec<FeatureFlag>, BobbinError>;
}
