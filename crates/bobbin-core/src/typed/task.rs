//! Task trait - 型付き Task の定義
//!
//! payload の型と capability 名を 1 対 1 で結びつける。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Capability, NewTask, TenantId};

/// Task は capability 名と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct GenerateInvoice {
///     order_id: String,
/// }
///
/// impl Task for GenerateInvoice {
///     const CAPABILITY: &'static str = "billing.invoice.generate.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 時に JSON payload にするため
/// - `DeserializeOwned`: worker 側で payload から復元するため
/// - `Send + Sync + 'static`: Arc に入れて複数の worker から使うため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// capability 名
    ///
    /// # 命名規約
    /// - `{domain}.{action}` または `{domain}.{action}.v{major}`
    const CAPABILITY: &'static str;

    fn capability() -> Capability {
        Capability::new(Self::CAPABILITY)
    }

    /// Build the enqueue request for this payload.
    fn into_new_task(self, tenant_id: TenantId) -> Result<NewTask, serde_json::Error> {
        let payload = serde_json::to_value(&self)?;
        Ok(NewTask::new(tenant_id, Self::capability(), payload))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::InvoiceTask;
    use super::*;

    #[test]
    fn into_new_task_carries_capability_and_payload() {
        let task = InvoiceTask { value: 7 }
            .into_new_task(TenantId::parse("t1").unwrap())
            .unwrap();
        assert_eq!(task.capability.as_str(), "billing.invoice.generate.v1");
        assert_eq!(task.payload, serde_json::json!({"value": 7}));
        assert_eq!(task.tenant_id.as_str(), "t1");
    }
}
