//! Handler trait - Task を実行する Handler の定義
//!
//! - `Handler<T>`: 型付きの表層
//! - `DynHandler`: object-safe な内部表現
//! - `TypedHandler<T, H>`: 前者を後者に変換する type erasure

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::{HandlerError, TenantId};

/// Handler は Task を実行して結果 JSON か HandlerError を返す
///
/// Handler は冪等であること。lease 切れで同じ payload が再実行されうる。
///
/// # 使用例
/// ```ignore
/// struct GenerateInvoiceHandler;
///
/// #[async_trait]
/// impl Handler<GenerateInvoice> for GenerateInvoiceHandler {
///     async fn handle(
///         &self,
///         task: GenerateInvoice,
///         tenant_id: &TenantId,
///     ) -> Result<serde_json::Value, HandlerError> {
///         Ok(serde_json::json!({"invoice": task.order_id}))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(
        &self,
        task: T,
        tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納するための形。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError>;

    fn capability(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError> {
        // 形の合わない payload は何度やっても合わない
        let task: T = serde_json::from_value(payload).map_err(|e| {
            HandlerError::permanent(format!("malformed payload for {}: {e}", T::CAPABILITY))
        })?;
        self.handler.handle(task, tenant_id).await
    }

    fn capability(&self) -> &'static str {
        T::CAPABILITY
    }
}
