//! Demo handlers registered by the `bobbin` binary.
//!
//! - `demo.echo.v1`: returns its payload
//! - `demo.hello.v1`: fails a fixed number of times, then greets
//! - `demo.fail.v1`: always fails (transient unless `permanent`)

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bobbin_core::domain::{HandlerError, TenantId};
use bobbin_core::typed::{Handler, RegistryError, Task};
use bobbin_core::AppBuilder;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize)]
pub struct EchoTask {
    pub message: String,
}

impl Task for EchoTask {
    const CAPABILITY: &'static str = "demo.echo.v1";
}

pub struct EchoHandler;

#[async_trait]
impl Handler<EchoTask> for EchoHandler {
    async fn handle(
        &self,
        task: EchoTask,
        tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(json!({ "tenant_id": tenant_id, "message": task.message }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HelloTask {
    pub name: String,
}

impl Task for HelloTask {
    const CAPABILITY: &'static str = "demo.hello.v1";
}

pub struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    pub fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<HelloTask> for HelloHandler {
    async fn handle(
        &self,
        task: HelloTask,
        _tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::transient(format!(
                "intentional failure (left={left})"
            )));
        }
        Ok(json!({ "greeting": format!("Hello, {}!", task.name) }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailTask {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub permanent: bool,
}

impl Task for FailTask {
    const CAPABILITY: &'static str = "demo.fail.v1";
}

pub struct FailHandler;

#[async_trait]
impl Handler<FailTask> for FailHandler {
    async fn handle(
        &self,
        task: FailTask,
        _tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError> {
        let reason = task.reason.unwrap_or_else(|| "demo failure".to_string());
        if task.permanent {
            Err(HandlerError::permanent(reason))
        } else {
            Err(HandlerError::transient(reason))
        }
    }
}

pub fn register(builder: AppBuilder) -> Result<AppBuilder, RegistryError> {
    builder
        .register::<EchoTask, _>(EchoHandler)?
        .register::<HelloTask, _>(HelloHandler::new(2))?
        .register::<FailTask, _>(FailHandler)
}

pub const CAPABILITIES: &[&str] = &[
    EchoTask::CAPABILITY,
    HelloTask::CAPABILITY,
    FailTask::CAPABILITY,
];
