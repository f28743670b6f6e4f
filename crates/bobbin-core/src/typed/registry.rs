//! FunctionRegistry - capability 名 → Handler
//!
//! - `register::<T, _>(handler)` で型付き Handler を登録
//! - 内部では TypedHandler でラップして `Arc<dyn DynHandler>` として持つ
//! - 起動後は読み取り専用（Arc で worker 間共有）

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;

#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for capability '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let capability = T::CAPABILITY.to_string();
        if self.handlers.contains_key(&capability) {
            return Err(RegistryError::AlreadyRegistered(capability));
        }
        self.handlers
            .insert(capability, Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(capability).cloned()
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.handlers.contains_key(capability)
    }

    /// Registered capability names, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
