use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use noteflow_core::domain::job::{OperationResult, TargetEntity};
use noteflow_core::domain::operation::OperationType;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed to write result to {target}: {message}")]
pub struct WriteError {
    pub target: String,
    pub message: String,
}

/// Writes a finished operation's result back to the note or task it belongs to.
#[async_trait]
pub trait EntityWriter: Send + Sync {
    async fn write_result(
        &self,
        target: &TargetEntity,
        operation: OperationType,
        result: &OperationResult,
    ) -> Result<(), WriteError>;
}

/// Keeps the latest result per (target, operation).
#[derive(Default)]
pub struct InMemoryEntityWriter {
    results: RwLock<HashMap<(TargetEntity, OperationType), OperationResult>>,
}

impl InMemoryEntityWriter {
    pub async fn result_for(
        &self,
        target: &TargetEntity,
        operation: OperationType,
    ) -> Option<OperationResult> {
        self.results.read().await.get(&(target.clone(), operation)).cloned()
    }

    pub async fn written_count(&self) -> usize {
        self.results.read().await.len()
    }
}

#[async_trait]
impl EntityWriter for InMemoryEntityWriter {
    async fn write_result(
        &self,
        target: &TargetEntity,
        operation: OperationType,
        result: &OperationResult,
    ) -> Result<(), WriteError> {
        self.results.write().await.insert((target.clone(), operation), result.clone());
        Ok(())
    }
}
