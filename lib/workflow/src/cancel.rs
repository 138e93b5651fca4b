//! Execution cancellation.
//!
//! Cancelling is terminal. Predictions still running for the execution are
//! cancelled at the provider on a best-effort basis, and child executions
//! are cancelled with their parent. Results that arrive afterwards are
//! ignored by the completion handler.

use crate::error::{EngineError, StoreError};
use crate::execution::{ExecutionStatus, NodeStatus};
use crate::store::ExecutionStore;
use genweave_core::ExecutionId;
use genweave_provider::PredictionProvider;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What a cancellation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSummary {
    /// `false` if the execution had already finished.
    pub cancelled: bool,
    pub predictions_cancelled: usize,
    pub children_cancelled: usize,
}

pub struct Canceller {
    store: Arc<dyn ExecutionStore>,
    predictions: Arc<dyn PredictionProvider>,
}

impl Canceller {
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>, predictions: Arc<dyn PredictionProvider>) -> Self {
        Self { store, predictions }
    }

    /// Cancels an execution and every unfinished execution below it.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is unknown or state cannot be
    /// written. Provider failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn cancel_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<CancelSummary, EngineError> {
        let mut summary = CancelSummary::default();
        let mut worklist = vec![execution_id];

        while let Some(id) = worklist.pop() {
            let execution = self.store.find_execution(id).await?;
            if execution.status.is_terminal() {
                continue;
            }
            match self
                .store
                .update_execution_status(id, ExecutionStatus::Cancelled, None)
                .await
            {
                Ok(_) => {}
                Err(StoreError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }

            if id == execution_id {
                summary.cancelled = true;
            } else {
                summary.children_cancelled += 1;
            }
            info!(execution_id = %id, "execution cancelled");

            let in_flight = execution
                .node_results
                .iter()
                .filter(|r| r.status == NodeStatus::Processing)
                .filter_map(|r| r.prediction_id.as_deref());
            for prediction_id in in_flight {
                match self.predictions.cancel(prediction_id).await {
                    Ok(()) => summary.predictions_cancelled += 1,
                    Err(e) => warn!(%prediction_id, error = %e, "failed to cancel prediction"),
                }
            }

            worklist.extend(execution.child_execution_ids.iter().copied());
        }

        Ok(summary)
    }
}
