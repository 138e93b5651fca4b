//! Execution state in Postgres.
//!
//! Every mutation locks the execution row (`SELECT ... FOR UPDATE`), applies
//! the same [`Execution`] methods the in-memory store uses, and writes the
//! changed columns and node results back in one transaction.

use super::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genweave_core::{ExecutionId, NodeId, WorkflowId};
use genweave_workflow::{
    DispatchMode, Execution, ExecutionStatus, ExecutionStore, NodeResult, NodeResultUpdate,
    NodeStatus, PendingNode, StoreError,
};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use std::str::FromStr;

const EXECUTION_COLUMNS: &str = r#"
    id, workflow_id, status, started_at, completed_at, error, total_cost, pending_nodes,
    parent_execution_id, parent_node_id, child_execution_ids, depth, dispatch_mode,
    created_at, updated_at
"#;

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::StorageFailed {
        message: e.to_string(),
    }
}

/// Row type for execution queries.
#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    workflow_id: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    total_cost: f64,
    pending_nodes: Json<Vec<PendingNode>>,
    parent_execution_id: Option<String>,
    parent_node_id: Option<String>,
    child_execution_ids: Json<Vec<ExecutionId>>,
    depth: i32,
    dispatch_mode: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    fn try_into_execution(self, node_results: Vec<NodeResult>) -> Result<Execution, sqlx::Error> {
        let id = ExecutionId::from_str(&self.id)
            .map_err(|e| decode_error("execution id", &self.id, e))?;
        let workflow_id = WorkflowId::from_str(&self.workflow_id)
            .map_err(|e| decode_error("workflow id", &self.workflow_id, e))?;
        let status = ExecutionStatus::from_str(&self.status)
            .map_err(|e| decode_error("execution status", &self.status, e))?;
        let dispatch_mode = DispatchMode::from_str(&self.dispatch_mode)
            .map_err(|e| decode_error("dispatch mode", &self.dispatch_mode, e))?;
        let parent_execution_id = self
            .parent_execution_id
            .map(|pid| {
                ExecutionId::from_str(&pid).map_err(|e| decode_error("execution id", &pid, e))
            })
            .transpose()?;
        let depth = u32::try_from(self.depth)
            .map_err(|e| decode_error("depth", &self.depth.to_string(), e))?;

        Ok(Execution {
            id,
            workflow_id,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
            total_cost: self.total_cost,
            node_results,
            pending_nodes: self.pending_nodes.0,
            parent_execution_id,
            parent_node_id: self.parent_node_id.map(NodeId::from),
            child_execution_ids: self.child_execution_ids.0,
            depth,
            dispatch_mode,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for node result queries.
#[derive(FromRow)]
struct NodeResultRow {
    node_id: String,
    status: String,
    output: Option<JsonValue>,
    error: Option<String>,
    prediction_id: Option<String>,
    updated_at: DateTime<Utc>,
}

impl NodeResultRow {
    fn try_into_result(self) -> Result<NodeResult, sqlx::Error> {
        let status = NodeStatus::from_str(&self.status)
            .map_err(|e| decode_error("node status", &self.status, e))?;
        Ok(NodeResult {
            node_id: NodeId::from(self.node_id),
            status,
            output: self.output,
            error: self.error,
            prediction_id: self.prediction_id,
            updated_at: self.updated_at,
        })
    }
}

async fn fetch_execution(
    conn: &mut PgConnection,
    execution_id: ExecutionId,
    for_update: bool,
) -> Result<Option<Execution>, sqlx::Error> {
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<ExecutionRow> = sqlx::query_as(&sql)
        .bind(execution_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let results: Vec<NodeResultRow> = sqlx::query_as(
        r#"
        SELECT node_id, status, output, error, prediction_id, updated_at
        FROM node_results
        WHERE execution_id = $1
        ORDER BY updated_at ASC, node_id ASC
        "#,
    )
    .bind(execution_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    let results = results
        .into_iter()
        .map(NodeResultRow::try_into_result)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(row.try_into_execution(results)?))
}

async fn insert_execution(conn: &mut PgConnection, execution: &Execution) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO executions
            (id, workflow_id, status, started_at, completed_at, error, total_cost, pending_nodes,
             parent_execution_id, parent_node_id, child_execution_ids, depth, dispatch_mode,
             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(execution.id.to_string())
    .bind(execution.workflow_id.to_string())
    .bind(execution.status.as_str())
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(&execution.error)
    .bind(execution.total_cost)
    .bind(Json(&execution.pending_nodes))
    .bind(execution.parent_execution_id.map(|id| id.to_string()))
    .bind(execution.parent_node_id.as_ref().map(|n| n.as_str().to_string()))
    .bind(Json(&execution.child_execution_ids))
    .bind(i32::try_from(execution.depth).unwrap_or(i32::MAX))
    .bind(execution.dispatch_mode.as_str())
    .bind(execution.created_at)
    .bind(execution.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Writes back everything a mutation may have changed.
async fn save_execution(
    conn: &mut PgConnection,
    before: &Execution,
    after: &Execution,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE executions
        SET status = $2, started_at = $3, completed_at = $4, error = $5, total_cost = $6,
            pending_nodes = $7, child_execution_ids = $8, updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(after.id.to_string())
    .bind(after.status.as_str())
    .bind(after.started_at)
    .bind(after.completed_at)
    .bind(&after.error)
    .bind(after.total_cost)
    .bind(Json(&after.pending_nodes))
    .bind(Json(&after.child_execution_ids))
    .bind(after.updated_at)
    .execute(&mut *conn)
    .await?;

    for result in &after.node_results {
        if before.node_result(&result.node_id) == Some(result) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO node_results
                (execution_id, node_id, status, output, error, prediction_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (execution_id, node_id) DO UPDATE
            SET status = EXCLUDED.status, output = EXCLUDED.output, error = EXCLUDED.error,
                prediction_id = EXCLUDED.prediction_id, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(after.id.to_string())
        .bind(result.node_id.as_str())
        .bind(result.status.as_str())
        .bind(&result.output)
        .bind(&result.error)
        .bind(&result.prediction_id)
        .bind(result.updated_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// [`ExecutionStore`] over a Postgres pool.
#[derive(Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, execution: Execution) -> Result<Execution, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        insert_execution(&mut *conn, &execution)
            .await
            .map_err(storage)?;
        Ok(execution)
    }

    /// Runs `f` against the locked execution and persists what it changed.
    /// Nothing is written when `f` fails.
    async fn modify<T>(
        &self,
        execution_id: ExecutionId,
        f: impl FnOnce(&mut Execution) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let before = fetch_execution(&mut *tx, execution_id, true)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound { execution_id })?;

        let mut execution = before.clone();
        let out = f(&mut execution)?;
        if execution != before {
            save_execution(&mut *tx, &before, &execution)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(out)
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create_execution(&self, workflow_id: WorkflowId) -> Result<Execution, StoreError> {
        self.insert(Execution::new(workflow_id)).await
    }

    async fn create_child_execution(
        &self,
        workflow_id: WorkflowId,
        parent_execution_id: ExecutionId,
        parent_node_id: &NodeId,
        depth: u32,
    ) -> Result<Execution, StoreError> {
        self.insert(Execution::child(
            workflow_id,
            parent_execution_id,
            parent_node_id.clone(),
            depth,
        ))
        .await
    }

    async fn find_execution(&self, execution_id: ExecutionId) -> Result<Execution, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        fetch_execution(&mut *conn, execution_id, false)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound { execution_id })
    }

    async fn update_execution_status(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        self.modify(execution_id, |e| e.transition(status, error))
            .await
    }

    async fn update_node_result(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        update: NodeResultUpdate,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |e| e.upsert_node_result(node_id, update))
            .await
    }

    async fn begin_execution(
        &self,
        execution_id: ExecutionId,
        boundary_nodes: Vec<NodeId>,
        nodes: Vec<PendingNode>,
    ) -> Result<bool, StoreError> {
        self.modify(execution_id, |e| e.begin(&boundary_nodes, nodes))
            .await
    }

    async fn set_pending_nodes(
        &self,
        execution_id: ExecutionId,
        nodes: Vec<PendingNode>,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |e| {
            if e.status.is_terminal() {
                return Err(StoreError::ExecutionTerminal { execution_id });
            }
            e.pending_nodes = nodes;
            e.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn remove_from_pending_nodes(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
    ) -> Result<bool, StoreError> {
        self.modify(execution_id, |e| e.claim_pending(node_id)).await
    }

    async fn restore_pending_node(
        &self,
        execution_id: ExecutionId,
        node: PendingNode,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |e| e.restore_pending(node)).await
    }

    async fn add_child_execution(
        &self,
        parent_execution_id: ExecutionId,
        child_execution_id: ExecutionId,
    ) -> Result<(), StoreError> {
        self.modify(parent_execution_id, |e| {
            if !e.child_execution_ids.contains(&child_execution_id) {
                e.child_execution_ids.push(child_execution_id);
                e.updated_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    async fn record_prediction(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
        prediction_id: &str,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |e| e.attach_prediction(node_id, prediction_id))
            .await
    }

    async fn find_node_by_prediction(
        &self,
        prediction_id: &str,
    ) -> Result<Option<(ExecutionId, NodeId)>, StoreError> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT execution_id, node_id
            FROM node_results
            WHERE prediction_id = $1
            "#,
        )
        .bind(prediction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some((execution_id, node_id)) = row else {
            return Ok(None);
        };
        let id = ExecutionId::from_str(&execution_id)
            .map_err(|e| storage(decode_error("execution id", &execution_id, e)))?;
        Ok(Some((id, NodeId::from(node_id))))
    }

    async fn add_cost(&self, execution_id: ExecutionId, amount: f64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET total_cost = total_cost + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(execution_id.to_string())
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { execution_id });
        }
        Ok(())
    }
}
