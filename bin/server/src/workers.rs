//! Background work: one consumer per queue plus the stall recovery sweep.

use crate::config::{NatsConfig, QueuesConfig};
use genweave_queue::nats::NatsJobQueue;
use genweave_queue::{InMemoryJobQueue, JobQueue, QueueError, QueueName};
use genweave_workflow::{Engine, RecoveryConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Where jobs travel between the API and the workers.
#[derive(Clone)]
pub enum Transport {
    Nats(NatsJobQueue),
    /// In-process queues. Jobs do not survive a restart.
    Memory(InMemoryJobQueue),
}

impl Transport {
    /// Connects to JetStream when configured, otherwise falls back to
    /// in-process queues.
    ///
    /// # Errors
    ///
    /// Returns an error if JetStream is configured but unreachable.
    pub async fn connect(nats: Option<&NatsConfig>) -> Result<Self, QueueError> {
        match nats {
            Some(config) => {
                let queue = NatsJobQueue::connect(config.queue_config()).await?;
                info!(url = %config.url, "connected to jetstream");
                Ok(Self::Nats(queue))
            }
            None => {
                info!("no jetstream configured, using in-process queues");
                Ok(Self::Memory(InMemoryJobQueue::new()))
            }
        }
    }

    #[must_use]
    pub fn job_queue(&self) -> Arc<dyn JobQueue> {
        match self {
            Self::Nats(queue) => Arc::new(queue.clone()),
            Self::Memory(queue) => Arc::new(queue.clone()),
        }
    }
}

/// Starts a consumer for every queue and the recovery sweep. All of them
/// stop once `shutdown` flips to `true`.
pub fn spawn(
    engine: &Engine,
    transport: &Transport,
    queues: &QueuesConfig,
    recovery: RecoveryConfig,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(QueueName::ALL.len() + 1);

    for queue in QueueName::ALL {
        let runtime = Arc::new(engine.runtime_with(queue, queues.runtime_config(queue)));
        let shutdown = shutdown.clone();
        let handle = match transport {
            Transport::Nats(nats) => {
                let nats = nats.clone();
                tokio::spawn(async move {
                    if let Err(e) = nats.consume(runtime, shutdown).await {
                        error!(%queue, error = %e, "jetstream worker stopped");
                    }
                })
            }
            Transport::Memory(memory) => {
                let memory = memory.clone();
                tokio::spawn(async move { memory.run(runtime, shutdown).await })
            }
        };
        handles.push(handle);
    }

    let task = engine.recovery_task(recovery);
    handles.push(tokio::spawn(task.run(shutdown.clone())));
    handles
}
