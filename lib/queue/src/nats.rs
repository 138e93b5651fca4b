//! NATS JetStream transport.
//!
//! Each [`QueueName`] maps to its own work-queue stream with a durable pull
//! consumer shared by every worker process. Jobs travel as versioned
//! envelopes. Delayed jobs carry a `not_before` time; a worker that receives
//! one early naks it with the remaining delay.

use crate::client::JobQueue;
use crate::envelope::Envelope;
use crate::error::QueueError;
use crate::job::{QueueName, QueuedJob};
use crate::runtime::{DeliveryOutcome, JobRuntime};
use async_nats::jetstream::{self, AckKind, consumer::pull};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Subject prefix for job messages.
const JOB_SUBJECT_PREFIX: &str = "genweave.jobs";

/// Default prefix for stream names.
const STREAM_PREFIX: &str = "GENWEAVE";

/// Configuration for the JetStream transport.
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    pub url: String,
    /// Prefix for per-queue stream names (defaults to GENWEAVE).
    pub stream_prefix: Option<String>,
    /// How long the server waits for an ack before redelivering.
    pub ack_wait: Duration,
}

impl NatsQueueConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_prefix: None,
            ack_wait: Duration::from_secs(60),
        }
    }

    fn stream_name(&self, queue: QueueName) -> String {
        let prefix = self.stream_prefix.as_deref().unwrap_or(STREAM_PREFIX);
        format!("{prefix}_{}", queue.as_str().to_uppercase().replace('-', "_"))
    }

    fn subject(queue: QueueName) -> String {
        format!("{JOB_SUBJECT_PREFIX}.{}", queue.as_str())
    }

    fn durable_name(queue: QueueName) -> String {
        format!("{}-workers", queue.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct JobMessage {
    job: QueuedJob,
    not_before: Option<DateTime<Utc>>,
}

impl JobMessage {
    fn remaining_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        let at = self.not_before?;
        (at > now).then(|| (at - now).to_std().unwrap_or_default())
    }
}

#[derive(Clone)]
pub struct NatsJobQueue {
    jetstream: jetstream::Context,
    config: NatsQueueConfig,
}

impl NatsJobQueue {
    /// Connects and makes sure a stream exists for every queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: NatsQueueConfig) -> Result<Self, QueueError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: e.to_string(),
            })?;
        let jetstream = jetstream::new(client);

        for queue in QueueName::ALL {
            let stream_config = jetstream::stream::Config {
                name: config.stream_name(queue),
                subjects: vec![NatsQueueConfig::subject(queue)],
                storage: jetstream::stream::StorageType::File,
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            };
            jetstream
                .get_or_create_stream(stream_config)
                .await
                .map_err(|e| QueueError::ConnectionFailed {
                    message: format!("failed to create stream for {queue}: {e}"),
                })?;
        }

        Ok(Self { jetstream, config })
    }

    async fn publish(&self, message: JobMessage) -> Result<(), QueueError> {
        let subject = NatsQueueConfig::subject(message.job.queue);
        let bytes = Envelope::new(message).to_json_bytes()?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Pulls jobs for the runtime's queue until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be created.
    pub async fn consume(
        &self,
        runtime: Arc<JobRuntime>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let queue = runtime.queue();
        let stream = self
            .jetstream
            .get_stream(self.config.stream_name(queue))
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                message: format!("failed to get stream: {e}"),
            })?;

        let durable = NatsQueueConfig::durable_name(queue);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: NatsQueueConfig::subject(queue),
                    ack_wait: self.config.ack_wait,
                    max_deliver: -1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                message: format!("failed to create consumer: {e}"),
            })?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                message: format!("failed to get messages: {e}"),
            })?;

        info!(%queue, "jetstream worker started");
        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = messages.next() => match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(%queue, error = %e, "failed to receive message");
                        continue;
                    }
                    None => break,
                },
            };

            let Some(permit) = runtime.acquire_slot().await else {
                break;
            };
            let runtime = runtime.clone();
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.deliver(&runtime, Arc::new(message)).await;
            });
        }
        info!(%queue, "jetstream worker stopped");
        Ok(())
    }

    async fn deliver(&self, runtime: &JobRuntime, message: Arc<jetstream::Message>) {
        let envelope = match Envelope::<JobMessage>::from_json_bytes(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "dropping undecodable job message");
                if let Err(e) = message.ack_with(AckKind::Term).await {
                    warn!(error = %e, "failed to terminate message");
                }
                return;
            }
        };
        let job_message = envelope.into_payload();

        if let Some(wait) = job_message.remaining_delay(Utc::now()) {
            if let Err(e) = message.ack_with(AckKind::Nak(Some(wait))).await {
                warn!(error = %e, "failed to defer message");
            }
            return;
        }

        let progress = spawn_progress(message.clone(), self.config.ack_wait / 2);
        let job = job_message.job;
        let outcome = runtime.handle(&job).await;
        progress.abort();

        if let DeliveryOutcome::Retry { delay } = outcome {
            let mut next = job;
            next.attempts_made += 1;
            if let Err(e) = self.requeue(next, delay).await {
                warn!(error = %e, "failed to requeue job, leaving it for redelivery");
                if let Err(e) = message.ack_with(AckKind::Nak(Some(delay))).await {
                    warn!(error = %e, "failed to nak message");
                }
                return;
            }
        }

        if let Err(e) = message.ack().await {
            warn!(error = %e, "failed to ack message");
        } else {
            debug!(?outcome, "message acknowledged");
        }
    }
}

/// Keeps an in-flight message from being redelivered while it is processed.
fn spawn_progress(message: Arc<jetstream::Message>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = message.ack_with(AckKind::Progress).await {
                warn!(error = %e, "failed to extend ack deadline");
            }
        }
    })
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.publish(JobMessage {
            job,
            not_before: None,
        })
        .await
    }

    async fn requeue(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let not_before = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d)
        };
        self.publish(JobMessage { job, not_before }).await
    }
}
