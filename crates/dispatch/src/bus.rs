use crate::types::{GpuClass, JobStatus};
use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Progress message published on a job's channel. Delivery is best-effort;
/// subscribers that connect late reconcile through the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub status: String,
    pub progress_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ProgressEvent {
    pub fn new(job_id: Uuid, status: JobStatus, progress_percent: f64) -> Self {
        Self {
            job_id,
            status: status.as_db_str().to_string(),
            progress_percent,
            error_message: None,
            timestamp: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error_message = error;
        self
    }
}

/// Work queues and per-job progress channels, both on the key-value store.
/// Queues are one FIFO per GPU class; progress is plain pub/sub.
#[derive(Clone)]
pub struct Bus {
    client: redis::Client,
    mgr: ConnectionManager,
}

fn queue_key(gpu_class: GpuClass) -> String {
    format!("queue:{}", gpu_class.as_str())
}

fn job_channel(job_id: Uuid) -> String {
    format!("job:{job_id}")
}

impl Bus {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("parse REDIS_URL")?;
        let mgr = ConnectionManager::new(client.clone())
            .await
            .context("connect REDIS_URL")?;
        Ok(Self { client, mgr })
    }

    pub async fn enqueue(&self, job_id: Uuid, gpu_class: GpuClass) -> Result<()> {
        let mut conn = self.mgr.clone();
        let _: () = conn
            .lpush(queue_key(gpu_class), job_id.to_string())
            .await
            .context("lpush job onto work queue")?;
        Ok(())
    }

    /// Blocking pop from the class queue. Returns None on timeout so callers
    /// can observe shutdown between waits. BRPOP guarantees at-most-once
    /// delivery across racing workers.
    pub async fn dequeue(&self, gpu_class: GpuClass, timeout_secs: u64) -> Result<Option<Uuid>> {
        let mut conn = self.mgr.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queue_key(gpu_class))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await
            .context("brpop work queue")?;
        match popped {
            Some((_, raw)) => {
                let id = raw.parse::<Uuid>().context("parse dequeued job id")?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Best-effort removal of a queued job, used by cancellation. A job the
    /// worker already popped is simply not found.
    pub async fn remove(&self, job_id: Uuid, gpu_class: GpuClass) -> Result<()> {
        let mut conn = self.mgr.clone();
        let _: () = conn
            .lrem(queue_key(gpu_class), 0, job_id.to_string())
            .await
            .context("lrem job from work queue")?;
        Ok(())
    }

    /// Publishes a progress event on the job's channel, stamping the
    /// server-side timestamp.
    pub async fn publish_progress(&self, mut event: ProgressEvent) -> Result<()> {
        event.timestamp = Some(chrono::Utc::now().timestamp());
        let payload = serde_json::to_string(&event).context("encode progress event")?;
        let mut conn = self.mgr.clone();
        let _: () = conn
            .publish(job_channel(event.job_id), payload)
            .await
            .context("publish progress event")?;
        Ok(())
    }

    /// Subscribes to a job's progress channel and yields raw JSON payloads.
    /// Dropping the stream tears down the subscription connection, so a
    /// disconnecting consumer releases its resources.
    pub async fn subscribe_progress(&self, job_id: Uuid) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("open pubsub connection")?;
        pubsub
            .subscribe(job_channel(job_id))
            .await
            .context("subscribe to job channel")?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_and_channel_keys() {
        assert_eq!(queue_key(GpuClass::Rtx4090), "queue:rtx4090");
        assert_eq!(queue_key(GpuClass::A100), "queue:a100");
        let id = Uuid::nil();
        assert_eq!(
            job_channel(id),
            "job:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn progress_event_wire_shape() {
        let event = ProgressEvent::new(Uuid::nil(), JobStatus::Rendering, 42.0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "RENDERING");
        assert_eq!(json["progressPercent"], 42.0);
        assert!(json.get("errorMessage").is_none());
        assert_eq!(json["jobId"], "00000000-0000-0000-0000-000000000000");
    }
}
