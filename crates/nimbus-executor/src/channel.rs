//! In-process substrate and result stream.
//!
//! Workers in the same process pull payloads from [`ChannelSubstrate`] and
//! report back through a [`ResultPublisher`]; the orchestrator reads those
//! reports from the paired [`ChannelResultStream`].

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_core::substrate::{
    Delivery, EnqueueOutcome, ExecutionPayload, ExecutionSubstrate, JobResultMessage, ResultStream,
};
use nimbus_core::{Error, JobId, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

/// Bounded in-memory queue of pending payloads.
pub struct ChannelSubstrate {
    pending: Mutex<VecDeque<ExecutionPayload>>,
    capacity: usize,
    available: Notify,
}

impl ChannelSubstrate {
    /// Create a queue that throttles once `capacity` payloads are pending.
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity,
            available: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ExecutionPayload>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the oldest pending payload, if any.
    pub fn try_next(&self) -> Option<ExecutionPayload> {
        self.lock().pop_front()
    }

    /// Wait for the next pending payload.
    pub async fn next(&self) -> ExecutionPayload {
        loop {
            let notified = self.available.notified();
            if let Some(payload) = self.try_next() {
                return payload;
            }
            notified.await;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.lock().iter().map(|p| p.job_id).collect()
    }
}

#[async_trait]
impl ExecutionSubstrate for ChannelSubstrate {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn enqueue(&self, payload: ExecutionPayload) -> Result<EnqueueOutcome> {
        {
            let mut pending = self.lock();
            if pending.len() >= self.capacity {
                debug!(job_id = %payload.job_id, "Queue full, throttling");
                return Ok(EnqueueOutcome::Throttled);
            }
            pending.push_back(payload);
        }
        self.available.notify_one();
        Ok(EnqueueOutcome::Accepted)
    }

    async fn remove_pending(&self, job_id: JobId) -> Result<bool> {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|p| p.job_id != job_id);
        Ok(pending.len() < before)
    }
}

/// Create a connected publisher and result stream.
pub fn result_channel(buffer: usize) -> (ResultPublisher, ChannelResultStream) {
    let (tx, rx) = mpsc::channel(buffer);
    (ResultPublisher { tx }, ChannelResultStream::new(rx))
}

/// Sending half used by workers (or the HTTP results endpoint).
#[derive(Clone)]
pub struct ResultPublisher {
    tx: mpsc::Sender<Bytes>,
}

impl ResultPublisher {
    pub async fn publish(&self, message: &JobResultMessage) -> Result<()> {
        let payload =
            serde_json::to_vec(message).map_err(|e| Error::InvalidInput(e.to_string()))?;
        self.publish_raw(Bytes::from(payload)).await
    }

    /// Publish an already-encoded message.
    pub async fn publish_raw(&self, payload: Bytes) -> Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| Error::Transport("result stream closed".to_string()))
    }
}

/// At-least-once stream over an mpsc channel. Messages stay in the unacked
/// set until acknowledged; rejected messages are kept aside for inspection.
pub struct ChannelResultStream {
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, Bytes>>,
    rejected: Mutex<Vec<Bytes>>,
}

impl ChannelResultStream {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx: tokio::sync::Mutex::new(rx),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(HashMap::new()),
            rejected: Mutex::new(Vec::new()),
        }
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Messages that were nacked.
    pub fn rejected(&self) -> Vec<Bytes> {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn settle(&self, tag: u64) -> Result<Bytes> {
        self.unacked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tag)
            .ok_or_else(|| Error::InvalidInput(format!("unknown delivery tag {}", tag)))
    }
}

#[async_trait]
impl ResultStream for ChannelResultStream {
    async fn receive(&self) -> Option<Delivery> {
        let payload = self.rx.lock().await.recv().await?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.unacked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag, payload.clone());
        Some(Delivery { tag, payload })
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.settle(tag)?;
        Ok(())
    }

    async fn nack(&self, tag: u64) -> Result<()> {
        let payload = self.settle(tag)?;
        warn!(tag, bytes = payload.len(), "Result message rejected");
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::JobKind;
    use nimbus_core::substrate::ResultStatus;

    fn payload() -> ExecutionPayload {
        ExecutionPayload {
            job_id: JobId::new(),
            kind: JobKind::Describe,
            parent_id: None,
            target: "describe-aws".into(),
            credential_ref: None,
            body: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_enqueue_throttles_at_capacity() {
        let substrate = ChannelSubstrate::new(1);
        assert_eq!(
            substrate.enqueue(payload()).await.unwrap(),
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            substrate.enqueue(payload()).await.unwrap(),
            EnqueueOutcome::Throttled
        );
        assert_eq!(substrate.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_remove_pending() {
        let substrate = ChannelSubstrate::new(10);
        let first = payload();
        let id = first.job_id;
        substrate.enqueue(first).await.unwrap();

        assert!(substrate.remove_pending(id).await.unwrap());
        // Gone now; a second removal reports it was not pending.
        assert!(!substrate.remove_pending(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_consumed_payload_cannot_be_removed() {
        let substrate = ChannelSubstrate::new(10);
        let p = payload();
        let id = p.job_id;
        substrate.enqueue(p).await.unwrap();
        assert_eq!(substrate.next().await.job_id, id);
        assert!(!substrate.remove_pending(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_result_stream_ack_and_nack() {
        let (publisher, stream) = result_channel(8);
        let message = JobResultMessage::new(JobId::new(), JobKind::Describe, ResultStatus::Succeeded);
        publisher.publish(&message).await.unwrap();
        publisher.publish_raw(Bytes::from_static(b"garbage")).await.unwrap();

        let first = stream.receive().await.unwrap();
        let decoded: JobResultMessage = serde_json::from_slice(&first.payload).unwrap();
        assert_eq!(decoded, message);
        let second = stream.receive().await.unwrap();
        assert_eq!(stream.unacked_len(), 2);

        stream.ack(first.tag).await.unwrap();
        stream.nack(second.tag).await.unwrap();
        assert_eq!(stream.unacked_len(), 0);
        assert_eq!(stream.rejected(), vec![Bytes::from_static(b"garbage")]);
        assert!(stream.ack(first.tag).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_ends_when_publishers_drop() {
        let (publisher, stream) = result_channel(1);
        drop(publisher);
        assert!(stream.receive().await.is_none());
    }
}
