//! Reliable chunked delivery of application payloads.
//!
//! Outbound payloads are split into 1 MiB chunks, each carrying a SHA-256
//! checksum, and sent through the routing engine. Receivers acknowledge
//! every chunk, request indexed retransmission on checksum mismatch, and
//! emit a final Complete once the group is assembled and handed to the
//! application callback. A periodic sweep retransmits unacknowledged
//! chunks and discards stale reassembly buffers; groups are abandoned
//! after the retry budget is exhausted.

mod assembler;
mod tracker;

pub use assembler::ReassemblyBuffer;
pub use tracker::OutgoingTracker;

use crate::identity::NodeId;
use crate::protocol::{DataBody, DataState, EnvelopeBody, MessageEnvelope, MessageId};
use crate::routing::RoutingEngine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum bytes carried by one chunk.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default retry budget per payload group.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default age after which groups are retried or discarded.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced to callers of the delivery layer.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery layer is shut down")]
    ShutDown,
}

/// Callback invoked with fully reassembled payloads.
pub type MessageHandler = Box<dyn Fn(NodeId, Vec<u8>) + Send + Sync>;

/// Fragmentation, reassembly, and acknowledged retransmission.
pub struct ReliableDelivery {
    local_id: NodeId,
    router: Arc<RoutingEngine>,
    /// group id -> outbound tracker. At most one per group.
    outgoing: Mutex<HashMap<MessageId, OutgoingTracker>>,
    /// (sender, group id) -> reassembly buffer.
    incoming: Mutex<HashMap<(NodeId, MessageId), ReassemblyBuffer>>,
    handler: Mutex<Option<MessageHandler>>,
    max_retries: u32,
    chunk_timeout: Duration,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ReliableDelivery {
    /// Create a delivery layer sending through `router`.
    pub fn new(local_id: NodeId, router: Arc<RoutingEngine>) -> Self {
        Self::with_limits(local_id, router, MAX_RETRY_ATTEMPTS, CHUNK_TIMEOUT)
    }

    /// Create with explicit retry budget and timeout (used by tests).
    pub fn with_limits(
        local_id: NodeId,
        router: Arc<RoutingEngine>,
        max_retries: u32,
        chunk_timeout: Duration,
    ) -> Self {
        Self {
            local_id,
            router,
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            max_retries,
            chunk_timeout,
            sweep_task: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Install the application callback for reassembled payloads.
    pub fn set_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Start the periodic timeout sweep.
    pub fn start(self: &Arc<Self>) {
        let delivery = self.clone();
        let interval = self.chunk_timeout;
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                delivery.sweep().await;
            }
        });
        *self.sweep_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Fragment a payload and send it to `target`.
    ///
    /// Returns the group id once every chunk is handed to the routing
    /// engine; acknowledgement tracking continues in the background.
    pub async fn send(&self, target: NodeId, data: &[u8]) -> Result<MessageId, DeliveryError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(DeliveryError::ShutDown);
        }

        let group_id = MessageId::generate();

        // An empty payload still travels as one empty chunk so the
        // acknowledgement round-trip happens.
        let chunks: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(MAX_CHUNK_SIZE).map(|c| c.to_vec()).collect()
        };
        let total = chunks.len() as u32;

        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(group_id, OutgoingTracker::new(group_id, target, chunks.clone()));

        info!(
            group = %group_id,
            target = %target.short(),
            chunks = total,
            bytes = data.len(),
            "Sending payload"
        );

        for (index, chunk) in chunks.into_iter().enumerate() {
            let envelope = self.chunk_envelope(group_id, total, index as u32, chunk);
            self.router.route(target, envelope).await;
        }

        Ok(group_id)
    }

    /// Handle an inbound data envelope.
    pub async fn on_data(&self, envelope: MessageEnvelope) {
        let (sender, body) = match envelope.body {
            EnvelopeBody::Data(body) => (envelope.sender_id, body),
            _ => return,
        };

        match body.state {
            DataState::Chunk => self.on_chunk(sender, body).await,
            DataState::Acknowledgment => self.on_ack(sender, &body),
            DataState::RetransmitRequest => self.on_retransmit_request(sender, &body).await,
            DataState::Complete => self.on_complete(sender, &body),
        }
    }

    async fn on_chunk(&self, sender: NodeId, body: DataBody) {
        if checksum(&body.data) != body.checksum {
            warn!(
                group = %body.group_id,
                index = body.chunk_index,
                "Checksum mismatch, requesting retransmission"
            );
            let request = DataBody::control(
                body.group_id,
                body.total_chunks,
                body.chunk_index,
                DataState::RetransmitRequest,
            );
            self.send_control(sender, request).await;
            return;
        }

        let group_id = body.group_id;
        let completed = {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            let buffer = incoming
                .entry((sender, group_id))
                .or_insert_with(|| ReassemblyBuffer::new(body.total_chunks));
            buffer.add_chunk(body.chunk_index, body.data);
            // Completion is checked under the same lock that stored the
            // chunk, so delivery happens exactly once.
            let assembled = buffer.take_assembled();
            if assembled.is_some() {
                incoming.remove(&(sender, group_id));
            }
            assembled
        };

        let ack = DataBody::control(
            group_id,
            body.total_chunks,
            body.chunk_index,
            DataState::Acknowledgment,
        );
        self.send_control(sender, ack).await;

        if let Some(payload) = completed {
            info!(
                group = %group_id,
                from = %sender.short(),
                bytes = payload.len(),
                "Payload assembled"
            );
            let complete =
                DataBody::control(group_id, body.total_chunks, 0, DataState::Complete);
            self.send_control(sender, complete).await;
            self.deliver(sender, payload);
        }
    }

    fn on_ack(&self, sender: NodeId, body: &DataBody) {
        let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tracker) = outgoing.get_mut(&body.group_id) {
            tracker.acknowledge(body.chunk_index);
            if tracker.is_complete() {
                debug!(
                    group = %body.group_id,
                    to = %sender.short(),
                    "Payload fully acknowledged"
                );
                outgoing.remove(&body.group_id);
            }
        }
    }

    async fn on_retransmit_request(&self, sender: NodeId, body: &DataBody) {
        let replay = {
            let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            match outgoing.get_mut(&body.group_id) {
                Some(tracker) => {
                    let retries = tracker.increment_retry();
                    if retries > self.max_retries {
                        error!(
                            group = %body.group_id,
                            retries,
                            "Retry budget exhausted, abandoning group"
                        );
                        outgoing.remove(&body.group_id);
                        None
                    } else {
                        tracker
                            .chunk(body.chunk_index)
                            .map(|chunk| (tracker.total_chunks(), chunk.to_vec()))
                    }
                }
                None => None,
            }
        };

        if let Some((total, chunk)) = replay {
            debug!(
                group = %body.group_id,
                index = body.chunk_index,
                "Retransmitting chunk"
            );
            let envelope = self.chunk_envelope(body.group_id, total, body.chunk_index, chunk);
            self.router.route(sender, envelope).await;
        }
    }

    fn on_complete(&self, sender: NodeId, body: &DataBody) {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&body.group_id);
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(sender, body.group_id));
    }

    /// Retransmit timed-out groups and discard stale reassembly buffers.
    pub async fn sweep(&self) {
        // Collect retransmissions under the lock, send after releasing it.
        let mut retransmissions: Vec<(NodeId, MessageId, u32, Vec<(u32, Vec<u8>)>)> = Vec::new();
        {
            let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            let mut abandoned = Vec::new();
            for (group_id, tracker) in outgoing.iter_mut() {
                if tracker.age() <= self.chunk_timeout {
                    continue;
                }
                if tracker.retry_count() > self.max_retries {
                    abandoned.push(*group_id);
                    continue;
                }
                tracker.increment_retry();
                let missing: Vec<(u32, Vec<u8>)> = tracker
                    .missing_chunks()
                    .into_iter()
                    .filter_map(|i| tracker.chunk(i).map(|c| (i, c.to_vec())))
                    .collect();
                retransmissions.push((
                    tracker.target(),
                    *group_id,
                    tracker.total_chunks(),
                    missing,
                ));
            }
            for group_id in abandoned {
                error!(group = %group_id, "Payload timed out after max retries");
                outgoing.remove(&group_id);
            }
        }

        for (target, group_id, total, missing) in retransmissions {
            warn!(
                group = %group_id,
                missing = missing.len(),
                "Payload timed out, retransmitting missing chunks"
            );
            for (index, chunk) in missing {
                let envelope = self.chunk_envelope(group_id, total, index, chunk);
                self.router.route(target, envelope).await;
            }
        }

        let timeout = self.chunk_timeout;
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sender, group_id), buffer| {
                let keep = buffer.age() <= timeout;
                if !keep {
                    debug!(
                        group = %group_id,
                        from = %sender.short(),
                        "Discarding stale reassembly buffer"
                    );
                }
                keep
            });
    }

    fn chunk_envelope(
        &self,
        group_id: MessageId,
        total: u32,
        index: u32,
        data: Vec<u8>,
    ) -> MessageEnvelope {
        let body = DataBody {
            group_id,
            total_chunks: total,
            chunk_index: index,
            state: DataState::Chunk,
            checksum: checksum(&data),
            data,
        };
        MessageEnvelope::new(self.local_id, EnvelopeBody::Data(body))
    }

    async fn send_control(&self, target: NodeId, body: DataBody) {
        let envelope = MessageEnvelope::new(self.local_id, EnvelopeBody::Data(body));
        self.router.route(target, envelope).await;
    }

    fn deliver(&self, sender: NodeId, payload: Vec<u8>) {
        let handler = self.handler.lock().unwrap_or_else(|e| e.into_inner());
        match handler.as_ref() {
            Some(callback) => callback(sender, payload),
            None => debug!(from = %sender.short(), "No message handler installed, payload dropped"),
        }
    }

    /// Number of in-flight outbound groups.
    pub fn outgoing_count(&self) -> usize {
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of reassembly buffers in progress.
    pub fn incoming_count(&self) -> usize {
        self.incoming.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop the sweep and clear group state.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .sweep_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
            let _ = task.await;
        }
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.incoming.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!("Reliable delivery stopped");
    }
}

/// SHA-256 checksum over chunk bytes.
pub fn checksum(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::monitor::{EventLog, HealthTable};
    use crate::registry::ConnectionRegistry;
    use crate::routing::LocalDelivery;
    use tokio::sync::mpsc;

    fn make_delivery() -> (Arc<ReliableDelivery>, mpsc::Receiver<LocalDelivery>) {
        let identity = Arc::new(Identity::generate());
        let events = Arc::new(EventLog::new());
        let health = Arc::new(HealthTable::new());
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let registry = Arc::new(ConnectionRegistry::new(
            identity.clone(),
            inbound_tx,
            events.clone(),
            health,
        ));
        let (deliver_tx, deliver_rx) = mpsc::channel(64);
        let router = Arc::new(RoutingEngine::new(
            identity.node_id(),
            registry,
            deliver_tx,
            events,
        ));
        let delivery = Arc::new(ReliableDelivery::new(identity.node_id(), router));
        (delivery, deliver_rx)
    }

    fn chunk_body(group: MessageId, total: u32, index: u32, data: Vec<u8>) -> DataBody {
        DataBody {
            group_id: group,
            total_chunks: total,
            chunk_index: index,
            state: DataState::Chunk,
            checksum: checksum(&data),
            data,
        }
    }

    fn envelope(sender: NodeId, body: DataBody) -> MessageEnvelope {
        MessageEnvelope::new(sender, EnvelopeBody::Data(body))
    }

    #[tokio::test]
    async fn test_single_chunk_delivery_and_callback() {
        let (delivery, _rx) = make_delivery();
        let sender = NodeId::from_bytes([9; 16]);

        let (payload_tx, mut payload_rx) = mpsc::unbounded_channel();
        delivery.set_handler(Box::new(move |from, bytes| {
            let _ = payload_tx.send((from, bytes));
        }));

        let group = MessageId::generate();
        delivery
            .on_data(envelope(sender, chunk_body(group, 1, 0, vec![42; 100])))
            .await;

        let (from, bytes) = payload_rx.recv().await.unwrap();
        assert_eq!(from, sender);
        assert_eq!(bytes, vec![42; 100]);
        assert_eq!(delivery.incoming_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_chunk_not_stored() {
        let (delivery, _rx) = make_delivery();
        let sender = NodeId::from_bytes([9; 16]);

        let group = MessageId::generate();
        let mut body = chunk_body(group, 2, 0, vec![1; 64]);
        body.checksum[0] ^= 0xff;

        delivery.on_data(envelope(sender, body)).await;
        assert_eq!(delivery.incoming_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_chunk_delivered_once() {
        let (delivery, _rx) = make_delivery();
        let sender = NodeId::from_bytes([9; 16]);

        let (payload_tx, mut payload_rx) = mpsc::unbounded_channel();
        delivery.set_handler(Box::new(move |_, bytes| {
            let _ = payload_tx.send(bytes);
        }));

        let group = MessageId::generate();
        delivery
            .on_data(envelope(sender, chunk_body(group, 2, 1, vec![2; 10])))
            .await;
        delivery
            .on_data(envelope(sender, chunk_body(group, 2, 0, vec![1; 10])))
            .await;
        // Duplicate of an already-seen chunk after completion.
        delivery
            .on_data(envelope(sender, chunk_body(group, 2, 0, vec![1; 10])))
            .await;

        let bytes = payload_rx.recv().await.unwrap();
        let mut expected = vec![1; 10];
        expected.extend_from_slice(&[2; 10]);
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn test_send_registers_tracker_and_acks_remove_it() {
        let (delivery, _rx) = make_delivery();
        let target = NodeId::from_bytes([5; 16]);

        let group = delivery.send(target, &[7u8; 100]).await.unwrap();
        assert_eq!(delivery.outgoing_count(), 1);

        let ack = DataBody::control(group, 1, 0, DataState::Acknowledgment);
        delivery.on_data(envelope(target, ack)).await;
        assert_eq!(delivery.outgoing_count(), 0);
    }

    #[tokio::test]
    async fn test_fragmentation_chunk_count() {
        let (delivery, _rx) = make_delivery();
        let target = NodeId::from_bytes([5; 16]);

        let data = vec![0u8; 2 * MAX_CHUNK_SIZE + 1];
        let group = delivery.send(target, &data).await.unwrap();

        let outgoing = delivery.outgoing.lock().unwrap();
        let tracker = outgoing.get(&group).unwrap();
        assert_eq!(tracker.total_chunks(), 3);
        assert_eq!(tracker.chunk(0).unwrap().len(), MAX_CHUNK_SIZE);
        assert_eq!(tracker.chunk(2).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retransmit_budget_abandons_group() {
        let (delivery, _rx) = make_delivery();
        let target = NodeId::from_bytes([5; 16]);

        let group = delivery.send(target, &[1u8; 10]).await.unwrap();

        for _ in 0..MAX_RETRY_ATTEMPTS {
            let request = DataBody::control(group, 1, 0, DataState::RetransmitRequest);
            delivery.on_data(envelope(target, request)).await;
            assert_eq!(delivery.outgoing_count(), 1);
        }

        // One past the budget: the group is abandoned.
        let request = DataBody::control(group, 1, 0, DataState::RetransmitRequest);
        delivery.on_data(envelope(target, request)).await;
        assert_eq!(delivery.outgoing_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_clears_both_sides() {
        let (delivery, _rx) = make_delivery();
        let peer = NodeId::from_bytes([5; 16]);

        let group = delivery.send(peer, &[1u8; 10]).await.unwrap();
        // A partial inbound group from the same peer.
        delivery
            .on_data(envelope(peer, chunk_body(group, 2, 0, vec![1; 4])))
            .await;
        assert_eq!(delivery.outgoing_count(), 1);
        assert_eq!(delivery.incoming_count(), 1);

        let complete = DataBody::control(group, 2, 0, DataState::Complete);
        delivery.on_data(envelope(peer, complete)).await;
        assert_eq!(delivery.outgoing_count(), 0);
        assert_eq!(delivery.incoming_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_payload_travels_as_one_chunk() {
        let (delivery, _rx) = make_delivery();
        let target = NodeId::from_bytes([5; 16]);
        let group = delivery.send(target, &[]).await.unwrap();

        let outgoing = delivery.outgoing.lock().unwrap();
        assert_eq!(outgoing.get(&group).unwrap().total_chunks(), 1);
    }
}
