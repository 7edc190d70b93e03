//! Producer for partitioned super-streams.
//!
//! A [`SuperStreamProducer`] looks like a single producer to the caller:
//! it routes every message to one of the super-stream's partitions, opens
//! per-partition producers on first use, rebinds them after disconnects and
//! metadata changes, and fans their confirmations back into one handler
//! tagged with the partition name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::ProducerConfig;
use crate::message::Message;
use crate::producer::partition::{PartitionProducer, ProducerState};
use crate::producer::routing::RoutingStrategy;
use crate::producer::{ConfirmationHandler, ConnectionClosedHandler};
use crate::transport::{
    CompressionType, ResponseCode, StreamTransport, TransportEvent, TransportPool,
};
use crate::{Error, Result};

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// Builder for [`SuperStreamProducer`]. The routing strategy is required;
/// handlers are optional.
pub struct SuperStreamProducerBuilder {
    config: ProducerConfig,
    pool: Arc<TransportPool>,
    routing: Option<RoutingStrategy>,
    confirm_handler: Option<ConfirmationHandler>,
    connection_closed_handler: Option<ConnectionClosedHandler>,
}

impl SuperStreamProducerBuilder {
    pub fn routing(mut self, routing: RoutingStrategy) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Handler invoked for every broker acknowledgement as
    /// `(partition_name, confirmation)`.
    pub fn confirm_handler(mut self, handler: ConfirmationHandler) -> Self {
        self.confirm_handler = Some(handler);
        self
    }

    pub fn connection_closed_handler(mut self, handler: ConnectionClosedHandler) -> Self {
        self.connection_closed_handler = Some(handler);
        self
    }

    /// Validates the configuration, resolves the partition list and opens
    /// the producer. No partition connection is made yet; those are bound
    /// lazily on first send.
    pub async fn build(self) -> Result<SuperStreamProducer> {
        self.config.validate()?;
        let routing = self
            .routing
            .ok_or_else(|| Error::CreateProducer("a routing strategy is required".to_string()))?;

        let locator = self
            .pool
            .acquire(&self.config.super_stream)
            .await
            .map_err(|e| Error::CreateProducer(e.to_string()))?;
        let fetched = locator.partitions(&self.config.super_stream).await;
        self.pool.release(locator.endpoint()).await;

        let partitions = match fetched {
            Ok(partitions) if !partitions.is_empty() => partitions,
            Ok(_) => {
                return Err(Error::CreateProducer(format!(
                    "super stream '{}' has no partitions",
                    self.config.super_stream
                )));
            }
            Err(e) => return Err(Error::CreateProducer(e.to_string())),
        };

        info!(
            super_stream = %self.config.super_stream,
            partitions = partitions.len(),
            client_name = ?self.config.client_provided_name,
            "super-stream producer open"
        );

        let inner = Arc::new(SuperStreamInner {
            config: self.config,
            routing,
            pool: self.pool,
            partitions: RwLock::new(Arc::new(partitions)),
            producers: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            state: AtomicU8::new(STATE_OPEN),
            confirm_handler: self.confirm_handler,
            connection_closed_handler: self.connection_closed_handler,
            event_loop: StdMutex::new(None),
        });

        let handle = spawn_event_loop(&inner);
        if let Ok(mut slot) = inner.event_loop.lock() {
            *slot = Some(handle);
        }

        Ok(SuperStreamProducer { inner })
    }
}

/// A logical producer over every partition of a super-stream.
#[derive(Clone)]
pub struct SuperStreamProducer {
    inner: Arc<SuperStreamInner>,
}

impl std::fmt::Debug for SuperStreamProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperStreamProducer").finish_non_exhaustive()
    }
}

struct SuperStreamInner {
    config: ProducerConfig,
    routing: RoutingStrategy,
    pool: Arc<TransportPool>,
    /// Immutable snapshot, swapped whole on metadata change.
    partitions: RwLock<Arc<Vec<String>>>,
    producers: RwLock<HashMap<String, Arc<PartitionProducer>>>,
    /// Per-partition guards so concurrent sends cannot declare a publisher
    /// twice for the same partition.
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    state: AtomicU8,
    confirm_handler: Option<ConfirmationHandler>,
    connection_closed_handler: Option<ConnectionClosedHandler>,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl SuperStreamProducer {
    pub fn builder(config: ProducerConfig, pool: Arc<TransportPool>) -> SuperStreamProducerBuilder {
        SuperStreamProducerBuilder {
            config,
            pool,
            routing: None,
            confirm_handler: None,
            connection_closed_handler: None,
        }
    }

    /// Routes the message to one partition and delegates the send. The
    /// publishing id is forwarded untouched.
    #[instrument(skip(self, message), fields(super_stream = %self.inner.config.super_stream))]
    pub async fn send(&self, publishing_id: u64, message: &Message) -> Result<()> {
        self.inner.ensure_open()?;
        let partition = self.inner.route_one(message).await?;
        let producer = self.inner.partition_producer(&partition).await?;
        match producer.send(publishing_id, message).await {
            Err(e) if is_connection_failure(&e) => {
                warn!(partition = %partition, error = %e, "send hit a stale connection, rebinding");
                self.inner.invalidate(&producer).await;
                let producer = self.inner.partition_producer(&partition).await?;
                producer.send(publishing_id, message).await
            }
            other => other,
        }
    }

    /// Groups the entries by destination partition, preserving the relative
    /// input order within each partition, then issues one batch frame per
    /// partition. Grouping this way keeps per-partition counts identical
    /// across `send`, `batch_send` and `sub_entry_send` for the same keys.
    #[instrument(
        skip(self, entries),
        fields(super_stream = %self.inner.config.super_stream, batch_size = entries.len())
    )]
    pub async fn batch_send(&self, entries: Vec<(u64, Message)>) -> Result<()> {
        self.inner.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }

        let partitions = self.inner.partitions_snapshot().await;
        let mut grouped: HashMap<String, Vec<(u64, Message)>> = HashMap::new();
        for (publishing_id, message) in entries {
            let partition = self.inner.route_against(&message, &partitions)?;
            grouped
                .entry(partition)
                .or_default()
                .push((publishing_id, message));
        }

        for partition in partitions.iter() {
            let Some(batch) = grouped.remove(partition) else {
                continue;
            };
            let producer = self.inner.partition_producer(partition).await?;
            match producer.batch_send(&batch).await {
                Err(e) if is_connection_failure(&e) => {
                    warn!(partition = %partition, error = %e, "batch hit a stale connection, rebinding");
                    self.inner.invalidate(&producer).await;
                    let producer = self.inner.partition_producer(partition).await?;
                    producer.batch_send(&batch).await?;
                }
                Err(e) => return Err(e),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Same grouping as [`batch_send`](Self::batch_send), packed as one
    /// sub-entry frame per destination partition. The single publishing id
    /// is reused for every partition, so with a producer reference each
    /// partition deduplicates the batch independently.
    #[instrument(
        skip(self, messages),
        fields(super_stream = %self.inner.config.super_stream, batch_size = messages.len())
    )]
    pub async fn sub_entry_send(
        &self,
        publishing_id: u64,
        messages: Vec<Message>,
        compression: CompressionType,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        if messages.is_empty() {
            return Ok(());
        }

        let partitions = self.inner.partitions_snapshot().await;
        let mut grouped: HashMap<String, Vec<Message>> = HashMap::new();
        for message in messages {
            let partition = self.inner.route_against(&message, &partitions)?;
            grouped.entry(partition).or_default().push(message);
        }

        for partition in partitions.iter() {
            let Some(batch) = grouped.remove(partition) else {
                continue;
            };
            let producer = self.inner.partition_producer(partition).await?;
            match producer
                .sub_entry_send(publishing_id, &batch, compression)
                .await
            {
                Err(e) if is_connection_failure(&e) => {
                    warn!(partition = %partition, error = %e, "sub-entry hit a stale connection, rebinding");
                    self.inner.invalidate(&producer).await;
                    let producer = self.inner.partition_producer(partition).await?;
                    producer
                        .sub_entry_send(publishing_id, &batch, compression)
                        .await?;
                }
                Err(e) => return Err(e),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Maximum broker-acknowledged publishing id across all partitions.
    /// Returns 0 when no producer reference is configured.
    pub async fn get_last_publishing_id(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        let Some(reference) = self
            .inner
            .config
            .reference
            .as_deref()
            .filter(|r| !r.is_empty())
        else {
            return Ok(0);
        };

        let partitions = self.inner.partitions_snapshot().await;
        match self.inner.query_sequences(reference, &partitions).await {
            Err(e) if is_connection_failure(&e) => {
                warn!(error = %e, "sequence query hit a stale connection, retrying");
                self.inner.query_sequences(reference, &partitions).await
            }
            other => other,
        }
    }

    /// Closes every partition producer. Returns `Ok` when all close cleanly,
    /// otherwise the first non-OK response code. Idempotent.
    pub async fn close(&self) -> Result<ResponseCode> {
        if self.inner.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return Ok(ResponseCode::Ok);
        }

        if let Ok(mut slot) = self.inner.event_loop.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        let producers: Vec<Arc<PartitionProducer>> = self
            .inner
            .producers
            .write()
            .await
            .drain()
            .map(|(_, producer)| producer)
            .collect();

        let mut result = ResponseCode::Ok;
        for producer in producers {
            match producer.close().await {
                Ok(code) if !code.is_ok() && result.is_ok() => result = code,
                Err(e) => warn!(error = %e, "partition producer close failed"),
                Ok(_) => {}
            }
        }

        info!(super_stream = %self.inner.config.super_stream, "super-stream producer closed");
        Ok(result)
    }

    /// Forces [`close`](Self::close) with a one-second grace period.
    pub async fn dispose(&self) -> Result<()> {
        match timeout(Duration::from_secs(1), self.close()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                warn!(
                    super_stream = %self.inner.config.super_stream,
                    "close did not finish within the dispose grace period"
                );
                Ok(())
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_OPEN
    }

    /// Current partition list snapshot.
    pub async fn partitions(&self) -> Vec<String> {
        self.inner.partitions_snapshot().await.as_ref().clone()
    }
}

impl SuperStreamInner {
    fn ensure_open(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            Ok(())
        } else {
            Err(Error::AlreadyClosed)
        }
    }

    async fn partitions_snapshot(&self) -> Arc<Vec<String>> {
        self.partitions.read().await.clone()
    }

    /// Metadata transport resolved through the pool on every use, so the
    /// route heals after a disconnect instead of pinning the transport that
    /// was live at create time. Callers must release (or evict) the
    /// returned transport's endpoint when done.
    async fn locator(&self) -> Result<Arc<dyn StreamTransport>> {
        self.pool.acquire(&self.config.super_stream).await
    }

    /// Maximum acknowledged publishing id across `partitions`. Evicts the
    /// pooled route on a connection failure so a retry reconnects.
    async fn query_sequences(&self, reference: &str, partitions: &[String]) -> Result<u64> {
        let locator = self.locator().await?;
        let mut max_id = 0u64;
        for partition in partitions {
            match locator.query_publisher_sequence(reference, partition).await {
                Ok(sequence) => max_id = max_id.max(sequence),
                Err(e) => {
                    if is_connection_failure(&e) {
                        self.pool.evict(locator.endpoint()).await;
                    } else {
                        self.pool.release(locator.endpoint()).await;
                    }
                    return Err(e);
                }
            }
        }
        self.pool.release(locator.endpoint()).await;
        Ok(max_id)
    }

    /// Re-fetches the partition list. Evicts the pooled route on a
    /// connection failure so a retry reconnects.
    async fn fetch_partitions(&self) -> Result<Vec<String>> {
        let locator = self.locator().await?;
        let result = locator.partitions(&self.config.super_stream).await;
        match &result {
            Err(e) if is_connection_failure(e) => self.pool.evict(locator.endpoint()).await,
            _ => self.pool.release(locator.endpoint()).await,
        }
        result
    }

    async fn route_one(&self, message: &Message) -> Result<String> {
        let partitions = self.partitions_snapshot().await;
        self.route_against(message, &partitions)
    }

    fn route_against(&self, message: &Message, partitions: &[String]) -> Result<String> {
        let routed = self.routing.route(message, partitions)?;
        match routed.into_iter().next() {
            Some(partition) => Ok(partition),
            None => {
                let key = self.routing.extract_key(message).unwrap_or_default();
                Err(Error::NoRoute { key })
            }
        }
    }

    fn confirm_callback(&self) -> ConfirmationHandler {
        match &self.confirm_handler {
            Some(handler) => handler.clone(),
            None => Arc::new(|_, _| {}),
        }
    }

    /// Create-or-get for a partition producer. The fast path is a shared
    /// read of the producer map; creation takes a per-partition mutex so a
    /// publisher is never declared twice.
    async fn partition_producer(&self, partition: &str) -> Result<Arc<PartitionProducer>> {
        {
            let producers = self.producers.read().await;
            if let Some(producer) = producers.get(partition) {
                if producer.state() == ProducerState::Open {
                    return Ok(producer.clone());
                }
            }
        }

        let lock = {
            let mut locks = self.creation_locks.lock().await;
            locks
                .entry(partition.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        {
            let producers = self.producers.read().await;
            if let Some(producer) = producers.get(partition) {
                if producer.state() == ProducerState::Open {
                    return Ok(producer.clone());
                }
            }
        }

        if let Some(stale) = self.producers.write().await.remove(partition) {
            let _ = stale.close().await;
        }

        let producer = PartitionProducer::create(
            self.pool.clone(),
            partition,
            self.config.reference.as_deref(),
            self.confirm_callback(),
        )
        .await?;

        self.producers
            .write()
            .await
            .insert(partition.to_string(), producer.clone());
        debug!(partition = %partition, "partition producer bound");
        Ok(producer)
    }

    /// Drops a producer whose transport turned out to be dead so the next
    /// send rebuilds it from fresh metadata.
    async fn invalidate(&self, producer: &Arc<PartitionProducer>) {
        producer.mark_reconnecting();
        self.pool.evict(producer.endpoint()).await;
        let mut producers = self.producers.write().await;
        if let Some(current) = producers.get(producer.stream()) {
            if Arc::ptr_eq(current, producer) {
                producers.remove(producer.stream());
            }
        }
    }

    async fn handle_connection_closed(&self, endpoint: &str, reason: &str) {
        warn!(
            endpoint,
            reason,
            super_stream = %self.config.super_stream,
            "connection closed"
        );
        self.pool.evict(endpoint).await;

        let mut producers = self.producers.write().await;
        let affected: Vec<String> = producers
            .iter()
            .filter(|(_, producer)| producer.endpoint() == endpoint)
            .map(|(name, _)| name.clone())
            .collect();
        for name in affected {
            if let Some(producer) = producers.remove(&name) {
                producer.mark_reconnecting();
                debug!(partition = %name, "partition producer invalidated");
            }
        }
        drop(producers);

        if let Some(handler) = &self.connection_closed_handler {
            handler(reason);
        }
    }

    async fn handle_metadata_update(&self, stream: &str, code: ResponseCode) {
        info!(stream, code = ?code, "metadata update");

        if code.stream_is_gone() {
            let removed = self.producers.write().await.remove(stream);
            if let Some(producer) = removed {
                let _ = producer.close().await;
                debug!(partition = %stream, "partition producer removed, stream is gone");
            }
        }

        let latest = match self.fetch_partitions().await {
            Err(e) if is_connection_failure(&e) => {
                warn!(error = %e, "partition refresh hit a stale connection, retrying");
                self.fetch_partitions().await
            }
            other => other,
        };

        match latest {
            Ok(latest) if !latest.is_empty() => {
                *self.partitions.write().await = Arc::new(latest);
            }
            _ if code.stream_is_gone() => {
                // Locator could not answer; at least stop routing to the
                // partition the broker told us is gone.
                let mut partitions = self.partitions.write().await;
                let remaining: Vec<String> = partitions
                    .iter()
                    .filter(|p| p.as_str() != stream)
                    .cloned()
                    .collect();
                *partitions = Arc::new(remaining);
            }
            _ => {}
        }
    }
}

fn is_connection_failure(error: &Error) -> bool {
    matches!(error, Error::NotConnected { .. } | Error::Connection(_))
}

fn spawn_event_loop(inner: &Arc<SuperStreamInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let mut events = inner.pool.events();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "producer event loop lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            match event {
                TransportEvent::ConnectionClosed { endpoint, reason } => {
                    inner.handle_connection_closed(&endpoint, &reason).await;
                }
                TransportEvent::MetadataUpdate { stream, code } => {
                    inner.handle_metadata_update(&stream, code).await;
                }
            }
        }
    })
}
