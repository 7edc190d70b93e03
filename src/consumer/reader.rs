use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::ConsumerConfig;
use crate::consumer::chunk::ChunkReader;
use crate::consumer::{MessageHandler, MetadataUpdateHandler};
use crate::transport::{
    Chunk, OffsetSpec, ResponseCode, StreamTransport, TransportEvent, TransportPool,
};
use crate::{Error, Result};

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// Per-delivery context handed to the message handler. Long-running
/// handlers should poll [`is_cancelled`](Self::is_cancelled) so close can
/// interrupt them between messages.
#[derive(Clone)]
pub struct ConsumerContext {
    pub stream: String,
    pub offset: u64,
    pub timestamp: i64,
    cancelled: Arc<AtomicBool>,
}

impl ConsumerContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Builder for [`Consumer`]. The message handler is required.
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    pool: Arc<TransportPool>,
    message_handler: Option<MessageHandler>,
    metadata_handler: Option<MetadataUpdateHandler>,
}

impl ConsumerBuilder {
    pub fn message_handler(mut self, handler: MessageHandler) -> Self {
        self.message_handler = Some(handler);
        self
    }

    pub fn metadata_handler(mut self, handler: MetadataUpdateHandler) -> Self {
        self.metadata_handler = Some(handler);
        self
    }

    /// Validates the configuration, subscribes to the stream and starts the
    /// dispatch task.
    pub async fn build(self) -> Result<Consumer> {
        self.config.validate()?;
        let handler = self.message_handler.ok_or_else(|| {
            Error::CreateConsumer("a message handler is required".to_string())
        })?;

        let transport = self
            .pool
            .acquire(&self.config.stream)
            .await
            .map_err(|e| Error::CreateConsumer(e.to_string()))?;
        let endpoint = transport.endpoint().to_string();

        let mut properties = HashMap::new();
        if let Some(name) = &self.config.client_provided_name {
            properties.insert("connection_name".to_string(), name.clone());
        }
        if let Some(reference) = &self.config.reference {
            properties.insert("name".to_string(), reference.clone());
        }
        if self.config.single_active_consumer {
            properties.insert("single-active-consumer".to_string(), "true".to_string());
            if let Some(super_stream) = &self.config.super_stream {
                properties.insert("super-stream".to_string(), super_stream.clone());
            }
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(32);
        let (subscriber_id, code) = match transport
            .subscribe(
                &self.config.stream,
                self.config.offset_spec,
                self.config.initial_credit,
                properties,
                chunk_tx,
            )
            .await
        {
            Ok(subscribed) => subscribed,
            Err(e) => {
                self.pool.release(&endpoint).await;
                return Err(Error::CreateConsumer(e.to_string()));
            }
        };
        if !code.is_ok() {
            self.pool.release(&endpoint).await;
            return Err(Error::CreateConsumer(format!(
                "subscribe to '{}' returned {code:?}",
                self.config.stream
            )));
        }

        info!(
            stream = %self.config.stream,
            subscriber_id,
            offset_spec = ?self.config.offset_spec,
            "consumer open"
        );

        let inner = Arc::new(ConsumerInner {
            config: self.config,
            transport,
            endpoint,
            pool: self.pool,
            subscriber_id,
            state: AtomicU8::new(STATE_OPEN),
            cancelled: Arc::new(AtomicBool::new(false)),
            dispatch: StdMutex::new(None),
        });

        let handle = tokio::spawn(dispatch_loop(
            inner.clone(),
            chunk_rx,
            handler,
            self.metadata_handler,
        ));
        if let Ok(mut slot) = inner.dispatch.lock() {
            *slot = Some(handle);
        }

        Ok(Consumer { inner })
    }
}

/// Subscription to one stream: grants credit as chunks arrive, parses them
/// and dispatches records through the message handler.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

struct ConsumerInner {
    config: ConsumerConfig,
    transport: Arc<dyn StreamTransport>,
    endpoint: String,
    pool: Arc<TransportPool>,
    subscriber_id: u8,
    state: AtomicU8,
    cancelled: Arc<AtomicBool>,
    dispatch: StdMutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub fn builder(config: ConsumerConfig, pool: Arc<TransportPool>) -> ConsumerBuilder {
        ConsumerBuilder {
            config,
            pool,
            message_handler: None,
            metadata_handler: None,
        }
    }

    /// Stores `offset` broker-side under this consumer's reference.
    #[instrument(skip(self), fields(stream = %self.inner.config.stream))]
    pub async fn store_offset(&self, offset: u64) -> Result<()> {
        self.inner.ensure_open()?;
        let reference = self
            .inner
            .config
            .reference
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::Config("a reference is required to store offsets".to_string())
            })?;
        self.inner
            .transport
            .store_offset(reference, &self.inner.config.stream, offset)
            .await
    }

    /// Unsubscribes and stops dispatching. The stream may already be gone,
    /// so the unsubscribe round-trip is bounded at three seconds.
    /// Idempotent.
    pub async fn close(&self) -> Result<ResponseCode> {
        if self.inner.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return Ok(ResponseCode::Ok);
        }
        self.inner.cancelled.store(true, Ordering::Release);

        let code = match timeout(
            Duration::from_secs(3),
            self.inner.transport.unsubscribe(self.inner.subscriber_id),
        )
        .await
        {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                warn!(error = %e, "unsubscribe failed on close");
                ResponseCode::Ok
            }
            Err(_) => {
                warn!("unsubscribe timed out on close");
                ResponseCode::Ok
            }
        };

        // The dispatch task sees the cancellation flag and the closed chunk
        // channel; detach rather than join so close can be called from
        // inside a message handler.
        if let Ok(mut slot) = self.inner.dispatch.lock() {
            slot.take();
        }

        self.inner.pool.release(&self.inner.endpoint).await;
        info!(stream = %self.inner.config.stream, "consumer closed");
        Ok(code)
    }

    /// Forces [`close`](Self::close) with a one-second grace period.
    pub async fn dispose(&self) -> Result<()> {
        match timeout(Duration::from_secs(1), self.close()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                warn!(
                    stream = %self.inner.config.stream,
                    "close did not finish within the dispose grace period"
                );
                Ok(())
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_OPEN
    }

    pub fn subscriber_id(&self) -> u8 {
        self.inner.subscriber_id
    }

    pub fn stream(&self) -> &str {
        &self.inner.config.stream
    }
}

impl ConsumerInner {
    fn ensure_open(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            Ok(())
        } else {
            Err(Error::AlreadyClosed)
        }
    }
}

async fn dispatch_loop(
    inner: Arc<ConsumerInner>,
    mut chunks: mpsc::Receiver<Chunk>,
    handler: MessageHandler,
    metadata_handler: Option<MetadataUpdateHandler>,
) {
    let mut events = inner.transport.events();
    loop {
        tokio::select! {
            maybe_chunk = chunks.recv() => {
                let Some(chunk) = maybe_chunk else { break };
                if inner.cancelled.load(Ordering::Acquire) {
                    break;
                }
                process_chunk(&inner, &handler, chunk).await;
            }
            event = events.recv() => {
                match event {
                    Ok(TransportEvent::MetadataUpdate { stream, code })
                        if stream == inner.config.stream =>
                    {
                        info!(stream = %stream, code = ?code, "metadata update for subscribed stream");
                        if let Some(h) = &metadata_handler {
                            h(&stream, code);
                        }
                    }
                    Ok(TransportEvent::ConnectionClosed { endpoint, reason })
                        if endpoint == inner.endpoint =>
                    {
                        warn!(endpoint = %endpoint, reason = %reason, "consumer connection closed");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "consumer event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // No more signals; keep draining whatever chunks are
                        // already queued.
                        while let Some(chunk) = chunks.recv().await {
                            if inner.cancelled.load(Ordering::Acquire) {
                                break;
                            }
                            process_chunk(&inner, &handler, chunk).await;
                        }
                        break;
                    }
                }
            }
        }
        if inner.cancelled.load(Ordering::Acquire) {
            break;
        }
    }
    debug!(stream = %inner.config.stream, "consumer dispatch finished");
}

async fn process_chunk(inner: &Arc<ConsumerInner>, handler: &MessageHandler, chunk: Chunk) {
    // Grant the next credit before parsing so the broker can ship the next
    // chunk while this one is being handled.
    if let Err(e) = inner.transport.credit(inner.subscriber_id, 1).await {
        warn!(error = %e, "credit grant failed");
    }

    let mut reader = ChunkReader::new(&chunk);
    let mut delivered = 0u64;
    let mut skipped = 0u64;

    while let Some((offset, record)) = reader.next_record() {
        if inner.cancelled.load(Ordering::Acquire) {
            debug!(offset, "cancelled while dispatching chunk");
            return;
        }
        match record {
            Ok(message) => {
                if let OffsetSpec::Offset(start) = inner.config.offset_spec {
                    if offset < start {
                        skipped += 1;
                        continue;
                    }
                }
                let context = ConsumerContext {
                    stream: inner.config.stream.clone(),
                    offset,
                    timestamp: chunk.timestamp,
                    cancelled: inner.cancelled.clone(),
                };
                handler(context, message).await;
                delivered += 1;
            }
            Err(e) => {
                warn!(offset, error = %e, "skipping undecodable record");
                skipped += 1;
            }
        }
    }

    debug!(
        chunk_id = chunk.chunk_id,
        delivered,
        skipped = skipped + reader.skipped(),
        "chunk dispatched"
    );
}
