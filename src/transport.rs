//! Interfaces to the lower wire layer.
//!
//! The binary codec, TCP framing and connection lifecycle live below this
//! crate; producers and consumers talk to them exclusively through the
//! [`StreamTransport`] trait. A [`TransportPool`] shares one transport per
//! broker endpoint across every producer and consumer routed there, closing
//! it once the last reference is released.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use crate::Result;

/// Broker response codes surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    StreamDoesNotExist,
    StreamNotAvailable,
    SubscriptionIdDoesNotExist,
    PublisherDoesNotExist,
    AccessRefused,
    PreconditionFailed,
    InternalError,
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        matches!(self, ResponseCode::Ok)
    }

    /// Whether a metadata update with this code means the stream is gone
    /// from its current broker and must be dropped or relocated.
    pub fn stream_is_gone(self) -> bool {
        matches!(
            self,
            ResponseCode::StreamDoesNotExist | ResponseCode::StreamNotAvailable
        )
    }
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum OffsetSpec {
    First,
    Last,
    #[default]
    Next,
    Offset(u64),
    Timestamp(i64),
}

/// Compression applied to a sub-entry batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Gzip = 1,
}

impl CompressionType {
    /// Decodes the compression type from an entry-type byte whose high bit
    /// marks a sub-entry; the low 7 bits carry the compression.
    pub fn from_entry_type(entry_type: u8) -> crate::Result<Self> {
        match entry_type & 0x7f {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Gzip),
            other => Err(crate::Error::InvalidMessage {
                message: format!("unknown compression type: {other}"),
            }),
        }
    }

    pub fn entry_type(self) -> u8 {
        0x80 | self as u8
    }
}

/// One batch of records as delivered by the broker. `chunk_id` is the offset
/// of the first record; `data` may contain standard entries and sub-entry
/// batches.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: u64,
    pub timestamp: i64,
    pub num_records: u32,
    pub data: Bytes,
}

impl Chunk {
    /// Broker timestamp (epoch milliseconds) as a UTC datetime.
    pub fn timestamp_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Broker acknowledgement for one publishing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub publishing_id: u64,
    pub code: ResponseCode,
}

/// Out-of-band signals from a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionClosed { endpoint: String, reason: String },
    MetadataUpdate { stream: String, code: ResponseCode },
}

/// Callback invoked by the transport for every publish confirmation.
pub type ConfirmCallback = Arc<dyn Fn(Confirmation) + Send + Sync>;

/// The lower layer this crate consumes: declare/publish on the producer
/// side, subscribe/credit on the consumer side, metadata queries, and a
/// broadcast of connection/metadata signals.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn partitions(&self, super_stream: &str) -> Result<Vec<String>>;

    async fn declare_publisher(
        &self,
        stream: &str,
        reference: Option<&str>,
        confirm: ConfirmCallback,
    ) -> Result<(u8, ResponseCode)>;

    /// Hands one frame carrying the given `(publishing_id, entry)` pairs to
    /// the wire, preserving their order.
    async fn publish(&self, publisher_id: u8, entries: Vec<(u64, Bytes)>) -> Result<()>;

    /// Hands one sub-entry frame to the wire. A single publishing id covers
    /// the whole batch; the uncompressed size is recorded in the frame.
    async fn publish_sub_batch(
        &self,
        publisher_id: u8,
        publishing_id: u64,
        compression: CompressionType,
        record_count: u16,
        uncompressed_size: u32,
        payload: Bytes,
    ) -> Result<()>;

    async fn query_publisher_sequence(&self, reference: &str, stream: &str) -> Result<u64>;

    async fn delete_publisher(&self, publisher_id: u8) -> Result<ResponseCode>;

    async fn subscribe(
        &self,
        stream: &str,
        offset_spec: OffsetSpec,
        initial_credit: u16,
        properties: HashMap<String, String>,
        chunks: mpsc::Sender<Chunk>,
    ) -> Result<(u8, ResponseCode)>;

    async fn credit(&self, subscriber_id: u8, credit: u16) -> Result<()>;

    async fn unsubscribe(&self, subscriber_id: u8) -> Result<ResponseCode>;

    async fn store_offset(&self, reference: &str, stream: &str, offset: u64) -> Result<()>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Locates the broker leading a stream and opens transports to it.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn locate(&self, stream: &str) -> Result<String>;

    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn StreamTransport>>;
}

struct PooledTransport {
    transport: Arc<dyn StreamTransport>,
    refs: usize,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Reference-counted transports keyed by broker endpoint.
///
/// Every acquire for a stream resolves the leading broker and either bumps
/// the refcount of the existing transport or connects a new one. Events from
/// all pooled transports are merged into a single broadcast so producer and
/// consumer glue can watch one channel.
pub struct TransportPool {
    factory: Arc<dyn TransportFactory>,
    routes: RwLock<HashMap<String, PooledTransport>>,
    events: broadcast::Sender<TransportEvent>,
}

impl TransportPool {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            factory,
            routes: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Acquires a transport to the broker currently leading `stream`.
    pub async fn acquire(&self, stream: &str) -> Result<Arc<dyn StreamTransport>> {
        let endpoint = self.factory.locate(stream).await?;

        let mut routes = self.routes.write().await;
        if let Some(entry) = routes.get_mut(&endpoint) {
            entry.refs += 1;
            debug!(endpoint = %endpoint, refs = entry.refs, "reusing pooled transport");
            return Ok(entry.transport.clone());
        }

        let transport = self.factory.connect(&endpoint).await?;
        let mut incoming = transport.events();
        let merged = self.events.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(event) => {
                        let _ = merged.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "transport event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!(endpoint = %endpoint, "opened transport");
        routes.insert(
            endpoint,
            PooledTransport {
                transport: transport.clone(),
                refs: 1,
                forwarder,
            },
        );
        Ok(transport)
    }

    /// Releases one reference to the transport at `endpoint`; the transport
    /// is dropped once no producer or consumer references remain.
    pub async fn release(&self, endpoint: &str) {
        let mut routes = self.routes.write().await;
        let drop_entry = match routes.get_mut(endpoint) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if drop_entry {
            if let Some(entry) = routes.remove(endpoint) {
                entry.forwarder.abort();
                debug!(endpoint = %endpoint, "closed transport, no references remain");
            }
        }
    }

    /// Drops the pooled transport at `endpoint` regardless of refcount.
    /// Used when the connection is known dead; later acquires reconnect.
    pub async fn evict(&self, endpoint: &str) {
        let mut routes = self.routes.write().await;
        if let Some(entry) = routes.remove(endpoint) {
            entry.forwarder.abort();
            warn!(endpoint = %endpoint, "evicted transport");
        }
    }

    /// Merged signal stream across every pooled transport.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub async fn transport_count(&self) -> usize {
        self.routes.read().await.len()
    }
}
