use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, instrument, warn};

use crate::message::Message;
use crate::producer::ConfirmationHandler;
use crate::transport::{
    CompressionType, Confirmation, ResponseCode, StreamTransport, TransportPool,
};
use crate::{Error, Result};

const STATE_CREATING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_RECONNECTING: u8 = 2;
const STATE_CLOSED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Creating,
    Open,
    Reconnecting,
    Closed,
}

impl ProducerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_CREATING => ProducerState::Creating,
            STATE_OPEN => ProducerState::Open,
            STATE_RECONNECTING => ProducerState::Reconnecting,
            _ => ProducerState::Closed,
        }
    }
}

/// Publishing context for a single partition stream.
///
/// Owns one publisher registration on the transport leading the partition.
/// Publishing ids pass through untouched and are never reordered within the
/// partition; every broker acknowledgement reaches the confirmation handler
/// tagged with the partition name.
pub struct PartitionProducer {
    stream: String,
    endpoint: String,
    reference: Option<String>,
    publisher_id: u8,
    transport: Arc<dyn StreamTransport>,
    pool: Arc<TransportPool>,
    state: AtomicU8,
    pending_confirms: Arc<AtomicUsize>,
    last_confirmed_id: Arc<AtomicU64>,
}

impl PartitionProducer {
    /// Looks up the partition's broker, declares a publisher and wires the
    /// confirmation path.
    pub(crate) async fn create(
        pool: Arc<TransportPool>,
        stream: &str,
        reference: Option<&str>,
        on_confirm: ConfirmationHandler,
    ) -> Result<Arc<Self>> {
        let transport = pool.acquire(stream).await?;
        let endpoint = transport.endpoint().to_string();

        let pending_confirms = Arc::new(AtomicUsize::new(0));
        let last_confirmed_id = Arc::new(AtomicU64::new(0));

        let confirm = {
            let pending = pending_confirms.clone();
            let last_confirmed = last_confirmed_id.clone();
            let partition = stream.to_string();
            Arc::new(move |confirmation: Confirmation| {
                let _ = pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                });
                if confirmation.code.is_ok() {
                    last_confirmed.fetch_max(confirmation.publishing_id, Ordering::AcqRel);
                }
                on_confirm(&partition, confirmation);
            })
        };

        let (publisher_id, code) = match transport.declare_publisher(stream, reference, confirm).await
        {
            Ok(declared) => declared,
            Err(e) => {
                pool.release(&endpoint).await;
                return Err(e);
            }
        };
        if !code.is_ok() {
            pool.release(&endpoint).await;
            return Err(Error::Broker { code });
        }

        info!(stream = %stream, endpoint = %endpoint, publisher_id, "partition producer open");

        Ok(Arc::new(Self {
            stream: stream.to_string(),
            endpoint,
            reference: reference.map(str::to_string),
            publisher_id,
            transport,
            pool,
            state: AtomicU8::new(STATE_OPEN),
            pending_confirms,
            last_confirmed_id,
        }))
    }

    /// Enqueues one message for transmission. Returns once the frame is
    /// handed to the transport, not once the broker confirms it.
    #[instrument(skip(self, message), fields(stream = %self.stream))]
    pub async fn send(&self, publishing_id: u64, message: &Message) -> Result<()> {
        self.ensure_open()?;
        self.pending_confirms.fetch_add(1, Ordering::AcqRel);
        let result = self
            .transport
            .publish(self.publisher_id, vec![(publishing_id, message.encode())])
            .await;
        if result.is_err() {
            let _ = self
                .pending_confirms
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                });
        }
        result
    }

    /// Sends all entries in a single frame, preserving their order.
    #[instrument(skip(self, entries), fields(stream = %self.stream, batch_size = entries.len()))]
    pub async fn batch_send(&self, entries: &[(u64, Message)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;

        let encoded: Vec<(u64, Bytes)> = entries
            .iter()
            .map(|(publishing_id, message)| (*publishing_id, message.encode()))
            .collect();

        self.pending_confirms
            .fetch_add(encoded.len(), Ordering::AcqRel);
        let result = self.transport.publish(self.publisher_id, encoded).await;
        if result.is_err() {
            let _ = self
                .pending_confirms
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(entries.len()))
                });
        }
        result
    }

    /// Packs the messages into one sub-entry frame under a single publishing
    /// id. The uncompressed size is recorded in the frame so the consumer
    /// can size its inflate buffer.
    #[instrument(skip(self, messages), fields(stream = %self.stream, batch_size = messages.len()))]
    pub async fn sub_entry_send(
        &self,
        publishing_id: u64,
        messages: &[Message],
        compression: CompressionType,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;

        if messages.len() > u16::MAX as usize {
            return Err(Error::InvalidMessage {
                message: format!("sub-entry batch of {} exceeds u16 records", messages.len()),
            });
        }

        let mut body = BytesMut::with_capacity(
            messages.iter().map(|m| 4 + m.encoded_len()).sum::<usize>(),
        );
        for message in messages {
            body.extend_from_slice(&(message.encoded_len() as u32).to_be_bytes());
            message.encode_into(&mut body);
        }
        let uncompressed = body.freeze();
        let uncompressed_size = uncompressed.len() as u32;

        let payload = match compression {
            CompressionType::None => uncompressed,
            CompressionType::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&uncompressed)?;
                Bytes::from(encoder.finish()?)
            }
        };

        debug!(
            uncompressed_size,
            compressed_size = payload.len(),
            "sub-entry frame built"
        );

        self.pending_confirms.fetch_add(1, Ordering::AcqRel);
        let result = self
            .transport
            .publish_sub_batch(
                self.publisher_id,
                publishing_id,
                compression,
                messages.len() as u16,
                uncompressed_size,
                payload,
            )
            .await;
        if result.is_err() {
            let _ = self
                .pending_confirms
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                });
        }
        result
    }

    /// Broker-acknowledged publishing-id highwater for this
    /// `(reference, stream)`. Returns 0 when no reference is set.
    pub async fn last_publishing_id(&self) -> Result<u64> {
        match self.reference.as_deref() {
            Some(reference) if !reference.is_empty() => {
                self.transport
                    .query_publisher_sequence(reference, &self.stream)
                    .await
            }
            _ => Ok(0),
        }
    }

    /// Deletes the publisher registration and releases the transport.
    /// Idempotent; a second close returns `Ok` immediately.
    pub async fn close(&self) -> Result<ResponseCode> {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return Ok(ResponseCode::Ok);
        }

        let code = match self.transport.delete_publisher(self.publisher_id).await {
            Ok(code) => code,
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "delete publisher failed on close");
                ResponseCode::Ok
            }
        };

        self.pool.release(&self.endpoint).await;
        debug!(stream = %self.stream, "partition producer closed");
        Ok(code)
    }

    /// Flags the producer as disconnected; the owning super-stream producer
    /// rebuilds it on the next send.
    pub(crate) fn mark_reconnecting(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_RECONNECTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn state(&self) -> ProducerState {
        ProducerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pending_confirmations(&self) -> usize {
        self.pending_confirms.load(Ordering::Acquire)
    }

    pub fn last_confirmed_id(&self) -> u64 {
        self.last_confirmed_id.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ProducerState::Open => Ok(()),
            ProducerState::Closed => Err(Error::AlreadyClosed),
            ProducerState::Creating | ProducerState::Reconnecting => Err(Error::NotConnected {
                stream: self.stream.clone(),
            }),
        }
    }
}
