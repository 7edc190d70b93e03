#![allow(dead_code)]

//! Shared test fixtures: an in-memory broker implementing the transport
//! traits, with handles to kill connections, delete streams and inspect
//! what was published.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use tokio::sync::{broadcast, mpsc};

use superstream::transport::{
    Chunk, CompressionType, ConfirmCallback, Confirmation, OffsetSpec, ResponseCode,
    StreamTransport, TransportEvent, TransportFactory,
};
use superstream::{Error, Result};

pub const ENDPOINT: &str = "node-0:5552";

/// Polls `condition` for up to two seconds before failing the test.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s: {what}");
}

#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub publishing_id: u64,
    pub payload: Bytes,
}

#[derive(Default)]
struct StreamLog {
    records: Vec<StoredRecord>,
    /// Highest publishing id accepted per producer reference; ids at or
    /// below the watermark are deduplicated.
    watermarks: HashMap<String, u64>,
    stored_offsets: HashMap<String, u64>,
}

#[derive(Default)]
struct BrokerState {
    streams: Mutex<HashMap<String, StreamLog>>,
    super_streams: Mutex<HashMap<String, Vec<String>>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

/// In-memory broker shared by every transport the factory connects.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_super_stream(&self, name: &str, partitions: &[&str]) {
        let mut streams = self.state.streams.lock().unwrap();
        for partition in partitions {
            streams.insert(partition.to_string(), StreamLog::default());
        }
        self.state.super_streams.lock().unwrap().insert(
            name.to_string(),
            partitions.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub fn add_stream(&self, name: &str) {
        self.state
            .streams
            .lock()
            .unwrap()
            .insert(name.to_string(), StreamLog::default());
    }

    /// Removes the stream and notifies every live transport the way the
    /// broker does when a partition is deleted.
    pub fn delete_stream(&self, stream: &str) {
        self.state.streams.lock().unwrap().remove(stream);
        for partitions in self.state.super_streams.lock().unwrap().values_mut() {
            partitions.retain(|p| p != stream);
        }
        for transport in self.live_transports() {
            let _ = transport.events.send(TransportEvent::MetadataUpdate {
                stream: stream.to_string(),
                code: ResponseCode::StreamDoesNotExist,
            });
        }
    }

    /// Kills every live connection. Later connects get fresh transports.
    pub fn kill_connections(&self) {
        for transport in self.live_transports() {
            transport.alive.store(false, Ordering::Release);
            let _ = transport.events.send(TransportEvent::ConnectionClosed {
                endpoint: transport.endpoint.clone(),
                reason: "killed by test".to_string(),
            });
        }
    }

    pub fn counts(&self) -> HashMap<String, usize> {
        self.state
            .streams
            .lock()
            .unwrap()
            .iter()
            .map(|(name, log)| (name.clone(), log.records.len()))
            .collect()
    }

    pub fn records(&self, stream: &str) -> Vec<StoredRecord> {
        self.state
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    pub fn stored_offset(&self, stream: &str, reference: &str) -> Option<u64> {
        self.state
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|log| log.stored_offsets.get(reference).copied())
    }

    pub fn live_connection_count(&self) -> usize {
        self.live_transports().len()
    }

    /// Total credit granted for subscriptions on `stream`, initial credit
    /// included.
    pub fn credit_granted(&self, stream: &str) -> u64 {
        self.state
            .transports
            .lock()
            .unwrap()
            .iter()
            .map(|transport| {
                transport
                    .subscriptions
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|sub| sub.stream == stream)
                    .map(|sub| sub.granted_total)
                    .sum::<u64>()
            })
            .sum()
    }

    /// Pushes one chunk to every subscription on `stream` that has credit.
    pub async fn deliver_chunk(&self, stream: &str, chunk: Chunk) {
        let mut targets = Vec::new();
        for transport in self.live_transports() {
            let mut subscriptions = transport.subscriptions.lock().unwrap();
            for subscription in subscriptions.values_mut() {
                if subscription.stream == stream && subscription.credits > 0 {
                    subscription.credits -= 1;
                    targets.push(subscription.sender.clone());
                }
            }
        }
        for sender in targets {
            let _ = sender.send(chunk.clone()).await;
        }
    }

    /// Properties recorded with the first subscription on `stream`.
    pub fn subscription_properties(&self, stream: &str) -> Option<HashMap<String, String>> {
        for transport in self.state.transports.lock().unwrap().iter() {
            let subscriptions = transport.subscriptions.lock().unwrap();
            if let Some(subscription) = subscriptions.values().find(|s| s.stream == stream) {
                return Some(subscription.properties.clone());
            }
        }
        None
    }

    fn live_transports(&self) -> Vec<Arc<MockTransport>> {
        self.state
            .transports
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.alive.load(Ordering::Acquire))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransportFactory for MockBroker {
    async fn locate(&self, stream: &str) -> Result<String> {
        let known = self.state.streams.lock().unwrap().contains_key(stream)
            || self
                .state
                .super_streams
                .lock()
                .unwrap()
                .contains_key(stream);
        if known {
            Ok(ENDPOINT.to_string())
        } else {
            Err(Error::Connection(format!(
                "no metadata for stream '{stream}'"
            )))
        }
    }

    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn StreamTransport>> {
        let (events, _) = broadcast::channel(64);
        let transport = Arc::new(MockTransport {
            endpoint: endpoint.to_string(),
            state: self.state.clone(),
            events,
            alive: AtomicBool::new(true),
            next_id: AtomicU8::new(0),
            publishers: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        });
        self.state
            .transports
            .lock()
            .unwrap()
            .push(transport.clone());
        Ok(transport)
    }
}

struct Publisher {
    stream: String,
    reference: Option<String>,
    confirm: ConfirmCallback,
}

struct Subscription {
    stream: String,
    sender: mpsc::Sender<Chunk>,
    credits: u64,
    granted_total: u64,
    properties: HashMap<String, String>,
}

pub struct MockTransport {
    endpoint: String,
    state: Arc<BrokerState>,
    events: broadcast::Sender<TransportEvent>,
    alive: AtomicBool,
    next_id: AtomicU8,
    publishers: Mutex<HashMap<u8, Publisher>>,
    subscriptions: Mutex<HashMap<u8, Subscription>>,
}

impl MockTransport {
    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Connection("connection closed".to_string()))
        }
    }

    fn publisher(&self, publisher_id: u8) -> Result<(String, Option<String>, ConfirmCallback)> {
        let publishers = self.publishers.lock().unwrap();
        publishers
            .get(&publisher_id)
            .map(|p| (p.stream.clone(), p.reference.clone(), p.confirm.clone()))
            .ok_or_else(|| Error::Connection(format!("unknown publisher {publisher_id}")))
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn partitions(&self, super_stream: &str) -> Result<Vec<String>> {
        self.ensure_alive()?;
        self.state
            .super_streams
            .lock()
            .unwrap()
            .get(super_stream)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("unknown super stream '{super_stream}'")))
    }

    async fn declare_publisher(
        &self,
        stream: &str,
        reference: Option<&str>,
        confirm: ConfirmCallback,
    ) -> Result<(u8, ResponseCode)> {
        self.ensure_alive()?;
        if !self.state.streams.lock().unwrap().contains_key(stream) {
            return Ok((0, ResponseCode::StreamDoesNotExist));
        }
        let publisher_id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.publishers.lock().unwrap().insert(
            publisher_id,
            Publisher {
                stream: stream.to_string(),
                reference: reference.map(str::to_string),
                confirm,
            },
        );
        Ok((publisher_id, ResponseCode::Ok))
    }

    async fn publish(&self, publisher_id: u8, entries: Vec<(u64, Bytes)>) -> Result<()> {
        self.ensure_alive()?;
        let (stream, reference, confirm) = self.publisher(publisher_id)?;

        let mut confirmations = Vec::with_capacity(entries.len());
        {
            let mut streams = self.state.streams.lock().unwrap();
            let log = streams
                .get_mut(&stream)
                .ok_or_else(|| Error::Connection(format!("stream '{stream}' does not exist")))?;
            for (publishing_id, payload) in entries {
                log.append(reference.as_deref(), publishing_id, payload);
                confirmations.push(Confirmation {
                    publishing_id,
                    code: ResponseCode::Ok,
                });
            }
        }
        for confirmation in confirmations {
            confirm(confirmation);
        }
        Ok(())
    }

    async fn publish_sub_batch(
        &self,
        publisher_id: u8,
        publishing_id: u64,
        compression: CompressionType,
        record_count: u16,
        uncompressed_size: u32,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_alive()?;
        let (stream, reference, confirm) = self.publisher(publisher_id)?;

        let mut body = match compression {
            CompressionType::None => payload,
            CompressionType::Gzip => {
                let mut out = Vec::with_capacity(uncompressed_size as usize);
                GzDecoder::new(payload.as_ref())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Connection(format!("bad gzip payload: {e}")))?;
                Bytes::from(out)
            }
        };
        assert_eq!(body.len(), uncompressed_size as usize);

        {
            let mut streams = self.state.streams.lock().unwrap();
            let log = streams
                .get_mut(&stream)
                .ok_or_else(|| Error::Connection(format!("stream '{stream}' does not exist")))?;
            if log.accepts(reference.as_deref(), publishing_id) {
                for _ in 0..record_count {
                    let len = body.get_u32() as usize;
                    let record = body.split_to(len);
                    log.records.push(StoredRecord {
                        publishing_id,
                        payload: record,
                    });
                }
                log.advance_watermark(reference.as_deref(), publishing_id);
            }
        }

        confirm(Confirmation {
            publishing_id,
            code: ResponseCode::Ok,
        });
        Ok(())
    }

    async fn query_publisher_sequence(&self, reference: &str, stream: &str) -> Result<u64> {
        self.ensure_alive()?;
        Ok(self
            .state
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|log| log.watermarks.get(reference).copied())
            .unwrap_or(0))
    }

    async fn delete_publisher(&self, publisher_id: u8) -> Result<ResponseCode> {
        self.ensure_alive()?;
        self.publishers.lock().unwrap().remove(&publisher_id);
        Ok(ResponseCode::Ok)
    }

    async fn subscribe(
        &self,
        stream: &str,
        _offset_spec: OffsetSpec,
        initial_credit: u16,
        properties: HashMap<String, String>,
        chunks: mpsc::Sender<Chunk>,
    ) -> Result<(u8, ResponseCode)> {
        self.ensure_alive()?;
        if !self.state.streams.lock().unwrap().contains_key(stream) {
            return Ok((0, ResponseCode::StreamDoesNotExist));
        }
        let subscriber_id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.subscriptions.lock().unwrap().insert(
            subscriber_id,
            Subscription {
                stream: stream.to_string(),
                sender: chunks,
                credits: u64::from(initial_credit),
                granted_total: u64::from(initial_credit),
                properties,
            },
        );
        Ok((subscriber_id, ResponseCode::Ok))
    }

    async fn credit(&self, subscriber_id: u8, credit: u16) -> Result<()> {
        self.ensure_alive()?;
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .get_mut(&subscriber_id)
            .ok_or_else(|| Error::Connection(format!("unknown subscriber {subscriber_id}")))?;
        subscription.credits += u64::from(credit);
        subscription.granted_total += u64::from(credit);
        Ok(())
    }

    async fn unsubscribe(&self, subscriber_id: u8) -> Result<ResponseCode> {
        self.ensure_alive()?;
        self.subscriptions.lock().unwrap().remove(&subscriber_id);
        Ok(ResponseCode::Ok)
    }

    async fn store_offset(&self, reference: &str, stream: &str, offset: u64) -> Result<()> {
        self.ensure_alive()?;
        let mut streams = self.state.streams.lock().unwrap();
        let log = streams
            .get_mut(stream)
            .ok_or_else(|| Error::Connection(format!("stream '{stream}' does not exist")))?;
        log.stored_offsets.insert(reference.to_string(), offset);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl StreamLog {
    fn accepts(&self, reference: Option<&str>, publishing_id: u64) -> bool {
        match reference {
            Some(r) if !r.is_empty() => self
                .watermarks
                .get(r)
                .map_or(true, |watermark| publishing_id > *watermark),
            _ => true,
        }
    }

    fn advance_watermark(&mut self, reference: Option<&str>, publishing_id: u64) {
        if let Some(r) = reference {
            if !r.is_empty() {
                self.watermarks
                    .entry(r.to_string())
                    .and_modify(|w| *w = (*w).max(publishing_id))
                    .or_insert(publishing_id);
            }
        }
    }

    fn append(&mut self, reference: Option<&str>, publishing_id: u64, payload: Bytes) {
        if self.accepts(reference, publishing_id) {
            self.records.push(StoredRecord {
                publishing_id,
                payload,
            });
            self.advance_watermark(reference, publishing_id);
        }
    }
}
