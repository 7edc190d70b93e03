//! # superstream
//!
//! A client for log-structured message brokers that expose append-only,
//! offset-addressable streams grouped into partitioned "super-streams".
//! The crate provides the two halves of that client:
//!
//! - a **super-stream producer** that routes each message to a partition,
//!   multiplexes per-partition producers underneath one logical handle, and
//!   fans confirmations back in tagged with the partition name;
//! - a **chunk-consuming reader** that grants credit as chunks arrive,
//!   decodes standard and compressed sub-entry records, assigns offsets and
//!   dispatches messages one by one through an async handler.
//!
//! TCP framing, the binary wire codec and connection lifecycle live below
//! this crate; they are consumed through the [`transport::StreamTransport`]
//! trait, and transports are shared per broker endpoint through a
//! reference-counted [`transport::TransportPool`].
//!
//! ## Producing
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use superstream::config::ProducerConfig;
//! use superstream::producer::{RoutingStrategy, SuperStreamProducer};
//! use superstream::transport::TransportPool;
//! use superstream::Message;
//!
//! # async fn example(pool: Arc<TransportPool>) -> superstream::Result<()> {
//! let producer = SuperStreamProducer::builder(
//!     ProducerConfig::new("invoices").with_reference("billing"),
//!     pool,
//! )
//! .routing(RoutingStrategy::hash_by_message_id())
//! .confirm_handler(Arc::new(|partition, confirmation| {
//!     println!("{partition}: confirmed {}", confirmation.publishing_id);
//! }))
//! .build()
//! .await?;
//!
//! let message = Message::new("amount=42").with_message_id("invoice-1");
//! producer.send(0, &message).await?;
//! producer.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Consuming
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::FutureExt;
//! use superstream::config::ConsumerConfig;
//! use superstream::consumer::Consumer;
//! use superstream::transport::{OffsetSpec, TransportPool};
//!
//! # async fn example(pool: Arc<TransportPool>) -> superstream::Result<()> {
//! let consumer = Consumer::builder(
//!     ConsumerConfig::new("invoices-0").with_offset_spec(OffsetSpec::First),
//!     pool,
//! )
//! .message_handler(Arc::new(|context, message| {
//!     async move {
//!         println!("offset {}: {} bytes", context.offset, message.data.len());
//!     }
//!     .boxed()
//! }))
//! .build()
//! .await?;
//!
//! // ... later
//! consumer.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`producer`] - routing strategies, per-partition producers and the
//!   super-stream producer
//! - [`consumer`] - chunk parsing and the credit-driven reader
//! - [`transport`] - the consumed wire interfaces and the transport pool
//! - [`config`] - configuration structures and environment parsing
//! - [`message`] - the message record and its entry encoding
//! - [`error`] - error types and result handling

/// Configuration structures and environment variable parsing
pub mod config;

/// Chunk parsing and the credit-driven consumer
pub mod consumer;

/// Error types and result handling
pub mod error;

/// Message record and entry codec
pub mod message;

/// Routing strategies, partition producers and the super-stream producer
pub mod producer;

/// Wire-layer interfaces and the reference-counted transport pool
pub mod transport;

pub use config::{ClientConfig, ConsumerConfig, ProducerConfig};
pub use error::{Error, Result};
pub use message::{Message, MessageProperties};
