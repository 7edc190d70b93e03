//! Configuration module for superstream.
//!
//! This module provides configuration structures for the client connection
//! and for individual producers and consumers. Connection settings can be
//! loaded from environment variables following the 12-factor methodology;
//! producer and consumer settings are constructed programmatically.
//!
//! # Example
//!
//! ```rust,no_run
//! use superstream::config::{ClientConfig, ProducerConfig};
//!
//! // Load connection settings from environment variables
//! let client = ClientConfig::from_env().expect("Failed to load config");
//! println!("Connecting to brokers: {:?}", client.endpoints);
//!
//! // Producer settings are built in code
//! let producer = ProducerConfig::new("invoices").with_reference("billing");
//! ```

use serde::{Deserialize, Serialize};
use std::env;

use crate::transport::OffsetSpec;
use crate::{Error, Result};

/// Default credit granted to the broker when a subscription opens.
pub const DEFAULT_INITIAL_CREDIT: u16 = 10;

/// Connection-level configuration shared by producers and consumers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub endpoints: Vec<String>,
    pub client_provided_name: String,
    pub connect_timeout_secs: u64,
    pub initial_credit: u16,
}

impl ClientConfig {
    /// Loads connection settings from environment variables.
    ///
    /// Required variables:
    /// - `STREAM_ENDPOINTS` - Comma-separated list of broker endpoints
    ///
    /// Optional variables have sensible defaults:
    /// - `STREAM_CLIENT_NAME` (default: "superstream-rust")
    /// - `STREAM_CONNECT_TIMEOUT_SECS` (default: 30)
    /// - `STREAM_INITIAL_CREDIT` (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `Err` if `STREAM_ENDPOINTS` is missing or resolves to an
    /// empty list, or if a numeric variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let endpoints = env::var("STREAM_ENDPOINTS")
            .map_err(|_| Error::Config("STREAM_ENDPOINTS is required".to_string()))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        if endpoints.is_empty() {
            return Err(Error::Config(
                "STREAM_ENDPOINTS must contain at least one endpoint".to_string(),
            ));
        }

        Ok(Self {
            endpoints,
            client_provided_name: env::var("STREAM_CLIENT_NAME")
                .unwrap_or_else(|_| "superstream-rust".to_string()),
            connect_timeout_secs: env::var("STREAM_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    Error::Config("STREAM_CONNECT_TIMEOUT_SECS must be a number".to_string())
                })?,
            initial_credit: env::var("STREAM_INITIAL_CREDIT")
                .unwrap_or_else(|_| DEFAULT_INITIAL_CREDIT.to_string())
                .parse::<u16>()
                .unwrap_or(DEFAULT_INITIAL_CREDIT),
        })
    }
}

/// Configuration for a super-stream producer.
///
/// The routing strategy and the confirmation handler are not part of this
/// struct; they are installed on the producer builder since they carry
/// behavior rather than data.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    /// Name of the super-stream to publish to.
    pub super_stream: String,

    /// Producer reference enabling broker-side deduplication by
    /// `(reference, publishing_id)` when present and non-empty.
    pub reference: Option<String>,

    /// Connection name reported to the broker for diagnostics.
    pub client_provided_name: Option<String>,
}

impl ProducerConfig {
    pub fn new(super_stream: impl Into<String>) -> Self {
        Self {
            super_stream: super_stream.into(),
            reference: None,
            client_provided_name: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_client_provided_name(mut self, name: impl Into<String>) -> Self {
        self.client_provided_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.super_stream.trim().is_empty() {
            return Err(Error::CreateProducer(
                "super stream name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a single-stream consumer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Name of the stream to subscribe to.
    pub stream: String,

    /// Where to start reading. Absolute offsets are additionally filtered
    /// client-side; the other variants are resolved broker-side.
    pub offset_spec: OffsetSpec,

    /// Consumer reference, required for single-active-consumer groups and
    /// for server-side offset tracking.
    pub reference: Option<String>,

    /// Whether to join a single-active-consumer group.
    pub single_active_consumer: bool,

    /// Super-stream this consumer belongs to, forwarded to the broker so
    /// single-active-consumer notifications are routed correctly.
    pub super_stream: Option<String>,

    /// Connection name reported to the broker for diagnostics.
    pub client_provided_name: Option<String>,

    /// Credit granted on subscribe.
    pub initial_credit: u16,
}

impl ConsumerConfig {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            offset_spec: OffsetSpec::default(),
            reference: None,
            single_active_consumer: false,
            super_stream: None,
            client_provided_name: None,
            initial_credit: DEFAULT_INITIAL_CREDIT,
        }
    }

    pub fn with_offset_spec(mut self, offset_spec: OffsetSpec) -> Self {
        self.offset_spec = offset_spec;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_single_active_consumer(mut self, enabled: bool) -> Self {
        self.single_active_consumer = enabled;
        self
    }

    pub fn with_super_stream(mut self, super_stream: impl Into<String>) -> Self {
        self.super_stream = Some(super_stream.into());
        self
    }

    pub fn with_client_provided_name(mut self, name: impl Into<String>) -> Self {
        self.client_provided_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream.trim().is_empty() {
            return Err(Error::Config("stream name must not be empty".to_string()));
        }
        if self.single_active_consumer && self.reference.as_deref().unwrap_or("").is_empty() {
            return Err(Error::Config(
                "a reference is required when single_active_consumer is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
