pub mod partition;
pub mod routing;
pub mod super_stream;

use std::sync::Arc;

use crate::transport::Confirmation;

/// Invoked for every broker acknowledgement as `(partition_name, confirmation)`.
pub type ConfirmationHandler = Arc<dyn Fn(&str, Confirmation) + Send + Sync>;

/// Invoked with the close reason when a transport carrying one of the
/// partition producers goes away. The producer rebinds on its own; this is
/// informational.
pub type ConnectionClosedHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub use partition::{PartitionProducer, ProducerState};
pub use routing::{RoutingKeyExtractor, RoutingStrategy, ROUTING_HASH_SEED};
pub use super_stream::{SuperStreamProducer, SuperStreamProducerBuilder};
