pub mod chunk;
pub mod reader;


use std::sync::Arc;

use futures::future::BoxFuture;

use crate::message::Message;
use crate::transport::ResponseCode;

pub use chunk::ChunkReader;
pub use reader::{Consumer, ConsumerBuilder, ConsumerContext};

/// Async handler invoked once per delivered message.
pub type MessageHandler =
    Arc<dyn Fn(ConsumerContext, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked when the broker reports a metadata change for the subscribed
/// stream.
pub type MetadataUpdateHandler = Arc<dyn Fn(&str, ResponseCode) + Send + Sync>;
