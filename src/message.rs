use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const FLAG_MESSAGE_ID: u8 = 0x01;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
}

/// A message accepted by producers and handed to consumer handlers.
///
/// The payload is an opaque byte sequence; the only property the client
/// itself reads is the free-form `message_id`, which routing key extractors
/// typically use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Bytes,
    pub properties: MessageProperties,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    /// Serialized length of this message as a chunk entry body.
    pub fn encoded_len(&self) -> usize {
        let id_len = self
            .properties
            .message_id
            .as_ref()
            .map(|id| 2 + id.len())
            .unwrap_or(0);
        1 + id_len + self.data.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match &self.properties.message_id {
            Some(id) => {
                buf.put_u8(FLAG_MESSAGE_ID);
                buf.put_u16(id.len() as u16);
                buf.put(id.as_bytes());
            }
            None => buf.put_u8(0),
        }
        buf.put(self.data.clone());
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidMessage {
                message: "empty message entry".to_string(),
            });
        }

        let flags = data.get_u8();
        if flags & !FLAG_MESSAGE_ID != 0 {
            return Err(Error::InvalidMessage {
                message: format!("unknown message flags: {flags:#04x}"),
            });
        }

        let message_id = if flags & FLAG_MESSAGE_ID != 0 {
            if data.remaining() < 2 {
                return Err(Error::InvalidMessage {
                    message: "truncated message-id length".to_string(),
                });
            }
            let id_len = data.get_u16() as usize;
            if data.remaining() < id_len {
                return Err(Error::InvalidMessage {
                    message: "truncated message-id".to_string(),
                });
            }
            let raw = data.split_to(id_len);
            let id = std::str::from_utf8(&raw)
                .map_err(|_| Error::InvalidMessage {
                    message: "message-id is not valid UTF-8".to_string(),
                })?
                .to_string();
            Some(id)
        } else {
            None
        };

        Ok(Self {
            data,
            properties: MessageProperties { message_id },
        })
    }
}
