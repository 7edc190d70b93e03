use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use std::io::Read;
use tracing::{trace, warn};

use crate::message::Message;
use crate::transport::{Chunk, CompressionType};
use crate::{Error, Result};

struct SubBatch {
    data: Bytes,
    records_left: u16,
}

/// Walks the entries of one delivered chunk and yields its records one by
/// one with their assigned offsets.
///
/// The first byte of each entry decides its shape: a clear high bit means a
/// standard entry (the byte is the first byte of the record length), a set
/// high bit means a sub-entry batch whose low 7 bits carry the compression
/// type. Records that fail to decode are yielded as errors so the caller
/// can skip them without losing offset accounting.
pub struct ChunkReader {
    chunk_id: u64,
    data: Bytes,
    remaining: u32,
    message_offset: u64,
    batch: Option<SubBatch>,
    skipped: u64,
}

impl ChunkReader {
    pub fn new(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            data: chunk.data.clone(),
            remaining: chunk.num_records,
            message_offset: 0,
            batch: None,
            skipped: 0,
        }
    }

    /// Next record with its offset, or `None` when the chunk is drained.
    /// A decode failure consumes the record's slot and is returned as
    /// `Err`; parsing continues with the following record.
    pub fn next_record(&mut self) -> Option<(u64, Result<Message>)> {
        loop {
            if self.batch.is_some() {
                if self.batch.as_ref().unwrap().records_left == 0 {
                    self.batch = None;
                    continue;
                }
                self.batch.as_mut().unwrap().records_left -= 1;
                let offset = self.next_offset();
                let batch = self.batch.as_mut().unwrap();
                return Some((offset, read_record(&mut batch.data)));
            }

            if self.remaining == 0 {
                return None;
            }

            if !self.data.has_remaining() {
                warn!(
                    outstanding = self.remaining,
                    "chunk data exhausted with records outstanding"
                );
                self.skipped += u64::from(self.remaining);
                self.remaining = 0;
                return None;
            }

            let entry_type = self.data[0];
            if entry_type & 0x80 == 0 {
                // Standard entry; the type byte doubles as the first byte
                // of the record length.
                let offset = self.next_offset();
                return Some((offset, read_record(&mut self.data)));
            }

            self.data.advance(1);
            match self.read_sub_entry(entry_type) {
                Ok(()) => continue,
                Err(e) => {
                    // No way to resync past a malformed sub-entry header;
                    // drop what is left of the chunk.
                    warn!(error = %e, "malformed sub-entry, dropping remainder of chunk");
                    self.skipped += u64::from(self.remaining);
                    self.remaining = 0;
                    self.data = Bytes::new();
                    return None;
                }
            }
        }
    }

    /// Records dropped without being yielded (exhausted data, unreadable
    /// sub-entry). Slots yielded as `Err` are not counted here.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn next_offset(&mut self) -> u64 {
        let offset = self.chunk_id + self.message_offset;
        self.message_offset += 1;
        self.remaining = self.remaining.saturating_sub(1);
        offset
    }

    fn read_sub_entry(&mut self, entry_type: u8) -> Result<()> {
        let compression = CompressionType::from_entry_type(entry_type)?;

        if self.data.remaining() < 10 {
            return Err(Error::InvalidMessage {
                message: "truncated sub-entry header".to_string(),
            });
        }
        let records = self.data.get_u16();
        let uncompressed_size = self.data.get_u32() as usize;
        let data_len = self.data.get_u32() as usize;
        if data_len > self.data.remaining() {
            return Err(Error::InvalidMessage {
                message: format!(
                    "sub-entry length {data_len} exceeds remaining {} bytes",
                    self.data.remaining()
                ),
            });
        }

        let body = self.data.split_to(data_len);
        let inflated = match compression {
            CompressionType::None => body,
            CompressionType::Gzip => {
                let mut out = Vec::with_capacity(uncompressed_size);
                GzDecoder::new(body.as_ref()).read_to_end(&mut out)?;
                Bytes::from(out)
            }
        };
        if inflated.len() != uncompressed_size {
            warn!(
                expected = uncompressed_size,
                actual = inflated.len(),
                "sub-entry inflated to an unexpected size"
            );
        }

        trace!(records, compression = ?compression, "sub-entry batch");
        self.batch = Some(SubBatch {
            data: inflated,
            records_left: records,
        });
        Ok(())
    }
}

fn read_record(data: &mut Bytes) -> Result<Message> {
    if data.remaining() < 4 {
        *data = Bytes::new();
        return Err(Error::InvalidMessage {
            message: "truncated record length".to_string(),
        });
    }
    let len = data.get_u32() as usize;
    if len > data.remaining() {
        let message = format!(
            "record length {len} exceeds remaining {} bytes",
            data.remaining()
        );
        *data = Bytes::new();
        return Err(Error::InvalidMessage { message });
    }
    Message::decode(data.split_to(len))
}
