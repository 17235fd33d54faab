//! Streaming reader for protocol messages.
//!
//! Large messages are handed out in chunks so a multi-megabyte query or
//! result row never has to be buffered whole. A chunk is either a full
//! message or a partial piece of one whose trailing bytes are still en
//! route; callers may only inspect the type byte on the first chunk of a
//! message.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::Error;

/// Default high-water mark for a single chunk.
pub const CHUNK_BUFFER_SIZE: usize = 8192;

/// Largest message length we accept from a peer.
const MAX_MESSAGE_LEN: i32 = 256 * 1024 * 1024;

/// One piece of a protocol message read off the wire.
#[derive(Debug)]
pub struct Chunk {
    /// Raw bytes, forwarded verbatim. The first chunk of a message starts
    /// with the type byte and the 4-byte length.
    pub data: BytesMut,

    /// True when this chunk starts a new message.
    pub first: bool,

    /// True when the current message is fully buffered, i.e. this chunk is
    /// its last piece.
    pub complete: bool,
}

/// Incremental message reader with a small carry-over buffer.
///
/// All partial state lives in the struct, never in a pending future, so an
/// in-flight `read_chunk` may be dropped (e.g. by a readiness poll picking
/// another endpoint) and resumed later without losing bytes.
#[derive(Debug)]
pub struct PacketReader {
    buf: BytesMut,
    limit: usize,
    /// Bytes of the current message not yet handed out. Zero means the next
    /// bytes on the wire start a new message.
    remaining: usize,
}

impl PacketReader {
    pub fn new() -> PacketReader {
        Self::with_limit(CHUNK_BUFFER_SIZE)
    }

    pub fn with_limit(limit: usize) -> PacketReader {
        PacketReader {
            buf: BytesMut::with_capacity(limit),
            limit: limit.max(8),
            remaining: 0,
        }
    }

    /// True when no message is partially read.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Read the next chunk. The first chunk of a message is emitted once the
    /// whole message is buffered or the buffer reached its high-water mark,
    /// whichever happens first.
    pub async fn read_chunk<S>(&mut self, io: &mut S) -> Result<Chunk, Error>
    where
        S: AsyncRead + std::marker::Unpin,
    {
        if self.remaining > 0 {
            return self.continuation(io).await;
        }

        loop {
            if self.buf.len() >= 5 {
                let total = self.message_len()?;

                if self.buf.len() >= total {
                    // Whole message is buffered.
                    let data = self.buf.split_to(total);
                    return Ok(Chunk {
                        data,
                        first: true,
                        complete: true,
                    });
                }

                if self.buf.len() >= self.limit {
                    // Emit what we have, the tail follows in later chunks.
                    let emitted = self.buf.len();
                    let data = self.buf.split();
                    self.remaining = total - emitted;
                    return Ok(Chunk {
                        data,
                        first: true,
                        complete: false,
                    });
                }
            }

            self.fill(io).await?;
        }
    }

    /// Read one complete message. Must not be called while a message is
    /// partially consumed through `read_chunk`.
    pub async fn read_message<S>(&mut self, io: &mut S) -> Result<BytesMut, Error>
    where
        S: AsyncRead + std::marker::Unpin,
    {
        if self.remaining > 0 {
            return Err(Error::ProtocolSync(
                "message read attempted in the middle of a chunked message".into(),
            ));
        }

        loop {
            if self.buf.len() >= 5 {
                let total = self.message_len()?;
                if self.buf.len() >= total {
                    return Ok(self.buf.split_to(total));
                }
            }
            self.fill(io).await?;
        }
    }

    async fn continuation<S>(&mut self, io: &mut S) -> Result<Chunk, Error>
    where
        S: AsyncRead + std::marker::Unpin,
    {
        if self.buf.is_empty() {
            self.fill(io).await?;
        }

        // The buffer may already hold the head of the next message.
        let take = self.buf.len().min(self.remaining);
        let data = self.buf.split_to(take);
        self.remaining -= take;

        Ok(Chunk {
            data,
            first: false,
            complete: self.remaining == 0,
        })
    }

    fn message_len(&self) -> Result<usize, Error> {
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(Error::ProtocolSync(format!(
                "message '{}' has invalid length {}",
                self.buf[0] as char, len
            )));
        }
        Ok(len as usize + 1)
    }

    async fn fill<S>(&mut self, io: &mut S) -> Result<(), Error>
    where
        S: AsyncRead + std::marker::Unpin,
    {
        if self.buf.capacity() - self.buf.len() < 1024 {
            self.buf.reserve(self.limit);
        }
        let n = io.read_buf(&mut self.buf).await.map_err(Error::SocketRead)?;
        if n == 0 {
            return Err(Error::SocketRead(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        Ok(())
    }
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tokio::io::AsyncWriteExt;

    fn query_message(sql: &str) -> BytesMut {
        let mut bytes = BytesMut::new();
        bytes.put_u8(b'Q');
        bytes.put_i32(4 + sql.len() as i32 + 1);
        bytes.put_slice(sql.as_bytes());
        bytes.put_u8(0);
        bytes
    }

    #[tokio::test]
    async fn small_message_is_one_complete_chunk() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let msg = query_message("SELECT 1");
        tx.write_all(&msg).await.unwrap();

        let mut reader = PacketReader::new();
        let chunk = reader.read_chunk(&mut rx).await.unwrap();

        assert!(chunk.first);
        assert!(chunk.complete);
        assert_eq!(chunk.data[..], msg[..]);
        assert!(reader.is_complete());
    }

    #[tokio::test]
    async fn large_message_arrives_in_multiple_chunks() {
        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);
        let sql = "SELECT '".to_string() + &"x".repeat(64 * 1024) + "'";
        let msg = query_message(&sql);
        tx.write_all(&msg).await.unwrap();

        let mut reader = PacketReader::new();
        let mut collected = BytesMut::new();
        let mut firsts = 0;
        let mut chunks = 0;

        loop {
            let chunk = reader.read_chunk(&mut rx).await.unwrap();
            chunks += 1;
            if chunk.first {
                firsts += 1;
                assert_eq!(chunk.data[0], b'Q');
            }
            let done = chunk.complete;
            collected.put(chunk.data);
            if done {
                break;
            }
        }

        assert!(chunks > 1, "64KiB message must not fit one chunk");
        assert_eq!(firsts, 1, "only the head of the message is first");
        assert_eq!(collected[..], msg[..]);
        assert!(reader.is_complete());
    }

    #[tokio::test]
    async fn partial_writes_reassemble_byte_for_byte() {
        let (mut tx, mut rx) = tokio::io::duplex(1024 * 1024);
        let msg = query_message(&"y".repeat(40 * 1024));

        let msg2 = msg.clone();
        let writer = tokio::spawn(async move {
            // Dribble the message out in uneven pieces.
            for piece in msg2.chunks(7 * 1024) {
                tx.write_all(piece).await.unwrap();
                tx.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = PacketReader::new();
        let mut collected = BytesMut::new();
        loop {
            let chunk = reader.read_chunk(&mut rx).await.unwrap();
            let done = chunk.complete;
            collected.put(chunk.data);
            if done {
                break;
            }
        }
        writer.await.unwrap();

        assert_eq!(collected[..], msg[..]);
    }

    #[tokio::test]
    async fn two_pipelined_messages_keep_boundaries() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let first = query_message("SELECT 1");
        let second = query_message("SELECT 2");
        tx.write_all(&first).await.unwrap();
        tx.write_all(&second).await.unwrap();

        let mut reader = PacketReader::new();
        let a = reader.read_chunk(&mut rx).await.unwrap();
        let b = reader.read_chunk(&mut rx).await.unwrap();

        assert!(a.first && a.complete);
        assert!(b.first && b.complete);
        assert_eq!(a.data[..], first[..]);
        assert_eq!(b.data[..], second[..]);
    }

    #[tokio::test]
    async fn read_message_returns_whole_frames() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let msg = query_message("SHOW VERSION");
        tx.write_all(&msg).await.unwrap();

        let mut reader = PacketReader::new();
        let out = reader.read_message(&mut rx).await.unwrap();
        assert_eq!(out[..], msg[..]);
    }

    #[tokio::test]
    async fn bogus_length_is_a_protocol_error() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[b'Q', 0xff, 0xff, 0xff, 0xff]).await.unwrap();

        let mut reader = PacketReader::new();
        let err = reader.read_chunk(&mut rx).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolSync(_)));
    }
}
