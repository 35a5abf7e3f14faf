//! Text reader that diverts embedded binary frames.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::{self, Read};

use crate::frame::{FIELDS_LEN, FrameError, FrameHeader, MAGIC};

/// Size of the read-ahead chunk pulled from the inner reader.
const CHUNK_LEN: usize = 8 * 1024;

/// Receiver for payloads found by a [`TextAndBinaryReader`].
pub trait BlobSink {
    /// Called once per complete frame, in stream order.
    ///
    /// # Errors
    ///
    /// An error aborts the current `read` call and is returned to the
    /// consumer of the text.
    fn blob(&mut self, id: u32, payload: Vec<u8>) -> io::Result<()>;
}

impl<F> BlobSink for F
where
    F: FnMut(u32, Vec<u8>) -> io::Result<()>,
{
    fn blob(&mut self, id: u32, payload: Vec<u8>) -> io::Result<()> {
        self(id, payload)
    }
}

/// Collects payloads by id. A repeated id is rejected as invalid data.
impl BlobSink for HashMap<u32, Vec<u8>> {
    fn blob(&mut self, id: u32, payload: Vec<u8>) -> io::Result<()> {
        match self.entry(id) {
            Entry::Occupied(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("duplicate frame id {id}"),
            )),
            Entry::Vacant(slot) => {
                slot.insert(payload);
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
enum State {
    /// Passing text through. `matched` magic bytes have been withheld.
    Text { matched: usize },
    /// A partial magic turned out to be text; `MAGIC[emitted..total]` is
    /// still owed to the consumer.
    Release { emitted: usize, total: usize },
    /// Collecting the id and length fields after the magic.
    Header {
        fields: [u8; FIELDS_LEN],
        filled: usize,
    },
    /// Collecting a payload.
    Payload {
        id: u32,
        remaining: usize,
        data: Vec<u8>,
    },
}

/// A [`Read`] adapter over a mixed text and binary stream.
///
/// Reads yield the text bytes only. Whenever the frame magic appears the
/// reader switches to binary consumption for exactly the declared payload
/// length, hands the payload to its [`BlobSink`], and resumes text.
///
/// The reader is restartable: the inner reader may deliver bytes in chunks
/// of any size, splitting the magic, the header or the payload anywhere.
/// Memory use is one fixed read-ahead chunk plus the payload currently being
/// collected.
pub struct TextAndBinaryReader<R, S> {
    inner: R,
    sink: S,
    state: State,
    buf: Box<[u8]>,
    pos: usize,
    end: usize,
    max_payload: usize,
}

impl<R, S> std::fmt::Debug for TextAndBinaryReader<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextAndBinaryReader")
            .field("state", &self.state)
            .field("buffered", &(self.end - self.pos))
            .field("max_payload", &self.max_payload)
            .finish_non_exhaustive()
    }
}

impl<R: Read, S: BlobSink> TextAndBinaryReader<R, S> {
    /// Wrap `inner`, delivering payloads to `sink`.
    pub fn new(inner: R, sink: S) -> Self {
        Self {
            inner,
            sink,
            state: State::Text { matched: 0 },
            buf: vec![0u8; CHUNK_LEN].into_boxed_slice(),
            pos: 0,
            end: 0,
            max_payload: u32::MAX as usize,
        }
    }

    /// Reject frames that declare more than `max` payload bytes.
    #[must_use]
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// The payload sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Mutable access to the payload sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Unwrap into the inner reader and the sink.
    ///
    /// Bytes already pulled from the inner reader but not yet consumed are
    /// dropped.
    pub fn into_parts(self) -> (R, S) {
        (self.inner, self.sink)
    }

    /// Pull the next chunk from the inner reader. Returns `false` at EOF.
    fn fill(&mut self) -> io::Result<bool> {
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(n) => {
                    self.pos = 0;
                    self.end = n;
                    return Ok(n > 0);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read, S: BlobSink> Read for TextAndBinaryReader<R, S> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            if let State::Release { emitted, total } = &mut self.state {
                let n = (*total - *emitted).min(out.len());
                out[..n].copy_from_slice(&MAGIC[*emitted..*emitted + n]);
                *emitted += n;
                if *emitted == *total {
                    self.state = State::Text { matched: 0 };
                }
                return Ok(n);
            }

            if self.pos == self.end && !self.fill()? {
                match self.state {
                    State::Text { matched: 0 } => return Ok(0),
                    State::Text { matched } => {
                        self.state = State::Release {
                            emitted: 0,
                            total: matched,
                        };
                        continue;
                    }
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside a binary frame",
                        ));
                    }
                }
            }

            let available = &self.buf[self.pos..self.end];

            match &mut self.state {
                State::Text { matched: 0 } => {
                    let text_len = available
                        .iter()
                        .position(|&b| b == MAGIC[0])
                        .unwrap_or(available.len());
                    if text_len == 0 {
                        self.pos += 1;
                        self.state = State::Text { matched: 1 };
                        continue;
                    }
                    let n = text_len.min(out.len());
                    out[..n].copy_from_slice(&available[..n]);
                    self.pos += n;
                    return Ok(n);
                }
                State::Text { matched } => {
                    if available[0] == MAGIC[*matched] {
                        self.pos += 1;
                        *matched += 1;
                        if *matched == MAGIC.len() {
                            self.state = State::Header {
                                fields: [0u8; FIELDS_LEN],
                                filled: 0,
                            };
                        }
                    } else {
                        // The current byte is left unconsumed and examined
                        // again once the withheld prefix has been released.
                        let total = *matched;
                        self.state = State::Release { emitted: 0, total };
                    }
                }
                State::Header { fields, filled } => {
                    let n = (FIELDS_LEN - *filled).min(available.len());
                    fields[*filled..*filled + n].copy_from_slice(&available[..n]);
                    *filled += n;
                    self.pos += n;
                    if *filled == FIELDS_LEN {
                        let header = FrameHeader::from_fields(fields);
                        let len = header.len as usize;
                        if len > self.max_payload {
                            return Err(FrameError::PayloadLimit {
                                id: header.id,
                                len,
                                max: self.max_payload,
                            }
                            .into());
                        }
                        if len == 0 {
                            self.state = State::Text { matched: 0 };
                            self.sink.blob(header.id, Vec::new())?;
                        } else {
                            self.state = State::Payload {
                                id: header.id,
                                remaining: len,
                                // Grows as bytes arrive; the header alone is not trusted.
                                data: Vec::with_capacity(len.min(CHUNK_LEN)),
                            };
                        }
                    }
                }
                State::Payload {
                    id,
                    remaining,
                    data,
                } => {
                    let n = (*remaining).min(available.len());
                    data.extend_from_slice(&available[..n]);
                    *remaining -= n;
                    self.pos += n;
                    if *remaining == 0 {
                        let id = *id;
                        let payload = std::mem::take(data);
                        self.state = State::Text { matched: 0 };
                        self.sink.blob(id, payload)?;
                    }
                }
                State::Release { .. } => unreachable!("handled at the top of the loop"),
            }
        }
    }
}
