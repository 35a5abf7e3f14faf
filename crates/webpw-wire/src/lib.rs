//! # webpw-wire
//!
//! Framing that lets raw binary payloads ride inside an otherwise textual
//! (JSON lines) stream without a secondary text encoding such as base64.
//!
//! Every binary region is a *frame*:
//!
//! ```text
//! +----------+---------+----------+------------------+
//! | TAK35EM1 | id: u32 | len: u32 | payload (len B)  |
//! +----------+---------+----------+------------------+
//!   8 bytes    LE        LE
//! ```
//!
//! The writer side is [`write_frame`]. The reader side is
//! [`TextAndBinaryReader`], a [`std::io::Read`] adapter that yields only the
//! text bytes and hands each complete payload to a [`BlobSink`]. Because it
//! is a plain `Read`, any streaming parser (for example
//! `serde_json::Deserializer::from_reader`) can consume the text while the
//! frames are skipped transparently.
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::io::Read;
//!
//! use webpw_wire::{TextAndBinaryReader, write_frame};
//!
//! let mut stream = b"{\"id\":7}\n".to_vec();
//! write_frame(&mut stream, 7, b"\x00\x01binary").unwrap();
//!
//! let mut reader = TextAndBinaryReader::new(stream.as_slice(), HashMap::new());
//! let mut text = String::new();
//! reader.read_to_string(&mut text).unwrap();
//!
//! assert_eq!(text, "{\"id\":7}\n");
//! assert_eq!(reader.sink()[&7], b"\x00\x01binary");
//! ```

#![forbid(unsafe_code)]

mod frame;
mod reader;

pub use frame::{FrameError, FrameHeader, HEADER_LEN, MAGIC, write_frame};
pub use reader::{BlobSink, TextAndBinaryReader};
