//! Response framing for streaming encode results to a peer.
//!
//! Each response is one JSON line followed, on success, by one binary frame
//! carrying the WebP bytes:
//!
//! ```text
//! {"header":{"version":1,"id":7,"status":"ok"},"data":{"width":4,"height":4,"length":44}}\n
//! TAK35EM1 <id=7> <len=44> <44 bytes of WebP>
//! ```
//!
//! Failures are a JSON line only, with `status` set to `"error"`, the
//! message in `err`, and the codec's status code in `code` when there is
//! one. The frame's id always equals the header's id, so a reader can pair
//! them even if responses are interleaved.

use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use webpw_wire::{FrameHeader, TextAndBinaryReader};

use crate::error::Error;
use crate::limits::WIDE_HOST_MEMORY_BYTES;
use crate::server::Encoded;

/// Response format version written in every header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame [`read_responses`] accepts. An encoded image never
/// exceeds the sandbox memory it was produced in.
pub const MAX_RESPONSE_PAYLOAD: usize = WIDE_HOST_MEMORY_BYTES as usize;

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The image was encoded; a frame follows.
    Ok,
    /// The request failed; no frame follows.
    Error,
}

/// Header of a response record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Format version, [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Correlation id, shared with the binary frame.
    pub id: u32,
    /// Outcome.
    pub status: Status,
    /// Error message, empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
    /// Codec status code, for codec failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// Metadata of a successful encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData {
    /// Image width.
    pub width: u32,
    /// Image height.
    pub height: u32,
    /// Length of the WebP payload in the frame.
    pub length: u32,
}

/// The JSON record of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// Header.
    pub header: ResponseHeader,
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl ResponseRecord {
    /// Build the record describing `result`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the encoded image is too large for a
    /// frame.
    pub fn from_result(id: u32, result: &Result<Encoded, Error>) -> Result<Self, Error> {
        Ok(match result {
            Ok(encoded) => Self {
                header: ResponseHeader {
                    version: PROTOCOL_VERSION,
                    id,
                    status: Status::Ok,
                    err: String::new(),
                    code: None,
                },
                data: Some(ResponseData {
                    width: encoded.width,
                    height: encoded.height,
                    length: frame_len(encoded)?,
                }),
            },
            Err(err) => Self {
                header: ResponseHeader {
                    version: PROTOCOL_VERSION,
                    id,
                    status: Status::Error,
                    err: err.to_string(),
                    code: match err {
                        Error::Codec { code, .. } => Some(*code),
                        _ => None,
                    },
                },
                data: None,
            },
        })
    }
}

fn frame_len(encoded: &Encoded) -> Result<u32, Error> {
    u32::try_from(encoded.data.len()).map_err(|_| {
        Error::Protocol(format!(
            "encoded image of {} bytes does not fit in a frame",
            encoded.data.len()
        ))
    })
}

/// Write one response: the JSON record, then the frame on success.
///
/// # Errors
///
/// Returns [`Error::Io`] if the writer fails and [`Error::Protocol`] if the
/// record cannot be encoded.
pub async fn write_response<W>(
    writer: &mut W,
    id: u32,
    result: &Result<Encoded, Error>,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let record = ResponseRecord::from_result(id, result)?;
    let mut line = serde_json::to_vec(&record).map_err(|e| Error::Protocol(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;

    if let Ok(encoded) = result {
        let header = FrameHeader::new(id, frame_len(encoded)?);
        writer.write_all(&header.to_bytes()).await?;
        writer.write_all(&encoded.data).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// A response read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The JSON record.
    pub record: ResponseRecord,
    /// The frame payload, present exactly when the status is ok.
    pub body: Option<Vec<u8>>,
}

impl Response {
    /// Whether the request succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.record.header.status == Status::Ok
    }
}

/// Read every response from a stream written by [`write_response`].
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the stream is malformed, a record has an
/// unknown version, a successful record has no matching frame (or one of
/// the wrong length), a failed record has a frame, or a frame has no
/// record.
pub fn read_responses<R: Read>(reader: R) -> Result<Vec<Response>, Error> {
    let mut stream =
        TextAndBinaryReader::new(reader, HashMap::new()).with_max_payload(MAX_RESPONSE_PAYLOAD);
    let records = serde_json::Deserializer::from_reader(&mut stream)
        .into_iter::<ResponseRecord>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Protocol(format!("malformed response stream: {e}")))?;
    let (_, mut frames) = stream.into_parts();

    let responses = records
        .into_iter()
        .map(|record| {
            let id = record.header.id;
            if record.header.version != PROTOCOL_VERSION {
                return Err(Error::Protocol(format!(
                    "response {id} has version {}, expected {PROTOCOL_VERSION}",
                    record.header.version
                )));
            }
            let body = frames.remove(&id);
            match (record.header.status, &record.data, &body) {
                (Status::Ok, Some(data), Some(body)) if body.len() == data.length as usize => {}
                (Status::Error, None, None) => {}
                _ => {
                    return Err(Error::Protocol(format!(
                        "response {id} does not match its frame"
                    )));
                }
            }
            Ok(Response { record, body })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(id) = frames.keys().min() {
        return Err(Error::Protocol(format!("frame {id} has no response record")));
    }
    Ok(responses)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn encoded(len: usize) -> Encoded {
        Encoded {
            width: 4,
            height: 2,
            data: (0..len).map(|i| i as u8).collect(),
        }
    }

    #[tokio::test]
    async fn success_line_is_followed_by_frame() {
        let mut out = Vec::new();
        write_response(&mut out, 7, &Ok(encoded(5))).await.unwrap();

        let newline = out.iter().position(|&b| b == b'\n').unwrap();
        let line: serde_json::Value = serde_json::from_slice(&out[..newline]).unwrap();
        assert_eq!(
            line,
            serde_json::json!({
                "header": {"version": 1, "id": 7, "status": "ok"},
                "data": {"width": 4, "height": 2, "length": 5}
            })
        );

        let frame = &out[newline + 1..];
        assert_eq!(&frame[..8], b"TAK35EM1");
        assert_eq!(&frame[8..12], &7u32.to_le_bytes());
        assert_eq!(&frame[12..16], &5u32.to_le_bytes());
        assert_eq!(&frame[16..], &[0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_is_a_line_only() {
        let mut out = Vec::new();
        write_response(&mut out, 3, &Err(Error::codec(5))).await.unwrap();
        assert!(!out.windows(8).any(|w| w == b"TAK35EM1"));

        let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line["header"]["status"], "error");
        assert_eq!(line["header"]["code"], 5);
        assert!(line["header"]["err"].as_str().unwrap().starts_with("codec error 5"));
        assert!(line.get("data").is_none());
    }

    #[tokio::test]
    async fn mixed_stream_reads_back_in_order() {
        let mut out = Vec::new();
        write_response(&mut out, 1, &Ok(encoded(300))).await.unwrap();
        write_response(&mut out, 2, &Err(Error::Timeout(std::time::Duration::from_secs(1))))
            .await
            .unwrap();
        // Payload containing a newline and a partial magic.
        let tricky = Encoded {
            width: 1,
            height: 1,
            data: b"TAK\n{\"x\":1}TAK35E".to_vec(),
        };
        write_response(&mut out, 3, &Ok(tricky.clone())).await.unwrap();

        let responses = read_responses(out.as_slice()).unwrap();
        assert_eq!(responses.len(), 3);
        assert!(responses[0].is_ok());
        assert_eq!(responses[0].body.as_deref(), Some(encoded(300).data.as_slice()));
        assert!(!responses[1].is_ok());
        assert!(responses[1].body.is_none());
        assert_eq!(responses[2].body.as_deref(), Some(tricky.data.as_slice()));
    }

    #[test]
    fn frame_without_record_is_rejected() {
        let mut out = b"{\"header\":{\"version\":1,\"id\":1,\"status\":\"error\",\"err\":\"x\"}}\n".to_vec();
        webpw_wire::write_frame(&mut out, 9, b"orphan").unwrap();
        let err = read_responses(out.as_slice()).unwrap_err();
        assert!(err.to_string().contains("frame 9"));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut out = b"{\"header\":{\"version\":1,\"id\":1,\"status\":\"ok\"},\"data\":{\"width\":1,\"height\":1,\"length\":4}}\n".to_vec();
        webpw_wire::write_frame(&mut out, 1, b"abc").unwrap();
        assert!(matches!(read_responses(out.as_slice()), Err(Error::Protocol(_))));
    }

    #[test]
    fn oversized_frame_header_is_rejected() {
        let mut out = b"{\"header\":{\"version\":1,\"id\":1,\"status\":\"ok\"},\"data\":{\"width\":1,\"height\":1,\"length\":4}}\n".to_vec();
        out.extend_from_slice(b"TAK35EM1");
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(read_responses(out.as_slice()), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let out = b"{\"header\":{\"version\":2,\"id\":1,\"status\":\"error\",\"err\":\"x\"}}\n";
        let err = read_responses(&out[..]).unwrap_err();
        assert!(err.to_string().contains("version 2"));
    }
}
