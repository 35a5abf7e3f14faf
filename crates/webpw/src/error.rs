//! Error types for the encoding service.

use std::time::Duration;

/// Messages for the encoder's status codes, indexed by code.
const CODEC_MESSAGES: [&str; 11] = [
    "ok",
    "out of memory allocating objects",
    "out of memory re-allocating byte buffer",
    "NULL parameter passed to function",
    "configuration is invalid",
    "bad picture dimension, maximum width and height is 16383 pixels",
    "partition #0 is too big to fit 512k",
    "partition is too big to fit 16M",
    "picture writer returned an I/O error",
    "file would be too big to fit in 4G",
    "encoding abort requested by user",
];

/// Look up the encoder's message for a status code.
#[must_use]
pub fn codec_message(code: i32) -> &'static str {
    usize::try_from(code)
        .ok()
        .and_then(|i| CODEC_MESSAGES.get(i))
        .copied()
        .unwrap_or("unknown encoder error")
}

/// Errors returned by the server, the runtime host and the encode pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `encode` was called before `start`.
    #[error("server not started")]
    NotStarted,

    /// `start` was called on a server that is already running.
    #[error("server already started")]
    AlreadyStarted,

    /// `start` was called after `close`.
    #[error("server is closed and cannot be started")]
    AlreadyClosed,

    /// `encode` was called after (or raced with) `close`.
    #[error("server is closed")]
    Closed,

    /// The configured module image could not be decompressed.
    #[error("failed to decompress module image: {0}")]
    Decompression(String),

    /// The module failed validation, compilation or linking.
    #[error("failed to compile module: {0}")]
    Compile(String),

    /// A module instance could not be created.
    #[error("failed to instantiate module: {0}")]
    Instantiation(String),

    /// The source bitmap uses a color model the codec does not accept.
    #[error("unsupported color model: {0}")]
    UnsupportedFormat(String),

    /// The source bitmap's dimensions or buffer size are unusable.
    #[error("invalid dimensions {width}x{height}: {reason}")]
    InvalidDimensions {
        /// Bitmap width in pixels.
        width: u32,
        /// Bitmap height in pixels.
        height: u32,
        /// What was wrong.
        reason: &'static str,
    },

    /// The sandbox could not satisfy an allocation under its memory cap.
    #[error("sandbox out of memory allocating {requested} bytes")]
    SandboxOutOfMemory {
        /// Requested allocation size.
        requested: usize,
    },

    /// The codec reported a failure. The code is the codec's own.
    #[error("codec error {code}: {message}")]
    Codec {
        /// Status code reported by the codec.
        code: i32,
        /// The codec's description of the code.
        message: &'static str,
    },

    /// A sandbox call or the wait for an instance exceeded its deadline.
    #[error("sandbox call exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request.
    #[error("encode cancelled")]
    Cancelled,

    /// The sandboxed code trapped.
    #[error("sandbox trapped: {0}")]
    Trap(String),

    /// A read or write fell outside the sandbox's linear memory.
    #[error("sandbox memory access out of bounds at offset {offset} (+{len})")]
    MemoryAccess {
        /// Start offset of the access.
        offset: u32,
        /// Length of the access.
        len: usize,
    },

    /// The module does not export the named function.
    #[error("module has no export named `{0}`")]
    MissingExport(String),

    /// A sandbox call or a response stream did not follow the expected format.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Writing to the destination sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::Codec`] from the codec's status code.
    #[must_use]
    pub fn codec(code: i32) -> Self {
        Self::Codec {
            code,
            message: codec_message(code),
        }
    }

    /// Whether the error was caused by calling into the server in the
    /// wrong lifecycle state.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::NotStarted | Self::AlreadyStarted | Self::AlreadyClosed | Self::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_messages_follow_encoder_codes() {
        assert_eq!(codec_message(0), "ok");
        assert!(codec_message(5).starts_with("bad picture dimension"));
        assert_eq!(codec_message(10), "encoding abort requested by user");
        assert_eq!(codec_message(11), "unknown encoder error");
        assert_eq!(codec_message(-1), "unknown encoder error");
    }

    #[test]
    fn codec_error_keeps_code_verbatim() {
        let err = Error::codec(6);
        assert!(matches!(err, Error::Codec { code: 6, .. }));
        assert_eq!(
            err.to_string(),
            "codec error 6: partition #0 is too big to fit 512k"
        );
    }

    #[test]
    fn lifecycle_errors_are_classified() {
        assert!(Error::NotStarted.is_lifecycle());
        assert!(Error::Closed.is_lifecycle());
        assert!(!Error::Cancelled.is_lifecycle());
    }
}
