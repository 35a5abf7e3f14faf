//! # webpw
//!
//! WebP encoding through a codec compiled to WebAssembly and run inside a
//! wasmtime sandbox.
//!
//! The codec module is shipped as a compressed image (gzip or zstd) and
//! handed to a [`Server`]. The server:
//!
//! - **Compiles once** - [`Server::start`] decompresses, validates and
//!   compiles the module; failures surface there, not on first encode
//! - **Isolates each request** - encodes run on pooled instances with their
//!   own linear memory, capped at 32 MiB on 32-bit hosts and 256 MiB on
//!   64-bit hosts
//! - **Bounds every call** - each request has a deadline and an optional
//!   cancellation token, enforced inside the sandbox via epoch interruption
//! - **Releases what it allocates** - buffers in the sandbox are freed on
//!   every path, and instances that trapped or were interrupted are thrown
//!   away
//!
//! Results can be streamed to a peer with [`write_response`], which emits a
//! JSON line per request plus a binary frame (see [`webpw_wire`]) carrying
//! the WebP bytes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webpw::{Bitmap, ColorModel, EncodeOptions, Server};
//!
//! # async fn example(codec: Vec<u8>) -> Result<(), webpw::Error> {
//! let server = Server::builder().with_binary(codec).build();
//! server.start()?;
//!
//! let pixels = vec![0xff; 16 * 16 * 4];
//! let bitmap = Bitmap::new(16, 16, ColorModel::Rgba8, pixels);
//! let webp = server
//!     .encode_to_vec(&bitmap, &EncodeOptions::default().with_quality(80.0))
//!     .await?;
//! assert_eq!(&webp.data[..4], b"RIFF");
//!
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod bitmap;
mod compression;
mod error;
mod limits;
pub mod pipeline;
mod pool;
mod response;
mod sandbox;
mod server;
mod wasm;

pub use bitmap::{Bitmap, ColorModel, MAX_DIMENSION};
pub use compression::{Compression, decompress};
pub use error::{Error, codec_message};
pub use limits::{
    NARROW_HOST_MEMORY_BYTES, ResourceLimits, WASM_PAGE_SIZE, WIDE_HOST_MEMORY_BYTES,
    memory_cap_for_pointer_width,
};
pub use pool::DEFAULT_POOL_SIZE;
pub use response::{
    MAX_RESPONSE_PAYLOAD, PROTOCOL_VERSION, Response, ResponseData, ResponseHeader, ResponseRecord,
    Status, read_responses, write_response,
};
pub use sandbox::{Sandbox, Value};
pub use server::{
    EncodeOptions, EncodeRequest, Encoded, Server, ServerBuilder, ServerConfig, ServerState,
};
pub use wasm::{CodecInstance, CodecModule, FEATURE_SET_VERSION, exports};

// Re-export so callers can build tokens without a direct dependency.
pub use tokio_util::sync::CancellationToken;
