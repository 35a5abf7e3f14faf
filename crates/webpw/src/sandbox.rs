//! The capability interface the encode pipeline uses to drive a codec.
//!
//! The pipeline only ever talks to a [`Sandbox`]: allocate a buffer in the
//! guest, copy bytes across, call an export, copy the result back, release
//! everything. [`CodecInstance`](crate::CodecInstance) implements it on top
//! of wasmtime; tests implement it with plain host memory.

use async_trait::async_trait;

use crate::error::Error;

/// A scalar passed to or returned from a sandbox export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
}

impl Value {
    /// The value as an `i32`, if it is one.
    #[must_use]
    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }
}

/// An isolated execution environment hosting the codec.
///
/// Offsets are positions in the sandbox's linear memory. A sandbox never
/// exposes host memory to the code it runs; bytes cross the boundary only
/// through [`write_memory`](Self::write_memory) and
/// [`read_memory`](Self::read_memory).
#[async_trait]
pub trait Sandbox: Send {
    /// Reserve `size` bytes of linear memory and return the offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxOutOfMemory`] if the allocation cannot be
    /// satisfied under the memory cap.
    async fn allocate(&mut self, size: usize) -> Result<u32, Error>;

    /// Release memory previously obtained from the sandbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the release call traps or is interrupted.
    async fn free(&mut self, offset: u32) -> Result<(), Error>;

    /// Copy `bytes` into linear memory at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryAccess`] if the range is out of bounds.
    fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error>;

    /// Copy `len` bytes out of linear memory starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryAccess`] if the range is out of bounds.
    fn read_memory(&mut self, offset: u32, len: usize) -> Result<Vec<u8>, Error>;

    /// Invoke an exported function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingExport`] if there is no such function,
    /// [`Error::Timeout`] or [`Error::Cancelled`] if the call is
    /// interrupted, and [`Error::Trap`] if the code traps.
    async fn call_export(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Error>;

    /// Whether the sandbox exports a function with this name.
    fn has_export(&mut self, name: &str) -> bool;
}
