//! The encoding server and its lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::bitmap::Bitmap;
use crate::error::Error;
use crate::limits::ResourceLimits;
use crate::pipeline::{self, DEFAULT_QUALITY};
use crate::pool::{DEFAULT_POOL_SIZE, InstancePool};
use crate::wasm::CodecModule;

/// Options for a single encode.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Quality factor in `[0, 100]`. Out-of-range values are clamped.
    pub quality: f32,
    /// Overall deadline for the request, including the wait for a free
    /// instance. Defaults to [`ResourceLimits::call_timeout`].
    pub deadline: Option<Duration>,
    /// Cancels the request when triggered.
    pub cancel: Option<CancellationToken>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            deadline: None,
            cancel: None,
        }
    }
}

impl EncodeOptions {
    /// Set the quality factor.
    #[must_use]
    pub const fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality;
        self
    }

    /// Set the request deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// An encode request: where the pixels come from, where the WebP goes.
#[derive(Debug)]
pub struct EncodeRequest<'a, W> {
    /// Image to encode.
    pub source: Bitmap<'a>,
    /// Sink that receives the encoded bytes.
    pub destination: W,
    /// Encode options.
    pub options: EncodeOptions,
}

impl<'a, W> EncodeRequest<'a, W> {
    /// Create a request with default options.
    pub fn new(source: Bitmap<'a>, destination: W) -> Self {
        Self {
            source,
            destination,
            options: EncodeOptions::default(),
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: EncodeOptions) -> Self {
        self.options = options;
        self
    }
}

/// An encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Width of the source image.
    pub width: u32,
    /// Height of the source image.
    pub height: u32,
    /// The WebP file.
    pub data: Vec<u8>,
}

/// Observable lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Created but not started. No codec has been compiled.
    Uninitialized,
    /// [`Server::start`] is compiling the codec.
    Starting,
    /// Accepting encode requests.
    Started,
    /// Closed for good.
    Closed,
}

enum Lifecycle {
    Uninitialized,
    Starting,
    Started(Arc<InstancePool>),
    Closed,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Compressed (gzip or zstd) codec module image.
    pub binary: Bytes,
    /// Limits applied to every codec instance.
    pub limits: ResourceLimits,
    /// Maximum number of encodes running at once.
    pub pool_size: usize,
}

impl ServerConfig {
    /// Configuration with default limits and pool size.
    pub fn new(binary: impl Into<Bytes>) -> Self {
        Self {
            binary: binary.into(),
            limits: ResourceLimits::default(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Builder for [`Server`].
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
///
/// use webpw::{ResourceLimits, Server};
///
/// # fn example(codec: Vec<u8>) -> Result<(), webpw::Error> {
/// let server = Server::builder()
///     .with_binary(codec)
///     .with_resource_limits(ResourceLimits {
///         call_timeout: Duration::from_secs(5),
///         ..Default::default()
///     })
///     .with_pool_size(4)
///     .build();
/// server.start()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    binary: Option<Bytes>,
    limits: Option<ResourceLimits>,
    pool_size: Option<usize>,
}

impl ServerBuilder {
    /// Set the compressed codec module image.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<Bytes>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Set resource limits.
    #[must_use]
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Set how many encodes may run at once. Values below 1 are raised to 1.
    #[must_use]
    pub const fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Build the server. Nothing is compiled until [`Server::start`].
    ///
    /// A builder without a binary yields a server whose `start` fails with
    /// [`Error::Decompression`].
    #[must_use]
    pub fn build(self) -> Server {
        Server::new(ServerConfig {
            binary: self.binary.unwrap_or_default(),
            limits: self.limits.unwrap_or_default(),
            pool_size: self.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        })
    }
}

/// WebP encoding server.
///
/// A server moves one way through `Uninitialized → Started → Closed`.
/// [`start`](Self::start) compiles the codec, [`encode`](Self::encode)
/// runs requests on pooled instances, and [`close`](Self::close) waits for
/// in-flight requests and releases everything. All methods take `&self`,
/// so a server can be shared across tasks in an `Arc`.
pub struct Server {
    config: ServerConfig,
    state: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("limits", &self.config.limits)
            .field("pool_size", &self.config.pool_size)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Create an uninitialized server.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        match *self.lock() {
            Lifecycle::Uninitialized => ServerState::Uninitialized,
            Lifecycle::Starting => ServerState::Starting,
            Lifecycle::Started(_) => ServerState::Started,
            Lifecycle::Closed => ServerState::Closed,
        }
    }

    /// Decompress and compile the codec, and begin accepting requests.
    ///
    /// Compiling happens outside the state lock, so other calls are not
    /// held up by it; they see the server as not started yet. Of several
    /// concurrent callers only one compiles, the rest get
    /// [`Error::AlreadyStarted`]. If compiling fails the server returns to
    /// uninitialized and `start` may be retried. A [`close`](Self::close)
    /// that lands while compiling wins, and the compiled codec is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] or [`Error::AlreadyClosed`] in the
    /// wrong state (including a close during compilation),
    /// [`Error::Decompression`] if the image cannot be decompressed, and
    /// [`Error::Compile`] if the module is unusable.
    pub fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.lock();
            match *state {
                Lifecycle::Starting | Lifecycle::Started(_) => return Err(Error::AlreadyStarted),
                Lifecycle::Closed => return Err(Error::AlreadyClosed),
                Lifecycle::Uninitialized => *state = Lifecycle::Starting,
            }
        }

        let started = Instant::now();
        let compiled = CodecModule::compile(&self.config.binary, &self.config.limits);

        let mut state = self.lock();
        if !matches!(*state, Lifecycle::Starting) {
            tracing::debug!("Server closed while starting");
            return Err(Error::AlreadyClosed);
        }
        let module = match compiled {
            Ok(module) => module,
            Err(e) => {
                *state = Lifecycle::Uninitialized;
                tracing::error!(error = %e, "Failed to start server");
                return Err(e);
            }
        };
        *state = Lifecycle::Started(Arc::new(InstancePool::new(module, self.config.pool_size)));
        drop(state);

        tracing::info!(
            pool_size = self.config.pool_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Server started"
        );
        Ok(())
    }

    fn pool(&self) -> Result<Arc<InstancePool>, Error> {
        match &*self.lock() {
            Lifecycle::Uninitialized | Lifecycle::Starting => Err(Error::NotStarted),
            Lifecycle::Started(pool) => Ok(Arc::clone(pool)),
            Lifecycle::Closed => Err(Error::Closed),
        }
    }

    /// Encode `source` and return the WebP bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] or [`Error::Closed`] in the wrong state
    /// and any error from the encode itself.
    pub async fn encode_to_vec(
        &self,
        source: &Bitmap<'_>,
        options: &EncodeOptions,
    ) -> Result<Encoded, Error> {
        let pool = self.pool()?;
        source.validate()?;

        let timeout = options.deadline.unwrap_or(self.config.limits.call_timeout);
        let deadline = Instant::now() + timeout;
        let cancel = options.cancel.as_ref();

        let mut lease = pool.checkout(timeout, cancel).await?;
        lease.instance.arm(
            deadline.saturating_duration_since(Instant::now()),
            options.cancel.clone(),
        );
        let result =
            pipeline::encode_bitmap(&mut lease.instance, source, options.quality, cancel).await;
        pool.checkin(lease);

        let data = result
            .map_err(|e| match e {
                // Report the request's budget, not what was left of it.
                Error::Timeout(_) => Error::Timeout(timeout),
                other => other,
            })
            .inspect_err(|e| tracing::debug!(error = %e, "Encode failed"))?;
        Ok(Encoded {
            width: source.width(),
            height: source.height(),
            data,
        })
    }

    /// Encode the request's source and write the WebP bytes to its
    /// destination.
    ///
    /// The codec instance is returned to the pool before the destination is
    /// written, so a slow sink never holds up other requests. On failure
    /// nothing is written.
    ///
    /// # Errors
    ///
    /// Same as [`encode_to_vec`](Self::encode_to_vec), plus [`Error::Io`]
    /// if writing to the destination fails.
    pub async fn encode<W>(&self, request: EncodeRequest<'_, W>) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        let EncodeRequest {
            source,
            mut destination,
            options,
        } = request;
        let encoded = self.encode_to_vec(&source, &options).await?;
        destination.write_all(&encoded.data).await?;
        destination.flush().await?;
        Ok(())
    }

    /// Stop accepting requests, wait for in-flight ones, and release the
    /// codec. Closing an already closed (or never started) server is a
    /// no-op.
    ///
    /// Only the call that moves the server to closed waits for in-flight
    /// encodes to drain. A concurrent second call returns at once, possibly
    /// while the first is still waiting.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for teardown that can
    /// fail.
    pub async fn close(&self) -> Result<(), Error> {
        let previous = std::mem::replace(&mut *self.lock(), Lifecycle::Closed);
        match previous {
            Lifecycle::Started(pool) => {
                pool.shutdown().await;
                tracing::info!("Server closed");
            }
            Lifecycle::Uninitialized | Lifecycle::Starting => {
                tracing::debug!("Closed server that was never started");
            }
            Lifecycle::Closed => {}
        }
        Ok(())
    }

    /// Whether the loaded codec has a dedicated single-channel encoder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] or [`Error::Closed`] in the wrong state.
    pub fn supports_gray(&self) -> Result<bool, Error> {
        Ok(self.pool()?.module().has_gray())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bitmap::ColorModel;

    fn pixel() -> Bitmap<'static> {
        Bitmap::new(1, 1, ColorModel::Rgba8, vec![0, 0, 0, 255])
    }

    #[tokio::test]
    async fn encode_before_start_is_rejected() {
        let server = Server::builder().with_binary(vec![1, 2, 3]).build();
        let err = server
            .encode_to_vec(&pixel(), &EncodeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotStarted));
        assert_eq!(server.state(), ServerState::Uninitialized);
    }

    #[tokio::test]
    async fn failed_start_leaves_server_uninitialized() {
        let server = Server::builder().with_binary(&b"not compressed"[..]).build();
        assert!(matches!(server.start(), Err(Error::Decompression(_))));
        assert_eq!(server.state(), ServerState::Uninitialized);

        let err = server
            .encode_to_vec(&pixel(), &EncodeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotStarted));
    }

    #[test]
    fn missing_binary_fails_to_start() {
        let server = Server::builder().build();
        assert!(matches!(server.start(), Err(Error::Decompression(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let server = Server::builder().build();
        server.close().await.unwrap();
        server.close().await.unwrap();
        assert_eq!(server.state(), ServerState::Closed);

        assert!(matches!(server.start(), Err(Error::AlreadyClosed)));
        let err = server
            .encode_to_vec(&pixel(), &EncodeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn server_that_is_starting_is_not_started_yet() {
        let server = Server::builder().build();
        *server.lock() = Lifecycle::Starting;
        assert_eq!(server.state(), ServerState::Starting);

        assert!(matches!(server.start(), Err(Error::AlreadyStarted)));
        let err = server
            .encode_to_vec(&pixel(), &EncodeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotStarted));

        server.close().await.unwrap();
        assert_eq!(server.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn state_is_readable_while_another_thread_compiles() {
        let server = Arc::new(Server::builder().build());
        *server.lock() = Lifecycle::Starting;

        // Compiling no longer holds the lock, so readers never block on it.
        let reader = Arc::clone(&server);
        let state = std::thread::spawn(move || reader.state()).join().unwrap();
        assert_eq!(state, ServerState::Starting);
    }

    #[test]
    fn options_builder() {
        let options = EncodeOptions::default()
            .with_quality(90.0)
            .with_deadline(Duration::from_secs(1));
        assert_eq!(options.quality, 90.0);
        assert_eq!(options.deadline, Some(Duration::from_secs(1)));
        assert!(options.cancel.is_none());
        assert_eq!(EncodeOptions::default().quality, DEFAULT_QUALITY);
    }
}
