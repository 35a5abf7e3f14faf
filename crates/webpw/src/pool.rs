//! A bounded pool of codec instances.
//!
//! A codec instance is single-threaded, so each in-flight encode needs one
//! to itself. The pool hands out at most `size` instances at a time and
//! creates them on demand. Instances that trapped, timed out, were
//! cancelled mid-call, or were abandoned by a dropped request are never
//! returned to the pool; a fresh one replaces them on the next checkout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::wasm::{CodecInstance, CodecModule};

/// Default number of concurrently usable instances.
pub const DEFAULT_POOL_SIZE: usize = 1;

pub(crate) struct InstancePool {
    module: CodecModule,
    idle: Mutex<Vec<CodecInstance>>,
    permits: Arc<Semaphore>,
    size: u32,
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("size", &self.size)
            .field("available", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl InstancePool {
    pub(crate) fn new(module: CodecModule, size: usize) -> Self {
        let size = u32::try_from(size.clamp(1, Semaphore::MAX_PERMITS)).unwrap_or(u32::MAX);
        Self {
            module,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(size as usize)),
            size,
        }
    }

    pub(crate) const fn module(&self) -> &CodecModule {
        &self.module
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<CodecInstance>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for an instance, giving up after `timeout` or when `cancel` fires.
    pub(crate) async fn checkout(
        &self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Lease, Error> {
        let acquire = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned());
        let permit = tokio::select! {
            acquired = acquire => acquired
                .map_err(|_| Error::Timeout(timeout))?
                .map_err(|_| Error::Closed)?,
            () = cancelled(cancel) => return Err(Error::Cancelled),
        };

        let reused = self.idle().pop();
        let instance = match reused {
            Some(instance) => instance,
            None => {
                tracing::debug!("Creating codec instance");
                self.module.instantiate().await?
            }
        };

        Ok(Lease {
            instance,
            _permit: permit,
        })
    }

    /// Return an instance after a request finished with it.
    ///
    /// Poisoned instances are dropped instead. A lease that is dropped
    /// without being checked in (for example because the request future
    /// was abandoned) discards its instance the same way, since it may hold
    /// buffers the pipeline never released.
    pub(crate) fn checkin(&self, lease: Lease) {
        let Lease {
            mut instance,
            _permit,
        } = lease;
        if instance.is_poisoned() {
            tracing::debug!("Discarding codec instance");
            return;
        }
        instance.disarm();
        self.idle().push(instance);
    }

    /// Wait for every checked-out instance to come back, then refuse new
    /// checkouts and drop the idle instances.
    pub(crate) async fn shutdown(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size).await {
            self.permits.close();
            drop(all);
        }
        let drained = std::mem::take(&mut *self.idle());
        tracing::debug!(instances = drained.len(), "Instance pool drained");
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// An instance on loan from the pool, holding one of its permits.
#[derive(Debug)]
pub(crate) struct Lease {
    pub(crate) instance: CodecInstance,
    _permit: OwnedSemaphorePermit,
}
