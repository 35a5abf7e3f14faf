//! wasmtime runtime host for the codec module.
//!
//! [`CodecModule`] is the compiled, validated module image. It owns the
//! engine, the pre-linked instance template, and the thread that advances
//! the engine epoch. [`CodecInstance`] is one live instance with its own
//! linear memory; it implements [`Sandbox`] for the encode pipeline.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wasmtime::{
    Config, Engine, ExternType, FuncType, Instance, InstancePre, Linker, Memory, Module, Store,
    StoreLimits, StoreLimitsBuilder, Trap, TypedFunc, UpdateDeadline, Val, ValType,
};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::compression;
use crate::error::Error;
use crate::limits::{ResourceLimits, WASM_PAGE_SIZE};
use crate::sandbox::{Sandbox, Value};

/// Version of the WebAssembly feature set the engine is configured with.
///
/// Bumped whenever [`CodecModule::compile`] enables or disables a proposal,
/// since that can change which module images are accepted.
pub const FEATURE_SET_VERSION: u32 = 1;

/// Export names the codec module is expected to provide.
pub mod exports {
    /// Linear memory.
    pub const MEMORY: &str = "memory";
    /// `(size: i32) -> i32`, returns 0 on failure.
    pub const ALLOC: &str = "webp_alloc";
    /// `(ptr: i32)`.
    pub const FREE: &str = "webp_free";
    /// `(ptr, len, width, height: i32, quality: f32) -> (out_ptr: i32, out_len: i32)`.
    pub const ENCODE_RGBA: &str = "webp_encode_rgba";
    /// Same signature as [`ENCODE_RGBA`], one byte per pixel. Optional.
    pub const ENCODE_GRAY: &str = "webp_encode_gray";
    /// Reactor entry point, run once before first use. Optional.
    pub const INITIALIZE: &str = "_initialize";
}

/// Why an in-flight call was stopped by the epoch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
enum Interrupted {
    #[error("call deadline exceeded")]
    Deadline,
    #[error("call cancelled")]
    Cancelled,
}

/// Deadline and cancellation for the calls made on behalf of one request.
#[derive(Debug, Clone)]
struct CallBudget {
    deadline: Instant,
    timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl CallBudget {
    fn new(timeout: Duration, cancel: Option<CancellationToken>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            cancel,
        }
    }

    fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Interrupted::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(Interrupted::Deadline);
        }
        Ok(())
    }
}

/// Per-instance store data.
struct HostState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    budget: CallBudget,
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

/// Background thread that advances the engine epoch at a fixed interval.
///
/// Deadlines and cancellation are only observed on epoch ticks, so every
/// instance keeps a handle to the ticker alive for as long as it exists.
#[derive(Debug)]
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, interval: Duration) -> Result<Self, Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("webpw-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| Error::Compile(format!("failed to spawn epoch thread: {e}")))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A compiled and validated codec module.
///
/// Compiling is the expensive step; instances are created from the
/// pre-linked template in [`instantiate`](Self::instantiate) and each get
/// their own linear memory.
pub struct CodecModule {
    engine: Engine,
    pre: InstancePre<HostState>,
    limits: ResourceLimits,
    has_gray: bool,
    ticker: Arc<EpochTicker>,
}

impl std::fmt::Debug for CodecModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecModule")
            .field("limits", &self.limits)
            .field("has_gray", &self.has_gray)
            .finish_non_exhaustive()
    }
}

impl CodecModule {
    /// Decompress, compile, validate and link a codec module image.
    ///
    /// The image must be gzip or zstd compressed. Nothing inside the module
    /// runs here; the reactor entry point runs lazily on an instance's
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decompression`] if the image cannot be decompressed
    /// and [`Error::Compile`] if the module is invalid, lacks a required
    /// export, needs more memory than the cap allows, or imports something
    /// the host does not provide.
    pub fn compile(image: &[u8], limits: &ResourceLimits) -> Result<Self, Error> {
        let wasm = compression::decompress(image, limits.max_module_bytes)?;

        let engine = Self::create_engine(limits)?;
        let module =
            Module::new(&engine, &wasm).map_err(|e| Error::Compile(format!("{e:#}")))?;
        let has_gray = validate_exports(&module, limits)?;

        let linker = Self::create_linker(&engine)?;
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| Error::Compile(format!("failed to link module: {e:#}")))?;

        let ticker = EpochTicker::spawn(engine.clone(), limits.epoch_tick)?;

        tracing::info!(
            module_bytes = wasm.len(),
            feature_set = FEATURE_SET_VERSION,
            max_memory_bytes = limits.max_memory_bytes,
            has_gray,
            "Codec module compiled"
        );

        Ok(Self {
            engine,
            pre,
            limits: limits.clone(),
            has_gray,
            ticker: Arc::new(ticker),
        })
    }

    /// Create an engine with a pinned feature set.
    fn create_engine(limits: &ResourceLimits) -> Result<Engine, Error> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        config.max_wasm_stack(limits.max_wasm_stack);
        config.async_stack_size(limits.max_wasm_stack + 1024 * 1024);

        // Feature set v1: MVP plus the post-MVP proposals codec toolchains emit.
        config.wasm_bulk_memory(true);
        config.wasm_multi_value(true);
        config.wasm_reference_types(true);
        config.wasm_simd(true);
        config.wasm_relaxed_simd(false);
        config.wasm_threads(false);
        config.wasm_memory64(false);
        config.wasm_component_model(false);
        config.cranelift_nan_canonicalization(true);

        Engine::new(&config).map_err(|e| Error::Compile(format!("failed to configure engine: {e}")))
    }

    /// Create a linker providing the preview 1 system interface.
    fn create_linker(engine: &Engine) -> Result<Linker<HostState>, Error> {
        let mut linker = Linker::<HostState>::new(engine);
        wasmtime_wasi::p1::add_to_linker_async(&mut linker, |state: &mut HostState| {
            &mut state.wasi
        })
        .map_err(|e| Error::Compile(format!("failed to add WASI to linker: {e}")))?;
        Ok(linker)
    }

    /// Whether the module exports a dedicated single-channel encoder.
    #[must_use]
    pub const fn has_gray(&self) -> bool {
        self.has_gray
    }

    /// The limits the module was compiled with.
    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Create a fresh instance with its own linear memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Instantiation`] if the instance cannot be created
    /// or its exports do not have the expected signatures.
    pub async fn instantiate(&self) -> Result<CodecInstance, Error> {
        // stdin reads as empty and stdout is discarded; stderr is kept so
        // codec diagnostics reach the host log.
        let wasi = WasiCtxBuilder::new().inherit_stderr().build_p1();

        let memory_cap = usize::try_from(self.limits.max_memory_bytes).unwrap_or(usize::MAX);
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_cap)
            .instances(1)
            .memories(1)
            .tables(4)
            .build();

        let state = HostState {
            wasi,
            limits,
            budget: CallBudget::new(self.limits.call_timeout, None),
        };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store.epoch_deadline_callback(|ctx| match ctx.data().budget.check() {
            Ok(()) => Ok(UpdateDeadline::Yield(1)),
            Err(reason) => Err(wasmtime::Error::new(reason)),
        });
        store.set_epoch_deadline(1);

        let instance = self
            .pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| Error::Instantiation(format!("{e:#}")))?;

        let memory = instance
            .get_memory(&mut store, exports::MEMORY)
            .ok_or_else(|| Error::Instantiation("module has no exported memory".to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, exports::ALLOC)
            .map_err(|e| Error::Instantiation(format!("`{}`: {e}", exports::ALLOC)))?;
        let free = instance
            .get_typed_func::<i32, ()>(&mut store, exports::FREE)
            .map_err(|e| Error::Instantiation(format!("`{}`: {e}", exports::FREE)))?;

        tracing::debug!("Codec instance created");

        Ok(CodecInstance {
            store,
            instance,
            memory,
            alloc,
            free,
            max_memory_bytes: self.limits.max_memory_bytes,
            default_timeout: self.limits.call_timeout,
            armed: false,
            initialized: false,
            in_call: false,
            poisoned: false,
            _ticker: Arc::clone(&self.ticker),
        })
    }
}

/// Check the module's exports and report whether the gray encoder exists.
fn validate_exports(module: &Module, limits: &ResourceLimits) -> Result<bool, Error> {
    let mut memory = None;
    let mut funcs = HashSet::new();
    for export in module.exports() {
        match export.ty() {
            ExternType::Memory(ty) if export.name() == exports::MEMORY => memory = Some(ty),
            ExternType::Func(ty) => {
                check_signature(export.name(), &ty)?;
                funcs.insert(export.name().to_string());
            }
            _ => {}
        }
    }

    let memory = memory.ok_or_else(|| {
        Error::Compile(format!("module does not export `{}`", exports::MEMORY))
    })?;
    if memory.is_64() {
        return Err(Error::Compile("64-bit memories are not supported".to_string()));
    }
    let min_bytes = memory.minimum().saturating_mul(WASM_PAGE_SIZE);
    if min_bytes > limits.max_memory_bytes {
        return Err(Error::Compile(format!(
            "module needs {min_bytes} bytes of memory, cap is {}",
            limits.max_memory_bytes
        )));
    }

    for required in [exports::ALLOC, exports::FREE, exports::ENCODE_RGBA] {
        if !funcs.contains(required) {
            return Err(Error::Compile(format!(
                "module does not export `{required}`"
            )));
        }
    }
    Ok(funcs.contains(exports::ENCODE_GRAY))
}

#[derive(Clone, Copy)]
enum Kind {
    I32,
    F32,
}

fn kinds_match(actual: impl ExactSizeIterator<Item = ValType>, expected: &[Kind]) -> bool {
    actual.len() == expected.len()
        && actual.zip(expected).all(|(ty, kind)| match kind {
            Kind::I32 => matches!(ty, ValType::I32),
            Kind::F32 => matches!(ty, ValType::F32),
        })
}

fn check_signature(name: &str, ty: &FuncType) -> Result<(), Error> {
    use Kind::{F32, I32};
    let (params, results): (&[Kind], &[Kind]) = match name {
        exports::ALLOC => (&[I32], &[I32]),
        exports::FREE => (&[I32], &[]),
        exports::ENCODE_RGBA | exports::ENCODE_GRAY => (&[I32, I32, I32, I32, F32], &[I32, I32]),
        exports::INITIALIZE => (&[], &[]),
        _ => return Ok(()),
    };
    if kinds_match(ty.params(), params) && kinds_match(ty.results(), results) {
        Ok(())
    } else {
        Err(Error::Compile(format!(
            "export `{name}` has an unexpected signature: {ty:?}"
        )))
    }
}

/// A live codec instance.
///
/// An instance whose call trapped, was interrupted, or was abandoned
/// mid-flight reports [`is_poisoned`](Self::is_poisoned) and must not be
/// reused; its memory is reclaimed by dropping it.
pub struct CodecInstance {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    max_memory_bytes: u64,
    default_timeout: Duration,
    armed: bool,
    initialized: bool,
    in_call: bool,
    poisoned: bool,
    _ticker: Arc<EpochTicker>,
}

impl std::fmt::Debug for CodecInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecInstance")
            .field("initialized", &self.initialized)
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl CodecInstance {
    /// Bound every following call by `timeout` (measured from now) and
    /// `cancel`, until [`disarm`](Self::disarm).
    pub fn arm(&mut self, timeout: Duration, cancel: Option<CancellationToken>) {
        self.store.data_mut().budget = CallBudget::new(timeout, cancel);
        self.armed = true;
    }

    /// Return to the default per-call timeout.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.store.data_mut().budget = CallBudget::new(self.default_timeout, None);
    }

    /// Whether the instance must be discarded instead of reused.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned || self.in_call
    }

    /// Current size of the instance's linear memory.
    #[must_use]
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    fn begin_call(&mut self) -> Result<(), Error> {
        if !self.armed {
            self.store.data_mut().budget = CallBudget::new(self.default_timeout, None);
        }
        let budget = &self.store.data().budget;
        if let Err(reason) = budget.check() {
            return Err(interrupted(reason, budget.timeout));
        }
        self.store.set_epoch_deadline(1);
        self.in_call = true;
        Ok(())
    }

    fn finish_call<R>(&mut self, result: wasmtime::Result<R>) -> Result<R, Error> {
        self.in_call = false;
        result.map_err(|e| self.call_failed(e))
    }

    fn call_failed(&mut self, err: wasmtime::Error) -> Error {
        self.poisoned = true;
        let error = if let Some(reason) = err.downcast_ref::<Interrupted>() {
            interrupted(*reason, self.store.data().budget.timeout)
        } else if let Some(trap) = err.downcast_ref::<Trap>() {
            Error::Trap(trap.to_string())
        } else {
            Error::Trap(format!("{err:#}"))
        };
        tracing::warn!(error = %error, "Codec call failed, instance will be discarded");
        error
    }

    async fn ensure_initialized(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }
        let Some(func) = self.instance.get_func(&mut self.store, exports::INITIALIZE) else {
            self.initialized = true;
            return Ok(());
        };
        let init = func.typed::<(), ()>(&self.store).map_err(|e| {
            self.poisoned = true;
            Error::Instantiation(format!("`{}`: {e}", exports::INITIALIZE))
        })?;
        // Nothing has run yet if the budget is already spent, so the
        // instance stays clean and initializes on its next use.
        self.begin_call()?;
        let result = init.call_async(&mut self.store, ()).await;
        self.finish_call(result)?;
        self.initialized = true;
        tracing::debug!("Codec instance initialized");
        Ok(())
    }
}

fn interrupted(reason: Interrupted, timeout: Duration) -> Error {
    match reason {
        Interrupted::Deadline => Error::Timeout(timeout),
        Interrupted::Cancelled => Error::Cancelled,
    }
}

fn to_val(value: Value) -> Val {
    match value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
    }
}

fn from_val(name: &str, val: &Val) -> Result<Value, Error> {
    match val {
        Val::I32(v) => Ok(Value::I32(*v)),
        Val::I64(v) => Ok(Value::I64(*v)),
        Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
        _ => Err(Error::Protocol(format!(
            "export `{name}` returned a non-scalar value"
        ))),
    }
}

#[async_trait]
impl Sandbox for CodecInstance {
    async fn allocate(&mut self, size: usize) -> Result<u32, Error> {
        let out_of_memory = Error::SandboxOutOfMemory { requested: size };
        if size as u64 > self.max_memory_bytes {
            return Err(out_of_memory);
        }
        let Ok(len) = i32::try_from(size) else {
            return Err(out_of_memory);
        };

        self.ensure_initialized().await?;
        self.begin_call()?;
        let result = self.alloc.call_async(&mut self.store, len).await;
        let ptr = self.finish_call(result)?;
        if ptr == 0 {
            tracing::debug!(size, memory = self.memory_size(), "Sandbox allocation failed");
            return Err(out_of_memory);
        }
        Ok(ptr as u32)
    }

    async fn free(&mut self, offset: u32) -> Result<(), Error> {
        // A poisoned instance is reclaimed wholesale when it is dropped.
        if self.is_poisoned() || offset == 0 {
            return Ok(());
        }
        self.begin_call()?;
        let result = self.free.call_async(&mut self.store, offset as i32).await;
        self.finish_call(result)
    }

    fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.memory
            .write(&mut self.store, offset as usize, bytes)
            .map_err(|_| Error::MemoryAccess {
                offset,
                len: bytes.len(),
            })
    }

    fn read_memory(&mut self, offset: u32, len: usize) -> Result<Vec<u8>, Error> {
        let start = offset as usize;
        start
            .checked_add(len)
            .and_then(|end| self.memory.data(&self.store).get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or(Error::MemoryAccess { offset, len })
    }

    async fn call_export(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        self.ensure_initialized().await?;
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| Error::MissingExport(name.to_string()))?;

        let params: Vec<Val> = args.iter().copied().map(to_val).collect();
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];

        self.begin_call()?;
        let result = func.call_async(&mut self.store, &params, &mut results).await;
        self.finish_call(result)?;

        results.iter().map(|val| from_val(name, val)).collect()
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }
}
