//! Sandbox executor. Creates fresh V8 isolates and runs agent-authored
//! snippets against the memory capability functions.
//!
//! Each execution gets a brand new runtime; no state leaks between calls.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::capabilities::{module_ops, MemoryStore, SizeLimits, MEMORY_MODULE};
use crate::confinement::{Blacklist, Confinement};
use crate::error::SandboxError;
use crate::ipc::{Prelude, WorkerConfig, DEFAULT_MAX_IPC_MESSAGE_SIZE};
use crate::namespace::{
    decode_locals, is_valid_identifier, NamespaceSpec, BASELINE_SCRIPT, CAPTURE_SCRIPT,
    EXIT_SENTINEL,
};
use crate::ops::{membox_ext, ResultPayload};
use crate::request::{ExecutionOutcome, ExecutionRequest};
use crate::validator::validate_code;

#[cfg(feature = "metrics")]
use crate::metrics::SandboxMetrics;

/// How the sandbox executes snippets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run V8 in-process on a dedicated thread (suitable for tests).
    InProcess,
    /// Spawn an isolated worker process per execution (default; a V8 crash
    /// or abort takes down the worker, not the host).
    #[default]
    ChildProcess,
}

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum snippet size in bytes.
    pub max_code_size: usize,
    /// Maximum size of the marshaled locals payload in bytes.
    pub max_output_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent sandbox executions.
    pub max_concurrent: usize,
    /// Maximum IPC message size in bytes.
    pub max_ipc_message_size: usize,
    /// Execution mode: in-process or child-process isolation.
    pub execution_mode: ExecutionMode,
    /// Size ceilings for mutating capability functions.
    pub size_limits: SizeLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_code_size: 64 * 1024,        // 64 KB
            max_output_size: 1024 * 1024,    // 1 MB
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_concurrent: 8,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
            execution_mode: ExecutionMode::default(),
            size_limits: SizeLimits::default(),
        }
    }
}

/// The sandbox executor. Creates a fresh V8 isolate for each execution.
///
/// This is `Send + Sync` safe: all V8 operations are dispatched to a
/// dedicated thread (or a worker process) internally. A concurrency
/// semaphore limits the number of simultaneous isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<SandboxMetrics>>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: Arc::new(NoopAuditLogger),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Create a new sandbox executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let mut this = Self::new(config);
        this.audit_logger = logger;
        this
    }

    /// Attach a metrics registry.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execute one snippet and produce its `(locals, error)` outcome.
    ///
    /// Snippet-level failures (exceptions, denied paths, pre-flight install
    /// or import failures, timeouts) come back inside the `Ok` outcome; an
    /// `Err` means the sandbox infrastructure itself failed (spawn error,
    /// broken channel, corrupt payload, concurrency limit).
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, SandboxError> {
        tracing::info!(
            code_len = request.code.len(),
            mode = ?self.config.execution_mode,
            "execute: starting"
        );

        let audit_builder = AuditEntryBuilder::new(&request.code);
        let result = self.execute_inner(request).await;

        let entry = audit_builder.finish(&result);
        self.audit_logger.log(&entry).await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record(&entry);
        }

        match &result {
            Ok(outcome) if outcome.is_success() => tracing::info!("execute: complete"),
            Ok(outcome) => {
                tracing::info!(error = %outcome.error, "execute: completed with snippet error")
            }
            Err(e) => tracing::warn!(error = %e, "execute: failed"),
        }
        result
    }

    /// Convenience wrapper for synchronous callers.
    pub fn execute_blocking(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SandboxError::Worker(e.into()))?;
        rt.block_on(self.execute(request))
    }

    async fn execute_inner(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, SandboxError> {
        if let Err(e) = validate_code(&request.code, self.config.max_code_size) {
            return Ok(ExecutionOutcome::infrastructure(format!(
                "Code validation failed: {e}"
            )));
        }

        let preludes = match resolve_preludes(request) {
            Ok(p) => p,
            Err(message) => return Ok(ExecutionOutcome::infrastructure(message)),
        };
        let exposed_ops = match resolve_capabilities(request) {
            Ok(ops) => ops,
            Err(message) => return Ok(ExecutionOutcome::infrastructure(message)),
        };
        for name in request.bindings.keys() {
            if !is_valid_identifier(name) {
                return Ok(ExecutionOutcome::infrastructure(format!(
                    "Invalid binding name: '{name}'"
                )));
            }
        }

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let worker_config = self.worker_config(request, exposed_ops);
        match self.config.execution_mode {
            ExecutionMode::ChildProcess => {
                crate::host::execute_in_child(&request.code, &preludes, &worker_config).await
            }
            ExecutionMode::InProcess => {
                self.execute_in_process(&request.code, preludes, worker_config)
                    .await
            }
        }
    }

    fn worker_config(
        &self,
        request: &ExecutionRequest,
        exposed_ops: Vec<(String, String)>,
    ) -> WorkerConfig {
        WorkerConfig {
            timeout_ms: request.timeout.as_millis() as u64,
            max_heap_size: self.config.max_heap_size,
            max_output_size: self.config.max_output_size,
            max_code_size: self.config.max_code_size,
            max_ipc_message_size: self.config.max_ipc_message_size,
            allowed_root: request.allowed_root.clone(),
            size_limits: self.config.size_limits,
            exposed_ops,
            blacklist: request.blacklist.iter().cloned().collect(),
            bindings: request.bindings.clone(),
            log: request.log,
        }
    }

    /// In-process execution: a dedicated thread with its own V8 isolate.
    async fn execute_in_process(
        &self,
        code: &str,
        preludes: Vec<Prelude>,
        config: WorkerConfig,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let code = code.to_string();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Worker(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_snippet(&config, &code, &preludes));
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        });

        rx.await
            .map_err(|_| SandboxError::Worker(anyhow::anyhow!("sandbox thread panicked")))?
    }
}

/// Resolve the prelude manifest into scripts, honoring the install gate.
fn resolve_preludes(request: &ExecutionRequest) -> Result<Vec<Prelude>, String> {
    let Some(manifest) = &request.requirements_path else {
        return Ok(Vec::new());
    };
    if !request.allow_installs {
        return Err(
            "Failed to install requirements: installs are disabled for this request".to_string(),
        );
    }
    if !manifest.is_file() {
        return Err(format!(
            "Requirements file not found: {}",
            manifest.display()
        ));
    }
    let listing = std::fs::read_to_string(manifest)
        .map_err(|e| format!("Failed to install requirements: {}: {e}", manifest.display()))?;
    let base = manifest.parent().map(|p| p.to_path_buf()).unwrap_or_default();

    let mut preludes = Vec::new();
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let path = if std::path::Path::new(line).is_absolute() {
            std::path::PathBuf::from(line)
        } else {
            base.join(line)
        };
        let source = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to install requirements: {line}: {e}"))?;
        preludes.push(Prelude {
            name: line.to_string(),
            source,
        });
    }
    Ok(preludes)
}

/// Resolve `import_module` and `available_functions` against the capability
/// registry into `(module, function)` pairs.
fn resolve_capabilities(request: &ExecutionRequest) -> Result<Vec<(String, String)>, String> {
    let mut exposed = Vec::new();
    if let Some(module) = &request.import_module {
        let Some(ops) = module_ops(module) else {
            return Err(format!(
                "Failed to import module {module}: unknown capability module"
            ));
        };
        for name in ops {
            exposed.push((module.clone(), (*name).to_string()));
        }
    }
    // Accepts both "read_file" and "memory.read_file".
    for name in &request.available_functions {
        let (module, func) = match name.split_once('.') {
            Some((module, func)) => (module, func),
            None => (MEMORY_MODULE, name.as_str()),
        };
        let known = module_ops(module).is_some_and(|ops| ops.contains(&func));
        if !known {
            return Err(format!("Unknown capability function: '{name}'"));
        }
        let pair = (module.to_string(), func.to_string());
        if !exposed.contains(&pair) {
            exposed.push(pair);
        }
    }
    Ok(exposed)
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. AtomicBool lets the
    /// callback use a shared `&` reference instead of `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the Box<HeapLimitState> allocated in
    // run_snippet. The Box outlives this callback because the watchdog
    // thread is joined before heap_state is dropped, and V8 only invokes
    // the callback while the isolate is running.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Create a fresh JsRuntime with the membox extension loaded, V8 heap
/// limits set, and the memory store installed in OpState.
fn create_runtime(config: &WorkerConfig) -> Result<JsRuntime, SandboxError> {
    let confinement = Confinement::new(config.allowed_root.as_deref())
        .map_err(|e| SandboxError::Worker(anyhow::anyhow!("failed to prepare memory root: {e}")))?;
    let store = MemoryStore::new(confinement, config.size_limits);

    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![membox_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(store);
    Ok(runtime)
}

/// Run one snippet on the current thread. Must be called from a dedicated
/// thread, never the main tokio runtime.
///
/// Public for reuse in the worker binary.
pub async fn run_snippet(
    config: &WorkerConfig,
    code: &str,
    preludes: &[Prelude],
) -> Result<ExecutionOutcome, SandboxError> {
    let mut runtime = create_runtime(config)?;

    let spec = NamespaceSpec::new(
        config.exposed_ops.clone(),
        Blacklist::parse(&config.blacklist),
        config.bindings.clone(),
    );
    runtime
        .execute_script("[membox:bootstrap]", spec.build_bootstrap())
        .map_err(|e| SandboxError::Worker(anyhow::anyhow!("bootstrap failed: {e}")))?;

    for prelude in preludes {
        if config.log {
            tracing::debug!(name = %prelude.name, "installing prelude");
        }
        if let Err(e) = runtime.execute_script("[membox:prelude]", prelude.source.clone()) {
            return Ok(ExecutionOutcome::infrastructure(format!(
                "Failed to install requirements: {}: {e}",
                prelude.name
            )));
        }
    }

    // Baseline after preludes, so prelude definitions are not captured as
    // snippet locals.
    runtime
        .execute_script("[membox:baseline]", BASELINE_SCRIPT)
        .map_err(|e| SandboxError::Worker(anyhow::anyhow!("baseline failed: {e}")))?;

    // --- Set up heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- Set up CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = std::time::Duration::from_millis(config.timeout_ms);
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    // --- Execute the snippet ---
    let exec_error = match runtime.execute_script("[membox:snippet]", code.to_string()) {
        Ok(_) => {
            match tokio::time::timeout(
                timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    Some("async timeout".to_string())
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // The watchdog must be joined before the runtime is dropped, or the
    // IsolateHandle could be used after free.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Ok(ExecutionOutcome::infrastructure(format!(
            "MemoryError: Code execution exceeded the heap limit of {} MB.",
            config.max_heap_size / (1024 * 1024)
        )));
    }
    if timed_out.load(Ordering::SeqCst) {
        return Ok(ExecutionOutcome::infrastructure(format!(
            "TimeoutError: Code execution exceeded {} seconds.",
            format_timeout(config.timeout_ms)
        )));
    }

    // Classify the snippet error, if any. The exit sentinel is a controlled
    // termination, not an exception.
    let error = match exec_error {
        None => String::new(),
        Some(msg) => match parse_exit_status(&msg) {
            Some(0) => String::new(),
            Some(status) => format!("Sandboxed code called exit({status})"),
            None => format!("Exception in sandboxed code:\n{msg}"),
        },
    };

    // --- Capture locals (also after a snippet failure) ---
    runtime
        .execute_script("[membox:capture]", CAPTURE_SCRIPT)
        .map_err(|e| SandboxError::Decode(format!("locals capture failed: {e}")))?;

    let payload = {
        let state = runtime.op_state();
        let state = state.borrow();
        state
            .try_borrow::<ResultPayload>()
            .map(|r| r.0.clone())
            .ok_or_else(|| SandboxError::Decode("no locals payload was committed".into()))?
    };
    if payload.len() > config.max_output_size {
        return Err(SandboxError::OutputTooLarge {
            max: config.max_output_size,
        });
    }
    let locals = decode_locals(&payload).map_err(|e| SandboxError::Decode(e.to_string()))?;

    if error.is_empty() {
        Ok(ExecutionOutcome::success(locals))
    } else {
        Ok(ExecutionOutcome::snippet_failure(locals, error))
    }
}

/// Extract the status from an exit-sentinel error message.
fn parse_exit_status(msg: &str) -> Option<i64> {
    let at = msg.find(EXIT_SENTINEL)?;
    let digits: String = msg[at + EXIT_SENTINEL.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok().or(Some(0))
}

/// Render a millisecond budget as seconds for the timeout message.
pub(crate) fn format_timeout(ms: u64) -> String {
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{}", ms as f64 / 1000.0)
    }
}
