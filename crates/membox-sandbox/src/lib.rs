//! Process-isolated execution of agent-authored snippets against a
//! file-based memory.
//!
//! An agent turn that contains a code block becomes an
//! [`ExecutionRequest`]: the snippet, a wall-clock budget, a filesystem
//! confinement root, the capability functions to expose, and optional data
//! bindings. [`SandboxExecutor::execute`] runs the snippet in a fresh V8
//! isolate and always produces an [`ExecutionOutcome`], the `(locals,
//! error)` pair the conversation loop folds into the next turn.
//!
//! # Security model
//!
//! - Each execution gets a brand new isolate; no state leaks between calls.
//! - In the default [`ExecutionMode::ChildProcess`] the isolate lives in a
//!   `membox-worker` process spawned with a cleared environment, so a V8
//!   crash or abort never takes down the host.
//! - The snippet sees only the injected capability functions, `log`,
//!   `exit`, and its bindings. `Deno`, `eval`, and the `Function`
//!   constructors are stripped before it runs, and a textual validator
//!   rejects obvious escape attempts up front.
//! - Path-accepting capabilities resolve every argument against the
//!   confinement root; a denied path always surfaces as an error inside
//!   the snippet, never as silent success.
//! - CPU is bounded by a watchdog thread, memory by a V8 heap limit, and
//!   output by a payload size ceiling.

#![warn(missing_docs)]

pub mod audit;
pub mod capabilities;
pub mod confinement;
pub mod error;
mod executor;
mod host;
pub mod ipc;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod namespace;
mod ops;
mod request;
pub mod validator;

pub use error::SandboxError;
pub use executor::{run_snippet, ExecutionMode, SandboxConfig, SandboxExecutor};
pub use host::WORKER_BIN_ENV;
pub use request::{ExecutionOutcome, ExecutionRequest, DEFAULT_SANDBOX_TIMEOUT};
