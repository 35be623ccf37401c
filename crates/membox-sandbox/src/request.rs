//! Execution request and outcome types.
//!
//! One [`ExecutionRequest`] is built per agent turn that contains a code
//! block; one [`ExecutionOutcome`] comes back for every invocation, success
//! or failure, so the conversation loop can fold it into the next turn.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

/// Default wall-clock budget for one snippet execution.
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(20);

/// Immutable description of one sandbox invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The snippet to execute.
    pub code: String,
    /// Wall-clock budget; the worker is killed once it elapses.
    pub timeout: Duration,
    /// Permit prelude installation from `requirements_path`.
    pub allow_installs: bool,
    /// Manifest file listing prelude scripts to evaluate before the snippet.
    pub requirements_path: Option<PathBuf>,
    /// Filesystem confinement root; `None` means no confinement.
    pub allowed_root: Option<PathBuf>,
    /// Bare names or `module.function` entries to neutralize.
    pub blacklist: BTreeSet<String>,
    /// Explicit capability function names to expose to the snippet.
    pub available_functions: Vec<String>,
    /// Capability module whose public functions are all exposed.
    pub import_module: Option<String>,
    /// Caller-supplied data globals injected before the snippet runs.
    pub bindings: BTreeMap<String, Value>,
    /// Verbose tracing for this invocation.
    pub log: bool,
}

impl ExecutionRequest {
    /// Build a request for the given snippet with default settings.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout: DEFAULT_SANDBOX_TIMEOUT,
            allow_installs: false,
            requirements_path: None,
            allowed_root: None,
            blacklist: BTreeSet::new(),
            available_functions: Vec::new(),
            import_module: None,
            bindings: BTreeMap::new(),
            log: false,
        }
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Confine all path-accepting capability functions to this directory.
    pub fn with_allowed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.allowed_root = Some(root.into());
        self
    }

    /// Neutralize a bare name or `module.function` entry.
    pub fn with_blacklisted(mut self, entry: impl Into<String>) -> Self {
        self.blacklist.insert(entry.into());
        self
    }

    /// Expose one named capability function to the snippet.
    pub fn with_available_function(mut self, name: impl Into<String>) -> Self {
        self.available_functions.push(name.into());
        self
    }

    /// Expose every public function of a registered capability module.
    pub fn with_import_module(mut self, module: impl Into<String>) -> Self {
        self.import_module = Some(module.into());
        self
    }

    /// Inject a caller-supplied data global.
    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    /// Point at a prelude manifest and permit installing it.
    pub fn with_requirements(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.requirements_path = Some(manifest.into());
        self
    }

    /// Permit or forbid prelude installation.
    pub fn with_allow_installs(mut self, allow: bool) -> Self {
        self.allow_installs = allow;
        self
    }

    /// Enable verbose tracing for this invocation.
    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }
}

/// The `(locals, error)` pair produced for every invocation.
///
/// Three shapes are possible:
/// - success: `locals` is `Some`, `error` is empty;
/// - snippet failure: `locals` holds the bindings made before the failure,
///   `error` carries the formatted trace;
/// - infrastructure failure (timeout, worker crash, pre-flight install or
///   import failure, validation rejection): `locals` is `None` and `error`
///   is a distinct, legible message.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// Top-level bindings created by the snippet, marshaled to JSON values.
    /// Values the interchange format cannot represent are replaced by their
    /// textual rendition, never omitted.
    pub locals: Option<BTreeMap<String, Value>>,
    /// Empty on success.
    pub error: String,
}

impl ExecutionOutcome {
    /// A clean completion with the given locals.
    pub fn success(locals: BTreeMap<String, Value>) -> Self {
        Self {
            locals: Some(locals),
            error: String::new(),
        }
    }

    /// A snippet-level failure; bindings made before the failure survive.
    pub fn snippet_failure(locals: BTreeMap<String, Value>, error: impl Into<String>) -> Self {
        Self {
            locals: Some(locals),
            error: error.into(),
        }
    }

    /// An infrastructure failure: no locals are available at all.
    pub fn infrastructure(error: impl Into<String>) -> Self {
        Self {
            locals: None,
            error: error.into(),
        }
    }

    /// True when the snippet ran to completion without error.
    pub fn is_success(&self) -> bool {
        self.locals.is_some() && self.error.is_empty()
    }

    /// True when the sandbox itself failed (as opposed to the snippet).
    pub fn is_infrastructure_failure(&self) -> bool {
        self.locals.is_none()
    }
}
