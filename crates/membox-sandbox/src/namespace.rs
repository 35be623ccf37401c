//! Snippet namespace construction and locals capture.
//!
//! The worker evaluates three generated scripts around the snippet:
//!
//! 1. the bootstrap, which installs capability wrappers, caller bindings,
//!    `log` and `exit`, then strips code-generation primitives;
//! 2. [`BASELINE_SCRIPT`], run after any preludes, which records the set of
//!    global property names that existed before the snippet;
//! 3. [`CAPTURE_SCRIPT`], run after the snippet, which diffs the global
//!    object against the baseline and commits the new bindings as JSON.
//!
//! Capture packs each value as `{json}` when the interchange format can
//! represent it and `{repr}` (its textual rendition) when it cannot, so no
//! binding is silently dropped.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::confinement::Blacklist;

/// Prefix thrown by the snippet-visible `exit()` to request termination.
pub const EXIT_SENTINEL: &str = "__membox_exit:";

/// What the bootstrap installs into the snippet's global namespace.
#[derive(Debug)]
pub struct NamespaceSpec {
    exposed_ops: Vec<(String, String)>,
    blacklist: Blacklist,
    bindings: BTreeMap<String, Value>,
}

impl NamespaceSpec {
    /// Build a namespace spec from resolved capability pairs, the parsed
    /// blacklist, and caller bindings.
    pub fn new(
        exposed_ops: Vec<(String, String)>,
        blacklist: Blacklist,
        bindings: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            exposed_ops,
            blacklist,
            bindings,
        }
    }

    /// Generate the bootstrap script.
    ///
    /// Capability wrappers close over `Deno.core.ops` inside an IIFE, so
    /// they keep working after the hardening tail deletes `Deno` from the
    /// global object. A blacklisted capability is installed as `undefined`
    /// rather than omitted, so calling it fails with "is not a function"
    /// instead of a bare reference error.
    pub fn build_bootstrap(&self) -> String {
        let mut parts = Vec::new();
        parts.push(
            r#"
                ((ops) => {
                    globalThis.log = (msg) => ops.op_membox_log(String(msg));
                    globalThis.exit = (code) => {
                        throw new Error("__membox_exit:" + (Number(code) || 0));
                    };
                    Object.defineProperty(globalThis, '__membox_commit', {
                        value: (json) => ops.op_membox_set_result(json),
                        writable: false, configurable: false, enumerable: false
                    });"#
                .to_string(),
        );

        for (module, name) in &self.exposed_ops {
            if !is_valid_identifier(name) {
                tracing::warn!(%module, %name, "skipping capability with invalid name");
                continue;
            }
            if self.blacklist.is_denied(module, name) {
                parts.push(format!("                    globalThis.{name} = undefined;"));
                continue;
            }
            let Some(wrapper) = wrapper_expr(name) else {
                tracing::warn!(%module, %name, "skipping unknown capability");
                continue;
            };
            parts.push(format!("                    globalThis.{name} = {wrapper};"));
        }

        for bare in self.blacklist.bare_names() {
            if !is_valid_identifier(bare) {
                tracing::warn!(name = %bare, "skipping blacklist entry with invalid name");
                continue;
            }
            parts.push(format!("                    globalThis.{bare} = undefined;"));
        }

        for (name, value) in &self.bindings {
            if !is_valid_identifier(name) {
                tracing::warn!(%name, "skipping binding with invalid name");
                continue;
            }
            // serde_json output is a valid JS expression for these values.
            parts.push(format!("                    globalThis.{name} = {value};"));
        }

        // Remove code generation primitives so wrappers cannot be used to
        // reach Function via the prototype chain.
        parts.push(
            r#"
                    delete globalThis.Deno;
                    delete globalThis.eval;
                    const AsyncFunction = (async function(){}).constructor;
                    const GeneratorFunction = (function*(){}).constructor;
                    Object.defineProperty(Function.prototype, 'constructor', {
                        value: undefined, configurable: false, writable: false
                    });
                    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
                        value: undefined, configurable: false, writable: false
                    });
                    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
                        value: undefined, configurable: false, writable: false
                    });
                })(Deno.core.ops);"#
                .to_string(),
        );
        parts.join("\n")
    }
}

/// JS wrapper expression for a capability function, or `None` for an
/// unknown name.
fn wrapper_expr(name: &str) -> Option<&'static str> {
    Some(match name {
        "get_size" => r#"(path) => ops.op_membox_get_size(String(path ?? ""))"#,
        "create_file" => r#"(path, content) => ops.op_membox_create_file(String(path), String(content ?? ""))"#,
        "create_dir" => r#"(path) => ops.op_membox_create_dir(String(path))"#,
        "update_file" => r#"(path, oldContent, newContent) => JSON.parse(ops.op_membox_update_file(String(path), String(oldContent), String(newContent)))"#,
        "read_file" => r#"(path) => ops.op_membox_read_file(String(path))"#,
        "delete_file" => r#"(path) => ops.op_membox_delete_file(String(path))"#,
        "go_to_link" => r#"(link) => ops.op_membox_go_to_link(String(link))"#,
        "list_files" => r#"() => ops.op_membox_list_files()"#,
        "check_if_file_exists" => r#"(path) => ops.op_membox_file_exists(String(path))"#,
        "check_if_dir_exists" => r#"(path) => ops.op_membox_dir_exists(String(path))"#,
        _ => return None,
    })
}

/// Records the pre-snippet set of global property names. Run after the
/// bootstrap and any preludes so their installations are not captured as
/// snippet locals.
pub const BASELINE_SCRIPT: &str = r#"
    (() => {
        const names = new Set(Object.getOwnPropertyNames(globalThis));
        Object.defineProperty(globalThis, '__membox_baseline', {
            value: Object.freeze(names),
            writable: false, configurable: false, enumerable: false
        });
    })();
"#;

/// Diffs the global object against the baseline and commits the packed
/// bindings. Runs even after a snippet failure, so bindings made before the
/// failure survive into the outcome.
pub const CAPTURE_SCRIPT: &str = r#"
    (() => {
        const out = {};
        for (const name of Object.getOwnPropertyNames(globalThis)) {
            if (globalThis.__membox_baseline.has(name)) continue;
            if (name.startsWith("__membox_")) continue;
            let packed;
            try {
                const json = JSON.stringify(globalThis[name]);
                packed = (json === undefined) ? { repr: String(globalThis[name]) } : { json };
            } catch (_) {
                packed = { repr: String(globalThis[name]) };
            }
            out[name] = packed;
        }
        globalThis.__membox_commit(JSON.stringify(out));
    })();
"#;

#[derive(Deserialize)]
struct PackedValue {
    #[serde(default)]
    json: Option<String>,
    #[serde(default)]
    repr: Option<String>,
}

/// Decode the payload committed by [`CAPTURE_SCRIPT`] into locals.
pub fn decode_locals(payload: &str) -> Result<BTreeMap<String, Value>, serde_json::Error> {
    let packed: BTreeMap<String, PackedValue> = serde_json::from_str(payload)?;
    let mut out = BTreeMap::new();
    for (name, value) in packed {
        let decoded = match (value.json, value.repr) {
            (Some(json), _) => serde_json::from_str(&json)?,
            (None, Some(repr)) => Value::String(repr),
            (None, None) => Value::Null,
        };
        out.insert(name, decoded);
    }
    Ok(out)
}

/// A conservative identifier check for names interpolated into generated
/// scripts: ASCII letters, digits, `_` and `$`, not starting with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
