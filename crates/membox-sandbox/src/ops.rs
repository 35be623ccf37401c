//! deno_core op definitions for the membox sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function
//! pointers, metadata structs) that cannot carry doc comments. We suppress
//! `missing_docs` at the module level; the actual functions are documented
//! below.
#![allow(missing_docs)]

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::capabilities::{MemoryStore, UpdateOutcome};

/// Wrapper for the marshaled locals payload stored in OpState.
pub struct ResultPayload(pub String);

/// Log a message from sandbox code.
#[op2(fast)]
pub fn op_membox_log(#[string] msg: &str) {
    tracing::info!(target: "membox::sandbox::js", "{}", msg);
}

/// Store the marshaled locals payload in OpState.
#[op2(fast)]
pub fn op_membox_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ResultPayload(json.to_string()));
}

/// Size in bytes of a file or directory tree; an empty path means the
/// whole memory root.
#[op2]
pub fn op_membox_get_size(state: &mut OpState, #[string] path: &str) -> Result<f64, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    mem.get_size(path)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Create or overwrite a file, enforcing the size ceilings.
#[op2]
pub fn op_membox_create_file(
    state: &mut OpState,
    #[string] path: &str,
    #[string] content: &str,
) -> Result<bool, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    mem.create_file(path, content)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Create a directory and any missing parents.
#[op2]
pub fn op_membox_create_dir(
    state: &mut OpState,
    #[string] path: &str,
) -> Result<bool, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    mem.create_dir(path)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Delete a file. `false` when it does not exist; confinement denials throw.
#[op2]
pub fn op_membox_delete_file(
    state: &mut OpState,
    #[string] path: &str,
) -> Result<bool, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    mem.delete_file(path)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Replace the first occurrence of `old_content` in a file.
///
/// Returns a JSON-encoded value the JS wrapper parses: `true` when the
/// replacement was applied, or an `"Error: …"` string when it was rejected,
/// mirroring the data-not-exception shape of the read operations.
#[op2]
#[string]
pub fn op_membox_update_file(
    state: &mut OpState,
    #[string] path: &str,
    #[string] old_content: &str,
    #[string] new_content: &str,
) -> Result<String, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    let outcome = mem
        .update_file(path, old_content, new_content)
        .map_err(|e| JsErrorBox::generic(e.to_string()))?;
    let value = match outcome {
        UpdateOutcome::Applied => serde_json::Value::Bool(true),
        UpdateOutcome::Rejected(msg) => serde_json::Value::String(format!("Error: {msg}")),
    };
    serde_json::to_string(&value)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

/// Read a file; missing files come back as `Error: …` strings.
#[op2]
#[string]
pub fn op_membox_read_file(
    state: &mut OpState,
    #[string] path: &str,
) -> Result<String, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    mem.read_file(path)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Follow a `[[name]]` link to `name.md` and read it.
#[op2]
#[string]
pub fn op_membox_go_to_link(
    state: &mut OpState,
    #[string] link: &str,
) -> Result<String, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    mem.go_to_link(link)
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Render the memory tree as indented text.
#[op2]
#[string]
pub fn op_membox_list_files(state: &mut OpState) -> Result<String, JsErrorBox> {
    let mem = state.borrow::<MemoryStore>();
    mem.list_files()
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Does the path name an existing file? Never throws.
#[op2(fast)]
pub fn op_membox_file_exists(state: &mut OpState, #[string] path: &str) -> bool {
    state.borrow::<MemoryStore>().file_exists(path)
}

/// Does the path name an existing directory? Never throws.
#[op2(fast)]
pub fn op_membox_dir_exists(state: &mut OpState, #[string] path: &str) -> bool {
    state.borrow::<MemoryStore>().dir_exists(path)
}

deno_core::extension!(
    membox_ext,
    ops = [
        op_membox_log,
        op_membox_set_result,
        op_membox_get_size,
        op_membox_create_file,
        op_membox_create_dir,
        op_membox_delete_file,
        op_membox_update_file,
        op_membox_read_file,
        op_membox_go_to_link,
        op_membox_list_files,
        op_membox_file_exists,
        op_membox_dir_exists
    ],
);
