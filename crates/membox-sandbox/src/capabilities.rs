//! The memory capability module: file operations snippets may call.
//!
//! Every function here takes snippet-supplied paths and resolves them
//! through the invocation's [`Confinement`] before touching the filesystem.
//! Mutating operations enforce three size ceilings (per file, per directory,
//! whole memory) and write through a hidden temp file so a crash mid-write
//! never leaves a half-written memory file behind.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::confinement::{Confinement, PathDenied};

/// Largest single memory file, in bytes.
pub const FILE_SIZE_LIMIT: u64 = 1024 * 1024;
/// Largest single directory of memory files, in bytes.
pub const DIR_SIZE_LIMIT: u64 = 10 * 1024 * 1024;
/// Largest total memory, in bytes.
pub const MEMORY_SIZE_LIMIT: u64 = 100 * 1024 * 1024;

/// Name of the built-in capability module.
pub const MEMORY_MODULE: &str = "memory";

/// Public functions of the `memory` capability module, in exposure order.
pub const MEMORY_OPS: &[&str] = &[
    "get_size",
    "create_file",
    "create_dir",
    "update_file",
    "read_file",
    "delete_file",
    "go_to_link",
    "list_files",
    "check_if_file_exists",
    "check_if_dir_exists",
];

/// The functions a capability module exposes, or `None` if unregistered.
pub fn module_ops(module: &str) -> Option<&'static [&'static str]> {
    match module {
        MEMORY_MODULE => Some(MEMORY_OPS),
        _ => None,
    }
}

/// Size ceilings applied by mutating capability functions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizeLimits {
    /// Per-file ceiling in bytes.
    pub max_file_size: u64,
    /// Per-directory ceiling in bytes.
    pub max_dir_size: u64,
    /// Whole-memory ceiling in bytes.
    pub max_total_size: u64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_file_size: FILE_SIZE_LIMIT,
            max_dir_size: DIR_SIZE_LIMIT,
            max_total_size: MEMORY_SIZE_LIMIT,
        }
    }
}

/// A capability function failed.
///
/// `Denied` carries the confinement rejection and always surfaces to the
/// snippet as a thrown error. `Failed` covers everything else a capability
/// can refuse to do (missing paths, size ceilings, io errors).
#[derive(Debug)]
pub enum CapabilityError {
    /// The confinement policy rejected the path.
    Denied(PathDenied),
    /// The operation could not be performed.
    Failed(String),
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(d) => d.fmt(f),
            Self::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for CapabilityError {}

impl From<PathDenied> for CapabilityError {
    fn from(d: PathDenied) -> Self {
        Self::Denied(d)
    }
}

/// Result of [`MemoryStore::update_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The first occurrence was replaced and the file rewritten.
    Applied,
    /// Nothing was changed; the message says why.
    Rejected(String),
}

/// The file-based memory a snippet is allowed to touch.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    confinement: Confinement,
    limits: SizeLimits,
}

impl MemoryStore {
    /// Build a store over the given confinement policy.
    pub fn new(confinement: Confinement, limits: SizeLimits) -> Self {
        Self { confinement, limits }
    }

    /// Size in bytes of a file or directory tree. An empty path means the
    /// whole memory root.
    pub fn get_size(&self, path: &str) -> Result<f64, CapabilityError> {
        let target = if path.is_empty() {
            match self.confinement.root() {
                Some(root) => root.to_path_buf(),
                None => {
                    return Err(CapabilityError::Failed(
                        "No memory root is configured.".to_string(),
                    ))
                }
            }
        } else {
            self.confinement.resolve(path)?
        };
        let meta = fs::symlink_metadata(&target)
            .map_err(|_| CapabilityError::Failed(format!("Path not found: '{path}'")))?;
        let bytes = if meta.is_dir() { dir_size(&target) } else { meta.len() };
        Ok(bytes as f64)
    }

    /// Create or overwrite a file, creating parent directories as needed.
    /// Enforces all three size ceilings before the new content becomes
    /// visible. Returns `true` on success.
    pub fn create_file(&self, path: &str, content: &str) -> Result<bool, CapabilityError> {
        let target = self.confinement.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| CapabilityError::Failed(format!("Invalid path: '{path}'")))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .map_err(|e| CapabilityError::Failed(format!("Could not create '{path}': {e}")))?;

        let new_len = content.len() as u64;
        if new_len > self.limits.max_file_size {
            return Err(CapabilityError::Failed(format!(
                "File '{path}' is too large to create: {new_len} bytes exceeds the per-file limit of {} bytes.",
                self.limits.max_file_size
            )));
        }

        // Replacing a file only grows usage by the delta.
        let existing_len = fs::symlink_metadata(&target).map(|m| m.len()).unwrap_or(0);
        if let Some(root) = self.confinement.root() {
            let dir_used = dir_size(&parent).saturating_sub(existing_len);
            if dir_used + new_len > self.limits.max_dir_size {
                return Err(CapabilityError::Failed(format!(
                    "File '{path}' is too large to create: its directory would exceed the limit of {} bytes.",
                    self.limits.max_dir_size
                )));
            }
            let total_used = dir_size(root).saturating_sub(existing_len);
            if total_used + new_len > self.limits.max_total_size {
                return Err(CapabilityError::Failed(format!(
                    "File '{path}' is too large to create: total memory would exceed the limit of {} bytes.",
                    self.limits.max_total_size
                )));
            }
        }

        // Hidden temp name, so a crashed write is invisible to listings.
        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, content)
            .map_err(|e| CapabilityError::Failed(format!("Could not create '{path}': {e}")))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(CapabilityError::Failed(format!(
                "Could not create '{path}': {e}"
            )));
        }
        Ok(true)
    }

    /// Create a directory (and any missing parents). Returns `true` on
    /// success, including when the directory already exists.
    pub fn create_dir(&self, path: &str) -> Result<bool, CapabilityError> {
        let target = self.confinement.resolve(path)?;
        fs::create_dir_all(&target)
            .map_err(|e| CapabilityError::Failed(format!("Could not create '{path}': {e}")))?;
        Ok(true)
    }

    /// Replace the first occurrence of `old_content` with `new_content`.
    /// Missing files, directory targets, absent needles, and replacements
    /// that change nothing are reported as distinct rejections rather than
    /// errors, so the snippet can branch on the message.
    pub fn update_file(
        &self,
        path: &str,
        old_content: &str,
        new_content: &str,
    ) -> Result<UpdateOutcome, CapabilityError> {
        let target = self.confinement.resolve(path)?;
        if !target.exists() {
            return Ok(UpdateOutcome::Rejected(format!(
                "File does not exist: '{path}'"
            )));
        }
        if !target.is_file() {
            return Ok(UpdateOutcome::Rejected(format!("'{path}' is not a file")));
        }
        let current = match fs::read_to_string(&target) {
            Ok(c) => c,
            Err(e) => {
                return Ok(UpdateOutcome::Rejected(format!(
                    "Could not read '{path}': {e}"
                )))
            }
        };
        let Some(at) = current.find(old_content) else {
            return Ok(UpdateOutcome::Rejected(format!(
                "Could not find the exact text to replace in '{path}'. Looking for: '{}'",
                preview(old_content)
            )));
        };
        let mut updated = String::with_capacity(
            current.len() - old_content.len() + new_content.len(),
        );
        updated.push_str(&current[..at]);
        updated.push_str(new_content);
        updated.push_str(&current[at + old_content.len()..]);

        if updated == current {
            return Ok(UpdateOutcome::Rejected(
                "No changes were made to the file".to_string(),
            ));
        }
        if updated.len() as u64 > self.limits.max_file_size {
            return Ok(UpdateOutcome::Rejected(format!(
                "Updated content for '{path}' would exceed the per-file limit of {} bytes.",
                self.limits.max_file_size
            )));
        }
        match self.create_file(path, &updated) {
            Ok(_) => Ok(UpdateOutcome::Applied),
            Err(CapabilityError::Denied(d)) => Err(CapabilityError::Denied(d)),
            Err(CapabilityError::Failed(msg)) => Ok(UpdateOutcome::Rejected(msg)),
        }
    }

    /// Read a file. Missing files and io failures come back as `Error: …`
    /// strings so the snippet sees them as data, not exceptions. Only a
    /// confinement denial raises.
    pub fn read_file(&self, path: &str) -> Result<String, PathDenied> {
        let target = self.confinement.resolve(path)?;
        match fs::read_to_string(&target) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(format!("Error: File does not exist: '{path}'"))
            }
            Err(e) => Ok(format!("Error: Could not read '{path}': {e}")),
        }
    }

    /// Delete a file. Returns `false` when the file does not exist; a
    /// confinement denial raises.
    pub fn delete_file(&self, path: &str) -> Result<bool, CapabilityError> {
        let target = self.confinement.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CapabilityError::Failed(format!(
                "Could not delete '{path}': {e}"
            ))),
        }
    }

    /// Follow a wiki-style link and read the note it points to. `[[name]]`
    /// resolves to `name.md` (the suffix is added only when missing);
    /// anything else is used verbatim as the path.
    pub fn go_to_link(&self, link: &str) -> Result<String, PathDenied> {
        let token = link.trim();
        if token.is_empty() {
            return Ok(format!("Error: Invalid link: '{link}'"));
        }
        let path = match token
            .strip_prefix("[[")
            .and_then(|t| t.strip_suffix("]]"))
        {
            Some(name) if name.ends_with(".md") => name.to_string(),
            Some(name) => format!("{name}.md"),
            None => token.to_string(),
        };
        self.read_file(&path)
    }

    /// Render the memory tree as indented text rooted at `./`. Hidden
    /// entries are skipped, directories are suffixed with `/`, and empty
    /// directories are marked `(empty)`.
    pub fn list_files(&self) -> Result<String, CapabilityError> {
        let root = self.confinement.root().ok_or_else(|| {
            CapabilityError::Failed("No memory root is configured.".to_string())
        })?;
        let mut out = String::from("./\n");
        render_tree(root, "", &mut out);
        Ok(out.trim_end().to_string())
    }

    /// Does the path name an existing file? Never raises; denied or
    /// unreadable paths report `false`.
    pub fn file_exists(&self, path: &str) -> bool {
        match self.confinement.resolve(path) {
            Ok(p) => p.is_file(),
            Err(_) => false,
        }
    }

    /// Does the path name an existing directory? Never raises.
    pub fn dir_exists(&self, path: &str) -> bool {
        match self.confinement.resolve(path) {
            Ok(p) => p.is_dir(),
            Err(_) => false,
        }
    }
}

/// First 50 characters of a needle, for rejection messages.
fn preview(s: &str) -> String {
    let mut p: String = s.chars().take(50).collect();
    if s.chars().count() > 50 {
        p.push_str("...");
    }
    p
}

/// Total size of a directory tree in bytes. Symlinks are not followed and
/// unreadable entries count as zero.
fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.path().symlink_metadata() else {
            continue;
        };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    total
}

fn render_tree(dir: &Path, prefix: &str, out: &mut String) {
    let mut entries: Vec<_> = match fs::read_dir(dir) {
        Ok(rd) => rd
            .flatten()
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .collect(),
        Err(_) => return,
    };
    entries.sort_by_key(|e| e.file_name());

    let last = entries.len().saturating_sub(1);
    for (i, entry) in entries.iter().enumerate() {
        let connector = if i == last { "└── " } else { "├── " };
        out.push_str(prefix);
        out.push_str(connector);
        out.push_str(&entry.file_name().to_string_lossy());
        if entry.path().is_dir() {
            if has_visible_entries(&entry.path()) {
                out.push_str("/\n");
                let child_prefix = if i == last {
                    format!("{prefix}    ")
                } else {
                    format!("{prefix}│   ")
                };
                render_tree(&entry.path(), &child_prefix, out);
            } else {
                out.push_str("/ (empty)\n");
            }
        } else {
            out.push('\n');
        }
    }
}

/// Does the directory contain any non-hidden entry?
fn has_visible_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|rd| {
            rd.flatten()
                .any(|e| !e.file_name().to_string_lossy().starts_with('.'))
        })
        .unwrap_or(false)
}
