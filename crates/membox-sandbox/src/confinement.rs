//! Filesystem confinement for capability functions.
//!
//! Every path-accepting capability resolves its argument through a
//! [`Confinement`] before touching the filesystem. Resolution is lexical:
//! `.` and `..` components are normalized without consulting the filesystem,
//! then the candidate is checked component-wise against the canonicalized
//! root. A sibling directory whose name merely starts with the root's name
//! (`/mem-evil` vs `/mem`) is rejected.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A path was rejected by the confinement policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathDenied {
    /// The path as the snippet supplied it.
    pub path: String,
}

impl fmt::Display for PathDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Access to '{}' is denied by sandbox.", self.path)
    }
}

impl std::error::Error for PathDenied {}

/// Confinement policy for one sandbox invocation.
#[derive(Debug, Clone)]
pub struct Confinement {
    root: Option<PathBuf>,
}

impl Confinement {
    /// Build a confinement policy. When a root is given it is created if
    /// missing and canonicalized, so symlinked roots compare correctly.
    pub fn new(root: Option<&Path>) -> std::io::Result<Self> {
        let root = match root {
            Some(r) => {
                std::fs::create_dir_all(r)?;
                Some(r.canonicalize()?)
            }
            None => None,
        };
        Ok(Self { root })
    }

    /// An unconfined policy for callers that opt out of a root.
    pub fn unconfined() -> Self {
        Self { root: None }
    }

    /// The canonicalized confinement root, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Resolve a snippet-supplied path to an absolute path inside the root.
    ///
    /// Relative paths are interpreted against the root (or the process
    /// working directory when unconfined). The normalized result must sit at
    /// or below the root, component-wise.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, PathDenied> {
        let supplied = Path::new(raw);
        let base = match &self.root {
            Some(root) => root.clone(),
            None => {
                let joined = if supplied.is_absolute() {
                    supplied.to_path_buf()
                } else {
                    std::env::current_dir()
                        .map_err(|_| PathDenied { path: raw.to_string() })?
                        .join(supplied)
                };
                return Ok(normalize(&joined));
            }
        };

        let joined = if supplied.is_absolute() {
            supplied.to_path_buf()
        } else {
            base.join(supplied)
        };
        let normalized = normalize(&joined);
        if normalized.starts_with(&base) {
            Ok(normalized)
        } else {
            Err(PathDenied { path: raw.to_string() })
        }
    }
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent. `..`
/// at the front of a relative path is kept (it cannot be folded), which a
/// subsequent `starts_with` check then rejects.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Parsed blacklist: bare names are neutralized as globals, dotted
/// `module.function` entries suppress individual capability functions.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    bare: BTreeSet<String>,
    dotted: BTreeSet<(String, String)>,
}

impl Blacklist {
    /// Parse raw blacklist entries.
    pub fn parse<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bare = BTreeSet::new();
        let mut dotted = BTreeSet::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('.') {
                Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                    dotted.insert((module.to_string(), name.to_string()));
                }
                _ => {
                    bare.insert(entry.trim_matches('.').to_string());
                }
            }
        }
        Self { bare, dotted }
    }

    /// Is this capability function suppressed?
    pub fn is_denied(&self, module: &str, name: &str) -> bool {
        self.bare.contains(name)
            || self
                .dotted
                .contains(&(module.to_string(), name.to_string()))
    }

    /// Bare entries, to be shadowed as globals in the snippet's namespace.
    pub fn bare_names(&self) -> impl Iterator<Item = &str> {
        self.bare.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Confinement::new(Some(dir.path())).unwrap();
        let got = conf.resolve("notes/today.md").unwrap();
        assert!(got.starts_with(conf.root().unwrap()));
        assert!(got.ends_with("notes/today.md"));
    }

    #[test]
    fn parent_traversal_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Confinement::new(Some(dir.path())).unwrap();
        let err = conf.resolve("../outside.md").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Access to '../outside.md' is denied by sandbox."
        );
    }

    #[test]
    fn interior_dotdot_that_stays_inside_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Confinement::new(Some(dir.path())).unwrap();
        let got = conf.resolve("a/b/../c.md").unwrap();
        assert!(got.ends_with("a/c.md"));
    }

    #[test]
    fn sibling_with_shared_prefix_is_denied() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("mem");
        let conf = Confinement::new(Some(&root)).unwrap();
        let evil = base.path().join("mem-evil/secrets.md");
        assert!(conf.resolve(evil.to_str().unwrap()).is_err());
    }

    #[test]
    fn absolute_path_inside_root_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Confinement::new(Some(dir.path())).unwrap();
        let inside = conf.root().unwrap().join("file.md");
        let got = conf.resolve(inside.to_str().unwrap()).unwrap();
        assert_eq!(got, inside);
    }

    #[test]
    fn absolute_path_outside_root_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Confinement::new(Some(dir.path())).unwrap();
        assert!(conf.resolve("/etc/passwd").is_err());
    }

    #[test]
    fn unconfined_accepts_anything() {
        let conf = Confinement::unconfined();
        assert!(conf.resolve("/etc/hosts").is_ok());
        assert!(conf.resolve("relative/file.md").is_ok());
    }

    #[test]
    fn blacklist_parses_bare_and_dotted() {
        let bl = Blacklist::parse(["delete_file", "memory.create_file", "", "  "]);
        assert!(bl.is_denied("memory", "delete_file"));
        assert!(bl.is_denied("other", "delete_file"));
        assert!(bl.is_denied("memory", "create_file"));
        assert!(!bl.is_denied("other", "create_file"));
        assert!(!bl.is_denied("memory", "read_file"));
        assert_eq!(bl.bare_names().collect::<Vec<_>>(), vec!["delete_file"]);
    }
}
