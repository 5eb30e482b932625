//! Module registry (C11): resolves a dotted or bare module name to something
//! the executor can run, either natively in-process or via a gate.
//!
//! Precedence on lookup: an explicit path registered for this call's FQCN,
//! then the native-module table, then a search through the bundled
//! collection. Native modules are the handful that make sense to run on the
//! control node itself (`ftl2.builtin.debug` among them); everything else
//! dispatches through a bundle and a gate.

pub mod debug;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{Error, Result};

/// One parameter a module accepts, for `describe()` output.
#[derive(Debug, Clone)]
pub struct ParamDoc {
    pub name: String,
    pub required: bool,
    pub doc: String,
}

/// Machine-readable description of a module's parameter shape, exposed for
/// the (out-of-scope) CLI/REPL collaborators to introspect.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub fqcn: String,
    pub params: Vec<ParamDoc>,
    pub docs: String,
}

/// What a module call produced. Mirrors the `result` frame's fields so the
/// local-dispatch and remote-dispatch paths converge on the same shape.
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    pub success: bool,
    pub changed: bool,
    pub output: Value,
    pub error: Option<String>,
}

/// A module that runs in-process on the control node rather than through a
/// gate. `ftl2.builtin.debug` is the only one shipped; the rest of the
/// module library is out of scope (see Non-goals) and resolves remotely.
#[async_trait]
pub trait Module: Send + Sync {
    fn fqcn(&self) -> &'static str;

    fn describe(&self) -> ModuleDescriptor;

    async fn execute(&self, params: &IndexMap<String, Value>, check_mode: bool) -> Result<ModuleOutput>;
}

/// Where a resolved module's call should be dispatched.
pub enum Resolution {
    /// Run in-process; no bundle or gate needed.
    Native(Arc<dyn Module>),
    /// Dispatch to a gate; the file backing this FQCN is used for bundling.
    Remote { fqcn: String, path: PathBuf },
}

/// Resolves FQCNs to native modules or bundled files.
pub struct ModuleRegistry {
    explicit_paths: IndexMap<String, PathBuf>,
    native: IndexMap<String, Arc<dyn Module>>,
    search_paths: Vec<PathBuf>,
    collection_root: PathBuf,
}

impl ModuleRegistry {
    pub fn new(search_paths: Vec<PathBuf>, collection_root: impl Into<PathBuf>) -> Self {
        let mut registry = Self {
            explicit_paths: IndexMap::new(),
            native: IndexMap::new(),
            search_paths,
            collection_root: collection_root.into(),
        };
        registry.register_native(Arc::new(debug::DebugModule));
        registry
    }

    pub fn register_native(&mut self, module: Arc<dyn Module>) {
        self.native.insert(module.fqcn().to_string(), module);
    }

    /// Register an explicit file path for `fqcn`, overriding both the
    /// native table and the collection search for this one name.
    pub fn register_path(&mut self, fqcn: impl Into<String>, path: PathBuf) {
        self.explicit_paths.insert(fqcn.into(), path);
    }

    pub fn resolve(&self, fqcn: &str) -> Result<Resolution> {
        if let Some(path) = self.explicit_paths.get(fqcn) {
            return Ok(Resolution::Remote {
                fqcn: fqcn.to_string(),
                path: path.clone(),
            });
        }

        if let Some(module) = self.native.get(fqcn) {
            return Ok(Resolution::Native(module.clone()));
        }

        let file_name = fqcn.replace('.', "/");
        for dir in self.search_paths.iter().chain(std::iter::once(&self.collection_root)) {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return Ok(Resolution::Remote {
                    fqcn: fqcn.to_string(),
                    path: candidate,
                });
            }
        }

        Err(Error::ModuleNotFound(fqcn.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: BTreeMap<String, ()> = BTreeMap::new();
        for name in self.native.keys() {
            names.insert(name.clone(), ());
        }
        for name in self.explicit_paths.keys() {
            names.insert(name.clone(), ());
        }
        if let Ok(entries) = walkdir_collection(&self.collection_root) {
            for name in entries {
                names.insert(name, ());
            }
        }
        names.into_keys().collect()
    }

    pub fn describe(&self, fqcn: &str) -> Result<ModuleDescriptor> {
        match self.resolve(fqcn)? {
            Resolution::Native(module) => Ok(module.describe()),
            Resolution::Remote { fqcn, path } => describe_remote(&fqcn, &path),
        }
    }
}

fn walkdir_collection(root: &std::path::Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    if !root.is_dir() {
        return Ok(names);
    }
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            if let Ok(relative) = entry.path().strip_prefix(root) {
                let fqcn = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(".");
                names.push(fqcn);
            }
        }
    }
    Ok(names)
}

/// Parse a remote module's declared parameter doc comments. Recognized
/// form: lines matching `# ftl2:param: name[!] short doc`, where a
/// trailing `!` marks the parameter required. Modules that declare none
/// just get an empty `params` list; `describe()` is documentation, not
/// validation.
fn describe_remote(fqcn: &str, path: &std::path::Path) -> Result<ModuleDescriptor> {
    let bytes = std::fs::read(path).map_err(Error::Io)?;
    let text = String::from_utf8_lossy(&bytes);

    let mut params = Vec::new();
    let mut docs = String::new();

    for line in text.lines().take(100) {
        let trimmed = line.trim_start_matches(['#', '/', '*', ' ']);
        if let Some(rest) = trimmed.strip_prefix("ftl2:param:") {
            let rest = rest.trim();
            let (name_part, doc) = rest.split_once(' ').unwrap_or((rest, ""));
            let required = name_part.ends_with('!');
            let name = name_part.trim_end_matches('!').to_string();
            params.push(ParamDoc {
                name,
                required,
                doc: doc.trim().to_string(),
            });
        } else if let Some(rest) = trimmed.strip_prefix("ftl2:doc:") {
            docs.push_str(rest.trim());
            docs.push('\n');
        }
    }

    Ok(ModuleDescriptor {
        fqcn: fqcn.to_string(),
        params,
        docs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_native_before_collection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::new(vec![], dir.path());
        match registry.resolve("ftl2.builtin.debug").unwrap() {
            Resolution::Native(module) => assert_eq!(module.fqcn(), "ftl2.builtin.debug"),
            Resolution::Remote { .. } => panic!("expected native resolution"),
        }
    }

    #[test]
    fn explicit_path_overrides_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("override.py"), "# ftl2:doc: test\n").unwrap();

        let mut registry = ModuleRegistry::new(vec![], dir.path());
        registry.register_path("ftl2.builtin.debug", dir.path().join("override.py"));

        match registry.resolve("ftl2.builtin.debug").unwrap() {
            Resolution::Remote { path, .. } => assert_eq!(path, dir.path().join("override.py")),
            Resolution::Native(_) => panic!("expected the explicit path to win"),
        }
    }

    #[test]
    fn unresolved_module_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::new(vec![], dir.path());
        assert!(matches!(registry.resolve("ftl2.builtin.nonexistent"), Err(Error::ModuleNotFound(_))));
    }

    #[test]
    fn describes_remote_module_param_docs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ftl2/builtin")).unwrap();
        std::fs::write(
            dir.path().join("ftl2/builtin/shell"),
            "# ftl2:doc: runs a shell command\n# ftl2:param: cmd! the command to run\n",
        )
        .unwrap();

        let registry = ModuleRegistry::new(vec![], dir.path());
        let descriptor = registry.describe("ftl2.builtin.shell").unwrap();
        assert_eq!(descriptor.params.len(), 1);
        assert!(descriptor.params[0].required);
        assert_eq!(descriptor.params[0].name, "cmd");
        assert!(descriptor.docs.contains("runs a shell command"));
    }
}
