//! `require()` resolution for cell code.
//!
//! Builtins resolve to in-sandbox shims or are denied outright; everything
//! else must be a file under the sandbox root, found either relative to the
//! requiring file or in a `node_modules` directory between it and the root.
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use url::Url;

use super::fs::{FsError, ScopedFs};

/// Builtins backed by kernel shims.
const SHIMS: &[&str] = &["fs", "fs/promises", "path", "process"];

/// Host capabilities that are never handed to cells.
const DENIED: &[&str] = &["child_process", "cluster", "worker_threads", "vm", "inspector", "v8"];

/// Other Node builtins this kernel does not provide.
const UNAVAILABLE: &[&str] = &[
    "assert", "async_hooks", "buffer", "crypto", "dgram", "diagnostics_channel", "dns", "domain",
    "events", "http", "http2", "https", "module", "net", "os", "perf_hooks", "punycode", "querystring",
    "readline", "repl", "stream", "string_decoder", "sys", "timers", "tls", "trace_events", "tty",
    "url", "util", "wasi", "zlib",
];

const PROBE_EXTENSIONS: &[&str] = &["js", "cjs", "json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    Js,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Resolution {
    Shim {
        name: &'static str,
    },
    Denied {
        specifier: String,
        reason: String,
    },
    File {
        filename: String,
        dirname: String,
        url: String,
        format: ModuleFormat,
        source: String,
    },
    NotFound {
        specifier: String,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct ModuleResolver {
    fs: ScopedFs,
}

impl ModuleResolver {
    pub fn new(fs: ScopedFs) -> Self {
        Self { fs }
    }

    /// Resolves `specifier` as required from `parent` (a filename, or empty
    /// for the cell itself) and loads the module source.
    pub fn resolve(&self, specifier: &str, parent: &str) -> Resolution {
        if let Some(resolution) = builtin(specifier) {
            return resolution;
        }

        let base = self.parent_dir(parent);
        let found = if is_path_like(specifier) {
            self.fs
                .contain(&base.join(specifier))
                .map(|candidate| self.probe(&candidate))
        } else {
            Ok(self.find_package(specifier, &base))
        };

        match found {
            Ok(Some(path)) => self.load(path),
            Ok(None) => {
                debug!("Module {specifier:?} not found from {}", base.display());
                Resolution::NotFound {
                    specifier: specifier.to_string(),
                }
            }
            Err(e) => Resolution::Error {
                code: e.code(),
                message: format!("cannot require {specifier:?}: {e}"),
            },
        }
    }

    pub fn resolve_json(&self, specifier: &str, parent: &str) -> String {
        let resolution = self.resolve(specifier, parent);
        serde_json::to_string(&resolution).unwrap_or_else(|e| {
            serde_json::json!({ "kind": "error", "code": "ERR_INTERNAL", "message": e.to_string() })
                .to_string()
        })
    }

    fn parent_dir(&self, parent: &str) -> PathBuf {
        if parent.is_empty() {
            return self.fs.root().to_path_buf();
        }
        let parent = Path::new(parent);
        match (parent.parent(), self.fs.contain(parent)) {
            (Some(dir), Ok(_)) => dir.to_path_buf(),
            _ => self.fs.root().to_path_buf(),
        }
    }

    /// Walks `node_modules` directories from `base` up to the root.
    fn find_package(&self, specifier: &str, base: &Path) -> Option<PathBuf> {
        let (package, subpath) = split_package(specifier)?;
        let mut dir = Some(base);
        while let Some(current) = dir {
            if !current.starts_with(self.fs.root()) {
                break;
            }
            let package_dir = current.join("node_modules").join(package);
            if let Ok(package_dir) = self.fs.contain(&package_dir) {
                if package_dir.is_dir() {
                    let found = match subpath {
                        Some(subpath) => self
                            .fs
                            .contain(&package_dir.join(subpath))
                            .ok()
                            .and_then(|p| self.probe(&p)),
                        None => self.probe(&package_dir),
                    };
                    if found.is_some() {
                        return found;
                    }
                }
            }
            dir = current.parent();
        }
        None
    }

    /// File, then file with extension, then directory entry point.
    fn probe(&self, candidate: &Path) -> Option<PathBuf> {
        if let Some(file) = probe_file(candidate) {
            return Some(file);
        }
        if !candidate.is_dir() {
            return None;
        }
        let main = package_main(candidate)
            .and_then(|main| self.fs.contain(&candidate.join(main)).ok())
            .and_then(|main| {
                probe_file(&main).or_else(|| main.is_dir().then(|| self.probe_index(&main)).flatten())
            });
        main.or_else(|| self.probe_index(candidate))
    }

    fn probe_index(&self, dir: &Path) -> Option<PathBuf> {
        PROBE_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("index.{ext}")))
            .find(|index| index.is_file())
    }

    fn load(&self, path: PathBuf) -> Resolution {
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(source) => {
                let e = FsError::Io {
                    op: "open",
                    path: path.display().to_string(),
                    source,
                };
                return Resolution::Error {
                    code: e.code(),
                    message: e.to_string(),
                };
            }
        };
        let format = if path.extension().is_some_and(|ext| ext == "json") {
            ModuleFormat::Json
        } else {
            ModuleFormat::Js
        };
        let url = Url::from_file_path(&path)
            .map(String::from)
            .unwrap_or_else(|_| format!("file://{}", path.display()));
        let dirname = path
            .parent()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        Resolution::File {
            filename: path.display().to_string(),
            dirname,
            url,
            format,
            source,
        }
    }
}

fn builtin(specifier: &str) -> Option<Resolution> {
    let prefixed = specifier.strip_prefix("node:");
    let name = prefixed.unwrap_or(specifier);

    if let Some(shim) = SHIMS.iter().find(|shim| **shim == name) {
        return Some(Resolution::Shim { name: *shim });
    }
    let top = name.split('/').next().unwrap_or(name);
    if DENIED.contains(&top) {
        return Some(Resolution::Denied {
            specifier: specifier.to_string(),
            reason: format!("module \"{name}\" is not permitted in the notebook sandbox"),
        });
    }
    if UNAVAILABLE.contains(&top) || prefixed.is_some() {
        return Some(Resolution::Denied {
            specifier: specifier.to_string(),
            reason: format!("builtin module \"{name}\" is not available in this kernel"),
        });
    }
    None
}

fn probe_file(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    PROBE_EXTENSIONS
        .iter()
        .map(|ext| {
            let mut with_ext = candidate.as_os_str().to_owned();
            with_ext.push(".");
            with_ext.push(ext);
            PathBuf::from(with_ext)
        })
        .find(|path| path.is_file())
}

fn is_path_like(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/')
        || specifier == "."
        || specifier == ".."
}

/// `lodash/fp` → (`lodash`, `fp`), `@scope/pkg/x` → (`@scope/pkg`, `x`).
fn split_package(specifier: &str) -> Option<(&str, Option<&str>)> {
    if specifier.is_empty() || specifier.contains('\\') {
        return None;
    }
    let split_at = if specifier.starts_with('@') {
        let scope_end = specifier.find('/')?;
        specifier[scope_end + 1..]
            .find('/')
            .map(|i| scope_end + 1 + i)
    } else {
        specifier.find('/')
    };
    let (package, subpath) = match split_at {
        Some(i) => (&specifier[..i], Some(&specifier[i + 1..])),
        None => (specifier, None),
    };
    if package.split('/').any(|part| part == ".." || part == "." || part.is_empty()) {
        return None;
    }
    Some((package, subpath.filter(|s| !s.is_empty())))
}

/// Entry point from `package.json`: `main`, else a CommonJS `exports` target.
fn package_main(dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&content).ok()?;

    if let Some(main) = manifest.get("main").and_then(|m| m.as_str()) {
        if !main.is_empty() {
            return Some(main.to_string());
        }
    }

    let exports = manifest.get("exports")?;
    let root = exports.get(".").unwrap_or(exports);
    match root {
        serde_json::Value::String(target) => Some(target.clone()),
        serde_json::Value::Object(conditions) => ["require", "node", "default"]
            .iter()
            .find_map(|key| conditions.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, ModuleResolver) {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap().join("nb");
        std::fs::create_dir_all(&root).unwrap();
        (dir, ModuleResolver::new(ScopedFs::new(root)))
    }

    fn write(resolver: &ModuleResolver, relative: &str, content: &str) {
        let path = resolver.fs.root().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_shims_and_denied_builtins() {
        let (_dir, r) = sandbox();
        assert_eq!(r.resolve("fs", ""), Resolution::Shim { name: "fs" });
        assert_eq!(r.resolve("node:fs/promises", ""), Resolution::Shim { name: "fs/promises" });
        assert_eq!(r.resolve("path", ""), Resolution::Shim { name: "path" });
        for denied in ["child_process", "node:child_process", "worker_threads", "http", "node:anything"] {
            assert!(matches!(r.resolve(denied, ""), Resolution::Denied { .. }), "{denied}");
        }
    }

    #[test]
    fn test_package_main_from_node_modules() {
        let (_dir, r) = sandbox();
        write(&r, "node_modules/left-pad/package.json", r#"{"main": "lib/pad.js"}"#);
        write(&r, "node_modules/left-pad/lib/pad.js", "module.exports = 1;");
        match r.resolve("left-pad", "") {
            Resolution::File { filename, format, source, .. } => {
                assert!(filename.ends_with("node_modules/left-pad/lib/pad.js"));
                assert_eq!(format, ModuleFormat::Js);
                assert_eq!(source, "module.exports = 1;");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exports_require_condition() {
        let (_dir, r) = sandbox();
        write(
            &r,
            "node_modules/dual/package.json",
            r#"{"exports": {".": {"import": "./esm.mjs", "require": "./cjs.js"}}}"#,
        );
        write(&r, "node_modules/dual/cjs.js", "module.exports = 'cjs';");
        assert!(matches!(
            r.resolve("dual", ""),
            Resolution::File { filename, .. } if filename.ends_with("dual/cjs.js")
        ));
    }

    #[test]
    fn test_index_and_extension_probing() {
        let (_dir, r) = sandbox();
        write(&r, "node_modules/@scope/pkg/index.js", "module.exports = 'scoped';");
        write(&r, "node_modules/@scope/pkg/util/helpers.js", "module.exports = 'helpers';");
        write(&r, "lib/data.json", r#"{"a": 1}"#);

        assert!(matches!(r.resolve("@scope/pkg", ""), Resolution::File { .. }));
        assert!(matches!(
            r.resolve("@scope/pkg/util/helpers", ""),
            Resolution::File { filename, .. } if filename.ends_with("util/helpers.js")
        ));
        assert!(matches!(
            r.resolve("./lib/data", ""),
            Resolution::File { format: ModuleFormat::Json, .. }
        ));
    }

    #[test]
    fn test_relative_to_parent_module() {
        let (_dir, r) = sandbox();
        write(&r, "node_modules/a/index.js", "");
        write(&r, "node_modules/a/sibling.js", "module.exports = 's';");
        let parent = r.fs.root().join("node_modules/a/index.js");
        assert!(matches!(
            r.resolve("./sibling", parent.to_str().unwrap()),
            Resolution::File { filename, .. } if filename.ends_with("a/sibling.js")
        ));
    }

    #[test]
    fn test_nested_node_modules_win() {
        let (_dir, r) = sandbox();
        write(&r, "node_modules/dep/index.js", "module.exports = 'top';");
        write(&r, "node_modules/a/index.js", "");
        write(&r, "node_modules/a/node_modules/dep/index.js", "module.exports = 'nested';");
        let parent = r.fs.root().join("node_modules/a/index.js");
        match r.resolve("dep", parent.to_str().unwrap()) {
            Resolution::File { source, .. } => assert_eq!(source, "module.exports = 'nested';"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_relative_escape_is_rejected() {
        let (_dir, r) = sandbox();
        let outside = r.fs.root().parent().unwrap().join("evil.js");
        std::fs::write(&outside, "module.exports = 'evil';").unwrap();
        match r.resolve("../evil.js", "") {
            Resolution::Error { code, .. } => assert_eq!(code, "ERR_SANDBOX_PATH"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(r.resolve("../../x", ""), Resolution::Error { .. }));
    }

    #[test]
    fn test_traversal_in_package_name_is_not_found() {
        let (_dir, r) = sandbox();
        assert!(matches!(r.resolve("../", ""), Resolution::Error { .. } | Resolution::NotFound { .. }));
        assert!(matches!(r.resolve("foo/../../x", ""), Resolution::NotFound { .. }));
    }

    #[test]
    fn test_missing_module_not_found() {
        let (_dir, r) = sandbox();
        assert_eq!(
            r.resolve("nope", ""),
            Resolution::NotFound { specifier: "nope".to_string() }
        );
    }

    #[test]
    fn test_split_package() {
        assert_eq!(split_package("lodash"), Some(("lodash", None)));
        assert_eq!(split_package("lodash/fp"), Some(("lodash", Some("fp"))));
        assert_eq!(split_package("@a/b/c/d"), Some(("@a/b", Some("c/d"))));
        assert_eq!(split_package("@a"), None);
    }
}
