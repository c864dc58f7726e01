//! Path-guarded filesystem capability handed to cell code.
//!
//! Every path argument is resolved lexically against the sandbox root and
//! rejected before any I/O if the result would leave it. Resolution does not
//! follow symlinks: a link inside the root pointing elsewhere is followed by
//! the OS like any other path.
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("path {path:?} escapes the sandbox directory")]
    Escape { path: String },
    #[error("invalid path argument {0:?}")]
    InvalidPath(String),
    #[error("{op} is not supported in the notebook sandbox")]
    Unsupported { op: &'static str },
    #[error("{op} {path:?}: is a directory (use recursive)")]
    IsDirectory { op: &'static str, path: String },
    #[error("invalid data for {op}: {reason}")]
    InvalidData { op: &'static str, reason: String },
    #[error("{op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    /// Node-style error code surfaced to JS as `err.code`.
    pub fn code(&self) -> &'static str {
        match self {
            FsError::Escape { .. } => "ERR_SANDBOX_PATH",
            FsError::InvalidPath(_) => "ERR_INVALID_ARG_VALUE",
            FsError::Unsupported { .. } => "ERR_UNSUPPORTED",
            FsError::IsDirectory { .. } => "ERR_FS_EISDIR",
            FsError::InvalidData { .. } => "ERR_INVALID_ARG_TYPE",
            FsError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => "ENOENT",
                std::io::ErrorKind::AlreadyExists => "EEXIST",
                std::io::ErrorKind::PermissionDenied => "EACCES",
                _ => "EIO",
            },
        }
    }
}

/// One filesystem call coming from the JS shim.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FsRequest {
    ReadFile { path: String },
    WriteFile {
        path: String,
        /// base64
        data: String,
        #[serde(default)]
        append: bool,
    },
    Exists { path: String },
    Access { path: String },
    Stat { path: String },
    Lstat { path: String },
    Readdir { path: String },
    Mkdir {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Rm {
        path: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default)]
        force: bool,
    },
    Rmdir {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Unlink { path: String },
    Rename { from: String, to: String },
    CopyFile { from: String, to: String },
    Realpath { path: String },
    Watch { path: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatInfo {
    size: u64,
    kind: &'static str,
    mtime_ms: Option<f64>,
    birthtime_ms: Option<f64>,
    mode: u32,
}

/// Filesystem access confined to one directory.
#[derive(Debug, Clone)]
pub struct ScopedFs {
    root: PathBuf,
}

impl ScopedFs {
    /// `root` must be absolute and already normalized (canonical).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `raw` against the root, rejecting anything that lands outside.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, FsError> {
        if raw.is_empty() || raw.contains('\0') {
            return Err(FsError::InvalidPath(raw.to_string()));
        }
        let resolved = normalize(&self.root.join(raw));
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(FsError::Escape {
                path: raw.to_string(),
            })
        }
    }

    /// Same as [`resolve`](Self::resolve) for a path that is already a `Path`.
    pub fn contain(&self, path: &Path) -> Result<PathBuf, FsError> {
        let resolved = normalize(&self.root.join(path));
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(FsError::Escape {
                path: path.display().to_string(),
            })
        }
    }

    /// Executes one shim call. Paths are checked before anything touches disk.
    pub fn handle(&self, request: FsRequest) -> Result<Value, FsError> {
        match request {
            FsRequest::ReadFile { path } => {
                let target = self.resolve(&path)?;
                let bytes = std::fs::read(&target).map_err(io("open", &path))?;
                Ok(json!(base64::engine::general_purpose::STANDARD.encode(bytes)))
            }
            FsRequest::WriteFile { path, data, append } => {
                let target = self.resolve(&path)?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| FsError::InvalidData {
                        op: "write",
                        reason: e.to_string(),
                    })?;
                if append {
                    use std::io::Write;
                    let mut file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&target)
                        .map_err(io("open", &path))?;
                    file.write_all(&bytes).map_err(io("write", &path))?;
                } else {
                    std::fs::write(&target, bytes).map_err(io("write", &path))?;
                }
                Ok(Value::Null)
            }
            FsRequest::Exists { path } => {
                let target = self.resolve(&path)?;
                Ok(json!(target.symlink_metadata().is_ok()))
            }
            FsRequest::Access { path } => {
                let target = self.resolve(&path)?;
                target.metadata().map_err(io("access", &path))?;
                Ok(Value::Null)
            }
            FsRequest::Stat { path } => {
                let target = self.resolve(&path)?;
                let meta = std::fs::metadata(&target).map_err(io("stat", &path))?;
                Ok(json!(stat_info(&meta)))
            }
            FsRequest::Lstat { path } => {
                let target = self.resolve(&path)?;
                let meta = std::fs::symlink_metadata(&target).map_err(io("lstat", &path))?;
                Ok(json!(stat_info(&meta)))
            }
            FsRequest::Readdir { path } => {
                let target = self.resolve(&path)?;
                let mut names = std::fs::read_dir(&target)
                    .map_err(io("scandir", &path))?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect::<Vec<_>>();
                names.sort();
                Ok(json!(names))
            }
            FsRequest::Mkdir { path, recursive } => {
                let target = self.resolve(&path)?;
                if recursive {
                    std::fs::create_dir_all(&target).map_err(io("mkdir", &path))?;
                } else {
                    std::fs::create_dir(&target).map_err(io("mkdir", &path))?;
                }
                Ok(Value::Null)
            }
            FsRequest::Rm {
                path,
                recursive,
                force,
            } => {
                let target = self.resolve(&path)?;
                let meta = match std::fs::symlink_metadata(&target) {
                    Ok(meta) => meta,
                    Err(e) if force && e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Value::Null)
                    }
                    Err(e) => return Err(io("rm", &path)(e)),
                };
                if meta.is_dir() {
                    if !recursive {
                        return Err(FsError::IsDirectory { op: "rm", path });
                    }
                    std::fs::remove_dir_all(&target).map_err(io("rm", &path))?;
                } else {
                    std::fs::remove_file(&target).map_err(io("rm", &path))?;
                }
                Ok(Value::Null)
            }
            FsRequest::Rmdir { path, recursive } => {
                let target = self.resolve(&path)?;
                if recursive {
                    std::fs::remove_dir_all(&target).map_err(io("rmdir", &path))?;
                } else {
                    std::fs::remove_dir(&target).map_err(io("rmdir", &path))?;
                }
                Ok(Value::Null)
            }
            FsRequest::Unlink { path } => {
                let target = self.resolve(&path)?;
                std::fs::remove_file(&target).map_err(io("unlink", &path))?;
                Ok(Value::Null)
            }
            FsRequest::Rename { from, to } => {
                let source = self.resolve(&from)?;
                let target = self.resolve(&to)?;
                std::fs::rename(&source, &target).map_err(io("rename", &from))?;
                Ok(Value::Null)
            }
            FsRequest::CopyFile { from, to } => {
                let source = self.resolve(&from)?;
                let target = self.resolve(&to)?;
                std::fs::copy(&source, &target).map_err(io("copyfile", &from))?;
                Ok(Value::Null)
            }
            FsRequest::Realpath { path } => {
                let target = self.resolve(&path)?;
                let real = std::fs::canonicalize(&target).map_err(io("realpath", &path))?;
                // The real location is only revealed if it is inside the root
                let real = self.contain(&real)?;
                Ok(json!(real.to_string_lossy()))
            }
            FsRequest::Watch { path } => {
                self.resolve(&path)?;
                Err(FsError::Unsupported { op: "watch" })
            }
        }
    }

    /// JSON reply for the JS shim: `{ok, value}` or `{ok: false, error: {code, message}}`.
    pub fn handle_json(&self, request: &str) -> String {
        let reply = match serde_json::from_str::<FsRequest>(request) {
            Ok(request) => match self.handle(request) {
                Ok(value) => json!({ "ok": true, "value": value }),
                Err(e) => json!({ "ok": false, "error": { "code": e.code(), "message": e.to_string() } }),
            },
            Err(e) => json!({
                "ok": false,
                "error": { "code": "ERR_INVALID_ARG_VALUE", "message": format!("malformed fs call: {e}") }
            }),
        };
        reply.to_string()
    }
}

fn io(op: &'static str, path: &str) -> impl FnOnce(std::io::Error) -> FsError {
    let path = path.to_string();
    move |source| FsError::Io { op, path, source }
}

fn stat_info(meta: &std::fs::Metadata) -> StatInfo {
    let millis = |time: std::io::Result<std::time::SystemTime>| {
        time.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64() * 1000.0)
    };
    let kind = if meta.file_type().is_symlink() {
        "symlink"
    } else if meta.is_dir() {
        "directory"
    } else if meta.is_file() {
        "file"
    } else {
        "other"
    };
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o666 };

    StatInfo {
        size: meta.len(),
        kind,
        mtime_ms: millis(meta.modified()),
        birthtime_ms: millis(meta.created()),
        mode,
    }
}

/// Lexical normalization: drops `.`, applies `..`, never touches the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        outside: PathBuf,
        fs: ScopedFs,
    }

    /// `<tmp>/root` is the sandbox, `<tmp>/outside.txt` must stay untouched.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let root = base.join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("inside.txt"), "inside").unwrap();
        let outside = base.join("outside.txt");
        std::fs::write(&outside, "secret").unwrap();
        Fixture {
            _dir: dir,
            outside,
            fs: ScopedFs::new(root),
        }
    }

    fn b64(text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text)
    }

    #[test]
    fn test_normalize_is_lexical() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/../../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_resolve_relative_and_absolute_inside() {
        let f = fixture();
        let root = f.fs.root().to_path_buf();
        assert_eq!(f.fs.resolve("a/b.txt").unwrap(), root.join("a/b.txt"));
        assert_eq!(f.fs.resolve("./a/../b.txt").unwrap(), root.join("b.txt"));
        assert_eq!(f.fs.resolve(".").unwrap(), root);
        let absolute = root.join("x.txt");
        assert_eq!(f.fs.resolve(absolute.to_str().unwrap()).unwrap(), absolute);
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let f = fixture();
        for raw in ["..", "../outside.txt", "a/../../outside.txt", "/etc/passwd", "/"] {
            let err = f.fs.resolve(raw).unwrap_err();
            assert!(matches!(err, FsError::Escape { .. }), "{raw}");
            assert_eq!(err.code(), "ERR_SANDBOX_PATH");
        }
    }

    #[test]
    fn test_resolve_rejects_sibling_prefix() {
        // "<root>-evil" shares a string prefix with the root but is outside it
        let f = fixture();
        let sibling = format!("{}-evil/file", f.fs.root().display());
        assert!(matches!(f.fs.resolve(&sibling), Err(FsError::Escape { .. })));
    }

    #[test]
    fn test_resolve_rejects_empty_and_nul() {
        let f = fixture();
        assert!(matches!(f.fs.resolve(""), Err(FsError::InvalidPath(_))));
        assert!(matches!(f.fs.resolve("a\0b"), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn test_every_operation_rejects_escape_without_io() {
        let f = fixture();
        let escape = "../outside.txt";
        let requests = vec![
            FsRequest::ReadFile { path: escape.into() },
            FsRequest::WriteFile { path: escape.into(), data: b64("pwned"), append: false },
            FsRequest::WriteFile { path: escape.into(), data: b64("pwned"), append: true },
            FsRequest::Exists { path: escape.into() },
            FsRequest::Access { path: escape.into() },
            FsRequest::Stat { path: escape.into() },
            FsRequest::Lstat { path: escape.into() },
            FsRequest::Readdir { path: "..".into() },
            FsRequest::Mkdir { path: "../newdir".into(), recursive: true },
            FsRequest::Rm { path: escape.into(), recursive: true, force: true },
            FsRequest::Rmdir { path: "..".into(), recursive: true },
            FsRequest::Unlink { path: escape.into() },
            FsRequest::Rename { from: "inside.txt".into(), to: "../moved.txt".into() },
            FsRequest::Rename { from: escape.into(), to: "stolen.txt".into() },
            FsRequest::CopyFile { from: escape.into(), to: "copy.txt".into() },
            FsRequest::CopyFile { from: "inside.txt".into(), to: "../copy.txt".into() },
            FsRequest::Realpath { path: escape.into() },
            FsRequest::Watch { path: escape.into() },
        ];

        for request in requests {
            let label = format!("{request:?}");
            let err = f.fs.handle(request).unwrap_err();
            assert!(matches!(err, FsError::Escape { .. }), "{label}: {err}");
        }

        assert_eq!(std::fs::read_to_string(&f.outside).unwrap(), "secret");
        let base = f.outside.parent().unwrap();
        assert!(!base.join("newdir").exists());
        assert!(!base.join("moved.txt").exists());
        assert!(!base.join("copy.txt").exists());
        assert!(f.fs.root().join("inside.txt").exists());
        assert!(!f.fs.root().join("stolen.txt").exists());
    }

    #[test]
    fn test_write_read_append_roundtrip() {
        let f = fixture();
        f.fs.handle(FsRequest::WriteFile { path: "notes.txt".into(), data: b64("a"), append: false })
            .unwrap();
        f.fs.handle(FsRequest::WriteFile { path: "notes.txt".into(), data: b64("b"), append: true })
            .unwrap();
        let value = f.fs.handle(FsRequest::ReadFile { path: "notes.txt".into() }).unwrap();
        assert_eq!(value, json!(b64("ab")));
    }

    #[test]
    fn test_mkdir_readdir_stat_rm() {
        let f = fixture();
        f.fs.handle(FsRequest::Mkdir { path: "data/raw".into(), recursive: true }).unwrap();
        f.fs.handle(FsRequest::WriteFile { path: "data/raw/x.csv".into(), data: b64("1,2"), append: false })
            .unwrap();

        let listing = f.fs.handle(FsRequest::Readdir { path: "data/raw".into() }).unwrap();
        assert_eq!(listing, json!(["x.csv"]));

        let stat = f.fs.handle(FsRequest::Stat { path: "data".into() }).unwrap();
        assert_eq!(stat["kind"], "directory");
        let stat = f.fs.handle(FsRequest::Stat { path: "data/raw/x.csv".into() }).unwrap();
        assert_eq!(stat["kind"], "file");
        assert_eq!(stat["size"], 3);

        let err = f.fs.handle(FsRequest::Rm { path: "data".into(), recursive: false, force: false })
            .unwrap_err();
        assert_eq!(err.code(), "ERR_FS_EISDIR");
        f.fs.handle(FsRequest::Rm { path: "data".into(), recursive: true, force: false }).unwrap();
        assert!(!f.fs.root().join("data").exists());
    }

    #[test]
    fn test_rm_force_ignores_missing() {
        let f = fixture();
        f.fs.handle(FsRequest::Rm { path: "nope".into(), recursive: false, force: true }).unwrap();
        let err = f.fs.handle(FsRequest::Rm { path: "nope".into(), recursive: false, force: false })
            .unwrap_err();
        assert_eq!(err.code(), "ENOENT");
    }

    #[test]
    fn test_watch_is_unsupported_inside_root() {
        let f = fixture();
        let err = f.fs.handle(FsRequest::Watch { path: "inside.txt".into() }).unwrap_err();
        assert_eq!(err.code(), "ERR_UNSUPPORTED");
    }

    #[test]
    fn test_handle_json_reports_codes() {
        let f = fixture();
        let reply: Value =
            serde_json::from_str(&f.fs.handle_json(r#"{"op":"readFile","path":"/etc/passwd"}"#)).unwrap();
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "ERR_SANDBOX_PATH");

        let reply: Value = serde_json::from_str(&f.fs.handle_json(r#"{"op":"exists","path":"inside.txt"}"#)).unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["value"], true);

        let reply: Value = serde_json::from_str(&f.fs.handle_json(r#"{"op":"format-disk"}"#)).unwrap();
        assert_eq!(reply["error"]["code"], "ERR_INVALID_ARG_VALUE");
    }
}
