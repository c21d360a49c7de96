//! Object storage seen by the pipeline stages.
//!
//! Object names are `/`-separated and listing is a plain string-prefix match,
//! the way cloud buckets behave. Namespaces are only name prefixes.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{debug, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::RetryPolicy;

pub const TIFF_CONTENT_TYPE: &str = "image/tiff";
pub const NPY_CONTENT_TYPE: &str = "application/octet-stream";

const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object name `{0}`")]
    InvalidName(String),
    #[error("I/O error on `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    fn io(name: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(name.to_string())
        } else {
            StorageError::Io {
                name: name.to_string(),
                source,
            }
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
}

impl ObjectInfo {
    /// Last path segment of the object name.
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

pub trait Storage: Send + Sync {
    /// Objects whose name starts with `prefix`, sorted by name.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Creates or replaces `name`.
    fn write(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for &S {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        (**self).list(prefix)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        (**self).read(name)
    }

    fn write(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        (**self).write(name, data, content_type)
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        (**self).list(prefix)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        (**self).read(name)
    }

    fn write(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        (**self).write(name, data, content_type)
    }
}

/// Joins a namespace and a relative name with exactly one `/`.
pub fn join(namespace: &str, name: &str) -> String {
    let namespace = namespace.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Listing prefix for everything inside a namespace.
pub fn namespace_prefix(namespace: &str) -> String {
    let namespace = namespace.trim_end_matches('/');
    if namespace.is_empty() {
        String::new()
    } else {
        format!("{}/", namespace)
    }
}

// ---------------------------------------------------------------------------
// In-memory bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Process-local bucket, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn content_type(&self, name: &str) -> Option<String> {
        self.objects().get(name).map(|o| o.content_type.clone())
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        Ok(self
            .objects()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, obj)| ObjectInfo {
                name: name.clone(),
                size: obj.data.len() as u64,
            })
            .collect())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.objects()
            .get(name)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn write(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        self.objects().insert(
            name.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Directory-backed bucket
// ---------------------------------------------------------------------------

/// A local directory acting as a bucket. Each write lands in a hidden
/// sibling file first and is renamed into place, so readers never observe a
/// half-written object.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(name.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(StorageError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

fn is_partial(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(PARTIAL_SUFFIX)
}

impl Storage for LocalStorage {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        // Walk only the deepest directory the prefix fully names.
        let dir_part = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let start = dir_part
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |p, seg| p.join(seg));
        if !start.is_dir() {
            debug!("list prefix={:?}: {:?} does not exist", prefix, start);
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in WalkDir::new(&start) {
            let entry = entry.map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "directory loop"));
                StorageError::io(prefix, source)
            })?;
            if !entry.file_type().is_file() || is_partial(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !name.starts_with(prefix) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push(ObjectInfo { name, size });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_of(name)?;
        fs::read(&path).map_err(|e| StorageError::io(name, e))
    }

    fn write(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let path = self.path_of(name)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| StorageError::io(name, e))?;

        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::InvalidName(name.to_string()))?;
        let partial = parent.join(format!(".{}{}", file_name, PARTIAL_SUFFIX));
        fs::write(&partial, data).map_err(|e| StorageError::io(name, e))?;
        if let Err(e) = fs::rename(&partial, &path) {
            let _ = fs::remove_file(&partial);
            return Err(StorageError::io(name, e));
        }
        debug!("wrote {} ({} bytes, {})", name, data.len(), content_type);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retry wrapper
// ---------------------------------------------------------------------------

/// Retries transient failures of the wrapped storage with exponential backoff.
#[derive(Debug)]
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Storage> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn call<T>(
        &self,
        op: &str,
        name: &str,
        mut f: impl FnMut(&S) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut attempt = 1;
        loop {
            match f(&self.inner) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let wait = self.policy.backoff(attempt);
                    warn!(
                        "{} {:?} failed (attempt {}/{}): {}; retrying in {:?}",
                        op, name, attempt, self.policy.max_attempts, e, wait
                    );
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: Storage> Storage for Retrying<S> {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.call("list", prefix, |s| s.list(prefix))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.call("read", name, |s| s.read(name))
    }

    fn write(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.call("write", name, |s| s.write(name, data, content_type))
    }
}
