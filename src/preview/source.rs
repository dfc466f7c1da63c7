//! Document sources: where the bytes of a document come from

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::DocumentId;

/// Errors while materializing document bytes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read {path}: {detail}")]
    Io { path: PathBuf, detail: String },

    #[error("source {name:?} has no content")]
    Empty { name: String },
}

/// A file-like object that can be read into memory.
///
/// Implementations must be cheap to query for metadata; `materialize` may be
/// expensive and is called at most once per drain cycle per document.
pub trait DocumentSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Size in bytes as reported by the metadata
    fn size(&self) -> u64;

    /// Last modification time in milliseconds since the epoch
    fn modified_millis(&self) -> u128;

    /// Read the whole document into memory
    fn materialize(&self) -> Result<Arc<[u8]>, SourceError>;

    fn document_id(&self) -> DocumentId {
        DocumentId::from_metadata(self.name(), self.size(), self.modified_millis())
    }
}

/// A document on the local filesystem
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
    modified_millis: u128,
}

impl FileSource {
    /// Read metadata for `path`; the contents are read lazily
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path).map_err(|e| SourceError::Io {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        let modified_millis = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        Ok(Self {
            path,
            name,
            size: meta.len(),
            modified_millis,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn modified_millis(&self) -> u128 {
        self.modified_millis
    }

    fn materialize(&self) -> Result<Arc<[u8]>, SourceError> {
        let bytes = std::fs::read(&self.path).map_err(|e| SourceError::Io {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(SourceError::Empty {
                name: self.name.clone(),
            });
        }
        Ok(bytes.into())
    }
}

/// A document already held in memory
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    bytes: Arc<[u8]>,
    modified_millis: u128,
}

impl MemorySource {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let modified_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        Self::with_modified(name, bytes, modified_millis)
    }

    /// Pin the modification time, so the derived id is reproducible
    #[must_use]
    pub fn with_modified(
        name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        modified_millis: u128,
    ) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            modified_millis,
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl DocumentSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn modified_millis(&self) -> u128 {
        self.modified_millis
    }

    fn materialize(&self) -> Result<Arc<[u8]>, SourceError> {
        if self.bytes.is_empty() {
            return Err(SourceError::Empty {
                name: self.name.clone(),
            });
        }
        Ok(Arc::clone(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_source_id_uses_metadata() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"%PDF-1.7 body").unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.size(), 13);
        let id = source.document_id();
        assert!(id.as_str().starts_with(source.name()));
        assert!(id.as_str().contains(":13:"));
        assert_eq!(&*source.materialize().unwrap(), b"%PDF-1.7 body");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = FileSource::open("/definitely/not/here.pdf").unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn empty_memory_source_fails_to_materialize() {
        let source = MemorySource::with_modified("empty.pdf", Vec::new(), 1);
        assert_eq!(
            source.materialize().unwrap_err(),
            SourceError::Empty {
                name: "empty.pdf".into()
            }
        );
    }

    #[test]
    fn same_metadata_same_id() {
        let a = MemorySource::with_modified("a.pdf", vec![1, 2, 3], 42);
        let b = MemorySource::with_modified("a.pdf", vec![9, 9, 9], 42);
        assert_eq!(a.document_id(), b.document_id());
    }
}
