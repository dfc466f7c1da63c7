//! Core types for preview rendering

use std::fmt;
use std::sync::Arc;

/// Stable identity of a source document.
///
/// Derived from content-addressable metadata (name, size, modification time)
/// so the same file opened twice maps to the same pooled handle and the same
/// cache entries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Arc<str>);

impl DocumentId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Build an id from file metadata: `name:size:mtime_millis`
    #[must_use]
    pub fn from_metadata(name: &str, size: u64, modified_millis: u128) -> Self {
        Self(format!("{name}:{size}:{modified_millis}").into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a preview depicts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variant {
    /// A specific page render (`page:N`)
    Page,
    /// The file-level thumbnail shown in file lists
    File,
}

/// Cache and dedup key for one preview
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub document: DocumentId,
    /// 1-based page number
    pub page: u32,
    pub variant: Variant,
}

impl PageKey {
    #[must_use]
    pub fn page(document: DocumentId, page: u32) -> Self {
        Self {
            document,
            page,
            variant: Variant::Page,
        }
    }

    /// File-level thumbnail, rendered from the first page
    #[must_use]
    pub fn file(document: DocumentId) -> Self {
        Self {
            document,
            page: 1,
            variant: Variant::File,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant {
            Variant::Page => write!(f, "{}#page:{}", self.document, self.page),
            Variant::File => write!(f, "{}#file", self.document),
        }
    }
}

/// Scheduling priority, computed once when a request is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Likely above the fold: page number within the first batch
    High,
    Normal,
}

impl Priority {
    #[must_use]
    pub fn for_page(page: u32, batch_size: usize) -> Self {
        if (page as usize) <= batch_size {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

/// Page dimensions at scale 1.0, in document units
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    /// Viewport in whole pixels at the given scale (at least 1x1)
    #[must_use]
    pub fn viewport(&self, scale: f32) -> (u32, u32) {
        let w = (self.width * scale).floor().max(1.0) as u32;
        let h = (self.height * scale).floor().max(1.0) as u32;
        (w, h)
    }
}

/// Raw RGB pixel surface produced by rasterization.
#[derive(Clone)]
pub struct Surface {
    /// RGB pixel data (3 bytes per pixel)
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Surface {
    /// Allocate a white surface of the given size
    #[must_use]
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            pixels: vec![0xFF; width as usize * height as usize * 3],
            width,
            height,
        }
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Encoded preview, a `data:` URI
pub type Preview = Arc<str>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_follows_batch_size() {
        assert_eq!(Priority::for_page(1, 10), Priority::High);
        assert_eq!(Priority::for_page(10, 10), Priority::High);
        assert_eq!(Priority::for_page(11, 10), Priority::Normal);
    }

    #[test]
    fn page_and_file_keys_differ() {
        let doc = DocumentId::from_metadata("a.pdf", 10, 5);
        assert_ne!(PageKey::page(doc.clone(), 1), PageKey::file(doc.clone()));
        assert_eq!(PageKey::page(doc, 3).to_string(), "a.pdf:10:5#page:3");
    }

    #[test]
    fn viewport_never_collapses_to_zero() {
        let size = PageSize {
            width: 3.0,
            height: 600.0,
        };
        assert_eq!(size.viewport(0.1), (1, 60));
    }
}
