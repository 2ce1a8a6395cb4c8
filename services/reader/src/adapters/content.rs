//! services/reader/src/adapters/content.rs
//!
//! Filesystem implementation of the `ContentStore` port. Chapter and
//! supplementary HTML lives under `{books_dir}/{book_slug}/{slug}.html`,
//! next to a per-book `manifest.json`.
//!
//! Content is author-controlled, so it is served verbatim with no
//! sanitization.

use async_trait::async_trait;
use marginalia_core::domain::{Chapter, Manifest, SupplementaryResource};
use marginalia_core::ports::{ContentStore, PortError, PortResult};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::PathBuf;

/// A content adapter that serves static book files from a local directory.
#[derive(Clone)]
pub struct FsContentStore {
    books_dir: PathBuf,
}

impl FsContentStore {
    pub fn new(books_dir: PathBuf) -> Self {
        Self { books_dir }
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn fetch_document(&self, book_slug: &str, slug: &str) -> PortResult<String> {
        let path = self
            .books_dir
            .join(book_slug)
            .join(format!("{}.html", slug));

        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                PortError::NotFound(format!("Document '{}/{}' not found", book_slug, slug))
            } else {
                PortError::Unexpected(format!("Failed to read {}: {}", path.display(), e))
            }
        })
    }

    async fn load_manifest(&self, book_slug: &str) -> PortResult<Manifest> {
        let path = self.books_dir.join(book_slug).join("manifest.json");

        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                PortError::NotFound(format!("Manifest for book '{}' not found", book_slug))
            } else {
                PortError::Unexpected(format!("Failed to read {}: {}", path.display(), e))
            }
        })?;

        parse_manifest(&raw)
            .map_err(|e| PortError::Unexpected(format!("Invalid manifest for '{}': {}", book_slug, e)))
    }
}

//=========================================================================================
// Manifest Parsing (v1 and v2 formats)
//=========================================================================================

#[derive(Deserialize)]
struct BookMeta {
    title: Option<String>,
}

/// The v2 manifest: an object with a version tag, book metadata, chapters
/// and supplementary resources.
#[derive(Deserialize)]
struct ManifestV2 {
    #[allow(dead_code)]
    version: u8,
    #[serde(default)]
    book: Option<BookMeta>,
    #[serde(default)]
    chapters: Vec<Chapter>,
    #[serde(default)]
    supplementary: Vec<SupplementaryResource>,
}

/// The v1 manifest was either a bare chapter array or an object holding one.
/// It predates supplementary resources.
#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestV1 {
    Chapters(Vec<Chapter>),
    Wrapped {
        #[serde(default)]
        book: Option<BookMeta>,
        #[serde(default)]
        chapters: Vec<Chapter>,
    },
}

fn parse_manifest(raw: &str) -> Result<Manifest, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;

    let is_v2 = value.get("version").and_then(|v| v.as_u64()) == Some(2);
    if is_v2 {
        let v2: ManifestV2 = serde_json::from_value(value)?;
        return Ok(Manifest {
            title: v2.book.and_then(|b| b.title),
            chapters: v2.chapters,
            supplementary: v2.supplementary,
        });
    }

    let v1: ManifestV1 = serde_json::from_value(value)?;
    Ok(match v1 {
        ManifestV1::Chapters(chapters) => Manifest {
            title: None,
            chapters,
            supplementary: Vec::new(),
        },
        ManifestV1::Wrapped { book, chapters } => Manifest {
            title: book.and_then(|b| b.title),
            chapters,
            supplementary: Vec::new(),
        },
    })
}
