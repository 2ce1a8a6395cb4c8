//! crates/marginalia_core/src/domain.rs
//!
//! Defines the pure, core data structures for the platform, plus the handful
//! of pure rules (scroll math, completion threshold, comment threading) that
//! the reader engine applies to them. These are independent of any database
//! or transport format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reader's scroll percentage at or past this value marks the chapter
/// as completed.
pub const COMPLETION_THRESHOLD_PCT: u8 = 90;

/// Represents a book available on the platform.
#[derive(Debug, Clone)]
pub struct Book {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Ready,
    Draft,
    ComingSoon,
}

/// One chapter entry from a book manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub slug: String,
    pub title: String,
    pub number: u32,
    pub status: ChapterStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplementaryKind {
    Bibliography,
    Appendix,
    Glossary,
    Index,
    Other,
}

/// A non-chapter document shipped with a book (references, appendix, ...).
/// Served read-only: no progress tracking, no comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplementaryResource {
    pub slug: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: SupplementaryKind,
}

/// The parsed contents of a book's `manifest.json`.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub title: Option<String>,
    pub chapters: Vec<Chapter>,
    pub supplementary: Vec<SupplementaryResource>,
}

impl Manifest {
    pub fn find_chapter(&self, slug: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.slug == slug)
    }

    pub fn find_supplementary(&self, slug: &str) -> Option<&SupplementaryResource> {
        self.supplementary.iter().find(|s| s.slug == slug)
    }
}

/// One row per (book, chapter, user): how far a reader has gotten and how
/// long they have actively spent there. Mutated by every persist, never
/// deleted by the engine.
#[derive(Debug, Clone)]
pub struct ReadingProgress {
    pub book_id: Uuid,
    pub chapter_slug: String,
    pub user_id: Uuid,
    pub scroll_pct: u8,
    pub time_spent_seconds: u64,
    pub last_read_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row per chapter visit, bracketed by mount and unmount.
/// `ended_at` stays `None` while the visit is open (or if the close write
/// never landed).
#[derive(Debug, Clone)]
pub struct ReadingSession {
    pub id: Uuid,
    pub book_id: Uuid,
    pub chapter_slug: String,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub max_scroll_pct: u8,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
}

/// An annotation anchored to a verbatim substring of the chapter text.
///
/// A comment with a `parent_id` is a reply; replies inherit the parent's
/// anchor text and do not accept further replies (flat one-level threading).
/// `anchor_paragraph` is reserved for paragraph-level anchoring and is
/// currently always empty.
#[derive(Debug, Clone, Serialize)]
pub struct Comment {
    pub id: Uuid,
    pub book_id: Uuid,
    pub chapter_slug: String,
    pub user_id: Uuid,
    pub anchor_text: String,
    pub anchor_paragraph: String,
    pub content: String,
    pub parent_id: Option<Uuid>,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A thread root together with its replies, in display order.
#[derive(Debug, Clone, Serialize)]
pub struct CommentThread {
    pub root: Comment,
    pub replies: Vec<Comment>,
}

/// Derives a 0-100 scroll percentage from a viewport offset.
///
/// Documents that fit entirely in the viewport report 0 rather than
/// dividing by zero or going negative.
pub fn scroll_percentage(offset: f64, document_height: f64, viewport_height: f64) -> u8 {
    let scrollable = document_height - viewport_height;
    if scrollable <= 0.0 {
        return 0;
    }
    let pct = (offset / scrollable * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Projects a flat comment list into display threads.
///
/// Roots are comments without a parent, ordered by creation time ascending.
/// Replies group under their root in creation order and are always shown
/// once the root is shown, regardless of the root's resolved state. The
/// `show_resolved` filter hides resolved roots only; it never reorders.
/// Replies whose parent is absent from the input are dropped.
pub fn thread_comments(comments: &[Comment], show_resolved: bool) -> Vec<CommentThread> {
    let mut roots: Vec<&Comment> = comments.iter().filter(|c| c.is_root()).collect();
    roots.sort_by_key(|c| c.created_at);

    roots
        .into_iter()
        .filter(|root| show_resolved || !root.is_resolved)
        .map(|root| {
            let mut replies: Vec<Comment> = comments
                .iter()
                .filter(|c| c.parent_id == Some(root.id))
                .cloned()
                .collect();
            replies.sort_by_key(|c| c.created_at);
            CommentThread {
                root: root.clone(),
                replies,
            }
        })
        .collect()
}
