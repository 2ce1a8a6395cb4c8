//! services/reader/src/web/state.rs
//!
//! Defines the application's shared state and the per-connection chapter
//! view state: the activity/idle machine, the active-time accumulator, the
//! scroll progress calculator, the selection capture machine, and the local
//! comment cache. The surrounding tasks (ticker, WebSocket loop) call into
//! these methods; everything here is synchronous and directly testable.

use crate::config::Config;
use marginalia_core::domain::{
    scroll_percentage, thread_comments, Book, Chapter, ChapterStatus, Comment, CommentThread,
    COMPLETION_THRESHOLD_PCT,
};
use marginalia_core::ports::{
    ContentStore, IdentityService, NewComment, NewSession, PortError, PortResult, ProgressUpsert,
    ReaderStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// No tracked interaction for this long pauses active-time accrual.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// How often the idle check runs.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Granularity of active-time accrual.
pub const ACCRUAL_TICK: Duration = Duration::from_secs(1);
/// Minimum interval between interval-triggered progress writes.
pub const FLUSH_WINDOW: Duration = Duration::from_secs(5);
/// How long a selection must hold still after pointer-up before the
/// composer opens.
pub const SELECTION_SETTLE: Duration = Duration::from_millis(200);
/// The DOM container id of the rendered content region. Selections whose
/// common ancestor lives elsewhere (e.g. the comments sidebar) are discarded.
pub const CONTENT_REGION_ID: &str = "book-content";

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReaderStore>,
    pub identity: Arc<dyn IdentityService>,
    pub content: Arc<dyn ContentStore>,
    pub config: Arc<Config>,
}

//=========================================================================================
// Selection Capture Machine
//=========================================================================================

/// The selection/composer state for one view.
///
/// IDLE -pointer-down-> SELECTING -pointer-up + settle-> COMPOSING, which
/// holds the anchor text until submit or cancel. A selection that settles
/// outside the content region, or empty, falls back to IDLE silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionPhase {
    Idle,
    Selecting { candidate: Option<String> },
    Composing { anchor_text: String },
}

//=========================================================================================
// ChapterViewState (Specific to One WebSocket Connection)
//=========================================================================================

/// The state for a single mounted chapter view.
pub struct ChapterViewState {
    pub user_id: Uuid,
    pub book: Book,
    pub chapter_slug: String,

    // Scroll progress
    pub scroll_pct: u8,
    pub max_scroll_pct: u8,

    // Activity tracker + time accumulator
    pub last_activity: Instant,
    pub active: bool,
    pub time_spent_seconds: u64,

    // Progress persister bookkeeping
    pub dirty: bool,
    pub last_flush: Option<Instant>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Set iff the session-open write succeeded; the close write requires it.
    pub session_id: Option<Uuid>,

    // Comment engine
    pub comments: Vec<Comment>,
    pub show_resolved: bool,
    pub selection: SelectionPhase,
    /// Bumped on every pointer-down so a stale settle task cannot finalize
    /// a selection that was since restarted.
    pub selection_epoch: u64,
}

impl ChapterViewState {
    /// Mounts a chapter view: resolves the book and chapter, fetches the
    /// trusted HTML, loads prior progress and comments, and opens the
    /// reading session row.
    ///
    /// Content and chapter resolution failures are terminal and propagate.
    /// Progress/comment reads and the session open are best-effort: their
    /// failures are logged and degraded (empty snapshot, no session id) so
    /// the reading experience is never interrupted by lost telemetry.
    pub async fn open(
        app_state: Arc<AppState>,
        user_id: Uuid,
        book_slug: &str,
        chapter_slug: &str,
        viewport_width: u32,
        viewport_height: u32,
        user_agent: String,
    ) -> PortResult<(Self, Chapter, String)> {
        let book = app_state.store.resolve_book(book_slug).await?;

        let manifest = app_state.content.load_manifest(book_slug).await?;
        let chapter = manifest
            .find_chapter(chapter_slug)
            .filter(|c| c.status != ChapterStatus::ComingSoon)
            .cloned()
            .ok_or_else(|| {
                PortError::NotFound(format!(
                    "Chapter '{}/{}' not found",
                    book_slug, chapter_slug
                ))
            })?;

        let html = app_state
            .content
            .fetch_document(book_slug, chapter_slug)
            .await?;

        let prior = match app_state
            .store
            .get_progress(book.id, chapter_slug, user_id)
            .await
        {
            Ok(prior) => prior,
            Err(e) => {
                warn!("Failed to load prior progress: {e}");
                None
            }
        };

        let comments = match app_state
            .store
            .comments_for_chapter(book.id, chapter_slug)
            .await
        {
            Ok(comments) => comments,
            Err(e) => {
                warn!("Failed to load comments: {e}");
                Vec::new()
            }
        };

        // Exactly one open attempt per mount. If it fails the view carries
        // on without a session id and no close is ever attempted.
        let session_id = match app_state
            .store
            .open_session(NewSession {
                book_id: book.id,
                chapter_slug: chapter_slug.to_string(),
                user_id,
                started_at: Utc::now(),
                viewport_width,
                viewport_height,
                user_agent,
            })
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to open reading session: {e}");
                None
            }
        };

        let restore_pct = prior.as_ref().map(|p| p.scroll_pct).unwrap_or(0);
        let state = Self {
            user_id,
            book,
            chapter_slug: chapter_slug.to_string(),
            scroll_pct: restore_pct,
            // The session maximum is per visit; prior progress never seeds it.
            max_scroll_pct: 0,
            last_activity: Instant::now(),
            active: true,
            // Resume, not reset: repeat visits accumulate total engaged time.
            time_spent_seconds: prior.as_ref().map(|p| p.time_spent_seconds).unwrap_or(0),
            dirty: false,
            last_flush: None,
            completed_at: prior.as_ref().and_then(|p| p.completed_at),
            session_id,
            comments,
            show_resolved: false,
            selection: SelectionPhase::Idle,
            selection_epoch: 0,
        };

        Ok((state, chapter, html))
    }

    //-------------------------------------------------------------------------------------
    // Activity tracker
    //-------------------------------------------------------------------------------------

    /// A qualifying interaction: stamps last-activity and forces ACTIVE
    /// immediately, without waiting for the next poll.
    pub fn note_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.active = true;
    }

    /// The periodic idle check. ACTIVE -> IDLE only happens here.
    pub fn poll_idle(&mut self, now: Instant) {
        if now.duration_since(self.last_activity) >= IDLE_TIMEOUT {
            self.active = false;
        }
    }

    //-------------------------------------------------------------------------------------
    // Time accumulator
    //-------------------------------------------------------------------------------------

    /// One-second tick: accrues engaged time while ACTIVE, no-op while IDLE.
    pub fn tick_second(&mut self) {
        if self.active {
            self.time_spent_seconds += 1;
            self.dirty = true;
        }
    }

    //-------------------------------------------------------------------------------------
    // Scroll progress
    //-------------------------------------------------------------------------------------

    /// Folds a scroll event into the current and maximum percentages.
    /// Scrolling is also a qualifying activity.
    pub fn observe_scroll(
        &mut self,
        offset: f64,
        document_height: f64,
        viewport_height: f64,
        now: Instant,
    ) {
        self.note_activity(now);
        let pct = scroll_percentage(offset, document_height, viewport_height);
        self.scroll_pct = pct;
        self.max_scroll_pct = self.max_scroll_pct.max(pct);
        self.dirty = true;
    }

    //-------------------------------------------------------------------------------------
    // Progress persister
    //-------------------------------------------------------------------------------------

    /// Whether the interval ticker should write now: something changed and
    /// the debounce window since the last write has elapsed.
    pub fn should_flush(&self, now: Instant) -> bool {
        self.dirty
            && self
                .last_flush
                .map_or(true, |t| now.duration_since(t) >= FLUSH_WINDOW)
    }

    /// Builds the upsert payload for the current in-memory values, stamping
    /// the completion timestamp the first time the threshold is reached.
    /// Completion is sticky: once set it is carried on every later write.
    pub fn progress_payload(&mut self, now: DateTime<Utc>) -> ProgressUpsert {
        if self.scroll_pct >= COMPLETION_THRESHOLD_PCT && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        ProgressUpsert {
            book_id: self.book.id,
            chapter_slug: self.chapter_slug.clone(),
            user_id: self.user_id,
            scroll_pct: self.scroll_pct,
            time_spent_seconds: self.time_spent_seconds,
            last_read_at: now,
            completed_at: self.completed_at,
        }
    }

    pub fn mark_flushed(&mut self, now: Instant) {
        self.dirty = false;
        self.last_flush = Some(now);
    }

    //-------------------------------------------------------------------------------------
    // Selection capture
    //-------------------------------------------------------------------------------------

    pub fn pointer_down(&mut self, now: Instant) {
        self.note_activity(now);
        self.selection_epoch += 1;
        self.selection = SelectionPhase::Selecting { candidate: None };
    }

    /// Records the latest reported selection, keeping it only when it is
    /// non-empty and confined to the content region.
    pub fn selection_changed(&mut self, text: &str, container_id: &str, now: Instant) {
        self.note_activity(now);
        if let SelectionPhase::Selecting { candidate } = &mut self.selection {
            let trimmed = text.trim();
            *candidate = if container_id == CONTENT_REGION_ID && !trimmed.is_empty() {
                Some(trimmed.to_string())
            } else {
                None
            };
        }
    }

    /// Pointer released. Returns the epoch token the settle task must present
    /// back after the settle period.
    pub fn pointer_up(&mut self, now: Instant) -> u64 {
        self.note_activity(now);
        self.selection_epoch
    }

    /// Finalizes a selection after the settle period. Returns the anchor text
    /// if the composer should open; a stale epoch, an empty selection, or an
    /// unconfined one all resolve to no composer.
    pub fn settle_selection(&mut self, epoch: u64) -> Option<String> {
        if epoch != self.selection_epoch {
            return None;
        }
        match std::mem::replace(&mut self.selection, SelectionPhase::Idle) {
            SelectionPhase::Selecting {
                candidate: Some(text),
            } => {
                self.selection = SelectionPhase::Composing {
                    anchor_text: text.clone(),
                };
                Some(text)
            }
            SelectionPhase::Composing { anchor_text } => {
                // A settle task fired while the composer was already open
                // (e.g. a click that never formed a new selection).
                self.selection = SelectionPhase::Composing { anchor_text };
                None
            }
            _ => None,
        }
    }

    pub fn cancel_composer(&mut self) {
        self.selection = SelectionPhase::Idle;
    }

    //-------------------------------------------------------------------------------------
    // Comment engine
    //-------------------------------------------------------------------------------------

    /// Validates a submission and resolves its anchor: a reply inherits the
    /// parent's anchor text verbatim, a top-level comment takes the settled
    /// selection. Errors are user-facing messages for `CommentError`.
    pub fn resolve_submission(
        &self,
        content: &str,
        reply_to: Option<Uuid>,
    ) -> Result<NewComment, String> {
        let content = content.trim();
        if content.is_empty() {
            return Err("Comment text is required".to_string());
        }

        let (anchor_text, parent_id) = match reply_to {
            Some(parent_id) => {
                let parent = self
                    .comments
                    .iter()
                    .find(|c| c.id == parent_id)
                    .ok_or_else(|| "The comment you are replying to was not found".to_string())?;
                if !parent.is_root() {
                    return Err("Replies cannot be nested".to_string());
                }
                (parent.anchor_text.clone(), Some(parent_id))
            }
            None => match &self.selection {
                SelectionPhase::Composing { anchor_text } => (anchor_text.clone(), None),
                _ => return Err("Select some text to comment on first".to_string()),
            },
        };

        Ok(NewComment {
            book_id: self.book.id,
            chapter_slug: self.chapter_slug.clone(),
            user_id: self.user_id,
            anchor_text,
            // Reserved for paragraph-level anchoring; never computed.
            anchor_paragraph: String::new(),
            content: content.to_string(),
            parent_id,
        })
    }

    /// Appends a confirmed comment to the local cache. Only called after the
    /// store insert succeeded, so the cache never diverges from the store.
    pub fn apply_new_comment(&mut self, comment: Comment) {
        self.comments.push(comment);
    }

    pub fn resolved_state(&self, comment_id: Uuid) -> Option<bool> {
        self.comments
            .iter()
            .find(|c| c.id == comment_id)
            .map(|c| c.is_resolved)
    }

    /// Applies a confirmed resolution toggle to the local cache.
    pub fn apply_resolved(&mut self, comment_id: Uuid, resolved: bool) {
        if let Some(comment) = self.comments.iter_mut().find(|c| c.id == comment_id) {
            comment.is_resolved = resolved;
        }
    }

    pub fn threads(&self) -> Vec<CommentThread> {
        thread_comments(&self.comments, self.show_resolved)
    }
}
