//! End-to-end tests for the chapter view engine against an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marginalia_core::domain::{
    Book, Chapter, ChapterStatus, Comment, Manifest, ReadingProgress, ReadingSession,
};
use marginalia_core::ports::{
    ContentStore, IdentityService, NewComment, NewSession, PortError, PortResult, ProgressUpsert,
    ReaderStore,
};
use reader_lib::config::Config;
use reader_lib::web::progress_task::{flush_progress, teardown_view};
use reader_lib::web::state::{AppState, ChapterViewState, CONTENT_REGION_ID};
use reader_lib::web::ws_handler::apply_resolved_toggle;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::Level;
use uuid::Uuid;

const BOOK_ID: Uuid = Uuid::from_u128(0xB00C);
const READER: Uuid = Uuid::from_u128(0xAA);
const OTHER_READER: Uuid = Uuid::from_u128(0xBB);

type ProgressKey = (Uuid, String, Uuid);

#[derive(Default)]
struct StoreInner {
    progress: HashMap<ProgressKey, ReadingProgress>,
    sessions: HashMap<Uuid, ReadingSession>,
    comments: Vec<Comment>,
    close_calls: u32,
}

/// An in-memory `ReaderStore` with switchable failure modes.
#[derive(Default)]
struct MemoryStore {
    inner: StdMutex<StoreInner>,
    fail_open_session: bool,
    fail_resolve_toggle: bool,
}

impl MemoryStore {
    fn progress_rows(&self) -> Vec<ReadingProgress> {
        self.inner.lock().unwrap().progress.values().cloned().collect()
    }

    fn session_rows(&self) -> Vec<ReadingSession> {
        self.inner.lock().unwrap().sessions.values().cloned().collect()
    }

    fn close_calls(&self) -> u32 {
        self.inner.lock().unwrap().close_calls
    }
}

#[async_trait]
impl ReaderStore for MemoryStore {
    async fn resolve_book(&self, slug: &str) -> PortResult<Book> {
        if slug == "field-notes" {
            Ok(Book {
                id: BOOK_ID,
                slug: slug.to_string(),
                title: "Field Notes".to_string(),
            })
        } else {
            Err(PortError::NotFound(format!("Book '{}' not found", slug)))
        }
    }

    async fn upsert_progress(&self, progress: ProgressUpsert) -> PortResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (
            progress.book_id,
            progress.chapter_slug.clone(),
            progress.user_id,
        );
        // Same semantics as the Postgres adapter: replace by composite key,
        // keep the earliest completion timestamp.
        let existing_completed = inner.progress.get(&key).and_then(|p| p.completed_at);
        inner.progress.insert(
            key,
            ReadingProgress {
                book_id: progress.book_id,
                chapter_slug: progress.chapter_slug,
                user_id: progress.user_id,
                scroll_pct: progress.scroll_pct,
                time_spent_seconds: progress.time_spent_seconds,
                last_read_at: progress.last_read_at,
                completed_at: existing_completed.or(progress.completed_at),
            },
        );
        Ok(())
    }

    async fn get_progress(
        &self,
        book_id: Uuid,
        chapter_slug: &str,
        user_id: Uuid,
    ) -> PortResult<Option<ReadingProgress>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .progress
            .get(&(book_id, chapter_slug.to_string(), user_id))
            .cloned())
    }

    async fn open_session(&self, session: NewSession) -> PortResult<Uuid> {
        if self.fail_open_session {
            return Err(PortError::Unexpected("store offline".to_string()));
        }
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(
            id,
            ReadingSession {
                id,
                book_id: session.book_id,
                chapter_slug: session.chapter_slug,
                user_id: session.user_id,
                started_at: session.started_at,
                ended_at: None,
                max_scroll_pct: 0,
                viewport_width: session.viewport_width,
                viewport_height: session.viewport_height,
                user_agent: session.user_agent,
            },
        );
        Ok(id)
    }

    async fn close_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        max_scroll_pct: u8,
    ) -> PortResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.close_calls += 1;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))?;
        session.ended_at = Some(ended_at);
        session.max_scroll_pct = max_scroll_pct;
        Ok(())
    }

    async fn insert_comment(&self, comment: NewComment) -> PortResult<Comment> {
        let mut inner = self.inner.lock().unwrap();
        let stored = Comment {
            id: Uuid::new_v4(),
            book_id: comment.book_id,
            chapter_slug: comment.chapter_slug,
            user_id: comment.user_id,
            anchor_text: comment.anchor_text,
            anchor_paragraph: comment.anchor_paragraph,
            content: comment.content,
            parent_id: comment.parent_id,
            is_resolved: false,
            created_at: Utc::now(),
        };
        inner.comments.push(stored.clone());
        Ok(stored)
    }

    async fn set_comment_resolved(&self, comment_id: Uuid, resolved: bool) -> PortResult<()> {
        if self.fail_resolve_toggle {
            return Err(PortError::Unexpected("store offline".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        let comment = inner
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or_else(|| PortError::NotFound(format!("Comment {} not found", comment_id)))?;
        comment.is_resolved = resolved;
        Ok(())
    }

    async fn comments_for_chapter(
        &self,
        book_id: Uuid,
        chapter_slug: &str,
    ) -> PortResult<Vec<Comment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .comments
            .iter()
            .filter(|c| c.book_id == book_id && c.chapter_slug == chapter_slug)
            .cloned()
            .collect())
    }

    async fn progress_for_book(&self, book_id: Uuid) -> PortResult<Vec<ReadingProgress>> {
        Ok(self
            .progress_rows()
            .into_iter()
            .filter(|p| p.book_id == book_id)
            .collect())
    }

    async fn sessions_for_book(&self, book_id: Uuid) -> PortResult<Vec<ReadingSession>> {
        Ok(self
            .session_rows()
            .into_iter()
            .filter(|s| s.book_id == book_id)
            .collect())
    }

    async fn comments_for_book(&self, book_id: Uuid) -> PortResult<Vec<Comment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .comments
            .iter()
            .filter(|c| c.book_id == book_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdentityService for MemoryStore {
    async fn validate_session(&self, _token: &str) -> PortResult<Uuid> {
        Ok(READER)
    }
}

/// Serves one fixed chapter.
struct MemoryContent;

#[async_trait]
impl ContentStore for MemoryContent {
    async fn fetch_document(&self, book_slug: &str, slug: &str) -> PortResult<String> {
        if book_slug == "field-notes" && slug == "chapter-1" {
            Ok("<h1>Chapter 1</h1><p>The quick fox jumps.</p>".to_string())
        } else {
            Err(PortError::NotFound(format!(
                "Document '{}/{}' not found",
                book_slug, slug
            )))
        }
    }

    async fn load_manifest(&self, book_slug: &str) -> PortResult<Manifest> {
        if book_slug != "field-notes" {
            return Err(PortError::NotFound(format!(
                "Manifest for book '{}' not found",
                book_slug
            )));
        }
        Ok(Manifest {
            title: Some("Field Notes".to_string()),
            chapters: vec![
                Chapter {
                    slug: "chapter-1".to_string(),
                    title: "Chapter 1".to_string(),
                    number: 1,
                    status: ChapterStatus::Ready,
                },
                Chapter {
                    slug: "chapter-2".to_string(),
                    title: "Chapter 2".to_string(),
                    number: 2,
                    status: ChapterStatus::ComingSoon,
                },
            ],
            supplementary: Vec::new(),
        })
    }
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgres://unused".to_string(),
        log_level: Level::INFO,
        books_dir: "/nonexistent".into(),
    }
}

fn app_state(store: Arc<MemoryStore>) -> Arc<AppState> {
    Arc::new(AppState {
        store: store.clone(),
        identity: store,
        content: Arc::new(MemoryContent),
        config: Arc::new(test_config()),
    })
}

async fn mount(app: &Arc<AppState>, user: Uuid) -> ChapterViewState {
    let (state, chapter, html) = ChapterViewState::open(
        app.clone(),
        user,
        "field-notes",
        "chapter-1",
        1280,
        800,
        "integration-test".to_string(),
    )
    .await
    .expect("mount should succeed");
    assert_eq!(chapter.slug, "chapter-1");
    assert!(html.contains("The quick fox"));
    state
}

#[tokio::test]
async fn first_visit_scroll_to_95_creates_progress_and_session() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store.clone());

    let state = mount(&app, READER).await;
    assert!(state.session_id.is_some());
    let view_lock = Arc::new(Mutex::new(state));

    view_lock
        .lock()
        .await
        .observe_scroll(950.0, 1800.0, 800.0, Instant::now()); // 95%
    teardown_view(&app, &view_lock).await;

    let progress = store.progress_rows();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].scroll_pct, 95);
    assert_eq!(progress[0].user_id, READER);
    assert!(progress[0].completed_at.is_some());

    let sessions = store.session_rows();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].max_scroll_pct, 95);
    assert!(sessions[0].ended_at.is_some());
    assert_eq!(sessions[0].viewport_width, 1280);
    assert_eq!(sessions[0].user_agent, "integration-test");
}

#[tokio::test]
async fn repeated_flushes_upsert_one_row() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store.clone());
    let view_lock = Arc::new(Mutex::new(mount(&app, READER).await));

    view_lock
        .lock()
        .await
        .observe_scroll(300.0, 1800.0, 800.0, Instant::now()); // 30%
    flush_progress(&app, &view_lock).await;

    view_lock
        .lock()
        .await
        .observe_scroll(600.0, 1800.0, 800.0, Instant::now()); // 60%
    flush_progress(&app, &view_lock).await;

    let progress = store.progress_rows();
    assert_eq!(progress.len(), 1, "same key must replace, not duplicate");
    assert_eq!(progress[0].scroll_pct, 60);
}

#[tokio::test]
async fn revisit_resumes_accumulated_time_and_keeps_completion() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store.clone());

    // First visit: read to completion with some accrued time.
    let view_lock = Arc::new(Mutex::new(mount(&app, READER).await));
    {
        let mut view = view_lock.lock().await;
        view.observe_scroll(950.0, 1800.0, 800.0, Instant::now());
        for _ in 0..30 {
            view.tick_second();
        }
    }
    teardown_view(&app, &view_lock).await;
    let first_completed = store.progress_rows()[0].completed_at;
    assert!(first_completed.is_some());

    // Second visit: accumulator resumes, completion stays even though the
    // reader only glances at the top of the chapter this time.
    let state = mount(&app, READER).await;
    assert_eq!(state.time_spent_seconds, 30);
    let view_lock = Arc::new(Mutex::new(state));
    view_lock
        .lock()
        .await
        .observe_scroll(50.0, 1800.0, 800.0, Instant::now()); // 5%
    teardown_view(&app, &view_lock).await;

    let progress = store.progress_rows();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].scroll_pct, 5);
    assert_eq!(progress[0].completed_at, first_completed);
}

#[tokio::test]
async fn revisit_session_max_reflects_only_current_visit() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store.clone());

    // First visit reads to the bottom.
    let view_lock = Arc::new(Mutex::new(mount(&app, READER).await));
    view_lock
        .lock()
        .await
        .observe_scroll(950.0, 1800.0, 800.0, Instant::now()); // 95%
    teardown_view(&app, &view_lock).await;

    // Second visit only glances at the top. Its session row must record
    // what this visit observed, not the persisted high-water mark the
    // progress row restores from.
    let state = mount(&app, READER).await;
    let second_id = state.session_id.unwrap();
    let view_lock = Arc::new(Mutex::new(state));
    view_lock
        .lock()
        .await
        .observe_scroll(50.0, 1800.0, 800.0, Instant::now()); // 5%
    teardown_view(&app, &view_lock).await;

    let sessions = store.session_rows();
    assert_eq!(sessions.len(), 2);
    let second = sessions.iter().find(|s| s.id == second_id).unwrap();
    assert_eq!(second.max_scroll_pct, 5);
    let first = sessions.iter().find(|s| s.id != second_id).unwrap();
    assert_eq!(first.max_scroll_pct, 95);
}

#[tokio::test]
async fn failed_session_open_skips_close() {
    let store = Arc::new(MemoryStore {
        fail_open_session: true,
        ..MemoryStore::default()
    });
    let app = app_state(store.clone());

    // The mount still succeeds: a lost session is telemetry, not an error.
    let state = mount(&app, READER).await;
    assert!(state.session_id.is_none());

    let view_lock = Arc::new(Mutex::new(state));
    teardown_view(&app, &view_lock).await;
    assert_eq!(store.close_calls(), 0, "no close without an open id");
}

#[tokio::test]
async fn comment_and_reply_share_the_anchor() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store.clone());

    // First reader selects text in the content region and comments.
    let mut view = mount(&app, READER).await;
    let now = Instant::now();
    view.pointer_down(now);
    view.selection_changed("the quick fox", CONTENT_REGION_ID, now);
    let epoch = view.pointer_up(now);
    assert_eq!(view.settle_selection(epoch), Some("the quick fox".to_string()));

    let submission = view.resolve_submission("typo?", None).unwrap();
    let root = app.store.insert_comment(submission).await.unwrap();
    view.apply_new_comment(root.clone());
    view.cancel_composer();

    assert_eq!(root.anchor_text, "the quick fox");
    assert_eq!(root.parent_id, None);
    assert!(!root.is_resolved);

    // A second reader mounts the same chapter and replies; the anchor is
    // inherited, never re-selected.
    let other_view = mount(&app, OTHER_READER).await;
    assert_eq!(other_view.comments.len(), 1);
    let reply_submission = other_view
        .resolve_submission("agreed", Some(root.id))
        .unwrap();
    let reply = app.store.insert_comment(reply_submission).await.unwrap();

    assert_eq!(reply.parent_id, Some(root.id));
    assert_eq!(reply.anchor_text, "the quick fox");
    assert_eq!(reply.user_id, OTHER_READER);
}

#[tokio::test]
async fn sidebar_selection_creates_nothing() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store.clone());

    let mut view = mount(&app, READER).await;
    let now = Instant::now();
    view.pointer_down(now);
    view.selection_changed("text in the sidebar", "comments-sidebar", now);
    let epoch = view.pointer_up(now);

    // No composer opens, and without a composer a top-level submission
    // cannot be formed.
    assert_eq!(view.settle_selection(epoch), None);
    assert!(view.resolve_submission("orphan", None).is_err());
    assert!(store.inner.lock().unwrap().comments.is_empty());
}

fn root_note() -> NewComment {
    NewComment {
        book_id: BOOK_ID,
        chapter_slug: "chapter-1".to_string(),
        user_id: READER,
        anchor_text: "anchor".to_string(),
        anchor_paragraph: String::new(),
        content: "note".to_string(),
        parent_id: None,
    }
}

#[tokio::test]
async fn resolve_toggle_failure_leaves_cache_untouched() {
    let store = Arc::new(MemoryStore {
        fail_resolve_toggle: true,
        ..MemoryStore::default()
    });
    let app = app_state(store.clone());

    let comment = app.store.insert_comment(root_note()).await.unwrap();
    let view_lock = Arc::new(Mutex::new(mount(&app, READER).await));
    assert_eq!(
        view_lock.lock().await.resolved_state(comment.id),
        Some(false)
    );

    // The store write fails, so the flip must not reach the cache.
    let result = apply_resolved_toggle(&app, &view_lock, comment.id).await;
    assert_eq!(result.unwrap_err(), "Failed to update comment");
    assert_eq!(
        view_lock.lock().await.resolved_state(comment.id),
        Some(false)
    );
}

#[tokio::test]
async fn resolve_toggle_applies_after_store_confirms() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store.clone());

    let comment = app.store.insert_comment(root_note()).await.unwrap();
    let view_lock = Arc::new(Mutex::new(mount(&app, READER).await));

    let threads = apply_resolved_toggle(&app, &view_lock, comment.id)
        .await
        .unwrap();
    // Resolved roots disappear under the default filter.
    assert!(threads.is_empty());
    assert_eq!(
        view_lock.lock().await.resolved_state(comment.id),
        Some(true)
    );
    assert!(store.inner.lock().unwrap().comments[0].is_resolved);

    // Unknown ids surface at the point of action.
    let missing = apply_resolved_toggle(&app, &view_lock, Uuid::new_v4()).await;
    assert_eq!(missing.unwrap_err(), "Comment not found");
}

#[tokio::test]
async fn coming_soon_chapter_is_not_served() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store);

    let result = ChapterViewState::open(
        app,
        READER,
        "field-notes",
        "chapter-2",
        1280,
        800,
        "integration-test".to_string(),
    )
    .await;

    assert!(matches!(result, Err(PortError::NotFound(_))));
}

#[tokio::test]
async fn missing_document_is_terminal() {
    let store = Arc::new(MemoryStore::default());
    let app = app_state(store);

    let result = ChapterViewState::open(
        app,
        READER,
        "unknown-book",
        "chapter-1",
        1280,
        800,
        "integration-test".to_string(),
    )
    .await;

    assert!(matches!(result, Err(PortError::NotFound(_))));
}
