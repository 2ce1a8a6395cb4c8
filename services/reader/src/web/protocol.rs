//! services/reader/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser shell and the
//! reader service for one chapter view.
//!
//! The browser is deliberately thin: it renders the trusted chapter HTML it
//! receives in `ViewReady` and forwards raw interaction events (scroll
//! offsets, pointer and key activity, text selections, comment submissions).
//! All state-machine behavior lives server-side in the engine.

use marginalia_core::domain::{Chapter, CommentThread};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Mounts a chapter view. This must be the first message sent on the
    /// connection; the viewport dimensions and user agent are captured on
    /// the reading session row.
    Open {
        book_slug: String,
        chapter_slug: String,
        viewport_width: u32,
        viewport_height: u32,
        user_agent: String,
    },

    /// A scroll event inside the rendered document. Also counts as activity.
    Scroll {
        offset: f64,
        document_height: f64,
        viewport_height: f64,
    },

    /// Any other qualifying interaction: pointer move, key press, click.
    Activity,

    /// The reader pressed the pointer down inside the page; a selection may
    /// be starting.
    PointerDown,

    /// The reader released the pointer. The engine waits a short settle
    /// period before inspecting the final selection.
    PointerUp,

    /// The current selection text changed. `container_id` names the DOM
    /// container holding the selection's common ancestor; the engine uses it
    /// to confine selections to the content region.
    SelectionChanged { text: String, container_id: String },

    /// Submits the composer. With `reply_to` set this is a reply to an
    /// existing thread root; otherwise it needs a settled selection.
    SubmitComment {
        content: String,
        reply_to: Option<Uuid>,
    },

    /// Discards the composer and any bound selection.
    CancelComposer,

    /// Flips the resolved flag on one comment.
    ToggleResolved { comment_id: Uuid },

    /// Controls whether resolved thread roots are included in `Threads`.
    SetShowResolved { show: bool },
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The chapter view is mounted: trusted HTML to render, the scroll
    /// position to restore (single attempt, never retried), the persisted
    /// active-seconds the accumulator resumes from, and the initial comment
    /// threads.
    ViewReady {
        chapter: Chapter,
        html: String,
        restore_scroll_pct: u8,
        time_spent_seconds: u64,
        threads: Vec<CommentThread>,
    },

    /// The chapter content could not be served. Terminal for this view;
    /// the client renders an error state and the connection ends.
    ContentError { message: String },

    /// A selection settled inside the content region; the composer should
    /// open pre-bound to this anchor text.
    ComposerOpened { anchor_text: String },

    /// The current comment threads after a change (new comment, resolution
    /// toggle, or filter change).
    Threads { threads: Vec<CommentThread> },

    /// A direct comment action (submit or resolve) failed; shown inline at
    /// the point of action.
    CommentError { message: String },

    /// Reports a fatal error to the client, which should display an error message.
    Error { message: String },
}
