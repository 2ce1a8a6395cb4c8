pub mod middleware;
pub mod progress_task;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the main WebSocket handler to make it easily accessible
// to the binary that will build the web server router.
pub use middleware::require_auth;
pub use rest::{book_analytics_handler, supplementary_handler};
pub use ws_handler::ws_handler;
