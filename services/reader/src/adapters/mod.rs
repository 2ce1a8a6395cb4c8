pub mod content;
pub mod store;

pub use content::FsContentStore;
pub use store::PgStore;
