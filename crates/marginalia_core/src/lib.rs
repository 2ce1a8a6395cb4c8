pub mod domain;
pub mod ports;

pub use domain::{
    Book, Chapter, ChapterStatus, Comment, CommentThread, Manifest, ReadingProgress,
    ReadingSession, SupplementaryKind, SupplementaryResource,
};
pub use ports::{
    ContentStore, IdentityService, NewComment, NewSession, PortError, PortResult,
    ProgressUpsert, ReaderStore,
};
