pub mod database;
pub mod diff;
pub mod dump;
pub mod ssh;
pub mod watcher;

pub use database::*;
pub use diff::Diff;
pub use dump::{DumpSource, Dumper, Importer, compress_dump};
pub use watcher::{DiffEvent, Watcher, WatcherHandle};
