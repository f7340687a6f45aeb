mod checksum;
mod manager;
mod types;

pub use checksum::{ChecksumSet, ChecksumSource, EMPTY_CHECKSUM, collect};
pub use manager::{DatabaseManager, StorePool};
pub use types::{ConnectionConfig, Driver};
