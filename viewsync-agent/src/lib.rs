pub mod channel;
pub mod host;
pub mod select;
pub mod settings;
pub mod storage;
pub mod sync;
pub mod watch;

pub use sync::{HostEvent, Outcome, SkipReason, SyncError, ViewSync};
