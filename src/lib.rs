//! Rolling, memory-mapped, append-only queue shared by processes on one host.
//!
//! Excerpts are appended to one segment file per time cycle. A two-level sparse index per
//! segment gives near-constant-time seeks by index, a lock slot in a shared table store
//! serialises writers across processes, and a pretoucher keeps pages ahead of the writer
//! faulted in.
//!
//! ```no_run
//! use chronicle_rolling::RollingQueue;
//!
//! let queue = RollingQueue::open("./my_queue")?;
//! let mut appender = queue.acquire_appender()?;
//! let index = appender.write_bytes(b"hello")?;
//!
//! let mut tailer = queue.create_tailer()?;
//! tailer.move_to_index(index)?;
//! let excerpt = tailer.reading_document()?.expect("just written");
//! assert_eq!(excerpt.payload(), b"hello");
//! # Ok::<(), chronicle_rolling::Error>(())
//! ```

pub mod appender;
pub mod clock;
pub mod directory_listing;
pub mod error;
pub mod header;
pub mod mmap;
pub mod pretoucher;
pub mod queue;
pub mod queue_lock;
pub mod roll_cycle;
pub mod segment;
pub mod segment_store;
pub mod sparse_index;
pub mod table_store;
pub mod tailer;
pub mod wait;

pub use appender::{Appender, BatchWriter, DocumentWriter};
pub use clock::{Clock, QuantaClock, SetClock, SystemClock};
pub use directory_listing::{DirectoryListing, TableDirectoryListing, NO_MAX_CYCLE, NO_MIN_CYCLE};
pub use error::{Error, Result};
pub use pretoucher::Pretoucher;
pub use queue::{
    Direction, PretouchConfig, QueueConfig, RollingQueue, SegmentHandle, StoreListener,
};
pub use queue_lock::{LockConfig, LockRecovery, LockToken, QueueLock, TableStoreQueueLock};
pub use roll_cycle::RollCycle;
pub use segment_store::SegmentStore;
pub use sparse_index::{IndexCursor, ScanResult, SparseIndex};
pub use table_store::{MappedValue, TableStore};
pub use tailer::{Excerpt, Tailer};
pub use wait::PauseStrategy;
