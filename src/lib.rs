//! Append-only, segmented, multi-subscriber message log.
//!
//! A log is a directory of numbered segment datafiles, each with an offset
//! index, plus a checkpoint per named subscriber. One [`LogWriter`] appends;
//! any number of subscribers read the interval between their checkpoint and
//! the last written message, then acknowledge it. Segments every subscriber
//! has moved past can be reclaimed.
//!
//! ```no_run
//! use jlog::{Log, LogConfig, StartPolicy};
//!
//! # fn main() -> jlog::Result<()> {
//! let log = Log::open_or_create("/tmp/events", LogConfig::default())?;
//! log.add_subscriber("indexer", StartPolicy::Beginning)?;
//!
//! let mut writer = log.writer()?;
//! writer.append(b"hello")?;
//!
//! let reader = log.reader("indexer")?;
//! if let Some((interval, messages)) = reader.poll()? {
//!     for message in &messages {
//!         println!("{} {:?}", message.id, message.payload);
//!     }
//!     reader.checkpoint(interval.to)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod checkpoint;
pub mod clock;
pub mod error;
pub mod header;
pub mod index;
pub mod lock;
pub mod log_id;
pub mod meta;
pub mod mmap;
pub mod reader;
pub mod repair;
pub mod retention;
pub mod segment;
pub mod store;
pub mod writer;

pub use checkpoint::StartPolicy;
pub use clock::{Clock, QuantaClock, SystemClock};
pub use error::{Error, Result};
pub use index::IndexState;
pub use lock::ExclusiveLock;
pub use log_id::LogId;
pub use meta::{LogConfig, LogMeta, Safety};
pub use reader::{Interval, LogReader, Message};
pub use repair::{Inspection, RepairOutcome};
pub use retention::PendingReaders;
pub use segment::SegmentName;
pub use store::Log;
pub use writer::LogWriter;
