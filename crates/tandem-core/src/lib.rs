//! Core types for the Tandem synchronisation engine.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the vocabulary shared by the kernel and the synchronisation layer:
//! logical time, synchronisation windows and strongly-typed identifiers.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod id;
pub mod time;
pub mod window;

pub use id::{ChannelId, EventId, ProcessId, SourceId, TaskId, VoterId};
pub use time::LogicalTime;
pub use window::SyncWindow;
