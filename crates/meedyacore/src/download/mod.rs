//! Download planning, execution and progress tracking

pub mod codec;
pub mod command;
pub mod events;
pub mod expander;
pub mod failure;
pub mod metadata;
pub mod options;
pub mod output;
pub mod queue;
pub mod supervisor;

pub use codec::{Format, MediaKind, SongCodec, VideoResolution};
pub use command::{BinaryResolver, DownloaderCommand, ManagedBinaryResolver, Tool};
pub use events::{EngineEvent, EventBus, Subscription};
pub use expander::{expand, CompanionPolicy, DownloadJob, ExpandContext};
pub use failure::{classify_failure, FailureKind};
pub use options::DownloadOptions;
pub use output::{parse_line, LineBuffer, OutputEvent};
pub use queue::{DownloadState, QueueSnapshot, QueueStore, WorkItem};
