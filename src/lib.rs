pub mod settings;
pub mod config;
pub mod context;
pub mod logging;
pub mod extent;
pub mod hash;
pub mod index;
pub mod hasher;
pub mod permissions;
pub mod transfer;
pub mod restore;

pub use settings::ChunkSettings;
pub use config::{Config, QueueSettings};
pub use context::{SettingsCache, SyncContext};
pub use extent::{ExtentSource, FileExtent, SparseExtent};
pub use hash::{CheckpointHash, FileHash, HashSink, TreeHashSink};
pub use index::{ChunkHashIndex, ChunkHashRecord, IndexGeneration};
pub use hasher::{ContentHasher, HashError, LocalSourceFile, SourceFile, VdlCache};
pub use transfer::{TransferCode, TransferError, TransferQueue, WorkFile};
pub use restore::{RestoreOrchestrator, RestoreOutcome};
