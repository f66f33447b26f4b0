pub mod config;
pub mod configcache;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod models;
pub mod probe;
pub mod scan;
pub mod scenes;
pub mod stream;
pub mod supervisor;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use configcache::{ConfigCache, ConfigKind, PoolConfig, RetryConfig, RetryPolicy, TriggerConfig, TriggerRule};
pub use db::Db;
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind, EventSubscriber};
pub use jobs::{
    BulkOutcome, CronScheduler, DeadLetterQueue, Disposition, DlqEntry, DlqStats, Job, JobId,
    JobState, JobStore, PhaseCompletion, PoolDeps, QueueStatus, RetryScheduler, Submission,
    TriggerEngine, WorkerPool,
};
pub use models::{BulkMode, Phase, Scene, SceneId, Subject, TriggerSlot, TriggerType};
pub use probe::{FfmpegProbe, MediaInfo, ProbeError, ProbeErrorKind, SpritesSpec, ThumbnailSpec};
pub use scan::FsLibraryScanner;
pub use scenes::SqliteSceneRepo;
pub use stream::{ScenePathCache, StreamAdmission, StreamSlot};
pub use supervisor::TaskSupervisor;
pub use traits::{Clock, LibraryScanner, MediaProbe, ScanSummary, SceneRepo, SystemClock};

/// Current version of reelvault
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
