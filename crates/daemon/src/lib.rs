//! Stereo Companion Daemon
//!
//! State-management core of a media-conversion orchestrator: tracks
//! downloaded video files, gates them on size stability, verifies decode
//! integrity, probes audio tracks, and drives stereo companion conversion,
//! persisting every observation so the system can stop and restart at any
//! moment without redoing work.

pub mod adapters;
pub mod clock;
pub mod discovery;
pub mod machine;
pub mod manager;
pub mod metrics;
pub mod metrics_server;
pub mod model;
pub mod planner;
pub mod startup;
pub mod store;

pub use stereod_config as config;
pub use stereod_config::Config;

pub use adapters::{
    AdapterError, AudioProbe, AudioTrack, ConversionOutcome, ConversionReport, ConvertPolicy,
    Converter, IntegrityChecker, IntegrityMode, IntegrityReport, IntegrityVerdict,
};
pub use clock::{Clock, FakeClock, FileStat, StatError, StatSource, SystemClock, SystemStatSource};
pub use discovery::{scan_directory, DiscoverOptions, DiscoveredFile};
pub use machine::{next_action, step, Action, Decision, Event, GroupMutation, MachineError};
pub use manager::{
    DiscoveryReport, HealthReport, MaintenanceReport, Manager, ManagerError, StatusReport,
};
pub use metrics::{
    collect_system_gauges, new_shared_metrics, Metrics, MetricsSnapshot, SharedMetrics,
    TimingSummary,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use model::{
    group_key, FileEntry, FileRole, GroupEntry, GroupState, IntegrityStatus, ProcessedStatus,
    NEVER_TS,
};
pub use planner::{derive_parallelism, Planner, PlannerError, TickReport, Workers};
pub use startup::{check_ffmpeg_available, check_ffprobe_available, run_startup_checks, StartupError};
pub use store::{GcReport, StateStore, StoreError, StoreStats};
