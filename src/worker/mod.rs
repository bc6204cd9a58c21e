//! # Scanning Node
//!
//! Everything that runs on a scanning node: the [`NodeAgent`] talking to the
//! scheduling center, the [`ShardRunner`] walking a shard's targets, and the
//! [`WorkerPool`] executing plugins inside the sandbox.

pub mod capacity;
pub mod checkpoint;
pub mod events;
pub mod fingerprint;
pub mod node_agent;
pub mod pool;
pub mod rate_limiter;
pub mod shard_runner;

pub use capacity::{LoadProbe, LoadSample, StaticLoadProbe, SystemLoadProbe};
pub use checkpoint::{
    CheckpointStore, CheckpointTracker, FileCheckpointStore, InMemoryCheckpointStore,
    LocalCheckpoint,
};
pub use events::{AssetEvent, EventSink, NodeEvent, StatEvent};
pub use fingerprint::{FingerprintProvider, StaticFingerprints};
pub use node_agent::{NodeAgent, NodeDependencies};
pub use pool::{ExecutionOutcome, PoolStats, WorkerPool};
pub use rate_limiter::TargetRateLimiter;
pub use shard_runner::{RunnerContext, RunnerLimits, ShardControl, ShardRunSummary, ShardRunner};
