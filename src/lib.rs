#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # VulnScan Core
//!
//! Scheduling and distributed dispatch core for a distributed vulnerability
//! scanning engine.
//!
//! ## Overview
//!
//! A scan task names a set of targets (addresses, CIDR ranges, hostnames) and a
//! scan policy. The scheduling center splits each task into shards, places the
//! shards on worker nodes by priority and load, and folds the nodes' reports
//! back into task status and finding counts. Nodes run shards through a bounded
//! worker pool, executing vulnerability checks from a hot-reloadable plugin
//! registry inside a sandbox.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► TaskManager ──► Dispatcher ──► scan.assignments.<node> ──► NodeAgent
//!                ▲                ▲                                        │
//!                │                └──── heartbeats ◄───────────────────────┤
//!                └────── ResultProcessor ◄── scan.results ◄── ShardRunner ◄┘
//!                                                               │
//!                                              WorkerPool ── PluginRegistry ── Sandbox
//! ```
//!
//! ## Module Organization
//!
//! - [`models`] - Tasks, shards, nodes, plugins and execution results
//! - [`state_machine`] - Task and shard state machines and status aggregation
//! - [`persistence`] - Durable state store (in-memory and Postgres)
//! - [`messaging`] - Message bus abstraction and wire messages
//! - [`orchestration`] - Task manager, dispatcher and result processing
//! - [`worker`] - Node agent, shard runner and worker pool
//! - [`registry`] - Plugin registry, sources and sandbox
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup and helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vulnscan_core::config::ScannerConfig;
//! use vulnscan_core::messaging::InMemoryMessageBus;
//! use vulnscan_core::models::NewTask;
//! use vulnscan_core::orchestration::SchedulingCenter;
//! use vulnscan_core::persistence::InMemoryStateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let center = SchedulingCenter::start(
//!     ScannerConfig::default(),
//!     Arc::new(InMemoryStateStore::new()),
//!     Arc::new(InMemoryMessageBus::new()),
//! )
//! .await?;
//!
//! let task_id = center
//!     .task_manager()
//!     .create_task(NewTask::new("weekly", vec!["10.0.0.0/30".into()], "full"))
//!     .await?;
//! println!("created {task_id}");
//! center.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod state_machine;
pub mod worker;

pub use config::{ConfigManager, ScannerConfig};
pub use error::{ScanError, ScanResult};
pub use messaging::{InMemoryMessageBus, MessageBus};
pub use models::{NewTask, Shard, ShardId, Task, TaskId};
pub use orchestration::{SchedulingCenter, TaskManager, TaskQuery};
pub use persistence::{InMemoryStateStore, StateStore};
pub use registry::PluginRegistry;
pub use state_machine::{ShardState, TaskState};
pub use worker::{NodeAgent, WorkerPool};
