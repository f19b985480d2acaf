//! Draftbench: Sandboxed Workbenches with Draft, Publish and Checkpoint History
//!
//! Each workbench keeps a published tree of user files, at most one draft copy that the agentic
//! workshop edits, and immutable checkpoints of the published tree. Model calls go through a
//! per-workbench consent gate; the engine is served as JSON-RPC over stdio.

pub mod agent;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod consent;
pub mod conversation;
pub mod draft;
pub mod engine;
pub mod error;
pub mod logging;
pub mod notify;
pub mod provider;
pub mod retry;
pub mod rpc;
pub mod snapshot;
pub mod store;
pub mod tools;
pub mod toolworker;
pub mod types;
