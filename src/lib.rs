//! resource-tree-handler — live resource trees for Krateo compositions
//!
//! Maintains, for every composition in the cluster, a resource tree of its
//! managed objects together with their health, serves it over HTTP, and
//! keeps it current by reacting to lifecycle webhooks, managed-object
//! events from an SSE bus, and explicit refresh requests.
//!
//! The moving parts:
//!
//! - [`cache::TreeCache`]: single-owner store of built trees with a
//!   wait-for-entry primitive
//! - [`dispatch`]: per-composition admission plus the bounded worker pool
//!   that runs builds
//! - [`tree`]: tree construction and single-node refresh
//! - [`sse::SseClient`]: the event-bus subscription side
//! - [`web`]: the served endpoints

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod filters;
pub mod kube;
pub mod models;
pub mod sse;
pub mod tree;
pub mod web;

// Re-export the service building blocks
pub use cache::{TreeCache, UpdateError, WaitOutcome};
pub use dispatch::{BuildJob, BuildState, Dispatcher, Regulator};
pub use models::{
    Exclude, Filters, Health, Reference, ResourceNodeSpec, ResourceNodeStatus, ResourceTree,
    ResourceTreeEntry, StatusNode,
};
pub use sse::SseClient;
