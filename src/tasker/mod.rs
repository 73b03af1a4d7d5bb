pub mod completion;
pub mod config;
pub mod consumer;
pub mod dag;
pub mod distributor;
pub mod error;
pub mod hub;
pub mod monitor;
pub mod progress;
pub mod queue_core;
pub mod registry;
pub mod remote;
pub mod task;
pub mod task_common;
