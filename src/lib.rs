//! Execution core of a distributed stream processing engine.
//!
//! A job is a [`execution::plan::Dag`] of vertices, each run as many
//! parallel [`processor::Processor`] instances, connected by edges
//! that carry [`item::Item`]s. The [`coordinator::JobCoordinator`]
//! starts an execution of the job on every cluster member through
//! that member's [`job_execution_service::JobExecutionService`],
//! takes periodic snapshots of processor state, and restarts from the
//! latest snapshot when the topology changes.
//!
//! Start reading at [`processor`] for the contract every processor
//! follows, then [`execution`] for how they are scheduled and wired.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod execution;
pub mod item;
pub mod job_execution_service;
#[macro_use]
pub mod metrics;
pub mod processor;
pub mod sinks;
pub mod snapshot;
pub mod sources;
pub mod testing;
pub mod tracing;
pub mod webserver;
pub mod window;
