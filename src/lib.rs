//! Fault-tolerant distributed shared memory.
//!
//! Processors share a fixed set of pages under a single-writer/multiple-reader
//! discipline coordinated by a replicated set of central managers, which fail
//! over through a timeout-triggered election.

pub mod central_manager;
pub mod cluster;
pub mod config;
pub mod election;
pub mod error;
pub mod fault;
pub mod log;
pub mod message;
pub mod network;
pub mod operation;
pub mod poisson;
pub mod processor;
pub mod state;

pub use central_manager::{CentralManager, CmReport};
pub use cluster::Cluster;
pub use config::Config;
pub use error::DsmError;
pub use message::{Message, MessageType};
pub use processor::{PageCache, Processor, ProcessorReport};
pub use state::{CmEntry, RequestStatus, State};
