//! Demultiplexer and PSI-rewriting core for a DVB transport-stream relay.
//!
//! [`context::DemuxContext`] owns the PID table, service registry, PSI caches, and output
//! list; [`context::DemuxContext::run`] feeds it a batch of [`source::RawPacket`]s. Outputs
//! are added and reconfigured with [`context::DemuxContext::add_output`]/
//! [`context::DemuxContext::change`]. The three collaborator traits — [`source::Source`],
//! [`sink::Sink`], [`ca::CaCoordinator`] — are supplied by the embedding application.

pub mod ca;
pub mod config;
pub mod context;
pub mod crc;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod gen;
pub mod handlers;
pub mod output;
pub mod packet;
pub mod pidtable;
pub mod psi;
pub mod service;
pub mod sink;
pub mod source;
#[cfg(test)]
pub mod testutil;

pub use ca::CaCoordinator;
pub use context::DemuxContext;
pub use error::DemuxError;
pub use output::{Output, OutputConfig, OutputId};
pub use sink::Sink;
pub use source::Source;
