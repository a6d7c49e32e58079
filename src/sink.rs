//! The output transport contract (spec §6): a UDP/RTP sender or file writer consuming
//! `(output, packet, dts)` triples. Expected non-blocking; if a sink blocks internally,
//! "that is the sink's problem" (spec §5).

use crate::output::OutputId;

/// A TS packet ready for an output, with its assigned DTS (spec §3 `block_t`:
/// `i_refcount`/`i_dts`). The manual refcount idiom of the original is replaced by an
/// `Arc<[u8; PACKET_SIZE]>`-like shared buffer at the call site (see `dispatcher.rs`); the
/// sink only ever sees one packet per `put` call; fan-out is the dispatcher's job.
#[derive(Debug, Clone)]
pub struct OutPacket {
    pub bytes: [u8; crate::packet::PACKET_SIZE],
    pub dts: i64,
}

/// The downstream transport: a UDP/RTP sender or file writer (spec §1, §6).
pub trait Sink {
    /// Queues `packet` for `output`. Expected non-blocking.
    fn put(&mut self, output: OutputId, packet: OutPacket);

    /// Pumps any packets queued by `put` since the last call.
    fn send(&mut self);
}
