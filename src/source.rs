//! The TS source driver contract (spec §6), re-expressed per DESIGN NOTES §9 as a
//! "capability record" trait rather than the original's four bound function pointers
//! (`pf_Open`/`pf_Read`/`pf_SetFilter`/`pf_UnsetFilter`).

use crate::packet::PACKET_SIZE;

/// Opaque handle returned by [`Source::set_filter`]; invalid once
/// [`Source::unset_filter`] has been called with it (spec §3: "`source_handle` — opaque
/// handle returned by the source... invalid when refcount zero").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceHandle(pub u64);

/// One TS packet as handed back by [`Source::read`], stamped with the wallclock time it was
/// received (the core assigns the DTS itself, spec §4.10.1).
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub bytes: [u8; PACKET_SIZE],
    /// Wallclock arrival time, in whatever monotonic unit the caller uses consistently
    /// (dvblast's `mtime_t`, i.e. microseconds).
    pub wallclock: i64,
}

/// The upstream byte source: a DVB tuner, UDP/multicast socket, or ASI capture card (spec
/// §1, §6). The demux core only ever calls these four methods; it never blocks inside them
/// except as `read` itself may block (spec §5).
pub trait Source {
    /// One-time initialization.
    fn open(&mut self) -> std::io::Result<()>;

    /// Returns the next batch of packets read from the source (spec §6: "linked list of TS
    /// packets with wallclock stamps; the core dates them"). May block.
    fn read(&mut self) -> std::io::Result<Vec<RawPacket>>;

    /// Installs a hardware/socket filter for `pid`, returning a handle later passed to
    /// [`Source::unset_filter`]. Not called at all in budget mode (spec §4.1).
    fn set_filter(&mut self, pid: u16) -> std::io::Result<SourceHandle>;

    /// Releases a filter previously installed by [`Source::set_filter`].
    fn unset_filter(&mut self, handle: SourceHandle, pid: u16);

    /// Requested after the transport-error-indicator watchdog trips (spec §4.10.4, §7 kind 1).
    fn reset(&mut self);
}
