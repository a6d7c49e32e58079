//! `demux_Run` (spec §4.10): per-batch dating, per-packet validation, PSI routing, PCR anchor
//! tracking, and per-output forwarding with watched-output descrambling checks.
//!
//! Grounded on `original_source/demux.c` `demux_Run`/`HandlePSIPacket`/`HandlePacket` and on
//! the teacher's `Demultiplex::push` for the overall "one packet through the pipeline" shape.

use crate::ca::CaCoordinator;
use crate::config::{EIT_PID, NIT_PID, PAT_PID, PADDING_PID, RST_PID, SDT_PID, TDT_PID};
use crate::context::DemuxContext;
use crate::handlers;
use crate::output::OutputId;
use crate::packet::{Packet, PACKET_SIZE};
use crate::sink::{OutPacket, Sink};
use crate::source::{RawPacket, Source};

/// Assigns a DTS to every packet in `batch` by linearly interpolating backward from the
/// batch's own last wallclock stamp using the duration since the previous batch (spec §4.10
/// step 1, CBR assumption within a read). Returns one DTS per packet, same order as `batch`.
fn date_batch(batch: &[RawPacket], last_dts: Option<i64>) -> Vec<i64> {
    if batch.is_empty() {
        return Vec::new();
    }
    let now = batch.last().unwrap().wallclock;
    let prev = last_dts.unwrap_or(now);
    let span = (now - prev).max(0);
    let n = batch.len();
    (0..n)
        .map(|i| {
            if n == 1 {
                now
            } else {
                let back = span * (n as i64 - 1 - i as i64) / n as i64;
                now - back
            }
        })
        .collect()
}

/// Runs one received batch of packets through the demux core (spec §4.10 `demux_Run`).
pub fn run<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, batch: Vec<RawPacket>) {
    if batch.is_empty() {
        return;
    }
    let dates = date_batch(&batch, ctx.last_dts);
    ctx.last_dts = dates.last().copied();

    for (raw, dts) in batch.into_iter().zip(dates) {
        handle_packet(ctx, &raw.bytes, raw.wallclock, dts);
    }
    ctx.sink.send();
    crate::gen::age_out_eit_buffers(ctx, ctx.last_dts.unwrap_or(0));
}

fn handle_packet<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    bytes: &[u8; PACKET_SIZE],
    wallclock: i64,
    dts: i64,
) {
    if !Packet::is_sync_byte(bytes[0]) {
        log::warn!("TS sync byte lost");
        return;
    }
    let pk = Packet::new(bytes);

    if pk.transport_error_indicator() {
        note_transport_error(ctx, wallclock);
    }

    let pid = pk.pid();
    if let Some(last) = ctx.pids.slot(pid).last_cc {
        if pk.has_payload() {
            let expected = (last + 1) & 0x0F;
            if pk.continuity_counter() != expected && pk.continuity_counter() != last {
                log::warn!("continuity discontinuity on pid {pid}: expected {expected}, got {}", pk.continuity_counter());
            }
        }
    }
    if pk.has_payload() {
        ctx.pids.slot_mut(pid).last_cc = Some(pk.continuity_counter());
    }

    route_psi(ctx, pid, &pk, bytes, dts);

    if let Some(pcr) = pk.pcr() {
        update_pcr_anchor(ctx, pid, pcr, dts);
    }

    forward_to_outputs(ctx, pid, &pk, bytes, dts);
}

/// Transport-error-indicator watchdog (spec §4.10 step 4, §7 kind 1): counts toward
/// `max_errors` within `watchdog_wait`, decaying after a quiescent window, and requesting a
/// source reset on threshold breach.
fn note_transport_error<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, wallclock: i64) {
    let window_us = ctx.config.watchdog_wait.as_micros() as i64;
    match ctx.tei_window_start {
        Some(start) if wallclock - start <= window_us => {
            ctx.tei_errors += 1;
        }
        _ => {
            ctx.tei_window_start = Some(wallclock);
            ctx.tei_errors = 1;
        }
    }
    if ctx.tei_errors > ctx.config.max_errors {
        log::error!("transport-error-indicator threshold exceeded, resetting source");
        ctx.source.reset();
        ctx.tei_errors = 0;
        ctx.tei_window_start = None;
    }
}

fn route_psi<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    pid: u16,
    pk: &Packet,
    bytes: &[u8; PACKET_SIZE],
    dts: i64,
) {
    if pid == TDT_PID || pid == RST_PID {
        let ids: Vec<OutputId> = ctx
            .output_ids()
            .filter(|&id| {
                let o = ctx.output(id).unwrap();
                o.config.dvb && o.sdt.bytes.is_some()
            })
            .collect();
        for id in ids {
            ctx.sink.put(id, OutPacket { bytes: *bytes, dts });
        }
        return;
    }

    if ctx.pids.slot(pid).psi_refcount == 0 {
        return;
    }
    let Some(payload) = pk.payload() else { return };
    let cc = pk.continuity_counter();

    match pid {
        PAT_PID => handlers::pat::handle(ctx, cc, payload, dts),
        SDT_PID => handlers::sdt::handle(ctx, cc, payload, dts),
        NIT_PID => handlers::nit_eit::handle_nit(ctx, cc, payload),
        EIT_PID => handlers::nit_eit::handle_eit(ctx, cc, payload, dts),
        _ => handlers::pmt::handle(ctx, pid, cc, payload, dts),
    }
}

/// Updates every output whose service names `pid` as PCR PID (spec §4.10 step 6).
fn update_pcr_anchor<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, pid: u16, pcr: u64, dts: i64) {
    if pid == PADDING_PID {
        return;
    }
    let sids: Vec<u16> = ctx
        .services
        .iter()
        .filter(|s| {
            s.current_pmt
                .as_deref()
                .map(|b| crate::psi::pmt::body(b).pcr_pid() == pid)
                .unwrap_or(false)
        })
        .map(|s| s.sid)
        .collect();
    if sids.is_empty() {
        return;
    }
    let ids: Vec<OutputId> = ctx.output_ids().filter(|&id| sids.contains(&ctx.output(id).unwrap().config.sid)).collect();
    for id in ids {
        if let Some(out) = ctx.output_mut(id) {
            out.pcr_anchor = Some(crate::output::PcrAnchor { stream_timestamp: pcr, wallclock_timestamp: dts });
        }
    }
}

/// Per-output forwarding (spec §4.10 step 7-8): pushes `bytes` to every output subscribed to
/// `pid` (via `pid.outputs`), to every raw/passthrough output, and to the global duplicate
/// output if set. Watched outputs get a cheap descrambling sanity check.
fn forward_to_outputs<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    pid: u16,
    pk: &Packet,
    bytes: &[u8; PACKET_SIZE],
    dts: i64,
) {
    let mut targets: Vec<OutputId> = ctx.pids.outputs_of(pid).collect();
    for &raw_id in &ctx.raw_outputs {
        if !targets.contains(&raw_id) {
            targets.push(raw_id);
        }
    }

    for id in targets {
        check_watched_output(ctx, id, pid, pk, dts);
        ctx.sink.put(id, OutPacket { bytes: *bytes, dts });
    }

    if let Some(dup) = ctx.duplicate_output {
        ctx.sink.put(dup, OutPacket { bytes: *bytes, dts });
    }
}

/// Validates a watched output's descrambling health on PES unit-starts (spec §4.10 step 7):
/// scrambling-control bit must be clear, and PES-carrying PIDs must start with the
/// `0x00 0x00 0x01` start code. Only tracks error counters and triggers a targeted CA reset
/// on threshold breach; the packet is forwarded regardless (spec §7 kind 4).
fn check_watched_output<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    id: OutputId,
    pid: u16,
    pk: &Packet,
    dts: i64,
) {
    let (watch, carries_pes) = match ctx.output(id) {
        Some(o) => (o.config.watch, ctx.pids.slot(pid).carries_pes),
        None => return,
    };
    if !watch || !pk.payload_unit_start_indicator() {
        return;
    }
    let bad = pk.is_scrambled()
        || (carries_pes
            && pk
                .payload()
                .map(|p| p.len() < 3 || p[0..3] != [0x00, 0x00, 0x01])
                .unwrap_or(true));
    if !bad {
        return;
    }
    let out = match ctx.output_mut(id) {
        Some(o) => o,
        None => return,
    };
    out.error_counter += 1;
    out.last_error_wallclock = Some(dts);
    if out.error_counter > ctx.config.max_errors {
        log::error!("output descrambling watchdog tripped, resetting CA");
        ctx.ca.reset();
        if let Some(out) = ctx.output_mut(id) {
            out.error_counter = 0;
            out.last_error_wallclock = None;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::context::DemuxContext;
    use crate::output::OutputConfig;
    use crate::testutil::{FakeCa, FakeSink, FakeSource};

    fn new_ctx() -> DemuxContext<FakeSource, FakeSink, FakeCa> {
        DemuxContext::new(DemuxConfig::default(), FakeSource::default(), FakeSink::default(), FakeCa::default())
    }

    fn raw_packet(pid: u16, cc: u8, scrambled: bool) -> RawPacket {
        let mut buf = [0u8; PACKET_SIZE];
        buf[0] = 0x47;
        buf[1] = 0x40 | ((pid >> 8) as u8 & 0x1F); // payload_unit_start_indicator
        buf[2] = (pid & 0xFF) as u8;
        buf[3] = (if scrambled { 0x80 } else { 0x00 }) | 0x10 | (cc & 0x0F);
        buf[4..7].copy_from_slice(&[0x00, 0x00, 0x01]); // valid PES start code
        RawPacket { bytes: buf, wallclock: 0 }
    }

    #[test]
    fn scrambled_packet_on_watched_output_is_still_forwarded() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 0, pid_list: vec![0x100], watch: true, ..Default::default() });
        ctx.pids.slot_mut(0x100).carries_pes = true;
        ctx.run(vec![raw_packet(0x100, 0, true)]);
        assert_eq!(ctx.sink.packets.len(), 1);
        assert_eq!(ctx.output(id).unwrap().error_counter, 1);
    }

    #[test]
    fn descrambling_watchdog_resets_ca_past_threshold_without_dropping_packets() {
        let mut ctx = new_ctx();
        ctx.config.max_errors = 2;
        let id = ctx.add_output(OutputConfig { sid: 0, pid_list: vec![0x100], watch: true, ..Default::default() });
        ctx.pids.slot_mut(0x100).carries_pes = true;
        for i in 0..4u8 {
            ctx.run(vec![raw_packet(0x100, i, true)]);
        }
        assert_eq!(ctx.sink.packets.len(), 4);
        assert_eq!(ctx.ca.reset_count, 1);
        assert_eq!(ctx.output(id).unwrap().error_counter, 0);
    }

    #[test]
    fn transport_error_indicator_past_threshold_resets_source() {
        let mut ctx = new_ctx();
        ctx.config.max_errors = 1;
        let mut buf = [0u8; PACKET_SIZE];
        buf[0] = 0x47;
        buf[1] = 0x80; // transport_error_indicator set, pid 0
        buf[3] = 0x10;
        for i in 0..3u8 {
            let mut p = buf;
            p[3] = 0x10 | (i & 0x0F);
            ctx.run(vec![RawPacket { bytes: p, wallclock: i as i64 }]);
        }
        assert_eq!(ctx.source.reset_count, 1);
    }
}
