//! PMT handler (spec §4.5): single-section table, byte-identity shortcut, ES/PCR PID
//! diffing, and CA add/update/delete transitions.
//!
//! Grounded on `original_source/demux.c` `HandlePMT`/`PMTNeedsDescrambling`.

use crate::ca::{CaCoordinator, CaPmtInfo};
use crate::config::PADDING_PID;
use crate::context::DemuxContext;
use crate::output::OutputId;
use crate::psi::pmt;
use crate::sink::Sink;
use crate::source::Source;

/// Feeds one PMT-PID packet's payload through reassembly, applying the PMT diff to every
/// section that completes (PMT is always a single section).
pub fn handle<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    pid: u16,
    cc: u8,
    payload: &[u8],
    dts: i64,
) {
    let mut sections = Vec::new();
    ctx.pids.slot_mut(pid).psi_buffer.push_packet(cc, payload, &mut sections);
    for section in sections {
        handle_section(ctx, pid, &section, dts);
    }
}

fn handle_section<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    pid: u16,
    section: &[u8],
    dts: i64,
) {
    let (common, syntax) = match crate::psi::validate_section(pid, section) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("invalid PMT section on pid {pid}: {e}");
            return;
        }
    };
    if common.table_id() != pmt::TABLE_ID {
        log::warn!("unexpected table_id {:#x} on PMT pid {pid}", common.table_id());
        return;
    }
    let sid = pmt::program_number(&syntax);
    let expected_pid = match ctx.services.find(sid) {
        Some(s) => s.pmt_pid,
        None => {
            log::warn!("PMT for unknown sid {sid} on pid {pid}");
            return;
        }
    };
    if expected_pid != pid {
        log::warn!("PMT for sid {sid} seen on pid {pid}, expected {expected_pid}");
        return;
    }

    let old_bytes = ctx.services.find(sid).unwrap().current_pmt.clone();
    if old_bytes.as_deref() == Some(section) {
        resend(ctx, sid, pid, dts);
        return;
    }

    let body = pmt::body(section);
    let old_body = old_bytes.as_deref().map(pmt::body);

    for s in body.streams() {
        ctx.pids.slot_mut(s.elementary_pid()).carries_pes = s.carries_pes();
    }

    let new_pcr = body.pcr_pid();
    let old_pcr = old_body.as_ref().map(|b| b.pcr_pid());
    if old_pcr != Some(new_pcr) {
        if new_pcr != PADDING_PID && new_pcr != pid {
            ctx.select_pid(sid, new_pcr);
        }
        if let Some(op) = old_pcr {
            if op != PADDING_PID && op != pid {
                ctx.unselect_pid(sid, op);
            }
        }
    }

    let new_selected: Vec<u16> = body.streams().filter(|s| s.would_be_selected()).map(|s| s.elementary_pid()).collect();
    let old_selected: Vec<u16> = old_body
        .as_ref()
        .map(|b| b.streams().filter(|s| s.would_be_selected()).map(|s| s.elementary_pid()).collect())
        .unwrap_or_default();
    for &epid in &new_selected {
        if !old_selected.contains(&epid) {
            ctx.select_pid(sid, epid);
        }
    }
    for &epid in &old_selected {
        if !new_selected.contains(&epid) {
            ctx.unselect_pid(sid, epid);
        }
    }

    let new_needs = body.needs_descrambling();
    let was_needs = ctx.services.find(sid).unwrap().needs_descrambling;
    let is_selected = ctx.sid_is_selected(sid);
    if is_selected {
        match (was_needs, new_needs) {
            (false, true) => {
                let info = CaPmtInfo { sid, pmt_pid: pid, pmt_section: section.to_vec() };
                ctx.ca.add_pmt(&info);
                ctx.ca_active_sids.insert(sid);
            }
            (true, true) => {
                let info = CaPmtInfo { sid, pmt_pid: pid, pmt_section: section.to_vec() };
                ctx.ca.update_pmt(&info);
            }
            (true, false) => {
                let info = CaPmtInfo {
                    sid,
                    pmt_pid: pid,
                    pmt_section: old_bytes.clone().unwrap_or_default(),
                };
                ctx.ca.delete_pmt(&info);
                ctx.ca_active_sids.remove(&sid);
            }
            (false, false) => {}
        }
    }

    {
        let svc = ctx.services.find_mut(sid).unwrap();
        svc.current_pmt = Some(section.to_vec());
        svc.needs_descrambling = new_needs;
    }

    let ids: Vec<OutputId> = ctx.output_ids().filter(|&id| ctx.output(id).unwrap().config.sid == sid).collect();
    for id in ids {
        crate::gen::update_pmt(ctx, id);
        crate::gen::send_one(ctx, id, pid, dts, |o| &mut o.pmt);
    }
}

/// Byte-identical PMT: no diffing, no CA call, but still pushed downstream (spec §4.5 "skip
/// re-processing but still send PMT downstream").
fn resend<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, sid: u16, pid: u16, dts: i64) {
    let ids: Vec<OutputId> = ctx.output_ids().filter(|&id| ctx.output(id).unwrap().config.sid == sid).collect();
    for id in ids {
        crate::gen::send_one(ctx, id, pid, dts, |o| &mut o.pmt);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::context::DemuxContext;
    use crate::output::OutputConfig;
    use crate::psi::pmt::BuiltStream;
    use crate::testutil::{FakeCa, FakeSink, FakeSource};

    fn new_ctx() -> DemuxContext<FakeSource, FakeSink, FakeCa> {
        let mut ctx = DemuxContext::new(DemuxConfig::default(), FakeSource::default(), FakeSink::default(), FakeCa::default());
        ctx.services.allocate(1, 0x100);
        ctx
    }

    fn feed(ctx: &mut DemuxContext<FakeSource, FakeSink, FakeCa>, section: &[u8], dts: i64) {
        let mut payload = vec![0u8];
        payload.extend_from_slice(section);
        handle(ctx, 0x100, 0, &payload, dts);
    }

    #[test]
    fn version_bump_selects_new_pid_and_regenerates_pmt() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, ..Default::default() });

        let streams = [BuiltStream { stream_type: 0x03, pid: 0x102, descriptors: &[] }];
        let section = pmt::build(1, 0, 0x101, &[], &streams, false);
        feed(&mut ctx, &section, 0);
        assert!(ctx.pids.slot(0x101).filter_refcount > 0);
        assert!(ctx.pids.slot(0x102).filter_refcount > 0);
        let pmt_bytes = ctx.output(id).unwrap().pmt.bytes.clone().unwrap();
        let got: Vec<_> = pmt::body(&pmt_bytes).streams().map(|s| s.elementary_pid()).collect();
        assert_eq!(got, vec![0x102]);

        let streams = [
            BuiltStream { stream_type: 0x03, pid: 0x102, descriptors: &[] },
            BuiltStream { stream_type: 0x02, pid: 0x103, descriptors: &[] },
        ];
        let section = pmt::build(1, 1, 0x101, &[], &streams, false);
        feed(&mut ctx, &section, 1000);
        assert!(ctx.pids.slot(0x103).filter_refcount > 0);
        let pmt_bytes = ctx.output(id).unwrap().pmt.bytes.clone().unwrap();
        let mut got: Vec<_> = pmt::body(&pmt_bytes).streams().map(|s| s.elementary_pid()).collect();
        got.sort_unstable();
        assert_eq!(got, vec![0x102, 0x103]);
    }

    #[test]
    fn explicit_pid_list_overrides_auto_selection() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, pid_list: vec![0x100, 0x102], ..Default::default() });

        let streams = [
            BuiltStream { stream_type: 0x03, pid: 0x102, descriptors: &[] },
            BuiltStream { stream_type: 0x02, pid: 0x103, descriptors: &[] },
        ];
        let section = pmt::build(1, 0, 0x101, &[], &streams, false);
        feed(&mut ctx, &section, 0);

        let pmt_bytes = ctx.output(id).unwrap().pmt.bytes.clone().unwrap();
        let got: Vec<_> = pmt::body(&pmt_bytes).streams().map(|s| s.elementary_pid()).collect();
        assert_eq!(got, vec![0x102]);
    }

    #[test]
    fn ca_descriptor_added_then_removed_fires_add_then_delete() {
        let mut ctx = new_ctx();
        let _id = ctx.add_output(OutputConfig { sid: 1, ..Default::default() });

        let streams = [BuiltStream { stream_type: 0x03, pid: 0x102, descriptors: &[] }];
        let section = pmt::build(1, 0, 0x101, &[], &streams, false);
        feed(&mut ctx, &section, 0);
        assert!(ctx.ca.added.is_empty());

        let ca_desc = [0x09u8, 0x01, 0x00];
        let section = pmt::build(1, 1, 0x101, &ca_desc, &streams, false);
        feed(&mut ctx, &section, 1000);
        assert_eq!(ctx.ca.added.len(), 1);
        assert_eq!(ctx.ca.added[0].sid, 1);

        let section = pmt::build(1, 2, 0x101, &[], &streams, false);
        feed(&mut ctx, &section, 2000);
        assert_eq!(ctx.ca.deleted.len(), 1);
    }
}
