//! PAT handler (spec §4.4): reassembly, version/byte-identity shortcut, TSID adoption, and
//! per-program diffing that drives `SelectPSI`/`UnselectPSI` and service registry updates.
//!
//! Grounded on `original_source/demux.c` `HandlePAT`/`UpdateTSID`/`DeleteProgram`.

use crate::ca::{CaCoordinator, CaPmtInfo};
use crate::config::{NIT_PID, PADDING_PID, PAT_PID};
use crate::context::{self, DemuxContext};
use crate::output::OutputId;
use crate::psi::pat::{self, ProgramEntry};
use crate::psi::{pmt, PsiTable};
use crate::sink::Sink;
use crate::source::Source;

/// Feeds one PAT-PID packet's payload through reassembly, applying the PAT diff to every
/// section that completes a table.
pub fn handle<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    cc: u8,
    payload: &[u8],
    dts: i64,
) {
    let mut sections = Vec::new();
    ctx.pids.slot_mut(PAT_PID).psi_buffer.push_packet(cc, payload, &mut sections);
    for section in sections {
        handle_section(ctx, &section, dts);
    }
}

fn handle_section<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, section: &[u8], dts: i64) {
    let (common, syntax) = match crate::psi::validate_section(PAT_PID, section) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("invalid PAT section: {e}");
            return;
        }
    };
    if common.table_id() != pat::TABLE_ID {
        log::warn!("unexpected table_id {:#x} on PAT PID", common.table_id());
        return;
    }
    if !ctx.pat_cache.next.insert(&syntax, section.to_vec()) {
        return;
    }
    let next = ctx.pat_cache.next.take();
    apply(ctx, next, dts);
}

fn apply<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, next: PsiTable, dts: i64) {
    if !next.byte_equal(&ctx.pat_cache.current) {
        let old = std::mem::replace(&mut ctx.pat_cache.current, next);
        let new_tsid = ctx.pat_cache.current.table_id_extension();
        if old.table_id_extension() != new_tsid {
            if let Some(tsid) = new_tsid {
                update_tsid(ctx, tsid);
            }
        }
        diff_programs(ctx, &old, dts);
    }
    let ids: Vec<OutputId> = ctx.output_ids().collect();
    for id in ids {
        if ctx.output(id).map(|o| o.config.sid != 0).unwrap_or(false) {
            crate::gen::send_one(ctx, id, PAT_PID, dts, |o| &mut o.pat);
        }
    }
}

/// `UpdateTSID` (spec §4.4): every non-`fixed_tsid` output adopts the new TSID and
/// regenerates everything but its PMT (spec §4.11's tsid_change rule, applied uniformly).
fn update_tsid<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, new_tsid: u16) {
    ctx.tsid = Some(new_tsid);
    log::info!("TSID changed to {new_tsid}");
    let ids: Vec<OutputId> = ctx
        .output_ids()
        .filter(|&id| ctx.output(id).map(|o| !o.config.fixed_tsid).unwrap_or(false))
        .collect();
    for id in ids {
        ctx.output_mut(id).unwrap().config.tsid = new_tsid;
        crate::gen::update_pat(ctx, id);
        crate::gen::update_nit(ctx, id);
        crate::gen::update_sdt(ctx, id);
    }
}

/// Program entries with `program_number == 0` (the NIT-PID announcement, spec §4.4 step 4)
/// dropped; warns if that entry names a PID other than the well-known `NIT_PID`.
fn program_entries(table: &PsiTable) -> Vec<ProgramEntry> {
    table
        .sections()
        .flat_map(|s| pat::programs(s).programs())
        .filter(|p| {
            if p.program_number == 0 {
                if p.pid != NIT_PID {
                    log::warn!("PAT names NIT on non-standard pid {} (expected {NIT_PID})", p.pid);
                }
                false
            } else {
                true
            }
        })
        .collect()
}

/// Drops program entries that claim a reserved PSI/SI PID as their PMT PID, warning once per
/// entry: selecting one of those would fight the permanent `psi_refcount` floor
/// `DemuxContext::new` installs for them.
fn reject_reserved_pmt_pids(programs: Vec<ProgramEntry>) -> Vec<ProgramEntry> {
    programs
        .into_iter()
        .filter(|p| {
            if context::is_reserved_psi_pid(p.pid) {
                log::warn!("PAT names reserved pid {} as PMT for program {}, ignoring", p.pid, p.program_number);
                false
            } else {
                true
            }
        })
        .collect()
}

fn diff_programs<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, old: &PsiTable, dts: i64) {
    let new_programs = reject_reserved_pmt_pids(program_entries(&ctx.pat_cache.current));
    let old_programs = reject_reserved_pmt_pids(program_entries(old));

    for p in &new_programs {
        match old_programs.iter().find(|o| o.program_number == p.program_number) {
            Some(o) if o.pid == p.pid => {}
            Some(o) => {
                delete_program(ctx, p.program_number, o.pid, dts);
                select_program(ctx, p.program_number, p.pid, dts);
            }
            None => select_program(ctx, p.program_number, p.pid, dts),
        }
    }
    for o in &old_programs {
        if !new_programs.iter().any(|p| p.program_number == o.program_number) {
            delete_program(ctx, o.program_number, o.pid, dts);
        }
    }
}

fn select_program<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    sid: u16,
    pmt_pid: u16,
    dts: i64,
) {
    ctx.select_psi(sid, pmt_pid);
    if ctx.services.find(sid).is_some() {
        ctx.services.find_mut(sid).unwrap().pmt_pid = pmt_pid;
    } else {
        ctx.services.allocate(sid, pmt_pid);
    }
    update_pat_for_sid(ctx, sid, dts);
}

/// `DeleteProgram(sid, pmt_pid)` (spec §4.4): unselects PSI and every PID the service's last
/// PMT named, notifies CA if it was an active descrambling transition, and clears the
/// service slot.
fn delete_program<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    sid: u16,
    pmt_pid: u16,
    dts: i64,
) {
    ctx.unselect_psi(sid, pmt_pid);
    if let Some(service) = ctx.services.find(sid).cloned() {
        if let Some(pmt_bytes) = &service.current_pmt {
            if ctx.sid_is_selected(sid) && service.needs_descrambling {
                let info = CaPmtInfo {
                    sid,
                    pmt_pid: service.pmt_pid,
                    pmt_section: pmt_bytes.clone(),
                };
                ctx.ca.delete_pmt(&info);
                ctx.ca_active_sids.remove(&sid);
            }
            let body = pmt::body(pmt_bytes);
            let pcr_pid = body.pcr_pid();
            if pcr_pid != PADDING_PID && pcr_pid != service.pmt_pid {
                ctx.unselect_pid(sid, pcr_pid);
            }
            for s in body.streams().filter(|s| s.would_be_selected()) {
                ctx.unselect_pid(sid, s.elementary_pid());
            }
        }
    }
    ctx.services.clear(sid);
    update_pat_for_sid(ctx, sid, dts);
}

fn update_pat_for_sid<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, sid: u16, _dts: i64) {
    let ids: Vec<OutputId> = ctx.output_ids().filter(|&id| ctx.output(id).unwrap().config.sid == sid).collect();
    for id in ids {
        crate::gen::update_pat(ctx, id);
        crate::gen::update_pmt(ctx, id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::context::{ChangeRequest, TsidRequest};
    use crate::output::OutputConfig;
    use crate::testutil::{FakeCa, FakeSink, FakeSource};

    fn feed_pat(ctx: &mut DemuxContext<FakeSource, FakeSink, FakeCa>, cc: u8, program: Option<ProgramEntry>, dts: i64) {
        let section = pat::build(0, 0, program);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        handle(ctx, cc, &payload, dts);
    }

    fn new_ctx() -> DemuxContext<FakeSource, FakeSink, FakeCa> {
        DemuxContext::new(DemuxConfig::default(), FakeSource::default(), FakeSink::default(), FakeCa::default())
    }

    #[test]
    fn empty_pat_produces_empty_outbound_pat() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, ..Default::default() });
        feed_pat(&mut ctx, 0, Some(ProgramEntry { program_number: 1, pid: 0x100 }), 0);
        let pat_bytes = ctx.output(id).unwrap().pat.bytes.clone().unwrap();
        let progs: Vec<_> = pat::programs(&pat_bytes).programs().collect();
        assert_eq!(progs, vec![ProgramEntry { program_number: 1, pid: 0x100 }]);
        assert!(ctx.services.find(1).is_some());
    }

    #[test]
    fn sid_removed_from_pat_clears_service_and_pat() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, ..Default::default() });
        feed_pat(&mut ctx, 0, Some(ProgramEntry { program_number: 1, pid: 0x100 }), 0);
        assert!(ctx.services.find(1).is_some());

        feed_pat(&mut ctx, 1, None, 1000);
        assert!(ctx.services.find(1).is_none());
        let pat_bytes = ctx.output(id).unwrap().pat.bytes.clone().unwrap();
        assert_eq!(pat::programs(&pat_bytes).programs().count(), 0);
    }

    #[test]
    fn tsid_adoption_updates_non_fixed_outputs() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, ..Default::default() });
        let section = pat::build(42, 0, Some(ProgramEntry { program_number: 1, pid: 0x100 }));
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        handle(&mut ctx, 0, &payload, 0);
        assert_eq!(ctx.output(id).unwrap().config.tsid, 42);

        let section = pat::build(43, 0, Some(ProgramEntry { program_number: 1, pid: 0x100 }));
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        handle(&mut ctx, 1, &payload, 1000);
        assert_eq!(ctx.output(id).unwrap().config.tsid, 43);
    }

    #[test]
    fn fixed_tsid_output_does_not_follow_pat() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 0, ..Default::default() });
        ctx.change(id, ChangeRequest { tsid: TsidRequest::Fixed(7), sid: 1, pid_list: Vec::new() });
        feed_pat(&mut ctx, 0, Some(ProgramEntry { program_number: 1, pid: 0x100 }), 0);
        assert_eq!(ctx.output(id).unwrap().config.tsid, 7);
    }

    #[test]
    fn delete_program_only_notifies_ca_if_the_sid_is_still_selected() {
        let mut ctx = new_ctx();
        feed_pat(&mut ctx, 0, Some(ProgramEntry { program_number: 1, pid: 0x100 }), 0);
        ctx.services.find_mut(1).unwrap().current_pmt = Some(vec![0u8; 8]);
        ctx.services.find_mut(1).unwrap().needs_descrambling = true;
        // No output selects sid 1, but simulate a stale `ca_active_sids` entry (e.g. left over
        // from a prior output that was since removed without an intervening PAT update).
        ctx.ca_active_sids.insert(1);

        feed_pat(&mut ctx, 1, None, 1000);
        assert!(ctx.services.find(1).is_none());
        assert!(ctx.ca.deleted.is_empty());
    }

    #[test]
    fn program_claiming_a_reserved_pid_as_pmt_is_ignored() {
        let mut ctx = new_ctx();
        feed_pat(&mut ctx, 0, Some(ProgramEntry { program_number: 1, pid: PAT_PID }), 0);
        assert!(ctx.services.find(1).is_none());
    }

    /// Pins the ordering of `DeleteProgram` vs. the new `SelectPSI`/service allocation when a
    /// SID reappears at a different PMT PID within the same PAT update (SPEC_FULL.md Open
    /// Question resolution): the old service slot is fully torn down, including any active CA
    /// notification, before the new one is populated.
    #[test]
    fn sid_reappears_at_new_pmt_pid_within_same_pat_update() {
        let mut ctx = new_ctx();
        let _id = ctx.add_output(OutputConfig { sid: 1, ..Default::default() });
        feed_pat(&mut ctx, 0, Some(ProgramEntry { program_number: 1, pid: 0x100 }), 0);
        assert_eq!(ctx.services.find(1).unwrap().pmt_pid, 0x100);

        feed_pat(&mut ctx, 1, Some(ProgramEntry { program_number: 1, pid: 0x200 }), 1000);
        assert_eq!(ctx.services.find(1).unwrap().pmt_pid, 0x200);
        assert!(ctx.services.find(1).unwrap().current_pmt.is_none());
    }
}
