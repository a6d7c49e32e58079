//! The 8192-slot PID table (spec §3, §4.1): per-PID filter/PSI refcounts, continuity
//! tracking, section reassembly state, and the sparse list of outputs subscribed to each
//! PID.
//!
//! Grounded on the teacher's `Filters<F>` — a sparse `Vec<Option<F>>` keyed by PID with
//! lowest-index-reuse insert (`Filters::insert`/`Filters::remove` in `demultiplex.rs`) —
//! generalized from "one filter per PID" to "N refcounts plus a sparse output list per PID";
//! and on `original_source/demux.c` `SetPID`/`UnsetPID`/`StartPID`/`StopPID` for the exact
//! refcount and NULL-slot-reuse discipline (spec §4.1).

use crate::config::PID_COUNT;
use crate::output::OutputId;
use crate::psi::SectionAssembler;
use crate::source::{Source, SourceHandle};

/// Per-PID state (spec §3 "PID slot").
#[derive(Debug)]
pub struct PidSlot {
    pub filter_refcount: u32,
    pub psi_refcount: u32,
    /// Advisory flag set from PMT `stream_type` (spec §3, §4.9 `carries_pes`).
    pub carries_pes: bool,
    pub last_cc: Option<u8>,
    pub source_handle: Option<SourceHandle>,
    pub psi_buffer: SectionAssembler,
    /// Sparse; `None` slots are preserved to keep other outputs' indices stable (spec §3,
    /// §4.1 tie-break: "NULL-slot reuse is deterministic (lowest index)").
    pub outputs: Vec<Option<OutputId>>,
}

impl Default for PidSlot {
    fn default() -> Self {
        PidSlot {
            filter_refcount: 0,
            psi_refcount: 0,
            carries_pes: false,
            last_cc: None,
            source_handle: None,
            psi_buffer: SectionAssembler::new(),
            outputs: Vec::new(),
        }
    }
}

/// The full 8192-entry table, indexed by 13-bit PID.
pub struct PidTable {
    slots: Vec<PidSlot>,
}

impl PidTable {
    pub fn new() -> PidTable {
        let mut slots = Vec::with_capacity(PID_COUNT);
        slots.resize_with(PID_COUNT, PidSlot::default);
        PidTable { slots }
    }

    pub fn slot(&self, pid: u16) -> &PidSlot {
        &self.slots[pid as usize]
    }

    pub fn slot_mut(&mut self, pid: u16) -> &mut PidSlot {
        &mut self.slots[pid as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &PidSlot)> {
        self.slots.iter().enumerate().map(|(i, s)| (i as u16, s))
    }

    /// Total filter_refcount across all PIDs, used by the universal invariant in spec §8:
    /// "The sum over all PIDs of filter_refcount equals the number of live (output, reason)
    /// subscriptions plus PSI subscriptions."
    pub fn total_filter_refcount(&self) -> u64 {
        self.slots.iter().map(|s| u64::from(s.filter_refcount)).sum()
    }

    /// Bumps `filter_refcount`; on 0->1 (and not in budget mode) asks the source to install
    /// a filter (spec §4.1 `SetPID`).
    pub fn set_pid<S: Source>(&mut self, source: &mut S, budget_mode: bool, pid: u16) {
        let slot = self.slot_mut(pid);
        slot.filter_refcount += 1;
        if !budget_mode && slot.filter_refcount == 1 && slot.source_handle.is_none() {
            match source.set_filter(pid) {
                Ok(handle) => slot.source_handle = Some(handle),
                Err(e) => log::error!("failed to install filter for pid {pid}: {e}"),
            }
        }
    }

    /// Decrements `filter_refcount`; on 1->0 releases the source filter (spec §4.1
    /// `UnsetPID`).
    pub fn unset_pid<S: Source>(&mut self, source: &mut S, budget_mode: bool, pid: u16) {
        let slot = self.slot_mut(pid);
        debug_assert!(slot.filter_refcount > 0, "UnsetPID on pid {pid} with zero refcount");
        slot.filter_refcount = slot.filter_refcount.saturating_sub(1);
        if !budget_mode && slot.filter_refcount == 0 {
            if let Some(handle) = slot.source_handle.take() {
                source.unset_filter(handle, pid);
            }
        }
    }

    /// Subscribes `output` to `pid` if not already present, reusing the lowest-index `None`
    /// slot before growing (spec §4.1 `StartPID`). No-op if already subscribed.
    pub fn start_pid<S: Source>(
        &mut self,
        source: &mut S,
        budget_mode: bool,
        output: OutputId,
        pid: u16,
    ) {
        let slot = self.slot_mut(pid);
        if slot.outputs.iter().flatten().any(|&o| o == output) {
            return;
        }
        match slot.outputs.iter().position(Option::is_none) {
            Some(idx) => slot.outputs[idx] = Some(output),
            None => slot.outputs.push(Some(output)),
        }
        self.set_pid(source, budget_mode, pid);
    }

    /// Unsubscribes `output` from `pid`, nulling its slot in place (spec §4.1 `StopPID`).
    /// No-op if not currently subscribed.
    pub fn stop_pid<S: Source>(
        &mut self,
        source: &mut S,
        budget_mode: bool,
        output: OutputId,
        pid: u16,
    ) {
        let slot = self.slot_mut(pid);
        if let Some(idx) = slot.outputs.iter().position(|o| *o == Some(output)) {
            slot.outputs[idx] = None;
            self.unset_pid(source, budget_mode, pid);
        }
    }

    pub fn outputs_of(&self, pid: u16) -> impl Iterator<Item = OutputId> + '_ {
        self.slot(pid).outputs.iter().filter_map(|o| *o)
    }
}

impl Default for PidTable {
    fn default() -> Self {
        PidTable::new()
    }
}
