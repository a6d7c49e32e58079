//! Fake `Source`/`Sink`/`CaCoordinator` implementations shared by unit tests across modules.
//!
//! Grounded on `pidtable.rs`'s own inline `FakeSource` (test module), generalized into one
//! shared set so handler and dispatcher tests don't each reinvent it.

use crate::ca::{CaCoordinator, CaPmtInfo};
use crate::output::OutputId;
use crate::sink::{OutPacket, Sink};
use crate::source::{RawPacket, Source, SourceHandle};

#[derive(Default)]
pub struct FakeSource {
    next_handle: u64,
    pub filtered: Vec<u16>,
    pub reset_count: u32,
}

impl Source for FakeSource {
    fn open(&mut self) -> std::io::Result<()> {
        Ok(())
    }
    fn read(&mut self) -> std::io::Result<Vec<RawPacket>> {
        Ok(Vec::new())
    }
    fn set_filter(&mut self, pid: u16) -> std::io::Result<SourceHandle> {
        self.filtered.push(pid);
        self.next_handle += 1;
        Ok(SourceHandle(self.next_handle))
    }
    fn unset_filter(&mut self, _handle: SourceHandle, pid: u16) {
        self.filtered.retain(|&p| p != pid);
    }
    fn reset(&mut self) {
        self.reset_count += 1;
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub packets: Vec<(OutputId, OutPacket)>,
    pub sends: u32,
}

impl Sink for FakeSink {
    fn put(&mut self, output: OutputId, packet: OutPacket) {
        self.packets.push((output, packet));
    }
    fn send(&mut self) {
        self.sends += 1;
    }
}

#[derive(Default)]
pub struct FakeCa {
    pub added: Vec<CaPmtInfo>,
    pub updated: Vec<CaPmtInfo>,
    pub deleted: Vec<CaPmtInfo>,
    pub reset_count: u32,
}

impl CaCoordinator for FakeCa {
    fn add_pmt(&mut self, pmt: &CaPmtInfo) {
        self.added.push(pmt.clone());
    }
    fn update_pmt(&mut self, pmt: &CaPmtInfo) {
        self.updated.push(pmt.clone());
    }
    fn delete_pmt(&mut self, pmt: &CaPmtInfo) {
        self.deleted.push(pmt.clone());
    }
    fn reset(&mut self) {
        self.reset_count += 1;
    }
}
