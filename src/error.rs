//! Errors that can arise while parsing or validating PSI sections and TS packets.
//!
//! Per spec §7, none of these cross the core's public API boundary: handler code logs and
//! discards them (`log::warn!`/`log::error!`), matching "the core never throws... it logs
//! and returns."

use thiserror::Error;

/// Section- and packet-level errors (spec §7 kinds 1-3).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DemuxError {
    #[error("section on PID {pid} failed CRC-32/MPEG-2 check")]
    Crc { pid: u16 },

    #[error("section on PID {pid} truncated: expected at least {expected} bytes, got {got}")]
    Truncated {
        pid: u16,
        expected: usize,
        got: usize,
    },

    #[error("unexpected table_id {table_id:#x} on PID {pid}")]
    UnexpectedTableId { pid: u16, table_id: u8 },

    #[error("PMT seen on PID {pid} does not match any known service's pmt_pid")]
    UnknownPmtPid { pid: u16 },

    #[error("EIT section for unknown service_id {sid}")]
    UnknownSid { sid: u16 },

    #[error("TS sync byte lost")]
    SyncLost,
}
