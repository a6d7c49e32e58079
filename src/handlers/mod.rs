//! The five table state machines (spec §4.4–§4.7): PAT, PMT, SDT diffing/versioning, and
//! minimal NIT/EIT handling. Each module owns the handler entry point for its table plus the
//! diffing logic that drives PID (un)selection and CA notification.

pub mod nit_eit;
pub mod pat;
pub mod pmt;
pub mod sdt;
