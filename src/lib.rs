//! probebeat - network probes and an SNMP trap receiver.
//!
//! Tasks are read from a TOML config, cleaned and stamped with a stable
//! identity, then driven by the [`scheduler::Scheduler`]. Every task writes
//! [`event::Event`]s into one channel that the event writer drains.

pub mod config;
pub mod context;
pub mod define;
pub mod event;
pub mod resolve;
pub mod scheduler;
pub mod semaphore;
pub mod tasks;
pub mod utils;
