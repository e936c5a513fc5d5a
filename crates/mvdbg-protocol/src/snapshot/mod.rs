//! Execution-state snapshots.
//!
//! A snapshot is a partial capture of a VM's execution state: which fields
//! are present depends on which state types were requested. `parse` turns
//! dump reply lines into [`state::RuntimeState`] values; `wire` serializes a
//! captured state back into chunked hex messages for injection into another
//! VM instance.

pub mod parse;
pub mod state;
pub mod wire;
