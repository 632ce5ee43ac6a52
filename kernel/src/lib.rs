// Sourcelog Kernel
//
// Event-sourced storage primitives: the source log, engine-neutral
// queries, and idempotent stream repositories layered on lease
// uniqueness.

pub mod log;
pub mod envelope;
pub mod query;
pub mod state;
pub mod invariants;
pub mod replay;
pub mod adapters;
pub mod stream;
pub mod decorators;
pub mod agent;
pub mod config;
pub mod provision;
