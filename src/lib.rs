//! Distributed query execution platform: a scheduler (master) dispatches
//! query scripts to workers, which execute them against a paged view of a
//! content-addressed block storage engine. See `spec.md`/`SPEC_FULL.md` in
//! the repository root for the wire protocol and semantics; each module
//! below corresponds to one of the three server roles plus the client
//! library and the pieces they share.

pub mod client;
pub mod config;
pub mod query;
pub mod scheduler;
pub mod storage;
pub mod tools;
pub mod wire;
pub mod worker;
