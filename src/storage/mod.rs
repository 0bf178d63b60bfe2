//! The storage engine: block pool, file/tag metadata tree, deduplication
//! and copy-on-write.
//!
//! # Layout
//!
//! Under a mount point:
//! - `superblock` — `FS_SIZE`, `BLOCK_SIZE`.
//! - `bitmap` — one bit per physical block, memory-mapped.
//! - `physical_blocks/block%04d` — fixed-size block files.
//! - `files/<file>/<tag>/metadata` — `{size, blocks=[...], state}`.
//! - `hash_index` — content-hash → physical-block-number, for dedup at
//!   COMMIT time.
//!
//! The spec's own design notes (§9) allow the logical→physical mapping to
//! be "best modelled abstractly as reference-counted content-addressed
//! storage" instead of literal hard links; this implementation takes that
//! option (see `file_tag` and `block_pool`) and maintains an explicit
//! refcount rebuilt from the metadata tree at start-up.
//!
//! # Copy-on-write
//!
//! A physical block is shared if its refcount is >= 2, or it is block 0.
//! Every WRITE that touches a shared block allocates a private copy before
//! mutating — unconditionally, with no bypass. The original engine had a
//! `storage_write_block` path whose "shared" predicate always returned
//! false; this rewrite does not carry that bug forward (see
//! `SPEC_FULL.md` §4.4 "Open question resolved").

mod bitmap;
mod block_pool;
mod engine;
mod error;
mod file_tag;
mod hash_index;
pub mod protocol;
mod superblock;

pub use engine::{StorageEngine, INITIAL_FILE, INITIAL_TAG};
pub use error::StorageError;
pub use file_tag::TagState;
