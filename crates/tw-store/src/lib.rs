//! Durable storage port for the Tradewind runtime.
//!
//! The runtime persists orders, fills, and portfolio snapshots through the
//! [`Repository`] trait before acknowledging them downstream. The schema and
//! durable backend live outside the core; the bundled [`MemoryRepository`] is
//! the single-process default and the standard test fixture.

pub mod memory;
pub mod repository;

pub use memory::MemoryRepository;
pub use repository::{Repository, StoreError, StoreResult};
