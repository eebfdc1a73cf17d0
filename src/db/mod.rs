// src/db/mod.rs
// Relational store: pooled SQLite access and per-entity query modules

pub mod conversations;
pub mod costs;
pub mod embeddings;
pub mod memory_units;
pub mod pool;
pub mod projects;
mod schema;

pub use pool::{DatabasePool, PoolStatus};
pub use projects::Project;
