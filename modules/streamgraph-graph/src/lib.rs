pub mod backend;
pub mod client;
pub mod memory;
pub mod migrate;
pub mod plan;
pub mod reader;
pub mod writer;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use backend::{BackendError, CommitMode, GraphBackend, UpsertResponse};
pub use client::GraphClient;
pub use memory::{GraphSnapshot, MemoryGraph, StoredPost, StoredUser};
pub use neo4rs::query;
pub use plan::{build_upsert_plan, Placeholder, UpsertPlan, UserSlot};
pub use reader::{GraphReader, PostRow, RankedUser, UserRow};
pub use writer::GraphWriter;
