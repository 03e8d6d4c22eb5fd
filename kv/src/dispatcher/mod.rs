//! The work dispatcher: a WebSocket-based pipeline/lambda job distributor
//! sitting on top of the on-disk engine (A) for shard persistence and the
//! MVCC store (B) for job/pipeline state. See `server` and `client` for the
//! two sides of the wire protocol, `registry` for the live worker table,
//! `state` for the shared state machines, and `interval` for schedule
//! parsing.

pub mod client;
pub mod interval;
pub mod registry;
pub mod server;
pub mod state;

pub use client::{DispatchClient, LambdaContext};
pub use registry::{WorkerHandle, WorkerRegistry};
pub use server::DispatchServer;
pub use state::{JobState, PipelineState};
