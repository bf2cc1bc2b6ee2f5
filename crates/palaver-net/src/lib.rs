//! # palaver-net
//!
//! The delivery registry: one live push channel per online user, with
//! fire-and-forget fan-out. The concrete transport that drains a channel
//! (WebSocket, SSE, long-poll) lives outside this workspace.

pub mod registry;

pub use registry::DeliveryRegistry;
