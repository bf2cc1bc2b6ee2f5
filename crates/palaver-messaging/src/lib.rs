//! # palaver-messaging
//!
//! The messaging service: conversation lifecycle (direct, group, broadcast),
//! participant management with an explicit permission table, message send
//! with real-time fan-out, reactions, and read tracking.
//!
//! Operations are synchronous and propagate authorization and not-found
//! failures directly to the caller; delivery to online participants is
//! fire-and-forget through the [`palaver_net::DeliveryRegistry`].

pub mod permissions;
pub mod policy;
pub mod service;

mod error;

pub use error::{MessagingError, Result};
pub use policy::MessagingPolicy;
pub use service::{ConversationView, MessagingService, ReactionOutcome};
