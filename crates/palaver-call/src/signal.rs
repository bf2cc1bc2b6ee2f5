//! Outbound signal delivery seam.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use palaver_net::DeliveryRegistry;
use palaver_shared::protocol::{CallSignal, CallSignalKind, PushEvent};
use palaver_shared::types::UserId;

use crate::error::SignalError;

/// Carries an outbound signal to the counterpart of the call. A browser
/// client posts to `/call/signal`; server-side composition and tests wire
/// in [`RegistrySignalSender`] instead.
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send(&self, kind: CallSignalKind, signal: CallSignal) -> Result<(), SignalError>;
}

/// Delivers signals straight through the in-process delivery registry,
/// addressed to the counterpart of `actor`.
pub struct RegistrySignalSender {
    actor: UserId,
    registry: Arc<DeliveryRegistry>,
}

impl RegistrySignalSender {
    pub fn new(actor: UserId, registry: Arc<DeliveryRegistry>) -> Self {
        Self { actor, registry }
    }
}

#[async_trait]
impl SignalSender for RegistrySignalSender {
    async fn send(&self, kind: CallSignalKind, signal: CallSignal) -> Result<(), SignalError> {
        let target = signal
            .counterpart_of(&self.actor)
            .map(|profile| profile.id)
            .ok_or_else(|| {
                SignalError::Transport("sender is not a party to this signal".into())
            })?;

        let delivered = self
            .registry
            .send(&target, PushEvent::from_signal(kind, signal));
        if !delivered {
            // A miss is not an error; the counterpart is simply offline.
            debug!(
                kind = kind.as_str(),
                to = %target.short(),
                "call signal not delivered"
            );
        }
        Ok(())
    }
}
