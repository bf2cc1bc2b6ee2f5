//! Peer transport seam and the endpoint registry.
//!
//! An endpoint is a listening handle bound to an advertised address; links
//! are the per-call connections opened through it. The registry owns one
//! reusable endpoint per local user and survives engine reloads because it
//! is injected from the composition root rather than held in an ambient
//! global.

use std::collections::HashMap;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use palaver_shared::types::UserId;

use crate::config::IceConfig;
use crate::error::PeerError;
use crate::media::MediaStream;

/// Events surfaced by one peer link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The remote side's media arrived; the call is live.
    RemoteStream,
    /// The remote side closed the link.
    Closed,
    Error(String),
}

/// A live per-call connection. Closing is idempotent.
pub trait PeerLink: Send + Sync {
    fn close(&self);
}

/// A link together with its event stream.
pub struct PeerCall {
    pub link: Box<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// The answering half of an inbound connection request.
#[async_trait]
pub trait InboundResponder: Send + Sync {
    async fn answer(self: Box<Self>, media: MediaStream) -> Result<PeerCall, PeerError>;
}

/// An inbound connection request from `remote`.
pub struct InboundCall {
    pub remote: String,
    pub responder: Box<dyn InboundResponder>,
}

/// A listening peer handle bound to one advertised address.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    fn address(&self) -> String;

    /// Whether the handle is still usable. Destroyed or disconnected
    /// handles must report `false` so the registry discards them.
    fn is_alive(&self) -> bool;

    /// Open an outbound link to `remote`, attaching the local media.
    async fn connect(&self, remote: &str, media: MediaStream) -> Result<PeerCall, PeerError>;

    /// Next inbound connection request; `None` once the endpoint closes.
    async fn next_inbound(&self) -> Option<InboundCall>;

    fn close(&self);
}

/// Factory for endpoints, parameterized with the ICE configuration.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(
        &self,
        address: &str,
        ice: &IceConfig,
    ) -> Result<Arc<dyn PeerEndpoint>, PeerError>;
}

#[derive(Default)]
struct RegistrySlots {
    endpoints: HashMap<UserId, Arc<dyn PeerEndpoint>>,
    /// Creation attempts per user, to decide when an address needs a
    /// uniqueness suffix.
    creations: HashMap<UserId, u32>,
}

/// One reusable endpoint per local user.
///
/// Liveness is checked before every reuse; a dead handle is discarded and
/// replaced with a fresh one whose address carries a random suffix, so the
/// new handle never collides with the address the dead one may still hold.
pub struct PeerEndpointRegistry {
    connector: Arc<dyn PeerConnector>,
    ice: IceConfig,
    slots: Mutex<RegistrySlots>,
}

impl PeerEndpointRegistry {
    pub fn new(connector: Arc<dyn PeerConnector>, ice: IceConfig) -> Self {
        Self {
            connector,
            ice,
            slots: Mutex::new(RegistrySlots::default()),
        }
    }

    pub async fn get_or_create(&self, user: &UserId) -> Result<Arc<dyn PeerEndpoint>, PeerError> {
        let mut slots = self.slots.lock().await;

        if let Some(existing) = slots.endpoints.get(user) {
            if existing.is_alive() {
                debug!(
                    user = %user.short(),
                    address = %existing.address(),
                    "reusing live peer endpoint"
                );
                return Ok(existing.clone());
            }
            debug!(user = %user.short(), "discarding dead peer endpoint");
            slots.endpoints.remove(user);
        }

        let attempt = slots.creations.entry(*user).or_insert(0);
        let address = if *attempt == 0 {
            user.to_string()
        } else {
            format!("{}-{:04x}", user, rand::random::<u16>())
        };
        *attempt += 1;

        match self.connector.create(&address, &self.ice).await {
            Ok(endpoint) => {
                info!(user = %user.short(), address = %address, "created peer endpoint");
                slots.endpoints.insert(*user, endpoint.clone());
                Ok(endpoint)
            }
            Err(e) => {
                if matches!(e, PeerError::AddressInUse(_)) {
                    // Never retry against the stale handle holding that
                    // address; the next attempt starts from scratch.
                    slots.endpoints.remove(user);
                    warn!(
                        user = %user.short(),
                        address = %address,
                        "peer address in use, cleared cached endpoint"
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn invalidate(&self, user: &UserId) {
        let mut slots = self.slots.lock().await;
        if let Some(endpoint) = slots.endpoints.remove(user) {
            endpoint.close();
            debug!(user = %user.short(), "invalidated peer endpoint");
        }
    }
}
