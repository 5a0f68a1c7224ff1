//! Transport trait abstraction for pluggable link backends

use async_trait::async_trait;
use singularity_shared::{ConnectionTarget, PeerHandle};

use crate::transport::TransportError;

/// One open connection to a peer
#[async_trait]
pub trait TransportLink: Send + Sync + 'static {
    /// Handle identifying this connection
    fn peer(&self) -> &PeerHandle;

    /// Write one message to the peer
    async fn send(&self, payload: &str) -> Result<(), TransportError>;

    /// Whether the link is still usable
    fn is_open(&self) -> bool;

    /// Release the link. Closing twice is a no-op.
    async fn close(&self);
}

/// Factory for opening transport links
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// The link type this connector produces
    type Link: TransportLink;

    /// Attempt to open a link to `target`
    async fn open(&self, target: &ConnectionTarget) -> Result<Self::Link, TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
