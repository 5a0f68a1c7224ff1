//! Registry of connected peers, keyed by address

use crate::transport::TransportLink;
use std::sync::Arc;

/// Open links by peer address (the mac for Bluetooth)
///
/// Cardinality is a handful of peers at most, so lookups are linear scans.
pub struct DeviceRegistry<L: TransportLink + ?Sized> {
    links: Vec<Arc<L>>,
}

impl<L: TransportLink + ?Sized> Default for DeviceRegistry<L> {
    fn default() -> Self {
        Self { links: Vec::new() }
    }
}

impl<L: TransportLink + ?Sized> DeviceRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link, returning any previous link for the same address
    pub fn add(&mut self, link: Arc<L>) -> Option<Arc<L>> {
        let previous = self.remove(&link.peer().address);
        self.links.push(link);
        previous
    }

    /// Unregister the link for `address`
    pub fn remove(&mut self, address: &str) -> Option<Arc<L>> {
        let index = self
            .links
            .iter()
            .position(|l| l.peer().address == address)?;
        Some(self.links.remove(index))
    }

    /// Find the link for `address`
    pub fn find(&self, address: &str) -> Option<Arc<L>> {
        self.links
            .iter()
            .find(|l| l.peer().address == address)
            .cloned()
    }

    /// Unregister everything, returning the links so the caller can close them
    pub fn clear(&mut self) -> Vec<Arc<L>> {
        std::mem::take(&mut self.links)
    }

    /// Registered addresses in insertion order
    pub fn addresses(&self) -> Vec<String> {
        self.links.iter().map(|l| l.peer().address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
