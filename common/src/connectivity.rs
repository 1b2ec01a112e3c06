use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::{config::StaticIpConfig, types::LinkState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddresses {
    pub local: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

/// Station-mode network interface.
pub trait NetworkLink {
    /// Pins the interface to a fixed address; takes effect on the next join.
    fn apply_static_ip(&mut self, config: &StaticIpConfig) -> bool;
    fn has_stored_credentials(&self) -> bool;
    /// Joins the remembered network, blocking for at most `timeout_ms`.
    fn join_stored(&mut self, timeout_ms: u64) -> bool;
    /// Joins with new credentials and remembers them on success.
    fn join(&mut self, credentials: &WifiCredentials, timeout_ms: u64) -> bool;
    /// Asks the interface to rejoin the remembered network without blocking.
    fn request_rejoin(&mut self);
    fn is_up(&self) -> bool;
    fn addresses(&self) -> Option<LinkAddresses>;
    fn erase_credentials(&mut self) -> bool;
}

pub struct ConnectivitySession<L> {
    link: L,
    state: LinkState,
    retry_interval_ms: u64,
    last_rejoin_ms: Option<u64>,
}

impl<L: NetworkLink> ConnectivitySession<L> {
    pub fn new(link: L, retry_interval_ms: u64) -> Self {
        Self {
            link,
            state: LinkState::Disconnected,
            retry_interval_ms,
            last_rejoin_ms: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn local_address(&self) -> Option<Ipv4Addr> {
        self.current_addresses().map(|addresses| addresses.local)
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.current_addresses().map(|addresses| addresses.gateway)
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.current_addresses().map(|addresses| addresses.subnet_mask)
    }

    fn current_addresses(&self) -> Option<LinkAddresses> {
        if !self.is_up() {
            return None;
        }
        self.link.addresses()
    }

    pub(crate) fn begin_provisioning(&mut self) {
        self.transition(LinkState::Provisioning);
    }

    /// Re-reads the interface and records the result as the current state.
    pub(crate) fn settle(&mut self) {
        let next = if self.link.is_up() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.transition(next);
    }

    /// Background recovery, called once per control-loop iteration.
    pub fn maintain(&mut self, now_ms: u64) {
        self.settle();
        if self.is_up() {
            self.last_rejoin_ms = None;
            return;
        }

        let due = self
            .last_rejoin_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.retry_interval_ms);
        if due && self.link.has_stored_credentials() {
            self.last_rejoin_ms = Some(now_ms);
            self.link.request_rejoin();
        }
    }

    fn transition(&mut self, next: LinkState) {
        if next == self.state {
            return;
        }

        match next {
            LinkState::Connected => match self.link.addresses() {
                Some(addresses) => info!(
                    "network link up: ip={}, gateway={}, subnet={}",
                    addresses.local, addresses.gateway, addresses.subnet_mask
                ),
                None => info!("network link up"),
            },
            LinkState::Provisioning => warn!("network link entering provisioning"),
            LinkState::Disconnected => warn!(
                "network link down (was {})",
                self.state.as_str().to_ascii_lowercase()
            ),
        }
        self.state = next;
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}
