//! Recording test doubles for every hardware seam.

use std::{collections::VecDeque, net::Ipv4Addr};

use crate::{
    broker::{BrokerEndpoint, BrokerTransport},
    clock::Clock,
    config::StaticIpConfig,
    connectivity::{LinkAddresses, NetworkLink, WifiCredentials},
    io::{DigitalInput, DigitalOutput},
    provisioning::{PortalRequest, PortalSubmission, ProvisioningPortal},
    store::{BlobStorage, StorageError},
    types::Level,
};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    pub blob: Option<Vec<u8>>,
    pub fail_mount: bool,
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub writes: u32,
}

impl MemoryStorage {
    pub fn with_blob(blob: &[u8]) -> Self {
        Self {
            blob: Some(blob.to_vec()),
            ..Self::default()
        }
    }
}

impl BlobStorage for MemoryStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        if self.fail_mount {
            return Err(StorageError::Mount("no partition".to_string()));
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail_reads {
            return Err(StorageError::Read("io".to_string()));
        }
        Ok(self.blob.clone())
    }

    fn write(&mut self, blob: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Write("read-only".to_string()));
        }
        self.writes += 1;
        self.blob = Some(blob.to_vec());
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.blob = None;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    ApplyStaticIp(StaticIpConfig),
    JoinStored,
    Join(String),
    RequestRejoin,
    EraseCredentials,
}

#[derive(Debug)]
pub struct MockLink {
    pub up: bool,
    pub stored: Option<WifiCredentials>,
    pub static_ip: Option<StaticIpConfig>,
    pub join_succeeds: bool,
    pub join_stored_succeeds: bool,
    pub rejoin_requests: u32,
    pub calls: Vec<LinkCall>,
}

impl MockLink {
    pub const DHCP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
}

impl Default for MockLink {
    fn default() -> Self {
        Self {
            up: false,
            stored: None,
            static_ip: None,
            join_succeeds: false,
            join_stored_succeeds: true,
            rejoin_requests: 0,
            calls: Vec::new(),
        }
    }
}

impl NetworkLink for MockLink {
    fn apply_static_ip(&mut self, config: &StaticIpConfig) -> bool {
        self.calls.push(LinkCall::ApplyStaticIp(*config));
        self.static_ip = Some(*config);
        true
    }

    fn has_stored_credentials(&self) -> bool {
        self.stored.is_some()
    }

    fn join_stored(&mut self, _timeout_ms: u64) -> bool {
        self.calls.push(LinkCall::JoinStored);
        self.up = self.stored.is_some() && self.join_succeeds && self.join_stored_succeeds;
        self.up
    }

    fn join(&mut self, credentials: &WifiCredentials, _timeout_ms: u64) -> bool {
        self.calls.push(LinkCall::Join(credentials.ssid.clone()));
        if self.join_succeeds {
            self.stored = Some(credentials.clone());
            self.up = true;
        }
        self.up
    }

    fn request_rejoin(&mut self) {
        self.calls.push(LinkCall::RequestRejoin);
        self.rejoin_requests += 1;
    }

    fn is_up(&self) -> bool {
        self.up
    }

    fn addresses(&self) -> Option<LinkAddresses> {
        if !self.up {
            return None;
        }
        Some(match self.static_ip {
            Some(config) => LinkAddresses {
                local: config.ip,
                gateway: config.gateway,
                subnet_mask: config.subnet,
            },
            None => LinkAddresses {
                local: Self::DHCP_ADDRESS,
                gateway: Ipv4Addr::new(192, 168, 1, 1),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            },
        })
    }

    fn erase_credentials(&mut self) -> bool {
        self.calls.push(LinkCall::EraseCredentials);
        self.stored = None;
        true
    }
}

#[derive(Debug, Default)]
pub struct MockPortal {
    pub answer: Option<PortalSubmission>,
    pub requests: Vec<PortalRequest>,
}

impl MockPortal {
    pub fn answering(submission: PortalSubmission) -> Self {
        Self {
            answer: Some(submission),
            requests: Vec::new(),
        }
    }
}

impl ProvisioningPortal for MockPortal {
    fn run(&mut self, request: &PortalRequest) -> Option<PortalSubmission> {
        self.requests.push(request.clone());
        self.answer.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    SetServer(BrokerEndpoint),
    Connect(String),
    Publish(String, Vec<u8>),
    Subscribe(String),
}

#[derive(Debug, Default)]
pub struct MockTransport {
    pub connected: bool,
    /// Number of upcoming connects that fail.
    pub failed_connects: u32,
    pub failed_subscribes: u32,
    pub fail_publishes: bool,
    pub inbound: VecDeque<(String, Vec<u8>)>,
    pub calls: Vec<TransportCall>,
}

impl MockTransport {
    pub fn queue_message(&mut self, topic: &str, payload: &[u8]) {
        self.inbound.push_back((topic.to_string(), payload.to_vec()));
    }

    pub fn connect_ids(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Connect(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish(topic, payload) => Some((
                    topic.clone(),
                    String::from_utf8_lossy(payload).into_owned(),
                )),
                _ => None,
            })
            .collect()
    }
}

impl BrokerTransport for MockTransport {
    fn set_server(&mut self, endpoint: &BrokerEndpoint) {
        self.calls.push(TransportCall::SetServer(endpoint.clone()));
    }

    fn connect(&mut self, client_id: &str) -> bool {
        self.calls.push(TransportCall::Connect(client_id.to_string()));
        if self.failed_connects > 0 {
            self.failed_connects -= 1;
            self.connected = false;
        } else {
            self.connected = true;
        }
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        self.calls
            .push(TransportCall::Publish(topic.to_string(), payload.to_vec()));
        self.connected && !self.fail_publishes
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        self.calls.push(TransportCall::Subscribe(topic.to_string()));
        if self.failed_subscribes > 0 {
            self.failed_subscribes -= 1;
            return false;
        }
        self.connected
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) -> bool {
        if !self.connected {
            return false;
        }
        while let Some((topic, payload)) = self.inbound.pop_front() {
            on_message(&topic, &payload);
        }
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn state_code(&self) -> i32 {
        if self.connected {
            0
        } else {
            -2
        }
    }
}

/// Virtual time: sleeping advances `now` and is recorded.
#[derive(Debug, Default)]
pub struct MockClock {
    pub now: u64,
    pub sleeps: Vec<u64>,
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now
    }

    fn sleep_ms(&mut self, ms: u64) {
        self.sleeps.push(ms);
        self.now += ms;
    }
}

/// Replays scripted levels, then holds the last one.
#[derive(Debug, Default)]
pub struct MockInput {
    script: VecDeque<Level>,
    last: Option<Level>,
}

impl MockInput {
    pub fn new(levels: impl IntoIterator<Item = Level>) -> Self {
        Self {
            script: levels.into_iter().collect(),
            last: None,
        }
    }

    pub fn push(&mut self, level: Level) {
        self.script.push_back(level);
    }
}

impl DigitalInput for MockInput {
    fn read(&mut self) -> Level {
        if let Some(level) = self.script.pop_front() {
            self.last = Some(level);
        }
        self.last.unwrap_or(Level::Low)
    }
}

#[derive(Debug, Default)]
pub struct MockPin {
    pub writes: Vec<Level>,
}

impl DigitalOutput for MockPin {
    fn write(&mut self, level: Level) {
        self.writes.push(level);
    }
}
