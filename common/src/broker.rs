use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{ConfigurationRecord, NodeSettings},
    io::{DigitalOutput, OutputBank},
    topics::{ANNOUNCE_PAYLOAD, TOPIC_ANNOUNCE},
    types::BrokerConnectionState,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker endpoint not configured")]
    NotConfigured,
    #[error("broker session not connected")]
    NotConnected,
    #[error("failed to publish to `{topic}`")]
    PublishFailed { topic: String },
    #[error("gave up connecting after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub keep_alive_secs: u16,
    /// Upper bound on any single blocking transport operation.
    pub io_timeout_ms: u64,
}

impl BrokerEndpoint {
    pub fn new(record: &ConfigurationRecord, settings: &NodeSettings) -> Self {
        Self {
            host: record.broker_host.clone(),
            port: record.broker_port,
            username: record.has_api_token().then(|| record.api_token.clone()),
            keep_alive_secs: settings.broker_keep_alive_secs,
            io_timeout_ms: settings.broker_io_timeout_ms,
        }
    }
}

/// Publish/subscribe client underneath a [`BrokerSession`].
pub trait BrokerTransport {
    fn set_server(&mut self, endpoint: &BrokerEndpoint);
    fn connect(&mut self, client_id: &str) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
    fn subscribe(&mut self, topic: &str) -> bool;
    /// Services keep-alive and hands every pending inbound message to `on_message`.
    /// Must not block longer than the endpoint's I/O timeout.
    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) -> bool;
    fn is_connected(&self) -> bool;
    /// Transport-specific diagnostic code for the last failure.
    fn state_code(&self) -> i32;
}

/// `'1'` switches the remote output on; anything else, including an empty payload, off.
pub fn decode_command(payload: &[u8]) -> bool {
    payload.first() == Some(&b'1')
}

/// Produces `{prefix}-{random}-{n}`; the counter keeps ids unique even if the
/// random part repeats.
pub struct ClientIdGenerator {
    prefix: String,
    state: u64,
    counter: u32,
}

impl ClientIdGenerator {
    pub fn new(prefix: &str, seed: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            state: seed | 1,
            counter: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.counter = self.counter.wrapping_add(1);
        format!("{}-{:04x}-{}", self.prefix, self.state & 0xffff, self.counter)
    }
}

pub struct BrokerSession<T> {
    transport: T,
    state: BrokerConnectionState,
    endpoint: Option<BrokerEndpoint>,
    topic: String,
    backoff_ms: u64,
    max_attempts: Option<u32>,
    client_ids: ClientIdGenerator,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(transport: T, settings: &NodeSettings, seed: u64) -> Self {
        Self {
            transport,
            state: BrokerConnectionState::Disconnected,
            endpoint: None,
            topic: String::new(),
            backoff_ms: settings.reconnect_backoff_ms,
            max_attempts: settings.max_connect_attempts,
            client_ids: ClientIdGenerator::new(&settings.client_id_prefix, seed),
        }
    }

    pub fn configure(&mut self, record: &ConfigurationRecord, settings: &NodeSettings) {
        let endpoint = BrokerEndpoint::new(record, settings);
        info!(
            "broker endpoint {}:{}, topic `{}`, authenticated={}",
            endpoint.host,
            endpoint.port,
            record.topic,
            endpoint.username.is_some()
        );
        self.transport.set_server(&endpoint);
        self.endpoint = Some(endpoint);
        self.topic = record.topic.clone();
        self.transition(BrokerConnectionState::Disconnected);
    }

    pub fn state(&self) -> BrokerConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == BrokerConnectionState::Connected
    }

    /// Blocks until the session is connected, announced and subscribed.
    ///
    /// Each failed attempt is followed by exactly one backoff sleep. Returns
    /// immediately without touching the transport when already connected.
    pub fn ensure_connected<C: Clock>(&mut self, clock: &mut C) -> Result<(), BrokerError> {
        self.ensure_connected_with(clock, |_| {})
    }

    /// Like [`ensure_connected`](Self::ensure_connected), but hands the current
    /// time to `after_backoff` once each backoff sleep ends, before the next attempt.
    pub fn ensure_connected_with<C, F>(
        &mut self,
        clock: &mut C,
        mut after_backoff: F,
    ) -> Result<(), BrokerError>
    where
        C: Clock,
        F: FnMut(u64),
    {
        if self.is_connected() {
            return Ok(());
        }
        let Some(endpoint) = &self.endpoint else {
            return Err(BrokerError::NotConfigured);
        };
        let target = format!("{}:{}", endpoint.host, endpoint.port);

        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            self.transition(BrokerConnectionState::Connecting);
            let client_id = self.client_ids.next_id();
            info!("attempting broker connection to {target} as `{client_id}`");

            if self.try_session(&client_id) {
                self.transition(BrokerConnectionState::Connected);
                return Ok(());
            }

            self.transition(BrokerConnectionState::Disconnected);
            warn!(
                "broker connection failed, rc={}; retrying in {}ms",
                self.transport.state_code(),
                self.backoff_ms
            );
            clock.sleep_ms(self.backoff_ms);
            after_backoff(clock.now_ms());

            if let Some(max) = self.max_attempts {
                if attempts >= max {
                    return Err(BrokerError::AttemptsExhausted { attempts });
                }
            }
        }
    }

    fn transition(&mut self, next: BrokerConnectionState) {
        if next != self.state {
            debug!("broker session {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    fn try_session(&mut self, client_id: &str) -> bool {
        if !self.transport.connect(client_id) {
            return false;
        }
        info!("broker connected");

        if !self
            .transport
            .publish(TOPIC_ANNOUNCE, ANNOUNCE_PAYLOAD.as_bytes())
        {
            warn!("announcement to `{TOPIC_ANNOUNCE}` failed");
            return false;
        }
        if !self.transport.subscribe(&self.topic) {
            warn!("subscription to `{}` failed", self.topic);
            return false;
        }
        info!("subscribed to `{}`", self.topic);
        true
    }

    /// Services the transport and applies inbound commands to `outputs`.
    /// A transport failure only moves the session to Disconnected.
    pub fn poll<P: DigitalOutput>(&mut self, outputs: &mut OutputBank<P>) -> bool {
        if !self.is_connected() {
            return false;
        }

        let ok = self.transport.poll(&mut |topic, payload| {
            info!(
                "message arrived [{topic}] {}",
                String::from_utf8_lossy(payload)
            );
            outputs.set_remote_active(decode_command(payload));
        });

        if !ok || !self.transport.is_connected() {
            warn!(
                "broker connection lost, rc={}",
                self.transport.state_code()
            );
            self.transition(BrokerConnectionState::Disconnected);
            return false;
        }
        true
    }

    /// Not retried here; the next scheduled publish runs after reconnection.
    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if self.transport.publish(topic, payload) {
            debug!("published {} bytes to `{topic}`", payload.len());
            return Ok(());
        }

        self.transition(BrokerConnectionState::Disconnected);
        Err(BrokerError::PublishFailed {
            topic: topic.to_string(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        mock::{MockClock, MockPin, MockTransport, TransportCall},
        types::Level,
    };

    fn session(
        transport: MockTransport,
        max_attempts: Option<u32>,
    ) -> BrokerSession<MockTransport> {
        let settings = NodeSettings {
            max_connect_attempts: max_attempts,
            ..NodeSettings::default()
        };
        let mut session = BrokerSession::new(transport, &settings, 42);
        session.configure(&ConfigurationRecord::default(), &settings);
        session
    }

    fn outputs() -> OutputBank<MockPin> {
        OutputBank::new(
            vec![(MockPin::default(), Level::High), (MockPin::default(), Level::Low)],
            1,
        )
    }

    #[test]
    fn connect_announces_then_subscribes() {
        let mut session = session(MockTransport::default(), None);
        let mut clock = MockClock::default();

        assert_eq!(session.ensure_connected(&mut clock), Ok(()));
        assert_eq!(session.state(), BrokerConnectionState::Connected);

        let calls = &session.transport().calls;
        assert!(matches!(calls[0], TransportCall::SetServer(_)));
        assert!(matches!(calls[1], TransportCall::Connect(_)));
        assert_eq!(
            calls[2],
            TransportCall::Publish("outTopic".to_string(), b"hello world".to_vec())
        );
        assert_eq!(calls[3], TransportCall::Subscribe("Topic".to_string()));
        assert!(clock.sleeps.is_empty());
    }

    #[test]
    fn ensure_connected_is_idempotent() {
        let mut session = session(MockTransport::default(), None);
        let mut clock = MockClock::default();
        session.ensure_connected(&mut clock).unwrap();
        let before = session.transport().calls.len();

        for _ in 0..3 {
            session.ensure_connected(&mut clock).unwrap();
        }
        assert_eq!(session.transport().calls.len(), before);
    }

    #[test]
    fn one_backoff_per_failed_attempt() {
        let mut transport = MockTransport::default();
        transport.failed_connects = 3;
        let mut session = session(transport, None);
        let mut clock = MockClock::default();

        session.ensure_connected(&mut clock).unwrap();

        assert_eq!(clock.sleeps, vec![5_000; 3]);
        let ids = session.transport().connect_ids();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);
    }

    #[test]
    fn backoff_hook_sees_time_after_each_sleep() {
        let mut transport = MockTransport::default();
        transport.failed_connects = 2;
        let mut session = session(transport, None);
        let mut clock = MockClock::default();
        let mut seen = Vec::new();

        session
            .ensure_connected_with(&mut clock, |now_ms| seen.push(now_ms))
            .unwrap();

        assert_eq!(seen, vec![5_000, 10_000]);
        assert_eq!(clock.sleeps, vec![5_000; 2]);
    }

    #[test]
    fn attempts_bound_is_honoured() {
        let mut transport = MockTransport::default();
        transport.failed_connects = u32::MAX;
        let mut session = session(transport, Some(2));
        let mut clock = MockClock::default();

        assert_eq!(
            session.ensure_connected(&mut clock),
            Err(BrokerError::AttemptsExhausted { attempts: 2 })
        );
        assert_eq!(clock.sleeps.len(), 2);
        assert_eq!(session.state(), BrokerConnectionState::Disconnected);
    }

    #[test]
    fn unconfigured_session_refuses_to_connect() {
        let settings = NodeSettings::default();
        let mut session = BrokerSession::new(MockTransport::default(), &settings, 1);

        assert_eq!(
            session.ensure_connected(&mut MockClock::default()),
            Err(BrokerError::NotConfigured)
        );
    }

    #[test]
    fn failed_subscribe_counts_as_failed_attempt() {
        let mut transport = MockTransport::default();
        transport.failed_subscribes = 1;
        let mut session = session(transport, None);
        let mut clock = MockClock::default();

        session.ensure_connected(&mut clock).unwrap();
        assert_eq!(clock.sleeps.len(), 1);
        assert_eq!(session.transport().connect_ids().len(), 2);
    }

    #[test]
    fn dispatch_mapping() {
        assert!(decode_command(b"1"));
        assert!(decode_command(b"1off"));
        assert!(!decode_command(b"0"));
        assert!(!decode_command(b"on"));
        assert!(!decode_command(b""));
    }

    #[test]
    fn inbound_commands_drive_remote_output() {
        let mut session = session(MockTransport::default(), None);
        session.ensure_connected(&mut MockClock::default()).unwrap();
        let mut outputs = outputs();

        session.transport_mut().queue_message("Topic", b"1");
        assert!(session.poll(&mut outputs));
        assert_eq!(outputs.remote_level(), Some(Level::Low));

        session.transport_mut().queue_message("Topic", b"");
        assert!(session.poll(&mut outputs));
        assert_eq!(outputs.remote_level(), Some(Level::High));
    }

    #[test]
    fn poll_failure_forces_disconnect() {
        let mut session = session(MockTransport::default(), None);
        let mut clock = MockClock::default();
        session.ensure_connected(&mut clock).unwrap();

        session.transport_mut().connected = false;
        assert!(!session.poll(&mut outputs()));
        assert_eq!(session.state(), BrokerConnectionState::Disconnected);

        session.ensure_connected(&mut clock).unwrap();
        assert!(session.is_connected());
        assert_eq!(session.transport().connect_ids().len(), 2);
    }

    #[test]
    fn publish_requires_connection_and_reports_failure() {
        let mut session = session(MockTransport::default(), None);
        assert_eq!(
            session.publish("outTopic", b"x"),
            Err(BrokerError::NotConnected)
        );

        session.ensure_connected(&mut MockClock::default()).unwrap();
        session.transport_mut().fail_publishes = true;
        assert_eq!(
            session.publish("outTopic", b"x"),
            Err(BrokerError::PublishFailed {
                topic: "outTopic".to_string()
            })
        );
        assert_eq!(session.state(), BrokerConnectionState::Disconnected);
    }

    #[test]
    fn api_token_becomes_username() {
        let settings = NodeSettings::default();
        let placeholder = BrokerEndpoint::new(&ConfigurationRecord::default(), &settings);
        assert_eq!(placeholder.username, None);

        let record = ConfigurationRecord {
            api_token: "tok".to_string(),
            ..ConfigurationRecord::default()
        };
        assert_eq!(
            BrokerEndpoint::new(&record, &settings).username.as_deref(),
            Some("tok")
        );
    }

    #[test]
    fn client_ids_are_unique() {
        let mut ids = ClientIdGenerator::new("node", 0);
        let first = ids.next_id();
        let second = ids.next_id();

        assert!(first.starts_with("node-"));
        assert!(first.ends_with("-1"));
        assert_ne!(first, second);
    }
}
