use thiserror::Error;
use tracing::{info, warn};

use crate::{
    broker::{BrokerSession, BrokerTransport},
    clock::Clock,
    config::{ConfigurationRecord, NodeSettings, StaticIpConfig},
    connectivity::{ConnectivitySession, NetworkLink},
    io::{DigitalInput, DigitalOutput, InputOutputMonitor, OutputBank},
    provisioning::{ProvisioningAgent, ProvisioningPortal},
    store::{BlobStorage, ConfigStore, StorageError},
    topics::{telemetry_payload, TOPIC_ANNOUNCE},
    types::Level,
};

/// Startup failures the node cannot recover from without a restart.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Board-specific collaborators handed to the [`Supervisor`].
pub struct NodeParts<S, L, T, I, O, C> {
    pub storage: S,
    pub link: L,
    pub transport: T,
    pub input: I,
    /// Output pins with their active levels.
    pub outputs: Vec<(O, Level)>,
    /// Index into `outputs` of the broker-controlled channel.
    pub remote_output: usize,
    pub clock: C,
    /// Seeds client id generation.
    pub seed: u64,
}

pub struct Supervisor<S, L, T, I, O, C> {
    settings: NodeSettings,
    store: ConfigStore<S>,
    session: ConnectivitySession<L>,
    broker: BrokerSession<T>,
    monitor: InputOutputMonitor<I>,
    outputs: OutputBank<O>,
    clock: C,
    record: ConfigurationRecord,
    telemetry_counter: u64,
    last_telemetry_ms: u64,
}

impl<S, L, T, I, O, C> Supervisor<S, L, T, I, O, C>
where
    S: BlobStorage,
    L: NetworkLink,
    T: BrokerTransport,
    I: DigitalInput,
    O: DigitalOutput,
    C: Clock,
{
    pub fn new(parts: NodeParts<S, L, T, I, O, C>, mut settings: NodeSettings) -> Self {
        settings.sanitize();
        Self {
            store: ConfigStore::new(parts.storage),
            session: ConnectivitySession::new(parts.link, settings.link_retry_interval_ms),
            broker: BrokerSession::new(parts.transport, &settings, parts.seed),
            monitor: InputOutputMonitor::new(parts.input),
            outputs: OutputBank::new(parts.outputs, parts.remote_output),
            clock: parts.clock,
            record: ConfigurationRecord::default(),
            telemetry_counter: 0,
            last_telemetry_ms: 0,
            settings,
        }
    }

    /// One-time boot sequence. Only a storage mount failure is fatal.
    pub fn startup<P: ProvisioningPortal>(&mut self, portal: &mut P) -> Result<(), StartupError> {
        self.outputs.drive_all(Level::Low);
        info!("{} outputs initialized", self.outputs.len());

        self.store.mount()?;

        if self.settings.clear_credentials {
            warn!("clearing stored configuration and network credentials");
            self.store.reset();
            if !self.session.link_mut().erase_credentials() {
                warn!("failed to erase stored network credentials");
            }
        }

        self.record = self.store.load();

        let report =
            ProvisioningAgent::new(&self.settings).run(&mut self.record, &mut self.session, portal);

        if report.dirty {
            if let (Some(ip), Some(gateway), Some(subnet)) = (
                self.session.local_address(),
                self.session.gateway(),
                self.session.subnet_mask(),
            ) {
                self.record.static_ip = Some(StaticIpConfig {
                    ip,
                    gateway,
                    subnet,
                });
            }
            info!("saving configuration");
            self.store.save(&self.record);
        }

        match (
            self.session.local_address(),
            self.session.gateway(),
            self.session.subnet_mask(),
        ) {
            (Some(ip), Some(gateway), Some(subnet)) => {
                info!("local ip {ip}, gateway {gateway}, subnet {subnet}")
            }
            _ => warn!("network not available; continuing, recovery runs in the background"),
        }

        self.broker.configure(&self.record, &self.settings);
        self.last_telemetry_ms = self.clock.now_ms();
        Ok(())
    }

    /// One control-loop iteration.
    pub fn tick(&mut self) {
        self.session.maintain(self.clock.now_ms());
        self.monitor.sample(&mut self.outputs);

        if !self.broker.is_connected() {
            let session = &mut self.session;
            let reconnect = self
                .broker
                .ensure_connected_with(&mut self.clock, |now_ms| session.maintain(now_ms));
            if let Err(err) = reconnect {
                warn!("{err}");
                return;
            }
        }
        self.broker.poll(&mut self.outputs);

        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_telemetry_ms) > self.settings.telemetry_interval_ms {
            self.last_telemetry_ms = now;
            self.telemetry_counter += 1;
            let payload = telemetry_payload(self.telemetry_counter);
            info!("publish message: {payload}");
            if let Err(err) = self.broker.publish(TOPIC_ANNOUNCE, payload.as_bytes()) {
                warn!("{err}");
            }
        }
    }

    /// The control loop. `None` runs forever; callers restart the node if it returns.
    pub fn run(&mut self, max_iterations: Option<u64>) {
        let mut iterations: u64 = 0;
        loop {
            self.tick();
            self.clock.sleep_ms(self.settings.loop_interval_ms);

            iterations = iterations.saturating_add(1);
            if max_iterations.is_some_and(|max| iterations >= max) {
                return;
            }
        }
    }

    pub fn record(&self) -> &ConfigurationRecord {
        &self.record
    }

    pub fn session(&self) -> &ConnectivitySession<L> {
        &self.session
    }

    pub fn broker(&self) -> &BrokerSession<T> {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut BrokerSession<T> {
        &mut self.broker
    }

    pub fn outputs(&self) -> &OutputBank<O> {
        &self.outputs
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn monitor_mut(&mut self) -> &mut InputOutputMonitor<I> {
        &mut self.monitor
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
