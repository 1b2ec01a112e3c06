use core::convert::TryInto;
use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use relaynode_common::{
    BlobStorage, BrokerEndpoint, BrokerTransport, DigitalInput, DigitalOutput, Level,
    LinkAddresses, NetworkLink, NodeParts, NodeSettings, PortalRequest, PortalSubmission,
    ProvisioningPortal, StaticIpConfig, StorageError, Supervisor, SystemClock, WifiCredentials,
};

use crate::{
    board, flag_enabled,
    form::{
        build_config_view, ProvisionForm, ProvisionResponse, StoredCredentials,
        CAPTIVE_PROBE_PATHS, MAX_HTTP_BODY, PORTAL_HTML,
    },
};

const NVS_NAMESPACE: &str = "relaynode";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_WIFI_KEY: &str = "wifi_json";
const NVS_READ_BUFFER: usize = 4096;
const WIFI_POLL_MS: u64 = 100;
const PORTAL_GRACE_MS: u64 = 500;
const RESTART_DELAY_MS: u64 = 100;

const STATE_CONNECTION_TIMEOUT: i32 = -4;
const STATE_CONNECTION_LOST: i32 = -3;
const STATE_CONNECT_FAILED: i32 = -2;
const STATE_DISCONNECTED: i32 = -1;
const STATE_CONNECTED: i32 = 0;

type SharedWifi = Arc<Mutex<BlockingWifi<EspWifi<'static>>>>;
type HttpRequest<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let wifi: SharedWifi = Arc::new(Mutex::new(BlockingWifi::wrap(esp_wifi, sys_loop)?));

    let outputs = board::output_channels(GpioOutput::open)?;
    let parts = NodeParts {
        storage: NvsStorage::new(nvs_partition.clone()),
        link: EspLink::open(wifi.clone(), nvs_partition).context("wifi link setup failed")?,
        transport: EspTransport::default(),
        input: GpioButton::open(board::BUTTON_GPIO)?,
        outputs,
        remote_output: board::remote_output_index(),
        clock: SystemClock,
        seed: random_seed(),
    };

    let mut supervisor = Supervisor::new(parts, node_settings());
    if let Err(err) = supervisor.startup(&mut EspPortal::new(wifi)) {
        warn!("startup failed: {err}; restarting");
        restart();
    }

    supervisor.run(None);
    warn!("control loop exited; restarting");
    restart()
}

fn node_settings() -> NodeSettings {
    NodeSettings {
        clear_credentials: option_env!("CLEAR_CREDENTIALS").is_some_and(flag_enabled),
        ..NodeSettings::default()
    }
}

fn random_seed() -> u64 {
    let high = u64::from(unsafe { esp_idf_svc::sys::esp_random() });
    let low = u64::from(unsafe { esp_idf_svc::sys::esp_random() });
    (high << 32) | low
}

fn restart() -> ! {
    thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn open_nvs(partition: &EspDefaultNvsPartition) -> Result<EspNvs<NvsDefault>, StorageError> {
    EspNvs::new(partition.clone(), NVS_NAMESPACE, true)
        .map_err(|err| StorageError::Mount(err.to_string()))
}

/// Configuration blob kept as a JSON string in NVS.
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            nvs: None,
        }
    }

    fn handle(&mut self) -> Result<&mut EspNvs<NvsDefault>, StorageError> {
        self.nvs
            .as_mut()
            .ok_or_else(|| StorageError::Mount("storage not mounted".to_string()))
    }
}

impl BlobStorage for NvsStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        self.nvs = Some(open_nvs(&self.partition)?);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let nvs = self.handle()?;
        let mut buffer = vec![0_u8; NVS_READ_BUFFER];
        nvs.get_str(NVS_CONFIG_KEY, &mut buffer)
            .map(|value| value.map(|text| text.as_bytes().to_vec()))
            .map_err(|err| StorageError::Read(err.to_string()))
    }

    fn write(&mut self, blob: &[u8]) -> Result<(), StorageError> {
        let text =
            std::str::from_utf8(blob).map_err(|err| StorageError::Write(err.to_string()))?;
        self.handle()?
            .set_str(NVS_CONFIG_KEY, text)
            .map_err(|err| StorageError::Write(err.to_string()))
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.handle()?
            .remove(NVS_CONFIG_KEY)
            .map(|_| ())
            .map_err(|err| StorageError::Erase(err.to_string()))
    }
}

/// Station interface. Credentials are remembered in NVS next to the
/// configuration blob so they survive the portal switching the radio to AP mode.
struct EspLink {
    wifi: SharedWifi,
    nvs: EspNvs<NvsDefault>,
    stored: Option<WifiCredentials>,
}

impl EspLink {
    fn open(wifi: SharedWifi, partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = open_nvs(&partition)?;
        let mut buffer = vec![0_u8; NVS_READ_BUFFER];
        let stored = match nvs.get_str(NVS_WIFI_KEY, &mut buffer) {
            Ok(Some(text)) => serde_json::from_str::<StoredCredentials>(text)
                .map_err(|err| warn!("ignoring unreadable wifi credentials: {err}"))
                .ok()
                .map(WifiCredentials::from),
            Ok(None) => None,
            Err(err) => {
                warn!("failed to read wifi credentials: {err}");
                None
            }
        };
        Ok(Self { wifi, nvs, stored })
    }

    fn persist(&mut self, credentials: &WifiCredentials) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&StoredCredentials::from(credentials))?;
        self.nvs.set_str(NVS_WIFI_KEY, &payload)?;
        Ok(())
    }

    /// Starts a station join and waits for the interface to come up.
    fn join_with(&self, credentials: &WifiCredentials, timeout_ms: u64) -> anyhow::Result<bool> {
        let client = client_configuration(credentials)?;
        let mut wifi = self.wifi.lock().map_err(|_| anyhow!("wifi lock poisoned"))?;
        ensure_station(&mut wifi, client)?;
        info!("wifi connecting to `{}`", credentials.ssid);
        if let Err(err) = wifi.wifi_mut().connect() {
            warn!("wifi connect request failed: {err}");
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if wifi.is_up().unwrap_or(false) {
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(WIFI_POLL_MS));
        }
        Ok(wifi.is_up().unwrap_or(false))
    }
}

impl NetworkLink for EspLink {
    fn apply_static_ip(&mut self, config: &StaticIpConfig) -> bool {
        let result = static_netif(config).and_then(|netif| {
            let mut wifi = self.wifi.lock().map_err(|_| anyhow!("wifi lock poisoned"))?;
            wifi.wifi_mut()
                .swap_netif_sta(netif)
                .context("failed to apply static IP netif configuration")?;
            Ok(())
        });
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("static IP not applied: {err:#}");
                false
            }
        }
    }

    fn has_stored_credentials(&self) -> bool {
        self.stored
            .as_ref()
            .is_some_and(|credentials| !credentials.ssid.is_empty())
    }

    fn join_stored(&mut self, timeout_ms: u64) -> bool {
        let Some(credentials) = self.stored.clone() else {
            return false;
        };
        self.join_with(&credentials, timeout_ms)
            .map_err(|err| warn!("wifi join failed: {err:#}"))
            .unwrap_or(false)
    }

    fn join(&mut self, credentials: &WifiCredentials, timeout_ms: u64) -> bool {
        let joined = self
            .join_with(credentials, timeout_ms)
            .map_err(|err| warn!("wifi join failed: {err:#}"))
            .unwrap_or(false);
        if joined {
            if let Err(err) = self.persist(credentials) {
                warn!("failed to remember wifi credentials: {err:#}");
            }
            self.stored = Some(credentials.clone());
        }
        joined
    }

    fn request_rejoin(&mut self) {
        let Some(credentials) = self.stored.as_ref() else {
            return;
        };
        let result = client_configuration(credentials).and_then(|client| {
            let mut wifi = self.wifi.lock().map_err(|_| anyhow!("wifi lock poisoned"))?;
            ensure_station(&mut wifi, client)?;
            wifi.wifi_mut().connect()?;
            Ok(())
        });
        if let Err(err) = result {
            debug!("wifi rejoin request failed: {err:#}");
        }
    }

    fn is_up(&self) -> bool {
        self.wifi
            .lock()
            .map(|wifi| wifi.is_up().unwrap_or(false))
            .unwrap_or(false)
    }

    fn addresses(&self) -> Option<LinkAddresses> {
        let wifi = self.wifi.lock().ok()?;
        let info = wifi.wifi().sta_netif().get_ip_info().ok()?;
        Some(LinkAddresses {
            local: info.ip,
            gateway: info.subnet.gateway,
            subnet_mask: prefix_to_mask(info.subnet.mask.0),
        })
    }

    fn erase_credentials(&mut self) -> bool {
        self.stored = None;
        let removed = self.nvs.remove(NVS_WIFI_KEY).is_ok();
        let restored =
            unsafe { esp_idf_svc::sys::esp_wifi_restore() } == esp_idf_svc::sys::ESP_OK;
        removed && restored
    }
}

fn client_configuration(credentials: &WifiCredentials) -> anyhow::Result<ClientConfiguration> {
    let auth_method = if credentials.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Ok(ClientConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: credentials
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    })
}

/// Puts the radio in station mode with `client`, restarting it only if the
/// configuration changed.
fn ensure_station(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    client: ClientConfiguration,
) -> anyhow::Result<()> {
    let desired = Configuration::Client(client);
    if wifi.get_configuration()? != desired {
        if wifi.is_started()? {
            let _ = wifi.disconnect();
            wifi.stop()?;
        }
        wifi.set_configuration(&desired)?;
    }
    if !wifi.is_started()? {
        wifi.start()?;
    }
    Ok(())
}

fn static_netif(config: &StaticIpConfig) -> anyhow::Result<EspNetif> {
    let mask = Mask::try_from(config.subnet)
        .map_err(|_| anyhow!("invalid subnet mask: {}", config.subnet))?;

    let mut conf = NetifConfiguration::wifi_default_client();
    conf.key = "WIFI_STA_STATIC"
        .try_into()
        .map_err(|_| anyhow!("netif key too long"))?;
    conf.ip_configuration = Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
        IpClientSettings {
            ip: config.ip,
            subnet: Subnet {
                gateway: config.gateway,
                mask,
            },
            dns: Some(config.gateway),
            secondary_dns: None,
        },
    )));

    Ok(EspNetif::new_with_conf(&conf)?)
}

fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

/// Access point plus HTTP form, torn down once the operator submits or the
/// timeout passes.
struct EspPortal {
    wifi: SharedWifi,
}

impl EspPortal {
    fn new(wifi: SharedWifi) -> Self {
        Self { wifi }
    }

    fn serve(&self, request: &PortalRequest) -> anyhow::Result<Option<PortalSubmission>> {
        self.start_access_point(request)?;

        let (tx, rx) = mpsc::sync_channel::<PortalSubmission>(1);
        let server = create_portal_server(request, tx)?;

        let submission = rx
            .recv_timeout(Duration::from_millis(request.timeout_ms))
            .ok();
        drop(rx);
        if submission.is_some() {
            thread::sleep(Duration::from_millis(PORTAL_GRACE_MS));
        } else {
            warn!("provisioning portal timed out");
        }

        drop(server);
        self.stop_access_point();
        Ok(submission)
    }

    fn start_access_point(&self, request: &PortalRequest) -> anyhow::Result<()> {
        let mut wifi = self.wifi.lock().map_err(|_| anyhow!("wifi lock poisoned"))?;
        if wifi.is_started()? {
            wifi.stop()?;
        }
        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: request
                .ap_ssid
                .try_into()
                .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
            password: request
                .ap_password
                .try_into()
                .map_err(|_| anyhow!("provisioning AP password too long"))?,
            auth_method: AuthMethod::WPAWPA2Personal,
            channel: 1,
            ..Default::default()
        }))?;
        wifi.start()?;
        wifi.wait_netif_up()?;
        info!(
            "provisioning AP started on `{}` (password: `{}`)",
            request.ap_ssid, request.ap_password
        );
        Ok(())
    }

    fn stop_access_point(&self) {
        match self.wifi.lock() {
            Ok(mut wifi) => {
                if let Err(err) = wifi.stop() {
                    warn!("failed to stop provisioning AP: {err}");
                }
            }
            Err(_) => warn!("wifi lock poisoned; provisioning AP left running"),
        }
    }
}

impl ProvisioningPortal for EspPortal {
    fn run(&mut self, request: &PortalRequest) -> Option<PortalSubmission> {
        match self.serve(request) {
            Ok(submission) => submission,
            Err(err) => {
                warn!("provisioning portal failed: {err:#}");
                None
            }
        }
    }
}

fn create_portal_server(
    request: &PortalRequest,
    submissions: mpsc::SyncSender<PortalSubmission>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in CAPTIVE_PROBE_PATHS {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    let view = build_config_view(request);
    server.fn_handler("/api/config", Method::Get, move |req| write_json(req, &view))?;

    server.fn_handler::<anyhow::Error, _>("/api/provision", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let form: ProvisionForm = match serde_json::from_slice(&body) {
            Ok(form) => form,
            Err(_) => return write_error(req, 400, "invalid provisioning payload"),
        };

        if let Err(message) = form.validate() {
            return write_error(req, 400, &message);
        }

        let response = ProvisionResponse {
            ssid: form.ssid.trim().to_string(),
            saved: form.save,
        };
        if submissions.try_send(form.into_submission()).is_err() {
            return write_error(req, 409, "provisioning already submitted");
        }
        write_json(req, &response)
    })?;

    Ok(server)
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// State written by the receiver thread of one client instance.
struct MqttShared {
    connected: AtomicBool,
    state_code: AtomicI32,
    inbound: Mutex<VecDeque<(String, Vec<u8>)>>,
}

impl Default for MqttShared {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            state_code: AtomicI32::new(STATE_DISCONNECTED),
            inbound: Mutex::new(VecDeque::new()),
        }
    }
}

/// ESP-IDF MQTT client. Events arrive on a background thread and are queued
/// until the control loop polls.
#[derive(Default)]
struct EspTransport {
    endpoint: Option<BrokerEndpoint>,
    client: Option<EspMqttClient<'static>>,
    shared: Arc<MqttShared>,
}

impl EspTransport {
    fn drop_client(&mut self) {
        self.client = None;
        self.shared.connected.store(false, Ordering::Relaxed);
    }
}

impl BrokerTransport for EspTransport {
    fn set_server(&mut self, endpoint: &BrokerEndpoint) {
        self.drop_client();
        self.endpoint = Some(endpoint.clone());
    }

    fn connect(&mut self, client_id: &str) -> bool {
        self.drop_client();
        let Some(endpoint) = self.endpoint.clone() else {
            self.shared
                .state_code
                .store(STATE_CONNECT_FAILED, Ordering::Relaxed);
            return false;
        };

        let shared = Arc::new(MqttShared::default());
        self.shared = shared.clone();

        let url = format!("mqtt://{}:{}", endpoint.host, endpoint.port);
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: endpoint.username.as_deref(),
            keep_alive_interval: Some(Duration::from_secs(u64::from(endpoint.keep_alive_secs))),
            network_timeout: Duration::from_millis(endpoint.io_timeout_ms),
            ..Default::default()
        };

        let (client, connection) = match EspMqttClient::new(&url, &conf) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("mqtt client setup failed: {err}");
                shared.state_code.store(STATE_CONNECT_FAILED, Ordering::Relaxed);
                return false;
            }
        };
        if let Err(err) = spawn_mqtt_receiver(connection, shared.clone()) {
            warn!("{err:#}");
            shared.state_code.store(STATE_CONNECT_FAILED, Ordering::Relaxed);
            return false;
        }
        self.client = Some(client);

        let deadline = Instant::now() + Duration::from_millis(endpoint.io_timeout_ms);
        while Instant::now() < deadline {
            if shared.connected.load(Ordering::Relaxed) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if shared.connected.load(Ordering::Relaxed) {
            return true;
        }

        self.client = None;
        shared
            .state_code
            .store(STATE_CONNECTION_TIMEOUT, Ordering::Relaxed);
        false
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|err| debug!("mqtt publish rejected: {err}"))
            .is_ok()
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| debug!("mqtt subscribe rejected: {err}"))
            .is_ok()
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) -> bool {
        if self.client.is_none() {
            return false;
        }

        let pending: Vec<(String, Vec<u8>)> = match self.shared.inbound.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for (topic, payload) in &pending {
            on_message(topic, payload);
        }

        if !self.shared.connected.load(Ordering::Relaxed) {
            self.client = None;
            return false;
        }
        true
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.shared.connected.load(Ordering::Relaxed)
    }

    fn state_code(&self) -> i32 {
        self.shared.state_code.load(Ordering::Relaxed)
    }
}

fn spawn_mqtt_receiver(
    mut connection: EspMqttConnection,
    shared: Arc<MqttShared>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = connection.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        shared.connected.store(true, Ordering::Relaxed);
                        shared.state_code.store(STATE_CONNECTED, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        shared.connected.store(false, Ordering::Relaxed);
                        shared
                            .state_code
                            .store(STATE_CONNECTION_LOST, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Only complete payloads are dispatched.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if let Ok(mut queue) = shared.inbound.lock() {
                            queue.push_back((topic.to_string(), data.to_vec()));
                        }
                    }
                    EventPayload::Error(err) => debug!("mqtt event error: {err:?}"),
                    _ => {}
                }
            }
            shared.connected.store(false, Ordering::Relaxed);
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

struct GpioOutput {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    gpio: u8,
}

impl GpioOutput {
    fn open(gpio: u8) -> anyhow::Result<Self> {
        let pin = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(gpio))) }
            .with_context(|| format!("gpio{gpio} output unavailable"))?;
        Ok(Self { pin, gpio })
    }
}

impl DigitalOutput for GpioOutput {
    fn write(&mut self, level: Level) {
        let result = if level.is_high() {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("gpio{} write failed: {err}", self.gpio);
        }
    }
}

struct GpioButton {
    pin: PinDriver<'static, AnyInputPin, Input>,
}

impl GpioButton {
    fn open(gpio: u8) -> anyhow::Result<Self> {
        let pin = unsafe { PinDriver::input(AnyInputPin::new(i32::from(gpio))) }
            .with_context(|| format!("gpio{gpio} input unavailable"))?;
        Ok(Self { pin })
    }
}

impl DigitalInput for GpioButton {
    fn read(&mut self) -> Level {
        Level::from_high(self.pin.is_high())
    }
}
