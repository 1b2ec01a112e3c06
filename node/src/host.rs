use std::{
    convert::Infallible,
    fs,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Packet, QoS,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};

use relaynode_common::{
    BlobStorage, BrokerEndpoint, BrokerTransport, DigitalInput, DigitalOutput, Level,
    LinkAddresses, NetworkLink, NodeParts, NodeSettings, PortalRequest, PortalSubmission,
    ProvisioningPortal, StaticIpConfig, StorageError, Supervisor, SystemClock, WifiCredentials,
};

use crate::{
    board, flag_enabled,
    form::{
        build_config_view, ConfigView, ProvisionForm, ProvisionResponse, StoredCredentials,
        CAPTIVE_PROBE_PATHS, PORTAL_HTML,
    },
};

const DEFAULT_DATA_DIR: &str = "./.relaynode";
const DEFAULT_PORTAL_ADDR: &str = "127.0.0.1:8080";
const RESTART_DELAY_MS: u64 = 1_000;
const POLL_SLICE_MS: u64 = 20;
const MAX_EVENTS_PER_POLL: usize = 32;

const STATE_CONNECTION_TIMEOUT: i32 = -4;
const STATE_CONNECTION_LOST: i32 = -3;
const STATE_CONNECT_FAILED: i32 = -2;
const STATE_DISCONNECTED: i32 = -1;
const STATE_CONNECTED: i32 = 0;

#[derive(Debug, Clone)]
struct HostConfig {
    data_dir: PathBuf,
    portal_addr: SocketAddr,
    button_path: PathBuf,
    settings: NodeSettings,
}

impl HostConfig {
    fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("RELAYNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let portal_addr = std::env::var("RELAYNODE_PORTAL_ADDR")
            .unwrap_or_else(|_| DEFAULT_PORTAL_ADDR.to_string());
        let portal_addr: SocketAddr = portal_addr
            .parse()
            .with_context(|| format!("invalid RELAYNODE_PORTAL_ADDR `{portal_addr}`"))?;

        let button_path = std::env::var("RELAYNODE_BUTTON_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("button"));

        let mut settings = NodeSettings::default();
        if let Some(backoff_ms) = std::env::var("RELAYNODE_BACKOFF_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            settings.reconnect_backoff_ms = backoff_ms;
        }
        settings.clear_credentials = std::env::var("RELAYNODE_CLEAR_CREDENTIALS")
            .map(|value| flag_enabled(&value))
            .unwrap_or(false);
        settings.sanitize();

        Ok(Self {
            data_dir,
            portal_addr,
            button_path,
            settings,
        })
    }
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env()?;
    info!(
        "relaynode host starting: data_dir={}, portal=http://{}, button={}",
        config.data_dir.display(),
        config.portal_addr,
        config.button_path.display()
    );

    loop {
        if let Err(err) = run_node(&config) {
            warn!("node stopped: {err:#}");
        }
        warn!("control loop exited; restarting in {RESTART_DELAY_MS}ms");
        thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
    }
}

fn run_node(config: &HostConfig) -> anyhow::Result<()> {
    let outputs = board::output_channels(|gpio| Ok::<_, Infallible>(LoggedPin::new(gpio)))?;

    let parts = NodeParts {
        storage: FileStorage::new(config.data_dir.join("config.json")),
        link: HostLink::open(config.data_dir.join("credentials.json")),
        transport: MqttTransport::default(),
        input: FileButton::new(config.button_path.clone()),
        outputs,
        remote_output: board::remote_output_index(),
        clock: SystemClock,
        seed: random_seed(),
    };

    let mut supervisor = Supervisor::new(parts, config.settings.clone());
    supervisor
        .startup(&mut HostPortal::new(config.portal_addr))
        .context("startup failed")?;
    supervisor.run(None);
    Ok(())
}

fn random_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ u64::from(std::process::id())
}

struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl BlobStorage for FileStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StorageError::Mount(format!("{}: {err}", parent.display())))?;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Read(format!("{}: {err}", self.path.display()))),
        }
    }

    fn write(&mut self, blob: &[u8]) -> Result<(), StorageError> {
        let staged = self.path.with_extension("json.tmp");
        fs::write(&staged, blob)
            .and_then(|()| fs::rename(&staged, &self.path))
            .map_err(|err| StorageError::Write(format!("{}: {err}", self.path.display())))
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Erase(format!("{}: {err}", self.path.display()))),
        }
    }
}

/// Stands in for the WiFi station on a workstation: the host network is
/// assumed reachable once an SSID has been provisioned.
struct HostLink {
    path: PathBuf,
    credentials: Option<StoredCredentials>,
    static_ip: Option<StaticIpConfig>,
    up: bool,
}

impl HostLink {
    fn open(path: PathBuf) -> Self {
        let credentials = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<StoredCredentials>(&raw)
                .map_err(|err| warn!("ignoring unreadable {}: {err}", path.display()))
                .ok(),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!("failed to read {}: {err}", path.display());
                None
            }
        };

        Self {
            path,
            credentials,
            static_ip: None,
            up: false,
        }
    }

    fn persist(&self, credentials: &StoredCredentials) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(credentials)?)?;
        Ok(())
    }
}

impl NetworkLink for HostLink {
    fn apply_static_ip(&mut self, config: &StaticIpConfig) -> bool {
        self.static_ip = Some(*config);
        true
    }

    fn has_stored_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn join_stored(&mut self, _timeout_ms: u64) -> bool {
        self.up = self.credentials.is_some();
        if let Some(credentials) = &self.credentials {
            info!("joined stored network `{}`", credentials.ssid);
        }
        self.up
    }

    fn join(&mut self, credentials: &WifiCredentials, _timeout_ms: u64) -> bool {
        if credentials.ssid.trim().is_empty() {
            return false;
        }

        let stored = StoredCredentials::from(credentials);
        if let Err(err) = self.persist(&stored) {
            warn!("failed to persist network credentials: {err:#}");
        }
        self.credentials = Some(stored);
        self.up = true;
        true
    }

    fn request_rejoin(&mut self) {
        self.up = self.credentials.is_some();
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
                local: Ipv4Addr::LOCALHOST,
                gateway: Ipv4Addr::LOCALHOST,
                subnet_mask: Ipv4Addr::new(255, 0, 0, 0),
            },
        })
    }

    fn erase_credentials(&mut self) -> bool {
        self.credentials = None;
        self.up = false;
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => {
                warn!("failed to remove {}: {err}", self.path.display());
                false
            }
        }
    }
}

#[derive(Clone)]
struct PortalState {
    view: Arc<ConfigView>,
    submissions: mpsc::Sender<PortalSubmission>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct HostPortal {
    addr: SocketAddr,
}

impl HostPortal {
    fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl ProvisioningPortal for HostPortal {
    fn run(&mut self, request: &PortalRequest) -> Option<PortalSubmission> {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!("failed to start portal runtime: {err}");
                return None;
            }
        };

        runtime
            .block_on(serve_portal(self.addr, request))
            .unwrap_or_else(|err| {
                warn!("provisioning portal failed: {err:#}");
                None
            })
    }
}

async fn serve_portal(
    addr: SocketAddr,
    request: &PortalRequest,
) -> anyhow::Result<Option<PortalSubmission>> {
    let (tx, mut rx) = mpsc::channel(1);
    let state = PortalState {
        view: Arc::new(build_config_view(request)),
        submissions: tx,
    };

    let mut app = Router::new()
        .route("/api/config", get(handle_get_config))
        .route("/api/provision", post(handle_post_provision));
    for path in CAPTIVE_PROBE_PATHS {
        app = app.route(path, get(handle_get_page));
    }
    let app = app.with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning portal at {addr}"))?;
    info!("provisioning portal listening on http://{addr}");

    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    let submission = first_submission(&mut rx, request.timeout_ms).await;

    if submission.is_some() {
        // let the response reach the operator before the listener goes away
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    server.abort();
    Ok(submission)
}

/// Waits for one submission, then closes the channel so later posts are refused.
async fn first_submission(
    rx: &mut mpsc::Receiver<PortalSubmission>,
    timeout_ms: u64,
) -> Option<PortalSubmission> {
    let submission = tokio::time::timeout(Duration::from_millis(timeout_ms), rx.recv())
        .await
        .ok()
        .flatten();
    rx.close();
    submission
}

async fn handle_get_page() -> Html<&'static str> {
    Html(PORTAL_HTML)
}

async fn handle_get_config(State(state): State<PortalState>) -> impl IntoResponse {
    Json(state.view.as_ref().clone())
}

async fn handle_post_provision(
    State(state): State<PortalState>,
    Json(form): Json<ProvisionForm>,
) -> impl IntoResponse {
    if let Err(message) = form.validate() {
        return error_response(StatusCode::BAD_REQUEST, &message);
    }

    let response = ProvisionResponse {
        ssid: form.ssid.trim().to_string(),
        saved: form.save,
    };
    if state.submissions.try_send(form.into_submission()).is_err() {
        return error_response(StatusCode::CONFLICT, "provisioning already submitted");
    }

    info!("provisioning submission received for `{}`", response.ssid);
    Json(response).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Blocking MQTT client. Each `connect` builds a fresh client so the broker
/// sees the new client id.
struct MqttTransport {
    endpoint: Option<BrokerEndpoint>,
    session: Option<(Client, Connection)>,
    connected: bool,
    state_code: i32,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self {
            endpoint: None,
            session: None,
            connected: false,
            state_code: STATE_DISCONNECTED,
        }
    }
}

impl MqttTransport {
    fn drop_session(&mut self) {
        if let Some((client, _)) = self.session.take() {
            let _ = client.try_disconnect();
        }
        self.connected = false;
    }
}

impl BrokerTransport for MqttTransport {
    fn set_server(&mut self, endpoint: &BrokerEndpoint) {
        self.drop_session();
        self.endpoint = Some(endpoint.clone());
    }

    fn connect(&mut self, client_id: &str) -> bool {
        self.drop_session();
        let Some(endpoint) = &self.endpoint else {
            self.state_code = STATE_CONNECT_FAILED;
            return false;
        };

        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(Duration::from_secs(u64::from(endpoint.keep_alive_secs)));
        if let Some(username) = &endpoint.username {
            options.set_credentials(username.clone(), "");
        }

        let (client, mut connection) = Client::new(options, 16);
        let deadline = Instant::now() + Duration::from_millis(endpoint.io_timeout_ms);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        self.state_code = refused_code(ack.code);
                        return false;
                    }
                    self.connected = true;
                    self.state_code = STATE_CONNECTED;
                    self.session = Some((client, connection));
                    return true;
                }
                Ok(Ok(_)) => {}
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    self.state_code = refused_code(code);
                    return false;
                }
                Ok(Err(err)) => {
                    debug!("mqtt connect error: {err}");
                    self.state_code = STATE_CONNECT_FAILED;
                    return false;
                }
                Err(_) => {
                    self.state_code = STATE_CONNECTION_TIMEOUT;
                    return false;
                }
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some((client, _)) = &self.session else {
            return false;
        };
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| debug!("mqtt publish rejected: {err}"))
            .is_ok()
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let Some((client, _)) = &self.session else {
            return false;
        };
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| debug!("mqtt subscribe rejected: {err}"))
            .is_ok()
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) -> bool {
        let Some((_, connection)) = self.session.as_mut() else {
            return false;
        };

        let mut lost = false;
        for _ in 0..MAX_EVENTS_PER_POLL {
            match connection.recv_timeout(Duration::from_millis(POLL_SLICE_MS)) {
                Ok(Ok(Event::Incoming(Packet::Publish(message)))) => {
                    on_message(&message.topic, &message.payload);
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    lost = true;
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("mqtt connection error: {err}");
                    lost = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if lost {
            self.drop_session();
            self.state_code = STATE_CONNECTION_LOST;
            return false;
        }
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn state_code(&self) -> i32 {
        self.state_code
    }
}

fn refused_code(code: ConnectReturnCode) -> i32 {
    match code {
        ConnectReturnCode::Success => STATE_CONNECTED,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// Reads high while a marker file exists, e.g. `touch .relaynode/button`.
struct FileButton {
    path: PathBuf,
}

impl FileButton {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DigitalInput for FileButton {
    fn read(&mut self) -> Level {
        Level::from_high(self.path.exists())
    }
}

struct LoggedPin {
    gpio: u8,
    level: Option<Level>,
}

impl LoggedPin {
    fn new(gpio: u8) -> Self {
        Self { gpio, level: None }
    }
}

impl DigitalOutput for LoggedPin {
    fn write(&mut self, level: Level) {
        if self.level != Some(level) {
            info!("gpio{} -> {}", self.gpio, level.as_str());
        }
        self.level = Some(level);
    }
}

#[cfg(test)]
mod tests {
    use relaynode_common::{ConfigurationRecord, ProvisioningAgent};

    use super::*;

    fn portal_state() -> (PortalState, mpsc::Receiver<PortalSubmission>) {
        let request = ProvisioningAgent::new(&NodeSettings::default())
            .portal_request(&ConfigurationRecord::default());
        let (tx, rx) = mpsc::channel(1);
        let state = PortalState {
            view: Arc::new(build_config_view(&request)),
            submissions: tx,
        };
        (state, rx)
    }

    fn provision_form(ssid: &str) -> Json<ProvisionForm> {
        Json(serde_json::from_value(serde_json::json!({ "ssid": ssid })).unwrap())
    }

    async fn post(state: &PortalState, ssid: &str) -> StatusCode {
        handle_post_provision(State(state.clone()), provision_form(ssid))
            .await
            .into_response()
            .status()
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("nested").join("config.json"));

        storage.mount().unwrap();
        assert_eq!(storage.read().unwrap(), None);

        storage.write(br#"{"mqtt_topic":"garden"}"#).unwrap();
        assert_eq!(
            storage.read().unwrap().as_deref(),
            Some(&br#"{"mqtt_topic":"garden"}"#[..])
        );

        storage.erase().unwrap();
        storage.erase().unwrap();
        assert_eq!(storage.read().unwrap(), None);
    }

    #[test]
    fn host_link_remembers_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let mut link = HostLink::open(path.clone());
        assert!(!link.has_stored_credentials());
        assert!(link.join(
            &WifiCredentials {
                ssid: "home".to_string(),
                password: "secret".to_string(),
            },
            1_000
        ));

        let mut reopened = HostLink::open(path);
        assert!(reopened.has_stored_credentials());
        assert!(reopened.join_stored(1_000));
        assert_eq!(
            reopened.addresses().map(|addresses| addresses.local),
            Some(Ipv4Addr::LOCALHOST)
        );

        assert!(reopened.erase_credentials());
        assert!(!reopened.is_up());
        assert!(!reopened.has_stored_credentials());
    }

    #[test]
    fn host_link_reports_static_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = HostLink::open(dir.path().join("credentials.json"));
        let config = StaticIpConfig {
            ip: Ipv4Addr::new(192, 168, 1, 3),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
        };

        assert!(link.apply_static_ip(&config));
        assert_eq!(link.addresses(), None);

        link.join(
            &WifiCredentials {
                ssid: "home".to_string(),
                password: String::new(),
            },
            1_000,
        );
        assert_eq!(
            link.addresses().map(|addresses| addresses.local),
            Some(config.ip)
        );
    }

    #[test]
    fn button_follows_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("button");
        let mut button = FileButton::new(path.clone());

        assert_eq!(button.read(), Level::Low);
        fs::write(&path, b"").unwrap();
        assert_eq!(button.read(), Level::High);
    }

    #[test]
    fn transport_without_endpoint_refuses() {
        let mut transport = MqttTransport::default();

        assert!(!transport.connect("relaynode-0000-1"));
        assert_eq!(transport.state_code(), STATE_CONNECT_FAILED);
        assert!(!transport.poll(&mut |_, _| {}));
    }

    #[tokio::test]
    async fn portal_refuses_submission_while_one_is_pending() {
        let (state, mut rx) = portal_state();

        assert_eq!(post(&state, "home").await, StatusCode::OK);
        assert_eq!(post(&state, "other").await, StatusCode::CONFLICT);

        let submission = first_submission(&mut rx, 1_000).await.unwrap();
        assert_eq!(submission.credentials.ssid, "home");
    }

    #[tokio::test]
    async fn portal_refuses_submission_after_first_is_taken() {
        let (state, mut rx) = portal_state();

        assert_eq!(post(&state, "home").await, StatusCode::OK);
        assert!(first_submission(&mut rx, 1_000).await.is_some());

        assert_eq!(post(&state, "other").await, StatusCode::CONFLICT);
        assert!(rx.recv().await.is_none());
    }
}
