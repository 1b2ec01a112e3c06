use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_BROKER_HOST: &str = "192.168.1.2";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_API_TOKEN: &str = "YOUR_APITOKEN";
pub const DEFAULT_TOPIC: &str = "Topic";
pub const DEFAULT_STATIC_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const DEFAULT_STATIC_SUBNET: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

pub const MAX_BROKER_HOST_LEN: usize = 40;
pub const MAX_PORT_DIGITS: usize = 5;
pub const MAX_API_TOKEN_LEN: usize = 34;
pub const MAX_TOPIC_LEN: usize = 34;

const KEY_SERVER: &str = "mqtt_server";
const KEY_PORT: &str = "mqtt_port";
const KEY_API_TOKEN: &str = "api_token";
const KEY_TOPIC: &str = "mqtt_topic";
const KEY_IP: &str = "ip";
const KEY_GATEWAY: &str = "gateway";
const KEY_SUBNET: &str = "subnet";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("value cannot be empty")]
    Empty,
    #[error("value exceeds {max} characters")]
    TooLong { max: usize },
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("invalid IPv4 address `{0}`")]
    InvalidAddress(String),
    #[error("invalid subnet mask `{0}`")]
    InvalidSubnetMask(String),
    #[error("unexpected JSON type")]
    WrongType,
}

/// A stored field that could not be used and fell back to its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRejection {
    pub key: &'static str,
    pub error: FieldError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIpConfig {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRecord {
    pub broker_host: String,
    pub broker_port: u16,
    pub api_token: String,
    pub topic: String,
    pub static_ip: Option<StaticIpConfig>,
}

impl Default for ConfigurationRecord {
    fn default() -> Self {
        Self {
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            api_token: DEFAULT_API_TOKEN.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            static_ip: None,
        }
    }
}

/// Operator-editable fields offered by the provisioning portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Server,
    Port,
    ApiKey,
    Topic,
}

impl ConfigField {
    pub const ALL: [ConfigField; 4] = [Self::Server, Self::Port, Self::ApiKey, Self::Topic];

    pub fn id(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Port => "port",
            Self::ApiKey => "apikey",
            Self::Topic => "topic",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Server => "mqtt server",
            Self::Port => "mqtt port",
            Self::ApiKey => "API token",
            Self::Topic => "Subscribe to topic",
        }
    }

    pub fn max_len(self) -> usize {
        match self {
            Self::Server => MAX_BROKER_HOST_LEN,
            Self::Port => MAX_PORT_DIGITS,
            Self::ApiKey => MAX_API_TOKEN_LEN,
            Self::Topic => MAX_TOPIC_LEN,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.id() == id)
    }

    pub fn is_secret(self) -> bool {
        self == Self::ApiKey
    }
}

#[derive(Debug, Serialize)]
struct StoredRecord<'a> {
    mqtt_server: &'a str,
    mqtt_port: String,
    api_token: &'a str,
    mqtt_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnet: Option<String>,
}

impl ConfigurationRecord {
    /// Decodes a persisted blob field by field.
    ///
    /// Only a blob that is not a JSON object is an error; every individual field that is
    /// missing or unusable resolves to its default and unusable ones are reported back.
    pub fn decode_lenient(raw: &[u8]) -> Result<(Self, Vec<FieldRejection>), serde_json::Error> {
        let map: Map<String, Value> = serde_json::from_slice(raw)?;
        let mut record = Self::default();
        let mut rejected = Vec::new();

        if let Some(value) = lookup(&map, &[KEY_SERVER, "broker_host"]) {
            match as_text(value).and_then(parse_broker_host) {
                Ok(host) => record.broker_host = host,
                Err(error) => rejected.push(FieldRejection { key: KEY_SERVER, error }),
            }
        }

        if let Some(value) = lookup(&map, &[KEY_PORT, "broker_port"]) {
            match parse_port_value(value) {
                Ok(port) => record.broker_port = port,
                Err(error) => rejected.push(FieldRejection { key: KEY_PORT, error }),
            }
        }

        if let Some(value) = lookup(&map, &[KEY_API_TOKEN]) {
            match as_text(value).and_then(parse_api_token) {
                Ok(token) => record.api_token = token,
                Err(error) => rejected.push(FieldRejection {
                    key: KEY_API_TOKEN,
                    error,
                }),
            }
        }

        if let Some(value) = lookup(&map, &[KEY_TOPIC, "topic"]) {
            match as_text(value).and_then(parse_topic) {
                Ok(topic) => record.topic = topic,
                Err(error) => rejected.push(FieldRejection { key: KEY_TOPIC, error }),
            }
        }

        let ip = lookup(&map, &[KEY_IP]).map(|value| as_text(value).and_then(parse_address));
        let gateway =
            lookup(&map, &[KEY_GATEWAY]).map(|value| as_text(value).and_then(parse_address));
        let subnet =
            lookup(&map, &[KEY_SUBNET]).map(|value| as_text(value).and_then(parse_subnet_mask));

        match ip {
            Some(Ok(ip)) => {
                let mut resolved = StaticIpConfig {
                    ip,
                    gateway: DEFAULT_STATIC_GATEWAY,
                    subnet: DEFAULT_STATIC_SUBNET,
                };
                match gateway {
                    Some(Ok(gateway)) => resolved.gateway = gateway,
                    Some(Err(error)) => rejected.push(FieldRejection {
                        key: KEY_GATEWAY,
                        error,
                    }),
                    None => {}
                }
                match subnet {
                    Some(Ok(subnet)) => resolved.subnet = subnet,
                    Some(Err(error)) => rejected.push(FieldRejection {
                        key: KEY_SUBNET,
                        error,
                    }),
                    None => {}
                }
                record.static_ip = Some(resolved);
            }
            Some(Err(error)) => rejected.push(FieldRejection { key: KEY_IP, error }),
            None => {}
        }

        Ok((record, rejected))
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let stored = StoredRecord {
            mqtt_server: &self.broker_host,
            mqtt_port: self.broker_port.to_string(),
            api_token: &self.api_token,
            mqtt_topic: &self.topic,
            ip: self.static_ip.map(|config| config.ip.to_string()),
            gateway: self.static_ip.map(|config| config.gateway.to_string()),
            subnet: self.static_ip.map(|config| config.subnet.to_string()),
        };
        serde_json::to_vec(&stored)
    }

    pub fn field_value(&self, field: ConfigField) -> String {
        match field {
            ConfigField::Server => self.broker_host.clone(),
            ConfigField::Port => self.broker_port.to_string(),
            ConfigField::ApiKey => self.api_token.clone(),
            ConfigField::Topic => self.topic.clone(),
        }
    }

    /// Validates and stores an operator-supplied value. Returns whether the record changed.
    pub fn apply_field(&mut self, field: ConfigField, value: &str) -> Result<bool, FieldError> {
        if value.len() > field.max_len() {
            return Err(FieldError::TooLong {
                max: field.max_len(),
            });
        }

        let changed = match field {
            ConfigField::Server => replace(&mut self.broker_host, parse_broker_host(value)?),
            ConfigField::Port => replace(&mut self.broker_port, parse_port(value)?),
            ConfigField::ApiKey => replace(&mut self.api_token, parse_api_token(value)?),
            ConfigField::Topic => replace(&mut self.topic, parse_topic(value)?),
        };
        Ok(changed)
    }

    pub fn has_api_token(&self) -> bool {
        let token = self.api_token.trim();
        !token.is_empty() && token != DEFAULT_API_TOKEN
    }
}

/// First non-null value among `keys`; later keys are accepted aliases.
fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| map.get(*key).filter(|value| !value.is_null()))
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn as_text(value: &Value) -> Result<&str, FieldError> {
    value.as_str().ok_or(FieldError::WrongType)
}

pub fn parse_broker_host(value: &str) -> Result<String, FieldError> {
    let host = value.trim();
    if host.is_empty() {
        return Err(FieldError::Empty);
    }
    if host.len() > MAX_BROKER_HOST_LEN {
        return Err(FieldError::TooLong {
            max: MAX_BROKER_HOST_LEN,
        });
    }
    Ok(host.to_string())
}

pub fn parse_port(value: &str) -> Result<u16, FieldError> {
    let digits = value.trim();
    if digits.is_empty() {
        return Err(FieldError::Empty);
    }
    if digits.len() > MAX_PORT_DIGITS || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(FieldError::InvalidPort);
    }
    match digits.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(FieldError::InvalidPort),
    }
}

fn parse_port_value(value: &Value) -> Result<u16, FieldError> {
    match value {
        Value::String(text) => parse_port(text),
        Value::Number(number) => number
            .as_u64()
            .filter(|port| (1..=u64::from(u16::MAX)).contains(port))
            .map(|port| port as u16)
            .ok_or(FieldError::InvalidPort),
        _ => Err(FieldError::WrongType),
    }
}

pub fn parse_api_token(value: &str) -> Result<String, FieldError> {
    if value.len() > MAX_API_TOKEN_LEN {
        return Err(FieldError::TooLong {
            max: MAX_API_TOKEN_LEN,
        });
    }
    Ok(value.to_string())
}

pub fn parse_topic(value: &str) -> Result<String, FieldError> {
    let topic = value.trim();
    if topic.is_empty() {
        return Err(FieldError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(FieldError::TooLong { max: MAX_TOPIC_LEN });
    }
    Ok(topic.to_string())
}

pub fn parse_address(value: &str) -> Result<Ipv4Addr, FieldError> {
    value
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| FieldError::InvalidAddress(value.to_string()))
}

pub fn parse_subnet_mask(value: &str) -> Result<Ipv4Addr, FieldError> {
    let mask = parse_address(value)?;
    let bits = u32::from(mask);
    if bits == 0 || bits.leading_ones() + bits.trailing_zeros() != 32 {
        return Err(FieldError::InvalidSubnetMask(value.to_string()));
    }
    Ok(mask)
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub reconnect_backoff_ms: u64,
    /// Bounds `ensure_connected`; `None` retries forever.
    pub max_connect_attempts: Option<u32>,
    pub telemetry_interval_ms: u64,
    pub broker_io_timeout_ms: u64,
    pub broker_keep_alive_secs: u16,
    pub wifi_connect_timeout_ms: u64,
    pub portal_timeout_ms: u64,
    pub link_retry_interval_ms: u64,
    /// Pause at the end of each control-loop iteration.
    pub loop_interval_ms: u64,
    pub client_id_prefix: String,
    pub clear_credentials: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: 5_000,
            max_connect_attempts: None,
            telemetry_interval_ms: 2_000,
            broker_io_timeout_ms: 1_000,
            broker_keep_alive_secs: 15,
            wifi_connect_timeout_ms: 10_000,
            portal_timeout_ms: 180_000,
            link_retry_interval_ms: 10_000,
            loop_interval_ms: 10,
            client_id_prefix: "relaynode".to_string(),
            clear_credentials: false,
        }
    }
}

impl NodeSettings {
    pub fn sanitize(&mut self) {
        self.reconnect_backoff_ms = self.reconnect_backoff_ms.clamp(100, 600_000);
        self.telemetry_interval_ms = self.telemetry_interval_ms.clamp(100, 3_600_000);
        self.broker_io_timeout_ms = self.broker_io_timeout_ms.clamp(50, 1_000);
        self.broker_keep_alive_secs = self.broker_keep_alive_secs.clamp(5, 3_600);
        self.wifi_connect_timeout_ms = self.wifi_connect_timeout_ms.clamp(1_000, 120_000);
        self.portal_timeout_ms = self.portal_timeout_ms.clamp(10_000, 3_600_000);
        self.link_retry_interval_ms = self.link_retry_interval_ms.clamp(1_000, 600_000);
        self.loop_interval_ms = self.loop_interval_ms.min(1_000);

        let prefix = self.client_id_prefix.trim();
        self.client_id_prefix = if prefix.is_empty() {
            "relaynode".to_string()
        } else {
            prefix.chars().take(16).collect()
        };
    }
}
