pub mod broker;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod io;
pub mod provisioning;
pub mod store;
pub mod supervisor;
pub mod topics;
pub mod types;

#[cfg(test)]
mod mock;

pub use broker::{BrokerEndpoint, BrokerError, BrokerSession, BrokerTransport};
pub use clock::{monotonic_ms, Clock, SystemClock};
pub use config::{ConfigField, ConfigurationRecord, NodeSettings, StaticIpConfig};
pub use connectivity::{ConnectivitySession, LinkAddresses, NetworkLink, WifiCredentials};
pub use io::{DigitalInput, DigitalOutput, InputOutputMonitor, OutputBank};
pub use provisioning::{
    PortalField, PortalRequest, PortalSubmission, ProvisioningAgent, ProvisioningPortal,
    PROVISIONING_AP_PASSWORD, PROVISIONING_AP_SSID,
};
pub use store::{BlobStorage, ConfigStore, StorageError};
pub use supervisor::{NodeParts, StartupError, Supervisor};
pub use topics::*;
pub use types::{BrokerConnectionState, Edge, Level, LinkState};
