use tracing::{debug, info, warn};

use crate::{
    config::{ConfigField, ConfigurationRecord, NodeSettings},
    connectivity::{ConnectivitySession, NetworkLink, WifiCredentials},
};

pub const PROVISIONING_AP_SSID: &str = "RelayNode-Setup";
pub const PROVISIONING_AP_PASSWORD: &str = "12345678";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalField {
    pub field: ConfigField,
    pub id: &'static str,
    pub label: &'static str,
    pub value: String,
    pub max_len: usize,
    pub secret: bool,
}

/// What the operator is shown: access point identity, prompts and how long to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub ap_ssid: &'static str,
    pub ap_password: &'static str,
    pub fields: Vec<PortalField>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSubmission {
    pub credentials: WifiCredentials,
    /// Field id to submitted value.
    pub fields: Vec<(String, String)>,
    pub save_requested: bool,
}

/// Interactive credential acquisition (captive portal or equivalent).
pub trait ProvisioningPortal {
    /// Blocks until an operator submits the form, or returns `None` once
    /// `request.timeout_ms` passes without one.
    fn run(&mut self, request: &PortalRequest) -> Option<PortalSubmission>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningReport {
    pub connected: bool,
    /// The record changed and must be persisted.
    pub dirty: bool,
}

pub struct ProvisioningAgent {
    join_timeout_ms: u64,
    portal_timeout_ms: u64,
}

impl ProvisioningAgent {
    pub fn new(settings: &NodeSettings) -> Self {
        Self {
            join_timeout_ms: settings.wifi_connect_timeout_ms,
            portal_timeout_ms: settings.portal_timeout_ms,
        }
    }

    pub fn run<L, P>(
        &self,
        record: &mut ConfigurationRecord,
        session: &mut ConnectivitySession<L>,
        portal: &mut P,
    ) -> ProvisioningReport
    where
        L: NetworkLink,
        P: ProvisioningPortal,
    {
        if let Some(static_ip) = record.static_ip {
            if session.link_mut().apply_static_ip(&static_ip) {
                info!(
                    "static ip configured: ip={}, gateway={}, subnet={}",
                    static_ip.ip, static_ip.gateway, static_ip.subnet
                );
            } else {
                warn!("failed to apply static ip {}; using dynamic address", static_ip.ip);
            }
        }

        if session.link().has_stored_credentials() {
            info!("joining stored network");
            if session.link_mut().join_stored(self.join_timeout_ms) {
                session.settle();
                return ProvisioningReport {
                    connected: session.is_up(),
                    dirty: false,
                };
            }
            warn!(
                "stored network not reachable within {}ms; starting provisioning",
                self.join_timeout_ms
            );
        } else {
            warn!("no stored network credentials; starting provisioning");
        }

        session.begin_provisioning();
        let request = self.portal_request(record);
        info!(
            "provisioning portal on AP `{}` (password: `{}`), waiting up to {}s",
            request.ap_ssid,
            request.ap_password,
            request.timeout_ms / 1000
        );

        let Some(submission) = portal.run(&request) else {
            warn!("provisioning portal timed out without operator input");
            session.settle();
            return ProvisioningReport {
                connected: false,
                dirty: false,
            };
        };

        let dirty = submission.save_requested;
        if dirty {
            apply_submission(record, &submission);
        }

        info!("joining `{}`", submission.credentials.ssid);
        let joined = session
            .link_mut()
            .join(&submission.credentials, self.join_timeout_ms);
        session.settle();

        if joined && session.is_up() {
            info!("provisioned network joined");
        } else {
            warn!("failed to join `{}`", submission.credentials.ssid);
        }

        ProvisioningReport {
            connected: session.is_up(),
            dirty,
        }
    }

    pub fn portal_request(&self, record: &ConfigurationRecord) -> PortalRequest {
        PortalRequest {
            ap_ssid: PROVISIONING_AP_SSID,
            ap_password: PROVISIONING_AP_PASSWORD,
            fields: ConfigField::ALL
                .into_iter()
                .map(|field| PortalField {
                    field,
                    id: field.id(),
                    label: field.label(),
                    value: record.field_value(field),
                    max_len: field.max_len(),
                    secret: field.is_secret(),
                })
                .collect(),
            timeout_ms: self.portal_timeout_ms,
        }
    }
}

fn apply_submission(record: &mut ConfigurationRecord, submission: &PortalSubmission) {
    for (id, value) in &submission.fields {
        let Some(field) = ConfigField::from_id(id) else {
            debug!("ignoring unknown portal field `{id}`");
            continue;
        };

        match record.apply_field(field, value) {
            Ok(true) => info!("portal updated `{}`", field.id()),
            Ok(false) => {}
            Err(err) => warn!("portal value for `{}` rejected: {err}", field.id()),
        }
    }
}
