use relaynode_common::{
    ConfigField, ConfigurationRecord, PortalRequest, PortalSubmission, WifiCredentials,
};
use serde::{Deserialize, Serialize};

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_WIFI_PASSWORD_LEN: usize = 64;
pub const MAX_HTTP_BODY: usize = 2048;

/// Paths operating systems probe to detect a captive portal.
pub const CAPTIVE_PROBE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Relay Node Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    .card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password]{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Relay Node Setup</h1>
  <div class="card">
    <h2>WiFi</h2>
    <label>SSID</label><input id="ssid" type="text" maxlength="32">
    <label>Password</label><input id="password" type="password" maxlength="64">
  </div>
  <div class="card">
    <h2>Broker</h2>
    <div id="fields"></div>
    <label><input id="save" type="checkbox" checked> Save settings</label>
    <button id="submit">Connect</button>
    <p id="status" class="muted"></p>
  </div>
  <script>
    const fields = document.getElementById('fields');
    const status = document.getElementById('status');
    let ids = [];

    fetch('/api/config').then(r => r.json()).then(cfg => {
      for (const f of cfg.fields) {
        ids.push(f.id);
        const label = document.createElement('label');
        label.textContent = f.label + (f.secret && f.valueSet ? ' (leave blank to keep current)' : '');
        const input = document.createElement('input');
        input.id = f.id;
        input.type = f.secret ? 'password' : 'text';
        input.maxLength = f.maxLen;
        input.value = f.value;
        fields.append(label, input);
      }
    });

    document.getElementById('submit').onclick = async () => {
      const body = {
        ssid: document.getElementById('ssid').value,
        password: document.getElementById('password').value,
        save: document.getElementById('save').checked,
      };
      for (const id of ids) {
        const value = document.getElementById(id).value;
        if (value !== '') body[id] = value;
      }
      const res = await fetch('/api/provision', {
        method: 'POST',
        headers: {'Content-Type': 'application/json'},
        body: JSON.stringify(body),
      });
      const data = await res.json();
      status.className = res.ok ? 'ok' : 'err';
      status.textContent = res.ok ? 'Submitted; the node is joining ' + data.ssid : data.error;
    };
  </script>
</body>
</html>
"#;

/// Operator submission posted by the setup page.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionForm {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub apikey: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_save")]
    pub save: bool,
}

fn default_save() -> bool {
    true
}

impl ProvisionForm {
    fn field_values(&self) -> [(ConfigField, Option<&str>); 4] {
        [
            (ConfigField::Server, self.server.as_deref()),
            (ConfigField::Port, self.port.as_deref()),
            (ConfigField::ApiKey, self.apikey.as_deref()),
            (ConfigField::Topic, self.topic.as_deref()),
        ]
    }

    pub fn validate(&self) -> Result<(), String> {
        let ssid = self.ssid.trim();
        if ssid.is_empty() {
            return Err("ssid cannot be empty".to_string());
        }
        if ssid.len() > MAX_SSID_LEN {
            return Err(format!("ssid exceeds {MAX_SSID_LEN} characters"));
        }
        if self.password.len() > MAX_WIFI_PASSWORD_LEN {
            return Err(format!(
                "password exceeds {MAX_WIFI_PASSWORD_LEN} characters"
            ));
        }

        let mut scratch = ConfigurationRecord::default();
        for (field, value) in self.field_values() {
            if let Some(value) = value {
                scratch
                    .apply_field(field, value)
                    .map_err(|err| format!("{}: {err}", field.id()))?;
            }
        }
        Ok(())
    }

    pub fn into_submission(self) -> PortalSubmission {
        let fields = self
            .field_values()
            .into_iter()
            .filter_map(|(field, value)| {
                value.map(|value| (field.id().to_string(), value.to_string()))
            })
            .collect();

        PortalSubmission {
            credentials: WifiCredentials {
                ssid: self.ssid.trim().to_string(),
                password: self.password,
            },
            fields,
            save_requested: self.save,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldView {
    pub id: &'static str,
    pub label: &'static str,
    /// Empty for secret fields.
    pub value: String,
    #[serde(rename = "valueSet")]
    pub value_set: bool,
    #[serde(rename = "maxLen")]
    pub max_len: usize,
    pub secret: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    #[serde(rename = "apSsid")]
    pub ap_ssid: &'static str,
    pub fields: Vec<FieldView>,
}

pub fn build_config_view(request: &PortalRequest) -> ConfigView {
    ConfigView {
        ap_ssid: request.ap_ssid,
        fields: request
            .fields
            .iter()
            .map(|field| FieldView {
                id: field.id,
                label: field.label,
                value: if field.secret {
                    String::new()
                } else {
                    field.value.clone()
                },
                value_set: !field.value.is_empty(),
                max_len: field.max_len,
                secret: field.secret,
            })
            .collect(),
    }
}

/// Station credentials as persisted next to the configuration blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub ssid: String,
    pub password: String,
}

impl From<&WifiCredentials> for StoredCredentials {
    fn from(credentials: &WifiCredentials) -> Self {
        Self {
            ssid: credentials.ssid.clone(),
            password: credentials.password.clone(),
        }
    }
}

impl From<StoredCredentials> for WifiCredentials {
    fn from(stored: StoredCredentials) -> Self {
        Self {
            ssid: stored.ssid,
            password: stored.password,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub ssid: String,
    pub saved: bool,
}

#[cfg(test)]
mod tests {
    use relaynode_common::{NodeSettings, ProvisioningAgent};

    use super::*;

    fn form(json: &str) -> ProvisionForm {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn minimal_form_defaults_to_save() {
        let form = form(r#"{"ssid":"home"}"#);

        assert!(form.validate().is_ok());
        let submission = form.into_submission();
        assert!(submission.save_requested);
        assert!(submission.fields.is_empty());
        assert_eq!(submission.credentials.password, "");
    }

    #[test]
    fn submission_keeps_field_ids() {
        let form = form(
            r#"{"ssid":" home ","password":"pw","server":"10.0.0.2","port":"1884","topic":"garden","save":false}"#,
        );

        assert!(form.validate().is_ok());
        let submission = form.into_submission();
        assert_eq!(submission.credentials.ssid, "home");
        assert!(!submission.save_requested);
        assert_eq!(
            submission.fields,
            vec![
                ("server".to_string(), "10.0.0.2".to_string()),
                ("port".to_string(), "1884".to_string()),
                ("topic".to_string(), "garden".to_string()),
            ]
        );
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(form(r#"{"ssid":"  "}"#).validate().is_err());
        assert!(form(r#"{"ssid":"home","port":"0"}"#).validate().is_err());
        assert!(form(r#"{"ssid":"home","port":"abc"}"#).validate().is_err());

        let long_server = format!(r#"{{"ssid":"home","server":"{}"}}"#, "a".repeat(41));
        let err = form(&long_server).validate().unwrap_err();
        assert!(err.starts_with("server"));
    }

    #[test]
    fn config_view_hides_secrets() {
        let record = ConfigurationRecord {
            api_token: "tok".to_string(),
            ..ConfigurationRecord::default()
        };
        let request = ProvisioningAgent::new(&NodeSettings::default()).portal_request(&record);
        let view = build_config_view(&request);

        let apikey = view.fields.iter().find(|f| f.id == "apikey").unwrap();
        assert_eq!(apikey.value, "");
        assert!(apikey.value_set);

        let topic = view.fields.iter().find(|f| f.id == "topic").unwrap();
        assert_eq!(topic.value, "Topic");
    }
}
