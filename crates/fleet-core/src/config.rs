//! Configuration documents (YAML) and runtime settings (environment).

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::operation::PollSettings;
use crate::template::check_tokens;
use crate::types::Scope;
use crate::{Error, Result};

/// Tokens available to every VM-scoped template.
pub const VM_TOKENS: &[&str] = &[
    "vm_name",
    "vm_index",
    "service_name",
    "deployment_name",
    "network_name",
];

/// Role attributes available to snapshot templates.
pub const ROLE_TOKENS: &[&str] = &[
    "role.role_name",
    "role.instance_name",
    "role.instance_status",
    "role.host_name",
];

// ── Deployment spec ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSpec {
    pub subscription_id: String,
    pub certificate_path: PathBuf,
    pub storage: StorageAccount,
    pub containers: Containers,
    pub service_name: String,
    pub service_location: String,
    pub deployment_name: String,
    pub network_name: String,
    pub n_vms: usize,
}

#[derive(Clone, Deserialize)]
pub struct StorageAccount {
    pub account: String,
    pub access_key: String,
}

impl fmt::Debug for StorageAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageAccount")
            .field("account", &self.account)
            .field("access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Containers {
    pub vhds: String,
    pub images: String,
}

impl DeploymentSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let spec: Self = load_document(path)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn scope(&self) -> Scope {
        Scope {
            service: self.service_name.clone(),
            deployment: self.deployment_name.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_vms < 1 {
            return Err(Error::ConfigValidation("n_vms must be at least 1".into()));
        }
        for (field, value) in [
            ("subscription_id", &self.subscription_id),
            ("storage.account", &self.storage.account),
            ("storage.access_key", &self.storage.access_key),
            ("containers.vhds", &self.containers.vhds),
            ("containers.images", &self.containers.images),
            ("service_name", &self.service_name),
            ("service_location", &self.service_location),
            ("deployment_name", &self.deployment_name),
            ("network_name", &self.network_name),
        ] {
            require_non_empty(field, value)?;
        }
        Ok(())
    }
}

// ── VM template ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VmTemplate {
    pub net: NetSpec,
    pub root_disk: RootDiskSpec,
    #[serde(default)]
    pub data_disks: Vec<DataDiskSpec>,
    pub system: SystemSpec,
    pub size: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetSpec {
    #[serde(default)]
    pub nat_ports: Vec<NatPort>,
    #[serde(default)]
    pub subnet_names: Vec<String>,
    #[serde(default)]
    pub public_ip_name_tpls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NatPort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub lb: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootDiskSpec {
    pub source_image: String,
    pub name_tpl: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataDiskSpec {
    pub url_tpl: String,
    pub size_gb: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSpec {
    pub host_name_tpl: String,
    pub user_data_tpl: String,
}

impl VmTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        let template: Self = load_document(path)?;
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<()> {
        require_non_empty("size", &self.size)?;
        require_non_empty("root_disk.source_image", &self.root_disk.source_image)?;

        let mut seen = HashSet::new();
        for nat in &self.net.nat_ports {
            require_non_empty("net.nat_ports[].name", &nat.name)?;
            if nat.port == 0 {
                return Err(Error::ConfigValidation(format!(
                    "net.nat_ports: port of '{}' must be between 1 and 65535",
                    nat.name
                )));
            }
            if !seen.insert(nat.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "net.nat_ports: duplicate name '{}'",
                    nat.name
                )));
            }
        }

        for (i, disk) in self.data_disks.iter().enumerate() {
            if disk.size_gb == 0 {
                return Err(Error::ConfigValidation(format!(
                    "data_disks[{i}].size_gb must be at least 1"
                )));
            }
        }

        for (field, tpl) in self.templates() {
            require_non_empty(&field, tpl)?;
            check_tokens(&field, tpl, VM_TOKENS)?;
        }
        Ok(())
    }

    /// Every template field, labelled with its document path.
    fn templates(&self) -> Vec<(String, &str)> {
        let mut fields = vec![
            ("root_disk.name_tpl".to_string(), self.root_disk.name_tpl.as_str()),
            ("system.host_name_tpl".into(), self.system.host_name_tpl.as_str()),
            ("system.user_data_tpl".into(), self.system.user_data_tpl.as_str()),
        ];
        for (i, tpl) in self.net.public_ip_name_tpls.iter().enumerate() {
            fields.push((format!("net.public_ip_name_tpls[{i}]"), tpl.as_str()));
        }
        for (i, disk) in self.data_disks.iter().enumerate() {
            fields.push((format!("data_disks[{i}].url_tpl"), disk.url_tpl.as_str()));
        }
        fields
    }
}

// ── Snapshot spec ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotSpec {
    pub label_tpl: String,
    pub name_tpl: String,
    pub os: String,
}

impl SnapshotSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let spec: Self = load_document(path)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        require_non_empty("os", &self.os)?;
        for (field, tpl) in [("label_tpl", &self.label_tpl), ("name_tpl", &self.name_tpl)] {
            require_non_empty(field, tpl)?;
            check_tokens(field, tpl, ROLE_TOKENS)?;
        }
        Ok(())
    }
}

// ── Loading ──────────────────────────────────────────────────────────

/// Read and parse a YAML document. Missing or mistyped fields are
/// reported as `ConfigValidation` with the file path.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigValidation(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_document(&raw).map_err(|e| match e {
        Error::ConfigValidation(msg) => {
            Error::ConfigValidation(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

pub fn parse_document<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_yaml::from_str(raw).map_err(|e| Error::ConfigValidation(e.to_string()))
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::ConfigValidation(format!("{field} must not be empty")));
    }
    Ok(())
}

// ── Runtime settings ─────────────────────────────────────────────────

/// Knobs read from the environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub poll: PollSettings,
    pub probe_timeout: Duration,
    pub management_url: String,
    pub blob_endpoint_suffix: String,
}

impl RunSettings {
    /// - `FLEET_POLL_INTERVAL_MS` (default: 1000)
    /// - `FLEET_OPERATION_TIMEOUT_SECS` (default: 1800)
    /// - `FLEET_PROBE_TIMEOUT_SECS` (default: 600)
    /// - `FLEET_MANAGEMENT_URL` (default: the public management endpoint)
    /// - `FLEET_BLOB_ENDPOINT_SUFFIX` (default: `blob.core.windows.net`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            poll: PollSettings {
                interval: Duration::from_millis(env_or("FLEET_POLL_INTERVAL_MS", 1000)?),
                timeout: Duration::from_secs(env_or("FLEET_OPERATION_TIMEOUT_SECS", 1800)?),
            },
            probe_timeout: Duration::from_secs(env_or("FLEET_PROBE_TIMEOUT_SECS", 600)?),
            management_url: std::env::var("FLEET_MANAGEMENT_URL")
                .unwrap_or_else(|_| mgmt_api::DEFAULT_BASE_URL.into()),
            blob_endpoint_suffix: std::env::var("FLEET_BLOB_ENDPOINT_SUFFIX")
                .unwrap_or_else(|_| mgmt_api::blob::DEFAULT_ENDPOINT_SUFFIX.into()),
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::ConfigValidation(format!("{key} must be a number, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}
