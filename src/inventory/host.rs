//! Host definition for the FTL2 inventory model.
//!
//! A host's identity is its name, unique within a run. Everything else is
//! connection detail (how to reach it) or user-supplied variables.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Transport used to reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// SSH connection (default for any host other than the implicit localhost).
    #[default]
    Ssh,
    /// In-process local execution; no gate transport is spun up over SSH.
    Local,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Ssh => write!(f, "ssh"),
            ConnectionType::Local => write!(f, "local"),
        }
    }
}

/// SSH connection endpoint parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshParams {
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// SSH user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Private key file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,

    /// Password, used only when no key is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for SshParams {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            user: None,
            private_key_file: None,
            password: None,
        }
    }
}

/// A managed host in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Host name, unique within a run.
    pub name: String,

    /// Address to connect to, if different from `name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Transport to use for this host.
    #[serde(default)]
    pub connection: ConnectionType,

    /// SSH endpoint parameters; ignored when `connection` is `local`.
    #[serde(default)]
    pub ssh: SshParams,

    /// Host-specific variables.
    #[serde(default)]
    pub vars: IndexMap<String, serde_yaml::Value>,

    /// Groups this host belongs to.
    #[serde(skip)]
    pub groups: HashSet<String>,
}

impl Host {
    /// Create a new host with the given name, defaulting to the SSH transport.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            connection: ConnectionType::default(),
            ssh: SshParams::default(),
            vars: IndexMap::new(),
            groups: HashSet::new(),
        }
    }

    /// Create a host using the local transport.
    pub fn local(name: impl Into<String>) -> Self {
        let mut host = Self::new(name);
        host.connection = ConnectionType::Local;
        host
    }

    /// The address to connect to (falls back to the host name).
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Set a variable on this host.
    pub fn set_var(&mut self, key: impl Into<String>, value: serde_yaml::Value) {
        self.vars.insert(key.into(), value);
    }

    /// Get a variable from this host.
    pub fn get_var(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.vars.get(key)
    }

    /// Add this host to a group.
    pub fn add_to_group(&mut self, group: impl Into<String>) {
        self.groups.insert(group.into());
    }

    /// Check if host belongs to a specific group.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Merge variables from another source (other takes precedence).
    pub fn merge_vars(&mut self, other: &IndexMap<String, serde_yaml::Value>) {
        for (key, value) in other {
            self.vars.insert(key.clone(), value.clone());
        }
    }

    /// Build a host from the attribute map passed to `add_host` or parsed
    /// from an inventory document.
    ///
    /// Recognized keys: `ansible_host` (address), `connection` (`ssh`|
    /// `local`), `ansible_port`, `ansible_user`,
    /// `ansible_ssh_private_key_file`, `ansible_password`. Everything else
    /// becomes a plain host variable.
    pub fn from_attrs(name: impl Into<String>, attrs: IndexMap<String, serde_yaml::Value>) -> Self {
        let mut host = Host::new(name);
        for (key, value) in attrs {
            match key.as_str() {
                "ansible_host" => {
                    if let serde_yaml::Value::String(s) = value {
                        host.address = Some(s);
                    }
                }
                "connection" => {
                    if let serde_yaml::Value::String(s) = &value {
                        host.connection = match s.as_str() {
                            "local" => ConnectionType::Local,
                            _ => ConnectionType::Ssh,
                        };
                    }
                }
                "ansible_port" => {
                    if let Some(n) = value.as_u64() {
                        host.ssh.port = n as u16;
                    }
                }
                "ansible_user" => {
                    if let serde_yaml::Value::String(s) = value {
                        host.ssh.user = Some(s);
                    }
                }
                "ansible_ssh_private_key_file" => {
                    if let serde_yaml::Value::String(s) = value {
                        host.ssh.private_key_file = Some(s);
                    }
                }
                "ansible_password" => {
                    if let serde_yaml::Value::String(s) = value {
                        host.ssh.password = Some(s);
                    }
                }
                _ => {
                    host.set_var(key, value);
                }
            }
        }
        host
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(addr) = &self.address {
            write!(f, " ({})", addr)?;
        }
        Ok(())
    }
}
