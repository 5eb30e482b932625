//! Inventory management for FTL2.
//!
//! Loads a declarative inventory document (YAasL/JSON, or the output of an
//! executable `--list` script) into an ordered set of [`Host`]s grouped by
//! name, and tracks dynamically-added hosts through the state store so they
//! survive across runs.

pub mod group;
pub mod host;

pub use group::Group;
pub use host::{ConnectionType, Host, SshParams};

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::state::State;

/// Where an inventory document comes from.
pub enum Source {
    /// A file on disk — may be YAML/JSON, or an executable `--list` script.
    Path(PathBuf),
    /// An already-parsed document (e.g. constructed by an embedding caller).
    Value(serde_yaml::Value),
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::Path(path)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Source::Path(path.to_path_buf())
    }
}

/// A host name, a group name, or an explicit list of either.
#[derive(Debug, Clone)]
pub enum Selector {
    /// A single host by name.
    Host(String),
    /// A single group by name (`all` matches every host).
    Group(String),
    /// A list of names, each resolved as a host-or-group and unioned.
    List(Vec<String>),
}

impl Selector {
    /// Parse a bare name as either a host or group selector, resolved at lookup time.
    pub fn name(name: impl Into<String>) -> Self {
        Selector::Host(name.into())
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        Selector::Host(s.to_string())
    }
}

impl From<Vec<String>> for Selector {
    fn from(names: Vec<String>) -> Self {
        Selector::List(names)
    }
}

/// The inventory: hosts and groups resolved from a document plus any hosts
/// added dynamically during the run.
pub struct Inventory {
    hosts: IndexMap<String, Host>,
    groups: IndexMap<String, Group>,
    state: Option<Arc<State>>,
}

impl Inventory {
    /// Create an empty inventory with just the distinguished `all` group.
    pub fn empty() -> Self {
        let mut groups = IndexMap::new();
        groups.insert("all".to_string(), Group::all());
        Self {
            hosts: IndexMap::new(),
            groups,
            state: None,
        }
    }

    /// Load an inventory document. Fails with `InventoryInvalid` on unknown
    /// top-level keys or malformed host attributes.
    pub fn load(source: Source) -> Result<Self> {
        let mut inventory = Self::empty();
        match source {
            Source::Path(path) => {
                if is_executable(&path) {
                    inventory.load_dynamic(&path)?;
                } else {
                    let content = std::fs::read_to_string(&path)?;
                    let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
                    inventory.load_document(&doc)?;
                }
            }
            Source::Value(doc) => inventory.load_document(&doc)?,
        }
        Ok(inventory)
    }

    /// Attach a state store so `add_host` persists across runs, and replay any
    /// hosts the store already knows about.
    pub fn with_state(mut self, state: Arc<State>) -> Self {
        for (name, attrs) in state.hosts() {
            self.insert_host(Host::from_attrs(name, attrs), &["all".to_string()]);
        }
        self.state = Some(state);
        self
    }

    fn load_document(&mut self, doc: &serde_yaml::Value) -> Result<()> {
        let map = doc.as_mapping().ok_or_else(|| {
            Error::InventoryInvalid("top-level inventory document must be a mapping".into())
        })?;

        for (key, value) in map {
            let group_name = key.as_str().ok_or_else(|| {
                Error::InventoryInvalid("group keys must be strings".into())
            })?;
            self.load_group(group_name, value)?;
        }
        Ok(())
    }

    fn load_group(&mut self, name: &str, value: &serde_yaml::Value) -> Result<()> {
        if !self.groups.contains_key(name) {
            self.groups.insert(name.to_string(), Group::new(name));
        }

        let map = match value.as_mapping() {
            Some(m) => m,
            None => return Ok(()),
        };

        if let Some(hosts) = map.get(&serde_yaml::Value::String("hosts".into())) {
            let hosts = hosts.as_mapping().ok_or_else(|| {
                Error::InventoryInvalid(format!("group '{name}' hosts must be a mapping"))
            })?;
            for (host_key, host_attrs) in hosts {
                let host_name = host_key.as_str().ok_or_else(|| {
                    Error::InventoryInvalid("host names must be strings".into())
                })?;
                let attrs = parse_attrs(host_attrs)?;
                let host = Host::from_attrs(host_name, attrs);
                self.insert_host(host, &[name.to_string(), "all".to_string()]);
            }
        }

        if let Some(children) = map.get(&serde_yaml::Value::String("children".into())) {
            let children = children.as_mapping().ok_or_else(|| {
                Error::InventoryInvalid(format!("group '{name}' children must be a mapping"))
            })?;
            for (child_key, child_value) in children {
                let child_name = child_key.as_str().ok_or_else(|| {
                    Error::InventoryInvalid("child group names must be strings".into())
                })?;
                self.groups.get_mut(name).unwrap().add_child(child_name);
                self.load_group(child_name, child_value)?;
            }
        }

        if let Some(vars) = map.get(&serde_yaml::Value::String("vars".into())) {
            let attrs = parse_attrs(vars)?;
            for (k, v) in attrs {
                self.groups.get_mut(name).unwrap().set_var(k, v);
            }
        }

        Ok(())
    }

    fn load_dynamic(&mut self, path: &Path) -> Result<()> {
        let output = Command::new(path).arg("--list").output()?;
        if !output.status.success() {
            return Err(Error::InventoryInvalid(format!(
                "dynamic inventory script failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let doc: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let yaml_doc = json_to_yaml(&doc);

        if let serde_yaml::Value::Mapping(map) = &yaml_doc {
            for (key, value) in map {
                if key.as_str() == Some("_meta") {
                    continue;
                }
                if let Some(name) = key.as_str() {
                    self.load_group(name, value)?;
                }
            }

            if let Some(meta) = map.get(&serde_yaml::Value::String("_meta".into())) {
                if let Some(hostvars) = meta
                    .as_mapping()
                    .and_then(|m| m.get(&serde_yaml::Value::String("hostvars".into())))
                    .and_then(|v| v.as_mapping())
                {
                    for (host_key, vars) in hostvars {
                        if let Some(host_name) = host_key.as_str() {
                            if let Some(host) = self.hosts.get_mut(host_name) {
                                let attrs = parse_attrs(vars)?;
                                host.merge_vars(&attrs);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn insert_host(&mut self, mut host: Host, member_of: &[String]) {
        let name = host.name.clone();
        for group in member_of {
            host.add_to_group(group.clone());
            self.groups
                .entry(group.clone())
                .or_insert_with(|| Group::new(group))
                .add_host(&name);
        }
        if let Some(existing) = self.hosts.get_mut(&name) {
            for group in &host.groups {
                existing.add_to_group(group.clone());
            }
            existing.merge_vars(&host.vars);
        } else {
            self.hosts.insert(name, host);
        }
    }

    /// Insert or update a dynamically-discovered host, persisting it to the
    /// attached state store. Safe to call concurrently with reads: the state
    /// store serializes writers internally and this method takes `&self`
    /// only for the persisted side effect — the in-memory index itself
    /// requires the caller to hold `&mut self` (callers own their inventory).
    pub fn add_host(&mut self, name: impl Into<String>, attrs: IndexMap<String, serde_yaml::Value>) -> Result<()> {
        let name = name.into();
        if let Some(state) = &self.state {
            state.put_host(name.clone(), attrs.clone());
        }
        let host = Host::from_attrs(name, attrs);
        self.insert_host(host, &["all".to_string()]);
        Ok(())
    }

    /// Resolve a selector to an ordered, de-duplicated list of hosts in
    /// inventory-declaration order.
    pub fn hosts(&self, selector: &Selector) -> Result<Vec<&Host>> {
        match selector {
            Selector::Host(name) => self.resolve_name(name),
            Selector::Group(name) => self.resolve_name(name),
            Selector::List(names) => {
                let mut seen = std::collections::HashSet::new();
                let mut out = Vec::new();
                for name in names {
                    for host in self.resolve_name(name)? {
                        if seen.insert(&host.name) {
                            out.push(host);
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    fn resolve_name(&self, name: &str) -> Result<Vec<&Host>> {
        if let Some(group) = self.groups.get(name) {
            return Ok(self.hosts_in_group(group));
        }
        if let Some(host) = self.hosts.get(name) {
            return Ok(vec![host]);
        }
        Err(Error::NoSuchHost(name.to_string()))
    }

    fn hosts_in_group(&self, group: &Group) -> Vec<&Host> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (name, host) in &self.hosts {
            if group.has_host(name) && seen.insert(name.clone()) {
                out.push(host);
            }
        }
        for child_name in &group.children {
            if let Some(child) = self.groups.get(child_name) {
                for host in self.hosts_in_group(child) {
                    if seen.insert(host.name.clone()) {
                        out.push(host);
                    }
                }
            }
        }
        out
    }

    /// Variables visible to a host: group vars (transitively, parent-first)
    /// overridden by the host's own vars.
    pub fn vars_for(&self, host: &Host) -> IndexMap<String, serde_yaml::Value> {
        let mut vars = IndexMap::new();
        let mut group_names: Vec<&String> = host.groups.iter().collect();
        group_names.sort();
        for group_name in group_names {
            if let Some(group) = self.groups.get(group_name) {
                for (k, v) in &group.vars {
                    vars.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, v) in &host.vars {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }

    /// Total host count.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Every group known to the inventory, in declaration order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

fn parse_attrs(value: &serde_yaml::Value) -> Result<IndexMap<String, serde_yaml::Value>> {
    match value {
        serde_yaml::Value::Mapping(map) => {
            let mut out = IndexMap::new();
            for (k, v) in map {
                let key = k.as_str().ok_or_else(|| {
                    Error::InventoryInvalid("attribute keys must be strings".into())
                })?;
                out.insert(key.to_string(), v.clone());
            }
            Ok(out)
        }
        serde_yaml::Value::Null => Ok(IndexMap::new()),
        _ => Err(Error::InventoryInvalid("expected a mapping of attributes".into())),
    }
}

fn json_to_yaml(value: &serde_json::Value) -> serde_yaml::Value {
    match value {
        serde_json::Value::Null => serde_yaml::Value::Null,
        serde_json::Value::Bool(b) => serde_yaml::Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_yaml::Value::Number(i.into())
            } else if let Some(f) = n.as_f64() {
                serde_yaml::Value::Number(f.into())
            } else {
                serde_yaml::Value::Number(0.into())
            }
        }
        serde_json::Value::String(s) => serde_yaml::Value::String(s.clone()),
        serde_json::Value::Array(arr) => {
            serde_yaml::Value::Sequence(arr.iter().map(json_to_yaml).collect())
        }
        serde_json::Value::Object(obj) => {
            let mut map = serde_yaml::Mapping::new();
            for (k, v) in obj {
                map.insert(serde_yaml::Value::String(k.clone()), json_to_yaml(v));
            }
            serde_yaml::Value::Mapping(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> serde_yaml::Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn loads_groups_hosts_and_vars() {
        let inv = Inventory::load(Source::Value(doc(
            r#"
webservers:
  hosts:
    web1:
      ansible_host: 10.0.0.1
    web2: {}
  vars:
    http_port: 80
"#,
        )))
        .unwrap();

        assert_eq!(inv.host_count(), 2);
        let hosts = inv.hosts(&Selector::name("webservers")).unwrap();
        assert_eq!(hosts.len(), 2);
        let web1 = inv.hosts(&Selector::name("web1")).unwrap();
        assert_eq!(web1[0].address(), "10.0.0.1");
        let vars = inv.vars_for(web1[0]);
        assert_eq!(vars.get("http_port"), Some(&serde_yaml::Value::Number(80.into())));
    }

    #[test]
    fn all_group_resolves_every_host() {
        let inv = Inventory::load(Source::Value(doc(
            r#"
webservers:
  hosts:
    web1: {}
databases:
  hosts:
    db1: {}
"#,
        )))
        .unwrap();
        assert_eq!(inv.hosts(&Selector::name("all")).unwrap().len(), 2);
    }

    #[test]
    fn unknown_selector_errors() {
        let inv = Inventory::empty();
        assert!(inv.hosts(&Selector::name("nope")).is_err());
    }

    #[test]
    fn child_groups_resolve_transitively() {
        let inv = Inventory::load(Source::Value(doc(
            r#"
prod:
  children:
    webservers:
      hosts:
        web1: {}
"#,
        )))
        .unwrap();
        assert_eq!(inv.hosts(&Selector::name("prod")).unwrap().len(), 1);
    }
}
