//! Group definition for the FTL2 inventory model.
//!
//! A group is a named set of host names plus group-level variables. Groups
//! resolve to hosts transitively through child groups; duplicates are
//! de-duplicated by name at lookup time in [`super::Inventory`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A group of hosts in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Group name.
    pub name: String,

    /// Host names belonging to this group directly.
    #[serde(default)]
    pub hosts: HashSet<String>,

    /// Child group names.
    #[serde(default)]
    pub children: HashSet<String>,

    /// Parent group names, computed from children relationships.
    #[serde(skip)]
    pub parents: HashSet<String>,

    /// Group-specific variables.
    #[serde(default)]
    pub vars: IndexMap<String, serde_yaml::Value>,
}

impl Group {
    /// Create a new group with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: HashSet::new(),
            children: HashSet::new(),
            parents: HashSet::new(),
            vars: IndexMap::new(),
        }
    }

    /// Create the distinguished `all` group.
    pub fn all() -> Self {
        Self::new("all")
    }

    /// Add a host to this group.
    pub fn add_host(&mut self, host: impl Into<String>) {
        self.hosts.insert(host.into());
    }

    /// Check if a host belongs to this group directly.
    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    /// Add a child group.
    pub fn add_child(&mut self, child: impl Into<String>) {
        self.children.insert(child.into());
    }

    /// Add a parent group (internal, used for reverse lookups during var merge).
    pub fn add_parent(&mut self, parent: impl Into<String>) {
        self.parents.insert(parent.into());
    }

    /// Set a variable on this group.
    pub fn set_var(&mut self, key: impl Into<String>, value: serde_yaml::Value) {
        self.vars.insert(key.into(), value);
    }

    /// Merge variables from another source (other takes precedence).
    pub fn merge_vars(&mut self, other: &IndexMap<String, serde_yaml::Value>) {
        for (key, value) in other {
            self.vars.insert(key.clone(), value.clone());
        }
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Group {}

impl std::hash::Hash for Group {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} hosts", self.name, self.hosts.len())?;
        if !self.children.is_empty() {
            write!(f, ", {} children", self.children.len())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_hosts_and_children() {
        let mut group = Group::new("web");
        group.add_host("web1");
        group.add_host("web2");
        group.add_child("edge");
        assert!(group.has_host("web1"));
        assert!(!group.has_host("db1"));
        assert!(group.children.contains("edge"));
    }
}
