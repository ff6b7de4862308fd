//! Cluster distribution of prepared plans.
//!
//! The wire layer is a collaborator: peers expose `GET prepareds/<name>`
//! returning the encoded plan and `PUT prepareds/<name>` installing one.
//! This module models that protocol as the [`Remote`] trait and provides
//! the best-effort broadcast used after local inserts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::errors::{Error, Result};

/// Access to the other nodes of the cluster.
pub trait Remote: Send + Sync {
    /// This node's name; empty when the node is not clustered.
    fn who_am_i(&self) -> String;

    /// Names of every node in the cluster, including this one.
    fn node_names(&self) -> Vec<String>;

    /// Prepared names currently cached on a peer.
    fn fetch_keys(&self, host: &str) -> Result<Vec<String>>;

    /// Fetches the encoded plan for a prepared cached on a peer.
    fn fetch_prepared(&self, host: &str, name: &str) -> Result<String>;

    /// Installs an encoded plan on a peer. Receivers verify that the
    /// embedded name matches `name`.
    fn install_prepared(&self, host: &str, name: &str, encoded: &str) -> Result<()>;
}

/// Splits a `host::name` cache identifier. A missing prefix yields an
/// empty host.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once("::") {
        Some((host, name)) => (host, name),
        None => ("", key),
    }
}

/// Builds a `host::name` cache identifier.
pub fn make_key(host: &str, name: &str) -> String {
    if host.is_empty() {
        name.to_owned()
    } else {
        format!("{host}::{name}")
    }
}

/// Stand-in for unclustered deployments: no peers, no distribution.
pub struct NoRemote;

impl Remote for NoRemote {
    fn who_am_i(&self) -> String {
        String::new()
    }

    fn node_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn fetch_keys(&self, host: &str) -> Result<Vec<String>> {
        Err(Error::Datastore {
            reason: format!("no such node: {host}"),
        })
    }

    fn fetch_prepared(&self, host: &str, _name: &str) -> Result<String> {
        Err(Error::Datastore {
            reason: format!("no such node: {host}"),
        })
    }

    fn install_prepared(&self, host: &str, _name: &str, _encoded: &str) -> Result<()> {
        Err(Error::Datastore {
            reason: format!("no such node: {host}"),
        })
    }
}

/// In-process cluster double used by tests: every node's prepared store is
/// a shared map of maps.
#[derive(Default)]
pub struct InProcessRemote {
    this_node: String,
    stores: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

impl InProcessRemote {
    /// A node named `this_node` over a shared store.
    pub fn new(
        this_node: impl Into<String>,
        stores: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
    ) -> Self {
        Self {
            this_node: this_node.into(),
            stores,
        }
    }

    /// The shared store backing a simulated cluster.
    pub fn shared_store() -> Arc<Mutex<HashMap<String, HashMap<String, String>>>> {
        Arc::new(Mutex::new(HashMap::new()))
    }
}

impl Remote for InProcessRemote {
    fn who_am_i(&self) -> String {
        self.this_node.clone()
    }

    fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        if !names.contains(&self.this_node) {
            names.push(self.this_node.clone());
        }
        names.sort();
        names
    }

    fn fetch_keys(&self, host: &str) -> Result<Vec<String>> {
        Ok(self
            .stores
            .lock()
            .get(host)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn fetch_prepared(&self, host: &str, name: &str) -> Result<String> {
        self.stores
            .lock()
            .get(host)
            .and_then(|m| m.get(name))
            .cloned()
            .ok_or_else(|| Error::no_such_prepared(name))
    }

    fn install_prepared(&self, host: &str, name: &str, encoded: &str) -> Result<()> {
        self.stores
            .lock()
            .entry(host.to_owned())
            .or_default()
            .insert(name.to_owned(), encoded.to_owned());
        Ok(())
    }
}

/// Best-effort asynchronous broadcast of `{name, encoded_plan}` to every
/// peer. Failures are logged, never surfaced.
pub(super) fn distribute_prepared(remote: &Arc<dyn Remote>, name: &str, encoded: &str) {
    let this_host = remote.who_am_i();
    if this_host.is_empty() {
        return;
    }
    let remote = Arc::clone(remote);
    let name = name.to_owned();
    let encoded = encoded.to_owned();
    std::thread::spawn(move || {
        for host in remote.node_names() {
            if host == this_host {
                continue;
            }
            if let Err(warn) = remote.install_prepared(&host, &name, &encoded) {
                info!(%name, %host, %warn, "failed to distribute statement");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_handles_both_forms() {
        assert_eq!(split_key("n1::p"), ("n1", "p"));
        assert_eq!(split_key("p"), ("", "p"));
        assert_eq!(make_key("n1", "p"), "n1::p");
        assert_eq!(make_key("", "p"), "p");
    }

    #[test]
    fn in_process_remote_round_trips() {
        let store = InProcessRemote::shared_store();
        let n1 = InProcessRemote::new("n1", Arc::clone(&store));
        let n2 = InProcessRemote::new("n2", Arc::clone(&store));
        n1.install_prepared("n2", "p", "encoded").unwrap();
        assert_eq!(n2.fetch_prepared("n2", "p").unwrap(), "encoded");
        assert_eq!(n2.fetch_keys("n2").unwrap(), vec!["p"]);
    }
}
