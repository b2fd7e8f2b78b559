// Inventory module: turns a target name into concrete destinations

mod dynamic;
mod static_inv;

pub use dynamic::*;
pub use static_inv::*;

use std::net::IpAddr;
use std::path::Path;

use tracing::debug;

use crate::output::errors::SpotError;
use crate::parser::ast::{Destination, Playbook, DEFAULT_SSH_PORT};

pub(crate) fn parse_port(value: &str) -> Result<u16, SpotError> {
    value.parse().map_err(|source| SpotError::InvalidPort {
        value: value.to_string(),
        source,
    })
}

/// Parse `host` or `host:port`. A full IP literal (IPv6 included) keeps the
/// default port.
pub fn parse_host_port(spec: &str, user: &str) -> Result<Destination, SpotError> {
    if spec.parse::<IpAddr>().is_ok() {
        return Ok(Destination::new(spec, DEFAULT_SSH_PORT, user));
    }
    match spec.rsplit_once(':') {
        None => Ok(Destination::new(spec, DEFAULT_SSH_PORT, user)),
        Some((host, port)) => Ok(Destination::new(host, parse_port(port)?, user)),
    }
}

/// A name that is not a declared target may still be a host: an IP literal,
/// anything with a dot, or something starting with `localhost`
fn looks_like_host(name: &str) -> bool {
    let bare = match name.rsplit_once(':') {
        Some((host, _)) if name.parse::<IpAddr>().is_err() => host,
        _ => name,
    };
    bare.parse::<IpAddr>().is_ok() || name.contains('.') || name.starts_with("localhost")
}

impl Playbook {
    /// Resolve the hosts of a target. Recomputed on every call.
    ///
    /// First match wins:
    /// 1. override host list
    /// 2. override inventory file (all groups)
    /// 3. override inventory URL (all groups)
    /// 4. declared target: static hosts, then its inventory file, then its URL
    /// 5. the name itself, if it looks like a host
    ///
    /// Hosts without their own user get [`Playbook::default_user`].
    pub async fn target_hosts(&self, name: &str) -> Result<Vec<Destination>, SpotError> {
        self.target_hosts_as(name, self.default_user()).await
    }

    /// Same as [`Playbook::target_hosts`], filling missing users with `user`.
    /// A run passes its task's resolved user so the login matches the task.
    pub async fn target_hosts_as(
        &self,
        name: &str,
        user: &str,
    ) -> Result<Vec<Destination>, SpotError> {

        if let Some(ref overrides) = self.overrides {
            if !overrides.target_hosts.is_empty() {
                return overrides
                    .target_hosts
                    .iter()
                    .map(|spec| parse_host_port(spec, user))
                    .collect();
            }
            if !overrides.inventory_file.is_empty() {
                return parse_inventory_file(Path::new(&overrides.inventory_file), &[], user);
            }
            if !overrides.inventory_url.is_empty() {
                return fetch_inventory(&overrides.inventory_url, &[], user).await;
            }
        }

        let Some(target) = self.targets.get(name) else {
            if looks_like_host(name) {
                debug!("target {} is not declared, use it as a host", name);
                return Ok(vec![parse_host_port(name, user)?]);
            }
            return Err(SpotError::TargetNotFound(name.to_string()));
        };

        if !target.hosts.is_empty() {
            let hosts = target
                .hosts
                .iter()
                .cloned()
                .map(|mut h| {
                    if h.port == 0 {
                        h.port = DEFAULT_SSH_PORT;
                    }
                    if h.user.is_empty() {
                        h.user = user.to_string();
                    }
                    h
                })
                .collect();
            return Ok(hosts);
        }

        if let Some(ref inv) = target.inventory_file {
            return parse_inventory_file(Path::new(&inv.location), &inv.groups, user);
        }

        if let Some(ref inv) = target.inventory_url {
            return fetch_inventory(&inv.location, &inv.groups, user).await;
        }

        Err(SpotError::NoHosts(name.to_string()))
    }
}
