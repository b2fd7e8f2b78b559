// Line-oriented inventory parser
//
// Format:
//   # comment
//   [group]
//   host[:port] [user]

use std::path::Path;

use crate::output::errors::SpotError;
use crate::parser::ast::Destination;

use super::parse_host_port;

/// Group a line belongs to before any `[group]` header
pub const IMPLICIT_GROUP: &str = "all";

/// Parse inventory text, keeping only hosts from `groups`.
///
/// An empty group list keeps every group. Hosts without a user token get
/// `default_user`. Output follows input line order.
pub fn parse_inventory(
    content: &str,
    groups: &[String],
    default_user: &str,
) -> Result<Vec<Destination>, SpotError> {
    let wanted = |group: &str| groups.is_empty() || groups.iter().any(|g| g == group);

    let mut hosts = Vec::new();
    let mut current_group = IMPLICIT_GROUP;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            current_group = &line[1..line.len() - 1];
            continue;
        }

        if !wanted(current_group) {
            continue;
        }

        let mut parts = line.split_whitespace();
        let host_port = parts.next().unwrap_or_default();
        let user = parts.next().unwrap_or(default_user);

        hosts.push(parse_host_port(host_port, user)?);
    }

    Ok(hosts)
}

/// Read and parse an inventory file
pub fn parse_inventory_file(
    path: &Path,
    groups: &[String],
    default_user: &str,
) -> Result<Vec<Destination>, SpotError> {
    let location = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| SpotError::Inventory {
        location: location.clone(),
        message: format!("can't open inventory file: {}", e),
    })?;

    parse_inventory(&content, groups, default_user).map_err(|e| SpotError::Inventory {
        location,
        message: format!("can't parse inventory file: {}", e),
    })
}
