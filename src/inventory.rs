//! Host specifications and inventory files
//!
//! Hosts are given either as `user@host:port` strings or as structured
//! records in a YAML inventory:
//!
//! ```yaml
//! hosts:
//!   - doble.me
//!   - deploy@web1.internal:2222
//!   - address: "::1"
//!     user: admin
//!     key_path: /home/admin/.ssh/id_ed25519
//! ```

use crate::error::{HostrunError, Result};
use crate::models::{Host, DEFAULT_SSH_PORT, LOCAL_HOST, MAX_HOST_COUNT, MAX_INVENTORY_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Process-wide defaults applied to host specs that omit them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDefaults {
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
}

impl Default for HostDefaults {
    fn default() -> Self {
        Self {
            user: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            port: DEFAULT_SSH_PORT,
            key_path: None,
        }
    }
}

/// One entry of a host list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostSpec {
    Short(String),
    Record(HostRecord),
}

/// Structured host entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    hosts: Vec<HostSpec>,
}

/// Parse a single `user@host:port` style host string.
///
/// Accepted forms: `host`, `user@host`, `host:port`, `user@host:port`,
/// `[ipv6]:port`, a bare IPv6 address, and the literal `local` which names
/// the machine running hostrun. Missing parts come from `defaults`.
///
/// # Errors
///
/// * `HostrunError::InvalidHost` - empty parts, bad port, or illegal characters
///
/// # Example
///
/// ```
/// use hostrun::inventory::{parse_host, HostDefaults};
///
/// let defaults = HostDefaults { user: "deploy".into(), port: 22, key_path: None };
/// let host = parse_host("root@web1:2222", &defaults)?;
/// assert_eq!(host.user, "root");
/// assert_eq!(host.port, 2222);
/// # Ok::<(), hostrun::error::HostrunError>(())
/// ```
pub fn parse_host(spec: &str, defaults: &HostDefaults) -> Result<Host> {
    let invalid = |reason: &str| HostrunError::InvalidHost {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty host"));
    }
    if trimmed == LOCAL_HOST {
        return Ok(Host::local());
    }

    let (user, rest) = match trimmed.rsplit_once('@') {
        Some((user, rest)) => {
            if user.is_empty() {
                return Err(invalid("empty user"));
            }
            (user.to_string(), rest)
        }
        None => (defaults.user.clone(), trimmed),
    };

    let (address, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (address, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| invalid("unterminated '['"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port).ok_or_else(|| invalid("invalid port"))?,
            None if tail.is_empty() => defaults.port,
            None => return Err(invalid("unexpected text after ']'")),
        };
        (address, port)
    } else if rest.matches(':').count() > 1 {
        // Unbracketed IPv6 carries no port
        (rest, defaults.port)
    } else if let Some((address, port)) = rest.split_once(':') {
        (
            address,
            parse_port(port).ok_or_else(|| invalid("invalid port"))?,
        )
    } else {
        (rest, defaults.port)
    };

    validate_address(address).map_err(|reason| invalid(reason))?;

    let mut host = Host::new(address, port, user);
    host.key_path = defaults.key_path.clone();
    Ok(host)
}

fn parse_port(port: &str) -> Option<u16> {
    port.parse::<u16>().ok().filter(|p| *p != 0)
}

fn validate_address(address: &str) -> std::result::Result<(), &'static str> {
    if address.is_empty() {
        return Err("empty address");
    }
    if address
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '\'' | '"'))
    {
        return Err("address contains illegal characters");
    }
    Ok(())
}

/// Resolve a list of host specs into hosts.
///
/// Duplicate hosts are kept only once (first occurrence wins), mirroring how a
/// host listed twice would otherwise run the task twice over one connection.
pub fn resolve_hosts(specs: &[HostSpec], defaults: &HostDefaults) -> Result<Vec<Host>> {
    if specs.len() > MAX_HOST_COUNT {
        return Err(HostrunError::HostCountExceeded {
            count: specs.len(),
            limit: MAX_HOST_COUNT,
        });
    }

    let mut seen = HashSet::with_capacity(specs.len());
    let mut hosts = Vec::with_capacity(specs.len());

    for spec in specs {
        let host = match spec {
            HostSpec::Short(s) => parse_host(s, defaults)?,
            HostSpec::Record(record) => resolve_record(record, defaults)?,
        };
        if seen.insert(host.clone()) {
            hosts.push(host);
        }
    }

    Ok(hosts)
}

fn resolve_record(record: &HostRecord, defaults: &HostDefaults) -> Result<Host> {
    if record.address == LOCAL_HOST {
        return Ok(Host::local());
    }
    validate_address(&record.address).map_err(|reason| HostrunError::InvalidHost {
        spec: record.address.clone(),
        reason: reason.to_string(),
    })?;
    if record.port == Some(0) {
        return Err(HostrunError::InvalidHost {
            spec: record.address.clone(),
            reason: "invalid port".to_string(),
        });
    }

    Ok(Host {
        address: record.address.clone(),
        port: record.port.unwrap_or(defaults.port),
        user: record.user.clone().unwrap_or_else(|| defaults.user.clone()),
        key_path: record.key_path.clone().or_else(|| defaults.key_path.clone()),
    })
}

/// Parse host strings such as the comma-separated `--hosts` value.
pub fn parse_host_list<S: AsRef<str>>(specs: &[S], defaults: &HostDefaults) -> Result<Vec<Host>> {
    let specs: Vec<HostSpec> = specs
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .map(|s| HostSpec::Short(s.to_string()))
        .collect();
    resolve_hosts(&specs, defaults)
}

/// Concatenate host groups, dropping repeats and enforcing the host limit
pub fn merge_hosts<I>(groups: I) -> Result<Vec<Host>>
where
    I: IntoIterator<Item = Vec<Host>>,
{
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    for host in groups.into_iter().flatten() {
        if seen.insert(host.clone()) {
            hosts.push(host);
        }
    }
    if hosts.len() > MAX_HOST_COUNT {
        return Err(HostrunError::HostCountExceeded {
            count: hosts.len(),
            limit: MAX_HOST_COUNT,
        });
    }
    Ok(hosts)
}

/// Parse an inventory from a YAML file.
///
/// # Errors
///
/// * `HostrunError::Io` - If file cannot be read
/// * `HostrunError::InventorySizeExceeded` - If file exceeds 1MB
/// * `HostrunError::YamlParse` - If YAML is malformed
/// * `HostrunError::HostCountExceeded` - If more than 1,000 hosts are listed
pub fn parse_inventory_file<P: AsRef<Path>>(
    path: P,
    defaults: &HostDefaults,
) -> Result<Vec<Host>> {
    let content = fs::read_to_string(path)?;
    parse_inventory_yaml(&content, defaults)
}

/// Parse an inventory from a YAML string. See [`parse_inventory_file`].
pub fn parse_inventory_yaml(content: &str, defaults: &HostDefaults) -> Result<Vec<Host>> {
    if content.len() > MAX_INVENTORY_SIZE {
        return Err(HostrunError::InventorySizeExceeded(content.len()));
    }

    let inventory: InventoryFile = serde_yaml::from_str(content)?;
    resolve_hosts(&inventory.hosts, defaults)
}
