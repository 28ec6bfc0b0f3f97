//! Static interface configuration
//!
//! Hosts that skip DHCP load their address from a TOML file instead:
//!
//! ```toml
//! address = "10.0.0.2"
//! netmask = "255.255.255.0"
//! gateway = "10.0.0.1"
//! ```

use crate::stack::Ipv4NetConfig;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::path::Path;

/// Load an interface configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Ipv4NetConfig> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

/// Parse an interface configuration from TOML text
pub fn parse(content: &str) -> Result<Ipv4NetConfig> {
    let config: Ipv4NetConfig =
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Ipv4NetConfig) -> Result<()> {
    if config.address == Ipv4Addr::UNSPECIFIED || config.address.is_broadcast() {
        return Err(Error::Config(format!(
            "{} is not a valid interface address",
            config.address
        )));
    }
    Ok(())
}
