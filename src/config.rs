//! Boot-time configuration
//!
//! `key=value` pairs from the multiboot command line:
//! `loglevel=debug ip=10.0.0.1 netmask=255.255.255.0 gw=10.0.0.254
//! dns=10.0.0.254`. Parsed once during boot; unknown keys are ignored.

use core::str::FromStr;

use crate::logger::LogLevel;
use crate::net::ipv4::Ipv4Address;
use crate::net::NetConfig;

/// Apply the command line. Returns the resulting network configuration
/// so boot can hand it to the stack in one step.
pub fn apply_cmdline(cmdline: &str) -> NetConfig {
    let mut net = NetConfig::default_for_boot();
    let mut dns: Option<Ipv4Address> = None;

    for word in cmdline.split_whitespace() {
        let Some((key, value)) = word.split_once('=') else {
            continue;
        };
        match key {
            "loglevel" => {
                if let Some(level) = LogLevel::from_str(value) {
                    crate::logger::set_level(level);
                }
            }
            "ip" => {
                if let Ok(ip) = Ipv4Address::from_str(value) {
                    net.ip = ip;
                }
            }
            "netmask" => {
                if let Ok(mask) = Ipv4Address::from_str(value) {
                    net.netmask = mask;
                }
            }
            "gw" => {
                if let Ok(gw) = Ipv4Address::from_str(value) {
                    net.gateway = gw;
                }
            }
            "dns" => {
                if let Ok(server) = Ipv4Address::from_str(value) {
                    dns = Some(server);
                }
            }
            _ => {}
        }
    }

    #[cfg(feature = "net_dns")]
    if let Some(server) = dns {
        crate::net::dns::set_nameserver(server);
    }
    #[cfg(not(feature = "net_dns"))]
    let _ = dns;

    net
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_overrides_defaults() {
        let net = apply_cmdline("loglevel=debug ip=192.168.7.2 gw=192.168.7.1 junk noise=1");
        assert_eq!(net.ip, Ipv4Address::new(192, 168, 7, 2));
        assert_eq!(net.gateway, Ipv4Address::new(192, 168, 7, 1));
    }

    #[test]
    fn malformed_values_are_ignored() {
        let defaults = NetConfig::default_for_boot();
        let net = apply_cmdline("ip=999.1.2.3 netmask=not-an-ip");
        assert_eq!(net.ip, defaults.ip);
        assert_eq!(net.netmask, defaults.netmask);
    }
}
