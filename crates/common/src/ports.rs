//! Local port selection.
//!
//! Allocation probes each candidate with a throwaway listener. The probe is
//! released before the app binds, so an unrelated process can still grab the
//! port in between; for a single-developer tool this race is accepted.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::config::PortRange;
use crate::{Error, Result};

/// Returns the lowest port in `range` that is neither recorded in `used` nor
/// currently bound on loopback.
pub fn allocate(range: PortRange, used: &BTreeSet<u16>) -> Result<u16> {
    allocate_with(range, used, loopback_bindable)
}

pub fn allocate_with(
    range: PortRange,
    used: &BTreeSet<u16>,
    mut bindable: impl FnMut(u16) -> bool,
) -> Result<u16> {
    for port in range.iter() {
        if used.contains(&port) {
            continue;
        }
        if bindable(port) {
            debug!(port, "allocated app port");
            return Ok(port);
        }
    }
    Err(Error::PortExhaustion {
        start: range.start,
        end: range.end,
    })
}

fn loopback_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Checks a port on all interfaces, the way the proxy will listen on it.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPorts {
    pub http: u16,
    pub https: u16,
}

const PRIVILEGED_CANDIDATES: [ProxyPorts; 2] = [
    ProxyPorts {
        http: 80,
        https: 443,
    },
    ProxyPorts {
        http: 8080,
        https: 8443,
    },
];

const UNPRIVILEGED_CANDIDATES: [ProxyPorts; 2] = [
    ProxyPorts {
        http: 8080,
        https: 8443,
    },
    ProxyPorts {
        http: 9080,
        https: 9443,
    },
];

/// Picks the listener pair for a self-managed proxy.
pub fn choose_proxy_ports(privileged: bool) -> Result<ProxyPorts> {
    choose_proxy_ports_with(privileged, is_port_available)
}

pub fn choose_proxy_ports_with(
    privileged: bool,
    mut available: impl FnMut(u16) -> bool,
) -> Result<ProxyPorts> {
    let candidates = if privileged {
        &PRIVILEGED_CANDIDATES
    } else {
        &UNPRIVILEGED_CANDIDATES
    };
    for pair in candidates {
        if available(pair.http) && available(pair.https) {
            return Ok(*pair);
        }
    }
    let tried = candidates
        .iter()
        .map(|p| format!("{}/{}", p.http, p.https))
        .collect::<Vec<_>>()
        .join(" and ");
    Err(Error::NoPortsAvailable { tried })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: PortRange = PortRange {
        start: 11000,
        end: 11004,
    };

    #[test]
    fn skips_recorded_ports() {
        let used = BTreeSet::from([11000, 11001]);
        assert_eq!(allocate_with(RANGE, &used, |_| true).unwrap(), 11002);
    }

    #[test]
    fn skips_externally_bound_ports() {
        let used = BTreeSet::from([11000]);
        let port = allocate_with(RANGE, &used, |p| p != 11001 && p != 11002).unwrap();
        assert_eq!(port, 11003);
    }

    #[test]
    fn exhaustion() {
        let used: BTreeSet<u16> = RANGE.iter().collect();
        match allocate_with(RANGE, &used, |_| true) {
            Err(Error::PortExhaustion { start, end }) => {
                assert_eq!((start, end), (11000, 11004));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(allocate_with(RANGE, &BTreeSet::new(), |_| false).is_err());
    }

    #[test]
    fn real_probe_skips_a_bound_port() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let range = PortRange {
            start: port,
            end: port,
        };
        assert!(allocate(range, &BTreeSet::new()).is_err());
    }

    #[test]
    fn proxy_port_fallbacks() {
        assert_eq!(
            choose_proxy_ports_with(true, |_| true).unwrap(),
            ProxyPorts {
                http: 80,
                https: 443
            }
        );
        assert_eq!(
            choose_proxy_ports_with(true, |p| p != 443).unwrap(),
            ProxyPorts {
                http: 8080,
                https: 8443
            }
        );
        assert_eq!(
            choose_proxy_ports_with(false, |p| p != 8080).unwrap(),
            ProxyPorts {
                http: 9080,
                https: 9443
            }
        );
        let err = choose_proxy_ports_with(false, |_| false).unwrap_err();
        assert!(err.to_string().contains("8080/8443 and 9080/9443"));
    }
}
