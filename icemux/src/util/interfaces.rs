// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Discovery of a local address suitable for accepting ICE-TCP connections

use std::net::{IpAddr, Ipv4Addr};

/// A single address assigned to a local network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
  pub name: String,
  pub ip: IpAddr,
  pub is_up: bool,
  pub is_loopback: bool,
}

/// Enumerates addresses of the host's configured interfaces.
///
/// `getifaddrs` (and its Windows counterpart) only reports interfaces that
/// carry an address, so every entry returned here is treated as up.
pub fn system_interfaces() -> std::io::Result<Vec<InterfaceAddress>> {
  let interfaces = if_addrs::get_if_addrs()?;
  Ok(
    interfaces
      .into_iter()
      .map(|iface| InterfaceAddress {
        is_loopback: iface.is_loopback(),
        ip: iface.ip(),
        name: iface.name,
        is_up: true,
      })
      .collect(),
  )
}

/// Picks the first IPv4 address on an interface which is up and is not a loopback.
///
/// Interfaces are considered in the order given; IPv6 addresses are skipped.
pub fn select_listen_ip<I>(interfaces: I) -> Option<Ipv4Addr>
where
  I: IntoIterator<Item = InterfaceAddress>,
{
  interfaces
    .into_iter()
    .filter(|iface| iface.is_up && !iface.is_loopback)
    .find_map(|iface| match iface.ip {
      IpAddr::V4(ip) if !ip.is_loopback() => {
        tracing::debug!(interface = %iface.name, %ip, "selected local ipv4 address");
        Some(ip)
      }
      _ => None,
    })
}
