// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Types shared between the DVMRP engine and anything that drives or
//! inspects it: protocol constants, vif/neighbor sets, the wire
//! codec, and the dump types used for printing.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;

#[macro_use]
pub mod bitmap;
pub mod dump;
pub mod wire;

pub use bitmap::*;
pub use dump::*;

/// Index of a virtual interface.
pub type VifIndex = u8;

/// Index of a neighbor in the process-wide neighbor bitmap.
pub type NbrIndex = u8;

/// The maximum number of vifs the engine will track.
pub const MAX_VIFS: usize = 32;

/// The maximum number of neighbors across all vifs.
pub const MAX_NEIGHBORS: usize = 64;

/// The metric sentinel meaning "no route". Metrics strictly above this
/// value (up to twice it) are the poison-reverse form of a route.
pub const UNREACHABLE: u8 = 32;

/// Default cost of a vif.
pub const DEFAULT_METRIC: u8 = 1;

/// Default TTL threshold of a vif.
pub const DEFAULT_THRESHOLD: u8 = 1;

/// Seconds between aging passes over routes and cache entries.
pub const TIMER_INTERVAL: u32 = 5;

/// Seconds between full route reports.
pub const ROUTE_REPORT_INTERVAL: u32 = 60;

/// A route that has not been refreshed by its parent in this many
/// seconds may be taken over by an equal-metric neighbor.
pub const ROUTE_SWITCH_TIME: u32 = 140;

/// A route not refreshed in this many seconds becomes unreachable.
pub const ROUTE_EXPIRE_TIME: u32 = 200;

/// A route not refreshed in this many seconds is deleted.
pub const ROUTE_DISCARD_TIME: u32 = 340;

/// Default lifetime of a forwarding cache entry, before jitter.
pub const DEFAULT_CACHE_LIFETIME: u32 = 300;

/// Default lifetime of the prunes we send, before jitter.
pub const DEFAULT_PRUNE_LIFETIME: u32 = 7200;

/// We never send a prune whose lifetime is below this.
pub const MIN_PRUNE_LIFE: u32 = TIMER_INTERVAL;

/// Initial prune retransmission interval, doubled on each retransmit.
pub const PRUNE_REXMIT_VAL: u32 = 3;

/// Initial graft retransmission interval, doubled until acknowledged.
pub const GRAFT_TIMEOUT_VAL: u32 = 5;

/// The administratively scoped multicast range, 239.0.0.0/8.
pub const ADMIN_SCOPE_PREFIX: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 0);
pub const ADMIN_SCOPE_MASK: Ipv4Addr = Ipv4Addr::new(255, 0, 0, 0);

/// Is `group` inside the administratively scoped range?
pub fn is_admin_scoped(group: Ipv4Addr) -> bool {
    u32::from(group) & u32::from(ADMIN_SCOPE_MASK)
        == u32::from(ADMIN_SCOPE_PREFIX)
}

/// Return the prefix length of a contiguous netmask, or `None` if the
/// mask has holes.
pub fn mask_width(mask: Ipv4Addr) -> Option<u8> {
    let m = u32::from(mask);
    let width = m.leading_ones();
    if m.checked_shl(width).unwrap_or(0) != 0 {
        return None;
    }
    Some(width as u8)
}

/// Is (`origin`, `mask`) a plausible unicast subnet to route towards?
///
/// The mask must be contiguous and cover the origin entirely. Only the
/// default route may use 0.0.0.0; loopback, "this network" and
/// class D/E origins are rejected.
pub fn valid_subnet(origin: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let o = u32::from(origin);
    let m = u32::from(mask);

    if mask_width(mask).is_none() || o & !m != 0 {
        return false;
    }

    if o == 0 {
        return m == 0;
    }

    let first = origin.octets()[0];
    !(first == 0 || first == 127 || first >= 224)
}

bitflags::bitflags! {
    /// Configuration and state flags of a vif, as reported by the
    /// vif layer.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct VifFlags: u16 {
        /// The vif is a point-to-point tunnel.
        const TUNNEL = 1 << 0;
        /// Administratively disabled.
        const DISABLED = 1 << 1;
        /// Operationally down.
        const DOWN = 1 << 2;
        /// No multicast routers are present on this vif.
        const LEAF = 1 << 3;
        /// We are the IGMP querier on this vif.
        const QUERIER = 1 << 4;
        /// Never make this vif a child of any route.
        const NOFLOOD = 1 << 5;
        /// Retransmit prunes sent upstream over this vif.
        const REXMIT_PRUNES = 1 << 6;
    }
}

impl VifFlags {
    /// Can traffic be forwarded out of or received on this vif?
    pub fn is_usable(&self) -> bool {
        !self.intersects(VifFlags::DOWN | VifFlags::DISABLED)
    }
}

bitflags::bitflags! {
    /// Route entry flags.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct RouteFlags: u8 {
        /// The metric or parent changed since the last triggered report.
        const CHANGED = 1 << 0;
        /// The route is unreachable and waiting to be discarded.
        const HOLDDOWN = 1 << 1;
    }
}

/// The state of the Prune we sent upstream for a cache entry.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum UpstreamPrune {
    /// No prune outstanding.
    #[default]
    NotPruned,
    /// A prune is outstanding with this many seconds left.
    Pending { remaining: u32 },
    /// The prune lifetime ran out on the last aging pass; the sources
    /// are evicted from the kernel exactly once and the state returns
    /// to `NotPruned`.
    Expired,
}

impl UpstreamPrune {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

impl fmt::Display for UpstreamPrune {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotPruned => write!(f, "-"),
            Self::Pending { remaining } => write!(f, "{remaining}"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Per-vif TTL thresholds handed to the kernel forwarding cache. A
/// zero entry means "do not forward out of this vif".
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TtlVector([u8; MAX_VIFS]);

impl Default for TtlVector {
    fn default() -> Self {
        Self([0; MAX_VIFS])
    }
}

impl TtlVector {
    pub fn get(&self, vif: VifIndex) -> u8 {
        self.0[usize::from(vif)]
    }

    pub fn set(&mut self, vif: VifIndex, ttl: u8) {
        self.0[usize::from(vif)] = ttl;
    }

    /// The vifs this vector forwards out of.
    pub fn forwarding(&self) -> VifBitmap {
        let mut out = VifBitmap::EMPTY;
        for (i, ttl) in self.0.iter().enumerate() {
            if *ttl != 0 {
                out.set(i as VifIndex);
            }
        }
        out
    }
}

/// Packet statistics the kernel keeps per (source, group).
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct SgCounters {
    pub pkts: u64,
    pub bytes: u64,
    pub wrong_if: u64,
}

/// An (origin, mask) pair identifying a route.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct RouteKey {
    pub origin: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl RouteKey {
    pub fn new(origin: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self { origin, mask }
    }

    /// Does `addr` fall inside this subnet?
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.mask) == u32::from(self.origin)
    }

    pub fn width(&self) -> u8 {
        mask_width(self.mask).unwrap_or(0)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.width())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subnet_validity() {
        let m24 = Ipv4Addr::new(255, 255, 255, 0);
        assert!(valid_subnet(Ipv4Addr::new(10, 0, 0, 0), m24));
        assert!(valid_subnet(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED));
        // Host bits set.
        assert!(!valid_subnet(Ipv4Addr::new(10, 0, 0, 1), m24));
        // Holes in the mask.
        assert!(!valid_subnet(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(255, 0, 255, 0)
        ));
        assert!(!valid_subnet(Ipv4Addr::new(127, 0, 0, 0), m24));
        assert!(!valid_subnet(Ipv4Addr::new(224, 1, 1, 0), m24));
        assert!(!valid_subnet(Ipv4Addr::UNSPECIFIED, m24));
    }

    #[test]
    fn mask_widths() {
        assert_eq!(mask_width(Ipv4Addr::new(255, 255, 255, 0)), Some(24));
        assert_eq!(mask_width(Ipv4Addr::UNSPECIFIED), Some(0));
        assert_eq!(mask_width(Ipv4Addr::BROADCAST), Some(32));
        assert_eq!(mask_width(Ipv4Addr::new(255, 0, 255, 0)), None);
    }

    #[test]
    fn admin_scope() {
        assert!(is_admin_scoped(Ipv4Addr::new(239, 1, 2, 3)));
        assert!(!is_admin_scoped(Ipv4Addr::new(224, 2, 2, 2)));
    }

    #[test]
    fn route_key_contains() {
        let key = RouteKey::new(
            Ipv4Addr::new(10, 1, 0, 0),
            Ipv4Addr::new(255, 255, 0, 0),
        );
        assert!(key.contains(Ipv4Addr::new(10, 1, 200, 7)));
        assert!(!key.contains(Ipv4Addr::new(10, 2, 0, 1)));
        assert_eq!(key.to_string(), "10.1.0.0/16");
    }
}
