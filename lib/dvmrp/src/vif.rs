// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The virtual interface and neighbor layer.
//!
//! Neighbor discovery and IGMP membership tracking live outside the
//! routing engine. The engine only consumes their results through
//! [`VifLayer`]. [`VifTable`] is a configuration-driven implementation
//! whose neighbor and membership state is pushed in by its owner.

use crate::Error;
use crate::config::VifConfig;
use dvmrp_api::MAX_NEIGHBORS;
use dvmrp_api::MAX_VIFS;
use dvmrp_api::NbrBitmap;
use dvmrp_api::NbrIndex;
use dvmrp_api::RouteKey;
use dvmrp_api::VifFlags;
use dvmrp_api::VifIndex;
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// What the routing engine needs to know about vifs and neighbors.
pub trait VifLayer {
    /// The number of configured vifs; valid indices are `0..num_vifs()`.
    fn num_vifs(&self) -> VifIndex;

    fn flags(&self, vif: VifIndex) -> VifFlags;

    /// The metric added to routes learned over this vif.
    fn cost(&self, vif: VifIndex) -> u8;

    /// The TTL a packet needs to be forwarded out of this vif.
    fn threshold(&self, vif: VifIndex) -> u8;

    fn local_addr(&self, vif: VifIndex) -> Ipv4Addr;

    /// The directly connected subnet, if this vif has one.
    fn subnet(&self, vif: VifIndex) -> Option<RouteKey>;

    /// A vif-specific override of the prune lifetime we advertise.
    fn prune_lifetime(&self, vif: VifIndex) -> Option<u32>;

    /// The neighbors currently known on this vif.
    fn neighbors(&self, vif: VifIndex) -> NbrBitmap;

    fn neighbor_index(&self, vif: VifIndex, addr: Ipv4Addr)
    -> Option<NbrIndex>;

    /// Does the neighbor understand prunes?
    fn is_pruning_neighbor(&self, vif: VifIndex, addr: Ipv4Addr) -> bool;

    /// Is there a local receiver for `group` on this vif?
    fn is_member(&self, vif: VifIndex, group: Ipv4Addr) -> bool;

    /// Is `group` administratively blocked on this vif?
    fn scoped(&self, vif: VifIndex, group: Ipv4Addr) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub struct Neighbor {
    pub index: NbrIndex,
    pub pruning: bool,
}

#[derive(Clone, Debug)]
pub struct Vif {
    pub name: String,
    pub flags: VifFlags,
    pub metric: u8,
    pub threshold: u8,
    pub local_addr: Ipv4Addr,
    pub remote_addr: Option<Ipv4Addr>,
    pub subnet: Option<RouteKey>,
    pub prune_lifetime: Option<u32>,
    pub boundaries: Vec<Ipv4Network>,
    neighbors: BTreeMap<Ipv4Addr, Neighbor>,
    groups: BTreeSet<Ipv4Addr>,
}

impl From<&VifConfig> for Vif {
    fn from(cfg: &VifConfig) -> Self {
        let mut flags = VifFlags::empty();
        if cfg.remote_addr.is_some() {
            flags |= VifFlags::TUNNEL;
        }
        if cfg.disabled {
            flags |= VifFlags::DISABLED;
        }
        if cfg.noflood {
            flags |= VifFlags::NOFLOOD;
        }
        if cfg.leaf {
            flags |= VifFlags::LEAF;
        }
        if cfg.rexmit_prunes.unwrap_or(cfg.remote_addr.is_none()) {
            flags |= VifFlags::REXMIT_PRUNES;
        }

        Self {
            name: cfg.name.clone(),
            flags,
            metric: cfg.metric,
            threshold: cfg.threshold,
            local_addr: cfg.local_addr,
            remote_addr: cfg.remote_addr,
            subnet: cfg.subnet.map(|n| RouteKey::new(n.network(), n.mask())),
            prune_lifetime: cfg.prune_lifetime,
            boundaries: cfg.boundaries.clone(),
            neighbors: BTreeMap::new(),
            groups: BTreeSet::new(),
        }
    }
}

/// A vif layer backed by static configuration.
#[derive(Clone, Debug, Default)]
pub struct VifTable {
    vifs: Vec<Vif>,
    nbr_slots: Vec<Option<(VifIndex, Ipv4Addr)>>,
}

impl VifTable {
    pub fn new(cfgs: &[VifConfig]) -> Self {
        Self {
            vifs: cfgs.iter().take(MAX_VIFS).map(Vif::from).collect(),
            nbr_slots: vec![None; MAX_NEIGHBORS],
        }
    }

    pub fn get(&self, vif: VifIndex) -> Option<&Vif> {
        self.vifs.get(usize::from(vif))
    }

    fn get_mut(&mut self, vif: VifIndex) -> Result<&mut Vif, Error> {
        self.vifs.get_mut(usize::from(vif)).ok_or(Error::UnknownVif(vif))
    }

    /// Find the vif a packet from `src` arrived on: the tunnel whose
    /// far end is `src`, or the vif whose subnet contains it.
    pub fn find_vif(&self, src: Ipv4Addr) -> Option<VifIndex> {
        self.vifs
            .iter()
            .position(|v| {
                v.flags.is_usable()
                    && match v.remote_addr {
                        Some(remote) => remote == src,
                        None => v.subnet.is_some_and(|s| s.contains(src)),
                    }
            })
            .map(|i| i as VifIndex)
    }

    /// Record a newly discovered neighbor, returning its index.
    ///
    /// A neighbor that is already known keeps its index.
    pub fn add_neighbor(
        &mut self,
        vif: VifIndex,
        addr: Ipv4Addr,
        pruning: bool,
    ) -> Result<NbrIndex, Error> {
        if let Some(n) = self.get_mut(vif)?.neighbors.get_mut(&addr) {
            n.pruning = pruning;
            return Ok(n.index);
        }

        let slot = self
            .nbr_slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NeighborTableFull)?;
        self.nbr_slots[slot] = Some((vif, addr));

        let index = slot as NbrIndex;
        self.get_mut(vif)?
            .neighbors
            .insert(addr, Neighbor { index, pruning });
        Ok(index)
    }

    /// Forget a neighbor, returning the index it held.
    pub fn remove_neighbor(
        &mut self,
        vif: VifIndex,
        addr: Ipv4Addr,
    ) -> Option<NbrIndex> {
        let n = self.get_mut(vif).ok()?.neighbors.remove(&addr)?;
        self.nbr_slots[usize::from(n.index)] = None;
        Some(n.index)
    }

    pub fn join(
        &mut self,
        vif: VifIndex,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        self.get_mut(vif)?.groups.insert(group);
        Ok(())
    }

    pub fn leave(
        &mut self,
        vif: VifIndex,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        self.get_mut(vif)?.groups.remove(&group);
        Ok(())
    }

    pub fn set_flags(
        &mut self,
        vif: VifIndex,
        flags: VifFlags,
        on: bool,
    ) -> Result<(), Error> {
        self.get_mut(vif)?.flags.set(flags, on);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (VifIndex, &Vif)> {
        self.vifs.iter().enumerate().map(|(i, v)| (i as VifIndex, v))
    }
}

impl VifLayer for VifTable {
    fn num_vifs(&self) -> VifIndex {
        self.vifs.len() as VifIndex
    }

    fn flags(&self, vif: VifIndex) -> VifFlags {
        self.get(vif).map(|v| v.flags).unwrap_or(VifFlags::DISABLED)
    }

    fn cost(&self, vif: VifIndex) -> u8 {
        self.get(vif).map(|v| v.metric).unwrap_or(dvmrp_api::UNREACHABLE)
    }

    fn threshold(&self, vif: VifIndex) -> u8 {
        self.get(vif).map(|v| v.threshold).unwrap_or(0)
    }

    fn local_addr(&self, vif: VifIndex) -> Ipv4Addr {
        self.get(vif).map(|v| v.local_addr).unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    fn subnet(&self, vif: VifIndex) -> Option<RouteKey> {
        self.get(vif).and_then(|v| v.subnet)
    }

    fn prune_lifetime(&self, vif: VifIndex) -> Option<u32> {
        self.get(vif).and_then(|v| v.prune_lifetime)
    }

    fn neighbors(&self, vif: VifIndex) -> NbrBitmap {
        self.get(vif)
            .map(|v| v.neighbors.values().map(|n| n.index).collect())
            .unwrap_or_default()
    }

    fn neighbor_index(
        &self,
        vif: VifIndex,
        addr: Ipv4Addr,
    ) -> Option<NbrIndex> {
        self.get(vif)?.neighbors.get(&addr).map(|n| n.index)
    }

    fn is_pruning_neighbor(&self, vif: VifIndex, addr: Ipv4Addr) -> bool {
        self.get(vif)
            .and_then(|v| v.neighbors.get(&addr))
            .is_some_and(|n| n.pruning)
    }

    fn is_member(&self, vif: VifIndex, group: Ipv4Addr) -> bool {
        self.get(vif).is_some_and(|v| v.groups.contains(&group))
    }

    fn scoped(&self, vif: VifIndex, group: Ipv4Addr) -> bool {
        self.get(vif)
            .is_some_and(|v| v.boundaries.iter().any(|b| b.contains(group)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn table() -> VifTable {
        let cfg = Config::from_toml(
            r#"
            [[vif]]
            name = "lan0"
            local_addr = "10.0.0.1"
            subnet = "10.0.0.0/24"
            boundaries = ["239.1.0.0/16"]

            [[vif]]
            name = "tun0"
            local_addr = "10.9.0.1"
            remote_addr = "10.9.0.2"
            metric = 3
            "#,
        )
        .unwrap();
        VifTable::new(&cfg.vifs)
    }

    #[test]
    fn neighbor_indices_are_reused() {
        let mut t = table();
        let a = t.add_neighbor(0, "10.0.0.2".parse().unwrap(), true).unwrap();
        let b = t.add_neighbor(1, "10.9.0.2".parse().unwrap(), false).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.neighbors(0), NbrBitmap::single(a));
        assert!(t.is_pruning_neighbor(0, "10.0.0.2".parse().unwrap()));
        assert!(!t.is_pruning_neighbor(1, "10.9.0.2".parse().unwrap()));

        assert_eq!(t.remove_neighbor(0, "10.0.0.2".parse().unwrap()), Some(a));
        let c = t.add_neighbor(0, "10.0.0.3".parse().unwrap(), true).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn flags_from_config() {
        let t = table();
        assert!(t.flags(0).contains(VifFlags::REXMIT_PRUNES));
        assert!(!t.flags(0).contains(VifFlags::TUNNEL));
        assert!(t.flags(1).contains(VifFlags::TUNNEL));
        assert!(!t.flags(1).contains(VifFlags::REXMIT_PRUNES));
        assert_eq!(t.cost(1), 3);
    }

    #[test]
    fn find_vif_and_scope() {
        let t = table();
        assert_eq!(t.find_vif("10.0.0.77".parse().unwrap()), Some(0));
        assert_eq!(t.find_vif("10.9.0.2".parse().unwrap()), Some(1));
        assert_eq!(t.find_vif("192.168.0.1".parse().unwrap()), None);
        assert!(t.scoped(0, "239.1.2.3".parse().unwrap()));
        assert!(!t.scoped(1, "239.1.2.3".parse().unwrap()));
    }
}
