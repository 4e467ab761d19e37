// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The DVMRP route table.
//!
//! One entry per origin subnet, holding the best (metric, parent vif,
//! gateway) learned from neighbor reports or local vifs. Besides path
//! selection each entry classifies every other vif:
//!
//! * A vif with a neighbor that has a better path to the origin is
//!   *dominated*: that neighbor forwards onto the vif, not us.
//! * Every other usable vif is a *child*. Neighbors on a child vif that
//!   advertise the route back to us in poison-reverse form are our
//!   *subordinates*; they depend on us for the origin's traffic.
//!
//! The table never touches the forwarding cache directly. Instead each
//! operation pushes [`RouteEvent`]s describing what the cache must do.

use crate::Error;
use crate::vif::VifLayer;
use dvmrp_api::MAX_VIFS;
use dvmrp_api::NbrBitmap;
use dvmrp_api::NbrIndex;
use dvmrp_api::ROUTE_DISCARD_TIME;
use dvmrp_api::ROUTE_EXPIRE_TIME;
use dvmrp_api::ROUTE_SWITCH_TIME;
use dvmrp_api::RouteEntryDump;
use dvmrp_api::RouteFlags;
use dvmrp_api::RouteKey;
use dvmrp_api::TIMER_INTERVAL;
use dvmrp_api::UNREACHABLE;
use dvmrp_api::VifBitmap;
use dvmrp_api::VifFlags;
use dvmrp_api::VifIndex;
use dvmrp_api::valid_subnet;
use dvmrp_api::wire::ReportedRoute;
use dvmrp_api::wire::encodable_mask;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Work the forwarding cache must do after a route table change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteEvent {
    /// The route's children, subordinates or upstream changed:
    /// recompute its cache entries and resync the kernel.
    Resync(RouteKey),
    /// The route became unreachable or was deleted: drop its cache
    /// entries.
    Flush(RouteKey),
    /// The route became reachable: sources cached against less
    /// specific routes that fall inside it must be re-resolved.
    Steal(RouteKey),
}

/// One line of a route report, as received on `vif`.
#[derive(Clone, Copy, Debug)]
pub struct RouteReport {
    pub origin: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// The metric as advertised, before adding the vif's cost.
    pub metric: u8,
    /// The reporting neighbor, or `None` for a directly connected subnet.
    pub src: Option<Ipv4Addr>,
    pub vif: VifIndex,
    pub nbr: Option<NbrIndex>,
}

/// Which routes a report should carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportKind {
    All,
    Changed,
}

#[derive(Clone, Debug)]
pub struct RouteEntry {
    key: RouteKey,
    metric: u8,
    parent: VifIndex,
    gateway: Option<Ipv4Addr>,
    dominants: [Option<Ipv4Addr>; MAX_VIFS],
    subordinates: NbrBitmap,
    /// Subordinates heard from since the last subordinate check.
    subordadv: NbrBitmap,
    children: VifBitmap,
    /// Seconds since the parent last refreshed this route.
    timer: u32,
    flags: RouteFlags,
}

impl RouteEntry {
    fn new(
        key: RouteKey,
        metric: u8,
        parent: VifIndex,
        gateway: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            key,
            metric,
            parent,
            gateway,
            dominants: [None; MAX_VIFS],
            subordinates: NbrBitmap::EMPTY,
            subordadv: NbrBitmap::EMPTY,
            children: VifBitmap::EMPTY,
            timer: 0,
            flags: RouteFlags::CHANGED,
        }
    }

    pub fn key(&self) -> RouteKey {
        self.key
    }

    pub fn origin(&self) -> Ipv4Addr {
        self.key.origin
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.key.mask
    }

    /// The prefix length of the mask.
    pub fn width(&self) -> u8 {
        self.key.width()
    }

    pub fn metric(&self) -> u8 {
        self.metric
    }

    pub fn is_reachable(&self) -> bool {
        self.metric < UNREACHABLE
    }

    /// The vif traffic from this origin is expected to arrive on.
    pub fn parent(&self) -> VifIndex {
        self.parent
    }

    /// The upstream neighbor, or `None` if the origin is directly
    /// connected.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn children(&self) -> VifBitmap {
        self.children
    }

    pub fn subordinates(&self) -> NbrBitmap {
        self.subordinates
    }

    pub fn dominant(&self, vif: VifIndex) -> Option<Ipv4Addr> {
        self.dominants.get(usize::from(vif)).copied().flatten()
    }

    pub fn age(&self) -> u32 {
        self.timer
    }

    pub fn flags(&self) -> RouteFlags {
        self.flags
    }

    fn event(&self) -> RouteEvent {
        RouteEvent::Resync(self.key)
    }

    /// Recompute the children and subordinates from scratch.
    ///
    /// On a `fresh` route every vif starts undominated and every
    /// neighbor on a child vif is assumed to be a subordinate until it
    /// says otherwise. Otherwise dominance learned on other vifs is
    /// kept and only vifs that just became children pick up assumed
    /// subordinates.
    fn init_children<V: VifLayer>(&mut self, vifs: &V, fresh: bool) {
        let prev = self.children;
        self.children = VifBitmap::EMPTY;

        for vif in 0..vifs.num_vifs() {
            let v = usize::from(vif);
            if fresh || vif == self.parent {
                self.dominants[v] = None;
            }

            let flags = vifs.flags(vif);
            let nbrs = vifs.neighbors(vif);
            if vif == self.parent
                || !flags.is_usable()
                || flags.contains(VifFlags::NOFLOOD)
                || self.dominants[v].is_some()
            {
                self.subordinates.clear_mask(nbrs);
                self.subordadv.clear_mask(nbrs);
                continue;
            }

            self.children.set(vif);
            if fresh || !prev.contains(vif) {
                self.subordinates.set_mask(nbrs);
                self.subordadv.set_mask(nbrs);
            }
        }
    }

    /// Take the route down: unreachable, and discarded after the
    /// holddown period unless something better turns up.
    fn expire(&mut self) {
        self.metric = UNREACHABLE;
        self.timer = self.timer.max(ROUTE_EXPIRE_TIME);
        self.flags |= RouteFlags::CHANGED | RouteFlags::HOLDDOWN;
    }

    fn can_be_child<V: VifLayer>(&self, vifs: &V, vif: VifIndex) -> bool {
        let flags = vifs.flags(vif);
        vif != self.parent
            && flags.is_usable()
            && !flags.contains(VifFlags::NOFLOOD)
    }

    pub fn dump(&self, groups: usize) -> RouteEntryDump {
        RouteEntryDump {
            key: self.key,
            metric: self.metric,
            parent: self.parent,
            gateway: self.gateway,
            children: self.children,
            subordinates: self.subordinates,
            dominants: self
                .dominants
                .iter()
                .enumerate()
                .filter_map(|(i, d)| d.map(|d| (i as VifIndex, d)))
                .collect(),
            age: self.timer,
            flags: self.flags,
            groups,
        }
    }
}

#[derive(Debug)]
pub struct RouteTable {
    log: Logger,
    routes: BTreeMap<RouteKey, RouteEntry>,
    /// Some route changed since the last triggered report.
    changed: bool,
    /// Seconds since subordinate claims were last audited.
    subord_clock: u32,
}

impl RouteTable {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.new(o!("component" => "route")),
            routes: BTreeMap::new(),
            changed: false,
            subord_clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn get(&self, key: &RouteKey) -> Option<&RouteEntry> {
        self.routes.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values()
    }

    /// Has any route changed since the last call to
    /// [`RouteTable::clear_changed`]?
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn clear_changed(&mut self) {
        for r in self.routes.values_mut() {
            r.flags.remove(RouteFlags::CHANGED);
        }
        self.changed = false;
    }

    /// Find the most specific reachable route covering `addr`.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&RouteEntry> {
        self.routes
            .values()
            .filter(|r| r.is_reachable() && r.key.contains(addr))
            .max_by_key(|r| r.width())
    }

    /// Check a report line without applying it.
    pub fn validate(rr: &RouteReport) -> Result<(), Error> {
        if let Some(src) = rr.src {
            if rr.metric == 0 || rr.metric > 2 * UNREACHABLE {
                return Err(Error::BadMetric {
                    metric: rr.metric,
                    origin: rr.origin,
                    src,
                });
            }
        }

        if !valid_subnet(rr.origin, rr.mask) {
            return Err(Error::InvalidSubnet {
                origin: rr.origin,
                mask: rr.mask,
            });
        }

        Ok(())
    }

    /// Process one (origin, mask, metric) line of a report.
    pub fn update_route<V: VifLayer>(
        &mut self,
        vifs: &V,
        rr: &RouteReport,
        events: &mut Vec<RouteEvent>,
    ) -> Result<(), Error> {
        if rr.vif >= vifs.num_vifs() {
            return Err(Error::UnknownVif(rr.vif));
        }

        let nbr = match (rr.src, rr.nbr) {
            (Some(src), None) => {
                return Err(Error::UnknownNeighbor { src, vif: rr.vif });
            }
            (_, nbr) => nbr,
        };

        Self::validate(rr)?;

        let key = RouteKey::new(rr.origin, rr.mask);
        let poisoned = rr.metric > UNREACHABLE;
        let adj_metric =
            rr.metric.saturating_add(vifs.cost(rr.vif)).min(UNREACHABLE);

        let Some(r) = self.routes.get_mut(&key) else {
            if adj_metric >= UNREACHABLE {
                return Ok(());
            }

            let mut r = RouteEntry::new(key, adj_metric, rr.vif, rr.src);
            r.init_children(vifs, true);
            debug!(self.log, "new route";
                "route" => %key,
                "metric" => adj_metric,
                "parent" => rr.vif,
                "gateway" => ?rr.src,
            );
            self.routes.insert(key, r);
            self.changed = true;
            events.push(RouteEvent::Steal(key));
            return Ok(());
        };

        // A route in holddown takes the first reachable path offered.
        if !r.is_reachable() {
            if adj_metric >= UNREACHABLE {
                return Ok(());
            }

            r.metric = adj_metric;
            r.parent = rr.vif;
            r.gateway = rr.src;
            r.timer = 0;
            r.flags.remove(RouteFlags::HOLDDOWN);
            r.flags.insert(RouteFlags::CHANGED);
            r.init_children(vifs, true);
            debug!(self.log, "route reachable again";
                "route" => %key,
                "metric" => adj_metric,
                "parent" => rr.vif,
                "gateway" => ?rr.src,
            );
            self.changed = true;
            events.push(RouteEvent::Steal(key));
            return Ok(());
        }

        if rr.vif == r.parent && rr.src == r.gateway {
            r.timer = 0;
            if adj_metric == r.metric {
                return Ok(());
            }

            r.metric = adj_metric;
            r.flags.insert(RouteFlags::CHANGED);
            self.changed = true;

            if adj_metric == UNREACHABLE {
                r.expire();
                debug!(self.log, "route poisoned by parent"; "route" => %key);
                events.push(RouteEvent::Flush(key));
            }
            return Ok(());
        }

        let better = adj_metric < UNREACHABLE
            && (adj_metric < r.metric
                || (adj_metric == r.metric
                    && match (rr.src, r.gateway) {
                        (Some(src), Some(gw)) => {
                            u32::from(src) < u32::from(gw)
                                || r.timer >= ROUTE_SWITCH_TIME
                        }
                        _ => false,
                    }));

        if better {
            let ev = r.event();
            r.metric = adj_metric;
            r.parent = rr.vif;
            r.gateway = rr.src;
            r.timer = 0;
            r.flags.insert(RouteFlags::CHANGED);
            r.init_children(vifs, false);
            debug!(self.log, "route switched";
                "route" => %key,
                "metric" => adj_metric,
                "parent" => rr.vif,
                "gateway" => ?rr.src,
            );
            self.changed = true;
            events.push(ev);
            return Ok(());
        }

        // Everything below is about a neighbor on some other vif
        // telling us how it relates to this route.
        let (Some(src), Some(nbr)) = (rr.src, nbr) else {
            return Ok(());
        };
        if rr.vif == r.parent {
            return Ok(());
        }

        let vif = rr.vif;
        let lcl = u32::from(vifs.local_addr(vif));
        let mut touched = false;

        if poisoned {
            if r.children.contains(vif) {
                r.subordadv.set(nbr);
                if !r.subordinates.contains(nbr) {
                    r.subordinates.set(nbr);
                    touched = true;
                    debug!(self.log, "neighbor is subordinate";
                        "route" => %key, "vif" => vif, "nbr" => %src);
                }
            }
        } else if r.children.contains(vif) {
            if rr.metric < r.metric
                || (rr.metric == r.metric && u32::from(src) < lcl)
            {
                r.children.clear(vif);
                r.dominants[usize::from(vif)] = Some(src);
                let nbrs = vifs.neighbors(vif);
                r.subordinates.clear_mask(nbrs);
                r.subordadv.clear_mask(nbrs);
                touched = true;
                debug!(self.log, "neighbor is dominant";
                    "route" => %key, "vif" => vif, "nbr" => %src);
            } else if r.subordinates.contains(nbr) {
                r.subordinates.clear(nbr);
                r.subordadv.clear(nbr);
                touched = true;
                debug!(self.log, "neighbor no longer subordinate";
                    "route" => %key, "vif" => vif, "nbr" => %src);
            }
        } else if r.dominants[usize::from(vif)] == Some(src)
            && (rr.metric > r.metric
                || (rr.metric == r.metric && u32::from(src) > lcl))
        {
            r.dominants[usize::from(vif)] = None;
            if r.can_be_child(vifs, vif) {
                r.children.set(vif);
                let others =
                    vifs.neighbors(vif).difference(NbrBitmap::single(nbr));
                r.subordinates.set_mask(others);
                r.subordadv.set_mask(others);
            }
            touched = true;
            debug!(self.log, "dominant neighbor lost out";
                "route" => %key, "vif" => vif, "nbr" => %src);
        }

        if touched {
            events.push(r.event());
        }
        Ok(())
    }

    /// Age every route by one tick.
    pub fn age_routes(&mut self, events: &mut Vec<RouteEvent>) {
        self.subord_clock += TIMER_INTERVAL;
        let audit = self.subord_clock >= 2 * ROUTE_EXPIRE_TIME;
        if audit {
            self.subord_clock = 0;
        }

        let mut discard = Vec::new();
        let mut changed = false;

        for (key, r) in self.routes.iter_mut() {
            // Directly connected routes live as long as their vif.
            if r.gateway.is_none() && r.is_reachable() {
                continue;
            }

            r.timer += TIMER_INTERVAL;
            if r.timer >= ROUTE_DISCARD_TIME {
                discard.push(*key);
                continue;
            }

            if r.timer >= ROUTE_EXPIRE_TIME && r.is_reachable() {
                r.expire();
                changed = true;
                info!(self.log, "route expired"; "route" => %key);
                events.push(RouteEvent::Flush(*key));
                continue;
            }

            if audit && r.is_reachable() {
                let stale = r.subordinates.difference(r.subordadv);
                if !stale.is_empty() {
                    debug!(self.log, "dropping stale subordinates";
                        "route" => %key, "nbrs" => %stale);
                    r.subordinates.clear_mask(stale);
                    events.push(r.event());
                }
                r.subordadv = NbrBitmap::EMPTY;
            }
        }

        for key in discard {
            self.routes.remove(&key);
            debug!(self.log, "route discarded"; "route" => %key);
            events.push(RouteEvent::Flush(key));
        }

        self.changed |= changed;
    }

    /// A vif came up: it becomes a child of every route, and its
    /// subnet becomes a directly connected route.
    pub fn add_vif<V: VifLayer>(
        &mut self,
        vifs: &V,
        vif: VifIndex,
        events: &mut Vec<RouteEvent>,
    ) -> Result<(), Error> {
        if vif >= vifs.num_vifs() {
            return Err(Error::UnknownVif(vif));
        }

        for r in self.routes.values_mut() {
            if !r.is_reachable() || !r.can_be_child(vifs, vif) {
                continue;
            }
            r.dominants[usize::from(vif)] = None;
            if !r.children.contains(vif) {
                r.children.set(vif);
                let nbrs = vifs.neighbors(vif);
                r.subordinates.set_mask(nbrs);
                r.subordadv.set_mask(nbrs);
                events.push(r.event());
            }
        }

        if let Some(subnet) = vifs.subnet(vif) {
            let rr = RouteReport {
                origin: subnet.origin,
                mask: subnet.mask,
                metric: 0,
                src: None,
                vif,
                nbr: None,
            };
            self.update_route(vifs, &rr, events)?;
        }

        Ok(())
    }

    /// A vif went down: routes through it expire and it stops being a
    /// child of anything.
    pub fn delete_vif<V: VifLayer>(
        &mut self,
        vifs: &V,
        vif: VifIndex,
        events: &mut Vec<RouteEvent>,
    ) -> Result<(), Error> {
        if vif >= vifs.num_vifs() {
            return Err(Error::UnknownVif(vif));
        }

        let nbrs = vifs.neighbors(vif);
        let mut changed = false;

        for r in self.routes.values_mut() {
            if r.parent == vif {
                if r.is_reachable() {
                    r.expire();
                    changed = true;
                    events.push(RouteEvent::Flush(r.key));
                }
                continue;
            }

            let v = usize::from(vif);
            if r.children.contains(vif) || r.dominants[v].is_some() {
                r.children.clear(vif);
                r.dominants[v] = None;
                r.subordinates.clear_mask(nbrs);
                r.subordadv.clear_mask(nbrs);
                events.push(r.event());
            }
        }

        self.changed |= changed;
        Ok(())
    }

    /// A new neighbor appeared on `vif`. Until it tells us otherwise it
    /// is assumed to depend on us for every route we forward onto
    /// that vif.
    pub fn add_neighbor(
        &mut self,
        vif: VifIndex,
        nbr: NbrIndex,
        events: &mut Vec<RouteEvent>,
    ) {
        for r in self.routes.values_mut() {
            if r.is_reachable()
                && r.children.contains(vif)
                && !r.subordinates.contains(nbr)
            {
                r.subordinates.set(nbr);
                r.subordadv.set(nbr);
                events.push(r.event());
            }
        }
    }

    /// A neighbor went away. Routes through it expire; vifs it
    /// dominated become ours again.
    pub fn delete_neighbor<V: VifLayer>(
        &mut self,
        vifs: &V,
        vif: VifIndex,
        addr: Ipv4Addr,
        nbr: NbrIndex,
        events: &mut Vec<RouteEvent>,
    ) {
        let mut changed = false;

        for r in self.routes.values_mut() {
            r.subordadv.clear(nbr);

            if r.parent == vif && r.gateway == Some(addr) {
                if r.is_reachable() {
                    r.expire();
                    changed = true;
                    info!(self.log, "gateway lost";
                        "route" => %r.key, "gateway" => %addr);
                    events.push(RouteEvent::Flush(r.key));
                }
                continue;
            }

            let mut touched = false;
            let v = usize::from(vif);
            if r.dominants[v] == Some(addr) {
                r.dominants[v] = None;
                if r.is_reachable() && r.can_be_child(vifs, vif) {
                    r.children.set(vif);
                    let others =
                        vifs.neighbors(vif).difference(NbrBitmap::single(nbr));
                    r.subordinates.set_mask(others);
                    r.subordadv.set_mask(others);
                }
                touched = true;
            }

            if r.subordinates.contains(nbr) {
                r.subordinates.clear(nbr);
                touched = true;
            }

            if touched && r.is_reachable() {
                events.push(r.event());
            }
        }

        self.changed |= changed;
    }

    /// Build the routes to advertise on `vif`.
    ///
    /// Routes learned over `vif` are poisoned: advertised with
    /// `UNREACHABLE` added so the upstream router knows we depend on
    /// it. The result is grouped by mask, longest first.
    pub fn report(
        &self,
        vif: VifIndex,
        kind: ReportKind,
    ) -> Vec<ReportedRoute> {
        let mut out: Vec<ReportedRoute> = self
            .routes
            .values()
            .filter(|r| {
                kind == ReportKind::All
                    || r.flags.contains(RouteFlags::CHANGED)
            })
            .filter(|r| encodable_mask(r.key.mask))
            .map(|r| {
                let metric = if r.parent == vif && r.is_reachable() {
                    r.metric + UNREACHABLE
                } else {
                    r.metric
                };
                ReportedRoute { origin: r.key.origin, mask: r.key.mask, metric }
            })
            .collect();

        out.sort_by(|a, b| {
            u32::from(b.mask)
                .cmp(&u32::from(a.mask))
                .then(u32::from(a.origin).cmp(&u32::from(b.origin)))
        });
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::vif::VifTable;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    const M24: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    // Three LAN vifs: 10.0.0.0/24, 10.1.0.0/24 and 10.2.0.0/24. We are
    // .1 on each.
    fn vifs() -> VifTable {
        let mut cfg = String::new();
        for i in 0..3 {
            cfg.push_str(&format!(
                "[[vif]]\nname = \"lan{i}\"\nlocal_addr = \"10.{i}.0.1\"\n\
                 subnet = \"10.{i}.0.0/24\"\n"
            ));
        }
        VifTable::new(&Config::from_toml(&cfg).unwrap().vifs)
    }

    fn report(
        vifs: &VifTable,
        origin: &str,
        metric: u8,
        src: &str,
        vif: VifIndex,
    ) -> RouteReport {
        let src = addr(src);
        RouteReport {
            origin: addr(origin),
            mask: M24,
            metric,
            src: Some(src),
            vif,
            nbr: vifs.neighbor_index(vif, src),
        }
    }

    fn table() -> RouteTable {
        RouteTable::new(&Logger::root(slog::Discard, o!()))
    }

    #[test]
    fn new_route_and_poison_from_parent() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.2"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];

        let rr = report(&v, "192.168.1.0", 1, "10.0.0.2", 0);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        let key = RouteKey::new(addr("192.168.1.0"), M24);
        let r = rt.get(&key).unwrap();
        assert_eq!(r.metric(), 2);
        assert_eq!(r.parent(), 0);
        assert_eq!(r.gateway(), Some(addr("10.0.0.2")));
        assert_eq!(r.children(), [1, 2].into_iter().collect());
        assert_eq!(ev, vec![RouteEvent::Steal(key)]);

        ev.clear();
        let rr = report(&v, "192.168.1.0", UNREACHABLE, "10.0.0.2", 0);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        let r = rt.get(&key).unwrap();
        assert!(!r.is_reachable());
        assert!(r.flags().contains(RouteFlags::HOLDDOWN));
        assert_eq!(ev, vec![RouteEvent::Flush(key)]);
    }

    #[test]
    fn unreachable_report_for_unknown_origin_is_ignored() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.2"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];
        let rr = report(&v, "192.168.1.0", UNREACHABLE, "10.0.0.2", 0);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        assert!(rt.is_empty());
        assert!(ev.is_empty());
    }

    #[test]
    fn bad_subnet_and_metric() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.2"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];

        let rr = report(&v, "192.168.1.7", 1, "10.0.0.2", 0);
        assert!(matches!(
            rt.update_route(&v, &rr, &mut ev),
            Err(Error::InvalidSubnet { .. })
        ));

        let rr = report(&v, "192.168.1.0", 0, "10.0.0.2", 0);
        assert!(matches!(
            RouteTable::validate(&rr),
            Err(Error::BadMetric { metric: 0, .. })
        ));
        assert!(rt.is_empty());
    }

    #[test]
    fn lower_metric_wins_then_ip_tiebreak() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.9"), true).unwrap();
        v.add_neighbor(1, addr("10.1.0.5"), true).unwrap();
        v.add_neighbor(1, addr("10.1.0.3"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];
        let key = RouteKey::new(addr("192.168.1.0"), M24);

        let rr = report(&v, "192.168.1.0", 3, "10.0.0.9", 0);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        let rr = report(&v, "192.168.1.0", 2, "10.1.0.5", 1);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        let r = rt.get(&key).unwrap();
        assert_eq!(r.parent(), 1);
        assert_eq!(r.gateway(), Some(addr("10.1.0.5")));
        assert!(!r.children().contains(1));
        assert!(r.children().contains(0));

        // Same metric, numerically lower address.
        let rr = report(&v, "192.168.1.0", 2, "10.1.0.3", 1);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        assert_eq!(rt.get(&key).unwrap().gateway(), Some(addr("10.1.0.3")));

        // Same metric, higher address: no switch.
        let rr = report(&v, "192.168.1.0", 2, "10.1.0.5", 1);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        assert_eq!(rt.get(&key).unwrap().gateway(), Some(addr("10.1.0.3")));
    }

    #[test]
    fn dominant_neighbor_on_child_vif() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.2"), true).unwrap();
        let n = v.add_neighbor(2, addr("10.2.0.7"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];
        let key = RouteKey::new(addr("192.168.1.0"), M24);

        let rr = report(&v, "192.168.1.0", 3, "10.0.0.2", 0);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        assert!(rt.get(&key).unwrap().subordinates().contains(n));

        // Our metric is 4. A neighbor on vif 2 advertising 3 dominates
        // that vif, but after the vif cost it does not beat our parent.
        ev.clear();
        let rr = report(&v, "192.168.1.0", 3, "10.2.0.7", 2);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        let r = rt.get(&key).unwrap();
        assert_eq!(r.parent(), 0);
        assert!(!r.children().contains(2));
        assert_eq!(r.dominant(2), Some(addr("10.2.0.7")));
        assert!(!r.subordinates().contains(n));
        assert_eq!(ev.len(), 1);

        // The dominant router gets worse; vif 2 is ours again.
        ev.clear();
        let rr = report(&v, "192.168.1.0", 9, "10.2.0.7", 2);
        rt.update_route(&v, &rr, &mut ev).unwrap();
        let r = rt.get(&key).unwrap();
        assert!(r.children().contains(2));
        assert_eq!(r.dominant(2), None);
        assert_eq!(ev.len(), 1);
    }

    #[test]
    fn expire_and_discard() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.2"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];
        let key = RouteKey::new(addr("192.168.1.0"), M24);
        let rr = report(&v, "192.168.1.0", 1, "10.0.0.2", 0);
        rt.update_route(&v, &rr, &mut ev).unwrap();

        ev.clear();
        let mut elapsed = 0;
        while elapsed < ROUTE_EXPIRE_TIME {
            rt.age_routes(&mut ev);
            elapsed += TIMER_INTERVAL;
        }
        assert!(!rt.get(&key).unwrap().is_reachable());
        assert!(ev.contains(&RouteEvent::Flush(key)));

        while elapsed < ROUTE_DISCARD_TIME {
            rt.age_routes(&mut ev);
            elapsed += TIMER_INTERVAL;
        }
        assert!(rt.get(&key).is_none());
    }

    #[test]
    fn local_routes_do_not_age() {
        let v = vifs();
        let mut rt = table();
        let mut ev = vec![];
        for vif in 0..3 {
            rt.add_vif(&v, vif, &mut ev).unwrap();
        }
        assert_eq!(rt.len(), 3);
        for _ in 0..(ROUTE_DISCARD_TIME / TIMER_INTERVAL + 1) {
            rt.age_routes(&mut ev);
        }
        assert_eq!(rt.len(), 3);
        let r = rt.lookup(addr("10.1.0.77")).unwrap();
        assert_eq!(r.gateway(), None);
        assert_eq!(r.parent(), 1);
        assert_eq!(r.metric(), 1);
    }

    #[test]
    fn report_poisons_routes_learned_on_vif() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.2"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];
        rt.add_vif(&v, 1, &mut ev).unwrap();
        let rr = report(&v, "192.168.1.0", 1, "10.0.0.2", 0);
        rt.update_route(&v, &rr, &mut ev).unwrap();

        let on0 = rt.report(0, ReportKind::All);
        let r = on0.iter().find(|r| r.origin == addr("192.168.1.0")).unwrap();
        assert_eq!(r.metric, 2 + UNREACHABLE);

        let on1 = rt.report(1, ReportKind::All);
        let r = on1.iter().find(|r| r.origin == addr("192.168.1.0")).unwrap();
        assert_eq!(r.metric, 2);

        rt.clear_changed();
        assert!(rt.report(1, ReportKind::Changed).is_empty());
    }

    #[test]
    fn lookup_prefers_longest_match() {
        let mut v = vifs();
        v.add_neighbor(0, addr("10.0.0.2"), true).unwrap();
        let mut rt = table();
        let mut ev = vec![];
        let src = addr("10.0.0.2");
        let nbr = v.neighbor_index(0, src);
        let wide = RouteReport {
            origin: addr("172.16.0.0"),
            mask: addr("255.255.0.0"),
            metric: 1,
            src: Some(src),
            vif: 0,
            nbr,
        };
        let narrow = RouteReport {
            origin: addr("172.16.4.0"),
            mask: M24,
            metric: 4,
            ..wide
        };
        rt.update_route(&v, &wide, &mut ev).unwrap();
        rt.update_route(&v, &narrow, &mut ev).unwrap();
        assert_eq!(rt.lookup(addr("172.16.4.1")).unwrap().width(), 24);
        assert_eq!(rt.lookup(addr("172.16.5.1")).unwrap().width(), 16);
        assert!(rt.lookup(addr("172.17.0.1")).is_none());
    }
}
