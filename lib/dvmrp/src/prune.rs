// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The forwarding cache and the prune/graft exchange.
//!
//! There is one [`GroupCacheEntry`] per (route, group) with traffic or
//! downstream prune state. Its outgoing vif set (`grpmems`) is always
//! recomputed from the route's children and subordinates, the prunes
//! received from downstream, and local membership. Whenever that set
//! empties we prune upstream; when it fills again while our prune is
//! outstanding we graft.
//!
//! Sources with no reachable route are held in a separate route-less
//! list of negative entries that only drop traffic.

use crate::Error;
use crate::callout::TimerHandle;
use crate::kern::KernelCache;
use crate::route::RouteEntry;
use crate::route::RouteTable;
use crate::router::Cx;
use crate::router::Outgoing;
use crate::router::TimerAction;
use crate::router::TimerEvent;
use crate::vif::VifLayer;
use dvmrp_api::CacheEntryDump;
use dvmrp_api::GRAFT_TIMEOUT_VAL;
use dvmrp_api::MIN_PRUNE_LIFE;
use dvmrp_api::NbrBitmap;
use dvmrp_api::NbrIndex;
use dvmrp_api::PRUNE_REXMIT_VAL;
use dvmrp_api::PruneDump;
use dvmrp_api::RouteKey;
use dvmrp_api::SourceDump;
use dvmrp_api::TIMER_INTERVAL;
use dvmrp_api::TtlVector;
use dvmrp_api::UpstreamPrune;
use dvmrp_api::VifBitmap;
use dvmrp_api::VifFlags;
use dvmrp_api::VifIndex;
use dvmrp_api::is_admin_scoped;
use dvmrp_api::wire::GraftMsg;
use dvmrp_api::wire::PruneMsg;
use rand::Rng;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::o;
use slog::trace;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Identifies a routed cache entry; the payload of its timers.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CacheKey {
    pub route: RouteKey,
    pub group: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct SourceEntry {
    pub origin: Ipv4Addr,
    /// When the source was installed in the kernel. `None` means it is
    /// currently evicted and kept only for its statistics.
    pub ctime: Option<u64>,
    /// The kernel packet count at the last check.
    pub pktcnt: u64,
    /// Packets counted by kernel entries that have since been removed.
    pub savpkt: u64,
}

impl SourceEntry {
    fn new(origin: Ipv4Addr, now: u64) -> Self {
        Self { origin, ctime: Some(now), pktcnt: 0, savpkt: 0 }
    }

    pub fn is_installed(&self) -> bool {
        self.ctime.is_some()
    }
}

/// A prune received from a downstream neighbor.
#[derive(Clone, Copy, Debug)]
pub struct PruneRecord {
    pub nbr: Ipv4Addr,
    pub vif: VifIndex,
    pub index: NbrIndex,
    /// Seconds of lifetime left.
    pub timer: u32,
}

#[derive(Clone, Debug)]
pub struct GroupCacheEntry {
    group: Ipv4Addr,
    route: Option<RouteKey>,
    parent: Option<VifIndex>,
    gateway: Option<Ipv4Addr>,
    grpmems: VifBitmap,
    scope: VifBitmap,
    ttls: TtlVector,
    upstream: UpstreamPrune,
    /// Interval before the next prune retransmission.
    prune_rexmit: u32,
    rexmit_timer: Option<TimerHandle>,
    /// Grafts sent without an ack; zero when no graft is outstanding.
    graft_sent: u32,
    graft_backoff: u32,
    graft_timer: Option<TimerHandle>,
    /// Seconds until the sources are next checked for activity.
    timer: u32,
    age: u32,
    sources: BTreeMap<Ipv4Addr, SourceEntry>,
    prunes: Vec<PruneRecord>,
    pruned: NbrBitmap,
}

impl GroupCacheEntry {
    fn new(
        group: Ipv4Addr,
        route: Option<&RouteEntry>,
        lifetime: u32,
    ) -> Self {
        Self {
            group,
            route: route.map(|r| r.key()),
            parent: route.map(|r| r.parent()),
            gateway: route.and_then(|r| r.gateway()),
            grpmems: VifBitmap::EMPTY,
            scope: VifBitmap::EMPTY,
            ttls: TtlVector::default(),
            upstream: UpstreamPrune::NotPruned,
            prune_rexmit: 0,
            rexmit_timer: None,
            graft_sent: 0,
            graft_backoff: 0,
            graft_timer: None,
            timer: lifetime,
            age: 0,
            sources: BTreeMap::new(),
            prunes: Vec::new(),
            pruned: NbrBitmap::EMPTY,
        }
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    pub fn route(&self) -> Option<RouteKey> {
        self.route
    }

    pub fn parent(&self) -> Option<VifIndex> {
        self.parent
    }

    pub fn grpmems(&self) -> VifBitmap {
        self.grpmems
    }

    pub fn scope(&self) -> VifBitmap {
        self.scope
    }

    pub fn ttls(&self) -> &TtlVector {
        &self.ttls
    }

    pub fn upstream(&self) -> UpstreamPrune {
        self.upstream
    }

    pub fn graft_sent(&self) -> u32 {
        self.graft_sent
    }

    /// The pending graft retransmission, if any.
    pub fn graft_timer(&self) -> Option<TimerHandle> {
        self.graft_timer
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.values()
    }

    pub fn prunes(&self) -> &[PruneRecord] {
        &self.prunes
    }

    /// Recompute the outgoing vifs and TTLs from the route and the
    /// prunes we hold. Returns whether the outgoing vifs changed.
    pub fn determine_forwvifs<V: VifLayer>(
        &mut self,
        vifs: &V,
        route: &RouteEntry,
        allow_scoped_transit: bool,
    ) -> bool {
        let mut mems = VifBitmap::EMPTY;
        let mut scope = VifBitmap::EMPTY;

        for vif in 0..vifs.num_vifs() {
            if vifs.scoped(vif, self.group) {
                scope.set(vif);
            }
            if !route.children().contains(vif) {
                continue;
            }

            let subs = route.subordinates().intersection(vifs.neighbors(vif));
            if !subs.is_subset(self.pruned) || vifs.is_member(vif, self.group)
            {
                mems.set(vif);
            }
        }

        // Traffic for a scoped group that came in over a boundary must
        // not leak anywhere.
        if is_admin_scoped(self.group)
            && !allow_scoped_transit
            && scope.contains(route.parent())
        {
            scope = (0..vifs.num_vifs()).collect();
        }

        let grpmems = mems.difference(scope);
        let mut ttls = TtlVector::default();
        for vif in grpmems.iter() {
            ttls.set(vif, vifs.threshold(vif));
        }

        let changed = grpmems != self.grpmems;
        self.grpmems = grpmems;
        self.scope = scope;
        self.ttls = ttls;
        changed
    }

    fn dump(&self, now: u64) -> CacheEntryDump {
        CacheEntryDump {
            route: self.route,
            group: self.group,
            parent: self.parent,
            grpmems: self.grpmems,
            scope: self.scope,
            upstream_prune: self.upstream,
            graft_sent: self.graft_sent,
            age: self.age,
            sources: self
                .sources
                .values()
                .map(|s| SourceDump {
                    origin: s.origin,
                    installed_for: s.ctime.map(|t| now.saturating_sub(t)),
                    pkts: s.savpkt + s.pktcnt,
                })
                .collect(),
            prunes: self
                .prunes
                .iter()
                .map(|p| PruneDump {
                    nbr: p.nbr,
                    vif: p.vif,
                    remaining: p.timer,
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
pub struct ForwardingCache {
    log: Logger,
    routed: BTreeMap<RouteKey, BTreeMap<Ipv4Addr, GroupCacheEntry>>,
    unrouted: BTreeMap<Ipv4Addr, GroupCacheEntry>,
}

impl ForwardingCache {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.new(o!("component" => "prune")),
            routed: BTreeMap::new(),
            unrouted: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&GroupCacheEntry> {
        self.routed.get(&key.route)?.get(&key.group)
    }

    /// The route-less entry for `group`, if any.
    pub fn unrouted(&self, group: Ipv4Addr) -> Option<&GroupCacheEntry> {
        self.unrouted.get(&group)
    }

    /// Every cache entry, routed entries first.
    pub fn iter(&self) -> impl Iterator<Item = &GroupCacheEntry> {
        self.routed
            .values()
            .flat_map(|m| m.values())
            .chain(self.unrouted.values())
    }

    pub fn len(&self) -> usize {
        self.routed.values().map(|m| m.len()).sum::<usize>()
            + self.unrouted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of groups cached against `route`.
    pub fn groups_for(&self, route: &RouteKey) -> usize {
        self.routed.get(route).map_or(0, |m| m.len())
    }

    pub fn dump(&self, now: u64) -> Vec<CacheEntryDump> {
        self.iter().map(|e| e.dump(now)).collect()
    }

    /// Recompute the outgoing vifs of one entry without touching the
    /// kernel. Returns the new set.
    pub fn determine_forwvifs<V: VifLayer>(
        &mut self,
        vifs: &V,
        routes: &RouteTable,
        key: &CacheKey,
        allow_scoped_transit: bool,
    ) -> Option<VifBitmap> {
        let route = routes.get(&key.route)?;
        let e = entry_mut(&mut self.routed, key)?;
        e.determine_forwvifs(vifs, route, allow_scoped_transit);
        Some(e.grpmems)
    }

    /// A kernel upcall: traffic from `origin` to `group` arrived with
    /// no forwarding entry.
    pub fn add_table_entry<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        if !group.is_multicast() {
            return Err(Error::NotMulticast(group));
        }
        let now = cx.timers.now();
        let lifetime = cx.cfg.cache_lifetime;

        let Some(route) = routes.lookup(origin) else {
            let e = self
                .unrouted
                .entry(group)
                .or_insert_with(|| GroupCacheEntry::new(group, None, lifetime));
            e.sources.insert(origin, SourceEntry::new(origin, now));
            debug!(self.log, "no route for source";
                "origin" => %origin, "group" => %group);
            kernel_install(&self.log, cx, origin, e);
            return Ok(());
        };

        // A source bound to the route-less list earlier now has a
        // route. The install below replaces its negative entry.
        if let Some(e) = self.unrouted.get_mut(&group) {
            e.sources.remove(&origin);
        }

        let key = CacheKey { route: route.key(), group };
        let e = self
            .routed
            .entry(key.route)
            .or_default()
            .entry(group)
            .or_insert_with(|| {
                let mut e = GroupCacheEntry::new(group, Some(route), lifetime);
                e.determine_forwvifs(
                    cx.vifs,
                    route,
                    cx.cfg.allow_scoped_transit,
                );
                e
            });

        let src = e
            .sources
            .entry(origin)
            .or_insert_with(|| SourceEntry::new(origin, now));
        src.ctime = Some(now);
        src.savpkt += src.pktcnt;
        src.pktcnt = 0;

        debug!(self.log, "add table entry";
            "origin" => %origin,
            "group" => %group,
            "route" => %key.route,
            "grpmems" => %e.grpmems,
        );
        kernel_install(&self.log, cx, origin, e);

        // A cache miss while our prune is outstanding means the
        // upstream router did not hear it: reissue.
        if e.grpmems.is_empty() {
            send_prune(&self.log, cx, key, e);
        }
        Ok(())
    }

    /// A route's children, subordinates or upstream changed.
    pub fn update_table_entry<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        key: RouteKey,
    ) {
        let Some(route) = routes.get(&key) else {
            return;
        };
        if !route.is_reachable() {
            return;
        }
        let Some(entries) = self.routed.get_mut(&key) else {
            return;
        };

        for (group, e) in entries.iter_mut() {
            let ckey = CacheKey { route: key, group: *group };
            let moved = e.parent != Some(route.parent())
                || e.gateway != route.gateway();

            if moved {
                debug!(self.log, "upstream changed";
                    "route" => %key,
                    "group" => %group,
                    "parent" => route.parent(),
                    "gateway" => ?route.gateway(),
                );
                cancel_prune(cx, e);
                cancel_graft(cx, e);
                e.parent = Some(route.parent());
                e.gateway = route.gateway();
            }

            // Prunes from vifs that are no longer ours mean nothing.
            let children = route.children();
            e.prunes.retain(|p| children.contains(p.vif));
            e.pruned = e.prunes.iter().map(|p| p.index).collect();

            let changed = e.determine_forwvifs(
                cx.vifs,
                route,
                cx.cfg.allow_scoped_transit,
            );
            if changed || moved {
                sync_kernel(&self.log, cx, e);
            }
            send_prune_or_graft(&self.log, cx, ckey, e);
        }
    }

    /// A route went away or became unreachable: release everything
    /// cached against it.
    pub fn flush<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        key: RouteKey,
    ) {
        let Some(entries) = self.routed.remove(&key) else {
            return;
        };
        for (_, mut e) in entries {
            debug!(self.log, "flush cache entry";
                "route" => %key, "group" => %e.group);
            release(&self.log, cx, &mut e);
        }
    }

    /// A route for `key` became reachable. Sources inside it that are
    /// cached against a less specific route, or against no route, are
    /// removed so the next upcall binds them to the new route.
    pub fn steal_sources<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        key: RouteKey,
    ) {
        let log = &self.log;
        let wider = self
            .routed
            .iter_mut()
            .filter(|(k, _)| **k != key && k.width() < key.width())
            .filter(|(k, _)| k.contains(key.origin))
            .flat_map(|(_, m)| m.values_mut());

        for e in wider.chain(self.unrouted.values_mut()) {
            let group = e.group;
            e.sources.retain(|origin, s| {
                if !key.contains(*origin) {
                    return true;
                }
                debug!(log, "source stolen";
                    "origin" => %origin, "group" => %group, "route" => %key);
                if s.is_installed() {
                    kernel_remove(log, cx, *origin, group);
                }
                false
            });
        }
    }

    /// Handle a prune from `src` on `vif`.
    pub fn accept_prune<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        src: Ipv4Addr,
        vif: VifIndex,
        msg: &PruneMsg,
    ) -> Result<(), Error> {
        let nbr = check_sender(cx.vifs, src, vif, msg.group)?;
        let route =
            routes.lookup(msg.origin).ok_or(Error::NoRoute(msg.origin))?;

        if !route.children().contains(vif) {
            return Err(Error::NonChild {
                what: "prune",
                src,
                vif,
                origin: msg.origin,
            });
        }
        if cx.vifs.scoped(vif, msg.group) {
            return Err(Error::Scoped {
                what: "prune",
                src,
                vif,
                group: msg.group,
            });
        }

        let key = CacheKey { route: route.key(), group: msg.group };
        let lifetime = cx.cfg.cache_lifetime;
        let e = self
            .routed
            .entry(key.route)
            .or_default()
            .entry(msg.group)
            .or_insert_with(|| {
                let mut e =
                    GroupCacheEntry::new(msg.group, Some(route), lifetime);
                e.determine_forwvifs(
                    cx.vifs,
                    route,
                    cx.cfg.allow_scoped_transit,
                );
                e
            });

        match e.prunes.iter_mut().find(|p| p.nbr == src && p.vif == vif) {
            Some(p) => p.timer = msg.lifetime,
            None => e.prunes.push(PruneRecord {
                nbr: src,
                vif,
                index: nbr,
                timer: msg.lifetime,
            }),
        }
        e.pruned.set(nbr);
        e.timer = e.timer.max(msg.lifetime);

        debug!(self.log, "prune received";
            "src" => %src,
            "vif" => vif,
            "origin" => %msg.origin,
            "group" => %msg.group,
            "lifetime" => msg.lifetime,
        );

        if e.determine_forwvifs(cx.vifs, route, cx.cfg.allow_scoped_transit) {
            sync_kernel(&self.log, cx, e);
        }
        if e.grpmems.is_empty() && !e.upstream.is_pending() {
            send_prune(&self.log, cx, key, e);
        }
        Ok(())
    }

    /// Handle a graft from `src` on `vif`. Every graft from a known
    /// neighbor is acknowledged, including ones we then leave
    /// unapplied.
    pub fn accept_graft<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        src: Ipv4Addr,
        vif: VifIndex,
        msg: &GraftMsg,
    ) -> Result<(), Error> {
        let nbr = check_sender(cx.vifs, src, vif, msg.group)?;
        cx.outbox.push(Outgoing::GraftAck { vif, dst: src, msg: *msg });

        let Some(route) = routes.lookup(msg.origin) else {
            debug!(self.log, "graft acked without a route";
                "src" => %src, "origin" => %msg.origin);
            return Ok(());
        };
        if !route.children().contains(vif) || cx.vifs.scoped(vif, msg.group)
        {
            debug!(self.log, "graft acked but not applied";
                "src" => %src,
                "vif" => vif,
                "origin" => %msg.origin,
                "group" => %msg.group,
            );
            return Ok(());
        }

        let key = CacheKey { route: route.key(), group: msg.group };
        let Some(e) = entry_mut(&mut self.routed, &key) else {
            return Ok(());
        };

        e.prunes.retain(|p| !(p.nbr == src && p.vif == vif));
        e.pruned.clear(nbr);

        debug!(self.log, "graft received";
            "src" => %src,
            "vif" => vif,
            "origin" => %msg.origin,
            "group" => %msg.group,
        );

        if e.determine_forwvifs(cx.vifs, route, cx.cfg.allow_scoped_transit) {
            sync_kernel(&self.log, cx, e);
        }
        if e.upstream.is_pending() && !e.grpmems.is_empty() {
            send_graft(&self.log, cx, key, e);
        }
        Ok(())
    }

    /// Handle a graft-ack. The ack is matched on (origin, group) alone.
    pub fn accept_g_ack<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        src: Ipv4Addr,
        vif: VifIndex,
        msg: &GraftMsg,
    ) -> Result<(), Error> {
        check_sender(cx.vifs, src, vif, msg.group)?;
        let route =
            routes.lookup(msg.origin).ok_or(Error::NoRoute(msg.origin))?;
        let key = CacheKey { route: route.key(), group: msg.group };
        let e = entry_mut(&mut self.routed, &key).ok_or(Error::NoCacheEntry {
            origin: msg.origin,
            group: msg.group,
        })?;

        debug!(self.log, "graft acked";
            "src" => %src, "origin" => %msg.origin, "group" => %msg.group);
        cancel_graft(cx, e);
        Ok(())
    }

    /// Forget the prunes a departed neighbor sent us.
    pub fn neighbor_removed(
        &mut self,
        vif: VifIndex,
        addr: Ipv4Addr,
        nbr: NbrIndex,
    ) {
        for e in self.routed.values_mut().flat_map(|m| m.values_mut()) {
            let before = e.prunes.len();
            e.prunes.retain(|p| !(p.nbr == addr && p.vif == vif));
            if e.prunes.len() != before {
                e.pruned.clear(nbr);
            }
        }
    }

    /// A local receiver joined `group` on `vif`.
    pub fn update_lclgrp<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        vif: VifIndex,
        group: Ipv4Addr,
    ) {
        debug!(self.log, "local member joined";
            "vif" => vif, "group" => %group);
        self.lclgrp_changed(cx, routes, group);
    }

    /// The last local receiver for `group` on `vif` left.
    pub fn delete_lclgrp<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        vif: VifIndex,
        group: Ipv4Addr,
    ) {
        debug!(self.log, "local member left";
            "vif" => vif, "group" => %group);
        self.lclgrp_changed(cx, routes, group);
    }

    fn lclgrp_changed<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
        group: Ipv4Addr,
    ) {
        let log = &self.log;
        for (rkey, entries) in self.routed.iter_mut() {
            let Some(e) = entries.get_mut(&group) else {
                continue;
            };
            let Some(route) = routes.get(rkey).filter(|r| r.is_reachable())
            else {
                continue;
            };

            let allow = cx.cfg.allow_scoped_transit;
            if e.determine_forwvifs(cx.vifs, route, allow) {
                sync_kernel(log, cx, e);
                let key = CacheKey { route: *rkey, group };
                send_prune_or_graft(log, cx, key, e);
            }
        }
    }

    /// Age every cache entry by one tick.
    pub fn age_table_entry<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        routes: &RouteTable,
    ) {
        let log = &self.log;
        let mut dead = Vec::new();

        for (rkey, entries) in self.routed.iter_mut() {
            let Some(route) = routes.get(rkey) else {
                continue;
            };
            for (group, e) in entries.iter_mut() {
                let key = CacheKey { route: *rkey, group: *group };
                if age_entry(log, cx, route, key, e) {
                    dead.push(key);
                }
            }
        }

        for key in dead {
            if let Some(entries) = self.routed.get_mut(&key.route) {
                if let Some(mut e) = entries.remove(&key.group) {
                    debug!(log, "cache entry deleted";
                        "route" => %key.route, "group" => %key.group);
                    release(log, cx, &mut e);
                }
                if entries.is_empty() {
                    self.routed.remove(&key.route);
                }
            }
        }

        self.unrouted.retain(|group, e| {
            e.age += TIMER_INTERVAL;
            e.timer = e.timer.saturating_sub(TIMER_INTERVAL);
            if e.timer > 0 && !e.sources.is_empty() {
                return true;
            }
            debug!(log, "route-less entry expired"; "group" => %group);
            release(log, cx, e);
            false
        });
    }

    /// Fire a prune retransmission.
    ///
    /// The retransmission does not resend the prune itself. It removes
    /// every installed source of the group from the kernel so the next
    /// packet causes an upcall, and the upcall reissues the prune.
    pub fn prune_rexmit<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        key: CacheKey,
    ) -> TimerAction {
        let log = &self.log;
        let Some(e) = entry_mut(&mut self.routed, &key) else {
            return TimerAction::Done;
        };
        e.rexmit_timer = None;

        let UpstreamPrune::Pending { remaining } = e.upstream else {
            return TimerAction::Done;
        };
        if !e.grpmems.is_empty() || remaining <= MIN_PRUNE_LIFE {
            return TimerAction::Done;
        }

        trace!(log, "prune retransmit";
            "route" => %key.route,
            "group" => %key.group,
            "interval" => e.prune_rexmit,
        );
        evict_sources(log, cx, e);
        e.prune_rexmit = e.prune_rexmit.saturating_mul(2);
        TimerAction::Done
    }

    /// Fire a graft retransmission. Grafts are resent with a doubling
    /// interval until acked.
    pub fn graft_rexmit<V: VifLayer, K: KernelCache>(
        &mut self,
        cx: &mut Cx<'_, V, K>,
        key: CacheKey,
    ) -> TimerAction {
        let Some(e) = entry_mut(&mut self.routed, &key) else {
            return TimerAction::Done;
        };
        e.graft_timer = None;
        if e.graft_sent == 0 {
            return TimerAction::Done;
        }
        let (Some(parent), Some(gw)) = (e.parent, e.gateway) else {
            return TimerAction::Done;
        };

        e.graft_sent += 1;
        e.graft_backoff = e.graft_backoff.saturating_mul(2);
        trace!(self.log, "graft retransmit";
            "route" => %key.route,
            "group" => %key.group,
            "count" => e.graft_sent,
        );
        cx.outbox.push(Outgoing::Graft {
            vif: parent,
            dst: gw,
            msg: GraftMsg { origin: key.route.origin, group: key.group },
        });
        TimerAction::Rearm { delay: e.graft_backoff }
    }

    /// Record the handle of a timer the router re-armed on our behalf.
    pub fn rearmed(&mut self, event: &TimerEvent, handle: TimerHandle) {
        match event {
            TimerEvent::PruneRetransmit(key) => {
                if let Some(e) = entry_mut(&mut self.routed, key) {
                    e.rexmit_timer = Some(handle);
                }
            }
            TimerEvent::GraftRetransmit(key) => {
                if let Some(e) = entry_mut(&mut self.routed, key) {
                    e.graft_timer = Some(handle);
                }
            }
            TimerEvent::AgeTick | TimerEvent::RouteReport => {}
        }
    }
}

fn entry_mut<'a>(
    routed: &'a mut BTreeMap<RouteKey, BTreeMap<Ipv4Addr, GroupCacheEntry>>,
    key: &CacheKey,
) -> Option<&'a mut GroupCacheEntry> {
    routed.get_mut(&key.route)?.get_mut(&key.group)
}

/// Validate the sender and group of a prune, graft or graft-ack.
fn check_sender<V: VifLayer>(
    vifs: &V,
    src: Ipv4Addr,
    vif: VifIndex,
    group: Ipv4Addr,
) -> Result<NbrIndex, Error> {
    if vif >= vifs.num_vifs() {
        return Err(Error::UnknownVif(vif));
    }
    let nbr = vifs
        .neighbor_index(vif, src)
        .ok_or(Error::UnknownNeighbor { src, vif })?;
    if !group.is_multicast() {
        return Err(Error::NotMulticast(group));
    }
    Ok(nbr)
}

/// Age one routed entry. Returns true if the entry should be deleted.
fn age_entry<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    route: &RouteEntry,
    key: CacheKey,
    e: &mut GroupCacheEntry,
) -> bool {
    e.age += TIMER_INTERVAL;

    // Our prune ran out on the previous tick. Upstream is flooding to
    // us again, so let the kernel re-request the sources.
    if e.upstream == UpstreamPrune::Expired {
        evict_sources(log, cx, e);
        e.upstream = UpstreamPrune::NotPruned;
    }

    if let UpstreamPrune::Pending { remaining } = e.upstream {
        let remaining = remaining.saturating_sub(TIMER_INTERVAL);
        if remaining == 0 {
            debug!(log, "upstream prune expired";
                "route" => %key.route, "group" => %key.group);
            cancel_prune(cx, e);
            e.upstream = UpstreamPrune::Expired;
        } else {
            e.upstream = UpstreamPrune::Pending { remaining };
        }
    }

    let before = e.prunes.len();
    for p in e.prunes.iter_mut() {
        p.timer = p.timer.saturating_sub(TIMER_INTERVAL);
    }
    e.prunes.retain(|p| p.timer > 0);
    if e.prunes.len() != before {
        e.pruned = e.prunes.iter().map(|p| p.index).collect();
        debug!(log, "downstream prunes expired";
            "route" => %key.route,
            "group" => %key.group,
            "count" => before - e.prunes.len(),
        );
        if e.determine_forwvifs(cx.vifs, route, cx.cfg.allow_scoped_transit) {
            sync_kernel(log, cx, e);
        }
        // A downstream prune should never outlive ours.
        if e.upstream.is_pending() && !e.grpmems.is_empty() {
            send_graft(log, cx, key, e);
        }
    }

    e.timer = e.timer.saturating_sub(TIMER_INTERVAL);
    if e.timer > 0 {
        return false;
    }

    let group = e.group;
    e.sources.retain(|origin, s| {
        if !s.is_installed() {
            return false;
        }
        match cx.kernel.counters(*origin, group) {
            Ok(c) if c.pkts != s.pktcnt => {
                s.pktcnt = c.pkts;
                true
            }
            Ok(_) => {
                debug!(log, "silent source";
                    "origin" => %origin, "group" => %group);
                kernel_remove(log, cx, *origin, group);
                false
            }
            Err(err) => {
                debug!(log, "source gone from kernel";
                    "origin" => %origin,
                    "group" => %group,
                    "err" => %err,
                );
                false
            }
        }
    });

    if e.sources.is_empty()
        && e.prunes.is_empty()
        && !e.upstream.is_pending()
        && e.graft_sent == 0
    {
        return true;
    }

    let base = cx.cfg.cache_lifetime;
    e.timer = base + cx.rng.random_range(0..(base / 2).max(1));
    false
}

fn send_prune_or_graft<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    key: CacheKey,
    e: &mut GroupCacheEntry,
) {
    if e.grpmems.is_empty() {
        if !e.upstream.is_pending() {
            send_prune(log, cx, key, e);
        }
    } else if e.upstream.is_pending() {
        send_graft(log, cx, key, e);
    }
}

/// Send (or resend) a prune upstream.
fn send_prune<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    key: CacheKey,
    e: &mut GroupCacheEntry,
) {
    if !cx.cfg.pruning {
        return;
    }
    let (Some(parent), Some(gw)) = (e.parent, e.gateway) else {
        return;
    };
    if !cx.vifs.is_pruning_neighbor(parent, gw) {
        trace!(log, "upstream does not prune";
            "route" => %key.route, "gateway" => %gw);
        return;
    }

    let lifetime = match e.upstream {
        UpstreamPrune::Pending { remaining } => remaining,
        _ => {
            let base =
                cx.vifs.prune_lifetime(parent).unwrap_or(cx.cfg.prune_lifetime);
            let jittered = base / 2 + cx.rng.random_range(0..base.max(1));
            e.prunes.iter().map(|p| p.timer).fold(jittered, u32::min)
        }
    };
    if lifetime < MIN_PRUNE_LIFE {
        debug!(log, "prune lifetime too short";
            "route" => %key.route,
            "group" => %key.group,
            "lifetime" => lifetime,
        );
        return;
    }

    e.upstream = UpstreamPrune::Pending { remaining: lifetime };
    debug!(log, "send prune";
        "route" => %key.route,
        "group" => %key.group,
        "gateway" => %gw,
        "lifetime" => lifetime,
    );
    cx.outbox.push(Outgoing::Prune {
        vif: parent,
        dst: gw,
        msg: PruneMsg { origin: key.route.origin, group: key.group, lifetime },
    });

    let flags = cx.vifs.flags(parent);
    if flags.contains(VifFlags::REXMIT_PRUNES)
        && !flags.contains(VifFlags::TUNNEL)
        && e.rexmit_timer.is_none()
    {
        if e.prune_rexmit == 0 {
            e.prune_rexmit = PRUNE_REXMIT_VAL;
        }
        let ev = TimerEvent::PruneRetransmit(key);
        e.rexmit_timer = Some(cx.timers.schedule(e.prune_rexmit, ev));
    }
}

/// Cancel our upstream prune with a graft, retransmitted until acked.
fn send_graft<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    key: CacheKey,
    e: &mut GroupCacheEntry,
) {
    cancel_prune(cx, e);
    let (Some(parent), Some(gw)) = (e.parent, e.gateway) else {
        return;
    };

    if e.graft_sent == 0 {
        e.graft_sent = 1;
        e.graft_backoff = GRAFT_TIMEOUT_VAL;
    }
    debug!(log, "send graft";
        "route" => %key.route, "group" => %key.group, "gateway" => %gw);
    cx.outbox.push(Outgoing::Graft {
        vif: parent,
        dst: gw,
        msg: GraftMsg { origin: key.route.origin, group: key.group },
    });

    if e.graft_timer.is_none() {
        e.graft_timer = Some(
            cx.timers
                .schedule(e.graft_backoff, TimerEvent::GraftRetransmit(key)),
        );
    }
}

fn cancel_prune<V: VifLayer, K: KernelCache>(
    cx: &mut Cx<'_, V, K>,
    e: &mut GroupCacheEntry,
) {
    if let Some(h) = e.rexmit_timer.take() {
        cx.timers.cancel(h);
    }
    e.upstream = UpstreamPrune::NotPruned;
    e.prune_rexmit = 0;
}

fn cancel_graft<V: VifLayer, K: KernelCache>(
    cx: &mut Cx<'_, V, K>,
    e: &mut GroupCacheEntry,
) {
    if let Some(h) = e.graft_timer.take() {
        cx.timers.cancel(h);
    }
    e.graft_sent = 0;
    e.graft_backoff = 0;
}

/// Push the entry's current parent and TTLs to the kernel for every
/// installed source.
fn sync_kernel<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    e: &GroupCacheEntry,
) {
    for s in e.sources.values().filter(|s| s.is_installed()) {
        kernel_install(log, cx, s.origin, e);
    }
}

fn kernel_install<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    origin: Ipv4Addr,
    e: &GroupCacheEntry,
) {
    if let Err(err) = cx.kernel.install(origin, e.group, e.parent, &e.ttls) {
        error!(log, "kernel install failed";
            "origin" => %origin, "group" => %e.group, "err" => %err);
    }
}

fn kernel_remove<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    origin: Ipv4Addr,
    group: Ipv4Addr,
) -> Option<u64> {
    match cx.kernel.remove(origin, group) {
        Ok(pkts) => Some(pkts),
        Err(err) => {
            error!(log, "kernel remove failed";
                "origin" => %origin, "group" => %group, "err" => %err);
            None
        }
    }
}

/// Remove every installed source from the kernel but keep the
/// sources for their statistics.
fn evict_sources<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    e: &mut GroupCacheEntry,
) {
    let group = e.group;
    for s in e.sources.values_mut().filter(|s| s.is_installed()) {
        let pkts = kernel_remove(log, cx, s.origin, group).unwrap_or(s.pktcnt);
        s.savpkt += pkts;
        s.pktcnt = 0;
        s.ctime = None;
    }
}

/// Tear an entry down: its installed sources leave the kernel and its
/// timers are cancelled.
fn release<V: VifLayer, K: KernelCache>(
    log: &Logger,
    cx: &mut Cx<'_, V, K>,
    e: &mut GroupCacheEntry,
) {
    evict_sources(log, cx, e);
    if let Some(h) = e.rexmit_timer.take() {
        cx.timers.cancel(h);
    }
    if let Some(h) = e.graft_timer.take() {
        cx.timers.cancel(h);
    }
}
