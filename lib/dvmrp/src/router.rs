// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The routing engine as a whole.
//!
//! A [`Router`] owns the route table, the forwarding cache, the timer
//! queue and its collaborators. The protocol I/O layer feeds it
//! received messages, kernel upcalls and the passage of time, and
//! drains the messages it wants sent with [`Router::take_outgoing`].
//! Nothing here blocks; the caller may sleep for at most
//! [`Router::time_until_next`] seconds between calls to
//! [`Router::advance`].

use crate::Error;
use crate::ErrorKind;
use crate::callout::TimerQueue;
use crate::config::EngineConfig;
use crate::kern::KernelCache;
use crate::prune::CacheKey;
use crate::prune::ForwardingCache;
use crate::route::ReportKind;
use crate::route::RouteEvent;
use crate::route::RouteReport;
use crate::route::RouteTable;
use crate::vif::VifLayer;
use dvmrp_api::DumpCacheResp;
use dvmrp_api::DumpRoutesResp;
use dvmrp_api::NbrIndex;
use dvmrp_api::ROUTE_REPORT_INTERVAL;
use dvmrp_api::RouteKey;
use dvmrp_api::TIMER_INTERVAL;
use dvmrp_api::VifBitmap;
use dvmrp_api::VifIndex;
use dvmrp_api::wire::GraftMsg;
use dvmrp_api::wire::PruneMsg;
use dvmrp_api::wire::ReportedRoute;
use dvmrp_api::wire::WireError;
use dvmrp_api::wire::decode_report;
use dvmrp_api::wire::encode_report;
use rand::SeedableRng;
use rand::rngs::StdRng;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::trace;
use slog::warn;
use std::net::Ipv4Addr;

/// The work a timer stands for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerEvent {
    /// Age routes and cache entries.
    AgeTick,
    /// Send a full route report on every vif.
    RouteReport,
    PruneRetransmit(CacheKey),
    GraftRetransmit(CacheKey),
}

/// What a fired timer wants done with itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerAction {
    Done,
    /// Schedule the same event again `delay` seconds from now.
    Rearm { delay: u32 },
}

/// A protocol message the engine wants sent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outgoing {
    /// A route report. `dst` of `None` means the vif's all-routers
    /// group (or the far end of a tunnel).
    Report {
        vif: VifIndex,
        dst: Option<Ipv4Addr>,
        routes: Vec<ReportedRoute>,
    },
    Prune { vif: VifIndex, dst: Ipv4Addr, msg: PruneMsg },
    Graft { vif: VifIndex, dst: Ipv4Addr, msg: GraftMsg },
    GraftAck { vif: VifIndex, dst: Ipv4Addr, msg: GraftMsg },
}

impl Outgoing {
    pub fn vif(&self) -> VifIndex {
        match self {
            Self::Report { vif, .. }
            | Self::Prune { vif, .. }
            | Self::Graft { vif, .. }
            | Self::GraftAck { vif, .. } => *vif,
        }
    }

    /// The payload of the message, without IGMP framing.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Report { routes, .. } => encode_report(routes),
            Self::Prune { msg, .. } => Ok(msg.encode()),
            Self::Graft { msg, .. } | Self::GraftAck { msg, .. } => {
                Ok(msg.encode())
            }
        }
    }
}

/// Everything a forwarding cache operation may touch besides the cache
/// itself and the route table.
pub struct Cx<'a, V, K> {
    pub(crate) cfg: &'a EngineConfig,
    pub(crate) vifs: &'a V,
    pub(crate) kernel: &'a mut K,
    pub(crate) timers: &'a mut TimerQueue<TimerEvent>,
    pub(crate) outbox: &'a mut Vec<Outgoing>,
    pub(crate) rng: &'a mut StdRng,
}

pub struct Router<V, K> {
    cfg: EngineConfig,
    log: Logger,
    timer_log: Logger,
    vifs: V,
    kernel: K,
    routes: RouteTable,
    cache: ForwardingCache,
    timers: TimerQueue<TimerEvent>,
    rng: StdRng,
    outbox: Vec<Outgoing>,
}

impl<V: VifLayer, K: KernelCache> Router<V, K> {
    /// Build a router and bring up every usable vif.
    pub fn new(cfg: EngineConfig, vifs: V, kernel: K, log: &Logger) -> Self {
        let rng = match cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut timers = TimerQueue::new();
        timers.schedule(TIMER_INTERVAL, TimerEvent::AgeTick);
        timers.schedule(ROUTE_REPORT_INTERVAL, TimerEvent::RouteReport);

        let mut router = Self {
            cfg,
            log: log.clone(),
            timer_log: log.new(o!("component" => "callout")),
            vifs,
            kernel,
            routes: RouteTable::new(log),
            cache: ForwardingCache::new(log),
            timers,
            rng,
            outbox: Vec::new(),
        };

        for vif in 0..router.vifs.num_vifs() {
            if !router.vifs.flags(vif).is_usable() {
                continue;
            }
            if let Err(e) = router.add_vif(vif) {
                warn!(router.log, "vif not brought up";
                    "vif" => vif, "err" => %e);
            }
        }
        router
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn vifs(&self) -> &V {
        &self.vifs
    }

    /// Mutable access to the vif layer. Topology changes made here
    /// must be announced with [`Router::add_vif`],
    /// [`Router::neighbor_added`] and friends.
    pub fn vifs_mut(&mut self) -> &mut V {
        &mut self.vifs
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn cache(&self) -> &ForwardingCache {
        &self.cache
    }

    /// Seconds since the router was created.
    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    /// How long the caller may wait before calling
    /// [`Router::advance`].
    pub fn time_until_next(&self) -> Option<u32> {
        self.timers.time_until_next()
    }

    /// Drain the messages queued for sending.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    fn parts(&mut self) -> (Cx<'_, V, K>, &RouteTable, &mut ForwardingCache) {
        let cx = Cx {
            cfg: &self.cfg,
            vifs: &self.vifs,
            kernel: &mut self.kernel,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
            rng: &mut self.rng,
        };
        (cx, &self.routes, &mut self.cache)
    }

    fn apply(&mut self, events: Vec<RouteEvent>) {
        let (mut cx, routes, cache) = self.parts();
        for ev in events {
            match ev {
                RouteEvent::Resync(key) => {
                    cache.update_table_entry(&mut cx, routes, key)
                }
                RouteEvent::Flush(key) => cache.flush(&mut cx, key),
                RouteEvent::Steal(key) => cache.steal_sources(&mut cx, key),
            }
        }
    }

    fn reject(&self, what: &str, err: Error) -> Error {
        match err.kind() {
            ErrorKind::Malformed => {
                info!(self.log, "dropping malformed {}", what; "err" => %err)
            }
            ErrorKind::Inconsistent => {
                warn!(self.log, "ignoring {}", what; "err" => %err)
            }
        }
        err
    }

    /// Process one route from a report received from `src` on `vif`,
    /// or with `src` of `None`, a directly connected subnet.
    pub fn update_route(
        &mut self,
        origin: Ipv4Addr,
        mask: Ipv4Addr,
        metric: u8,
        src: Option<Ipv4Addr>,
        vif: VifIndex,
    ) -> Result<(), Error> {
        let nbr = src.and_then(|s| self.vifs.neighbor_index(vif, s));
        let rr = RouteReport { origin, mask, metric, src, vif, nbr };
        let mut events = Vec::new();
        if let Err(e) = self.routes.update_route(&self.vifs, &rr, &mut events)
        {
            return Err(self.reject("route", e));
        }
        self.apply(events);
        Ok(())
    }

    /// Process a route report payload from `src` on `vif`.
    ///
    /// The report is checked in full first; a single bad line rejects
    /// the whole report.
    pub fn accept_report(
        &mut self,
        src: Ipv4Addr,
        vif: VifIndex,
        payload: &[u8],
    ) -> Result<(), Error> {
        let lines = match self.decode_report(src, vif, payload) {
            Ok(lines) => lines,
            Err(e) => return Err(self.reject("report", e)),
        };

        debug!(self.log, "report received";
            "src" => %src, "vif" => vif, "routes" => lines.len());

        let mut events = Vec::new();
        for rr in &lines {
            if let Err(e) =
                self.routes.update_route(&self.vifs, rr, &mut events)
            {
                // Lines were validated above, so this is a topology
                // change racing the report.
                warn!(self.log, "report line rejected"; "err" => %e);
            }
        }
        self.apply(events);
        Ok(())
    }

    fn decode_report(
        &self,
        src: Ipv4Addr,
        vif: VifIndex,
        payload: &[u8],
    ) -> Result<Vec<RouteReport>, Error> {
        if vif >= self.vifs.num_vifs() {
            return Err(Error::UnknownVif(vif));
        }
        let nbr = self
            .vifs
            .neighbor_index(vif, src)
            .ok_or(Error::UnknownNeighbor { src, vif })?;

        let mut lines = Vec::new();
        for r in decode_report(payload)? {
            let rr = RouteReport {
                origin: r.origin,
                mask: r.mask,
                metric: r.metric,
                src: Some(src),
                vif,
                nbr: Some(nbr),
            };
            RouteTable::validate(&rr)?;
            lines.push(rr);
        }
        Ok(lines)
    }

    pub fn accept_prune(
        &mut self,
        src: Ipv4Addr,
        vif: VifIndex,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        lifetime: u32,
    ) -> Result<(), Error> {
        let msg = PruneMsg { origin, group, lifetime };
        let (mut cx, routes, cache) = self.parts();
        let res = cache.accept_prune(&mut cx, routes, src, vif, &msg);
        res.map_err(|e| self.reject("prune", e))
    }

    pub fn accept_prune_msg(
        &mut self,
        src: Ipv4Addr,
        vif: VifIndex,
        payload: &[u8],
    ) -> Result<(), Error> {
        let msg = PruneMsg::decode(payload)
            .map_err(|e| self.reject("prune", e.into()))?;
        self.accept_prune(src, vif, msg.origin, msg.group, msg.lifetime)
    }

    pub fn accept_graft(
        &mut self,
        src: Ipv4Addr,
        vif: VifIndex,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        let msg = GraftMsg { origin, group };
        let (mut cx, routes, cache) = self.parts();
        let res = cache.accept_graft(&mut cx, routes, src, vif, &msg);
        res.map_err(|e| self.reject("graft", e))
    }

    pub fn accept_graft_msg(
        &mut self,
        src: Ipv4Addr,
        vif: VifIndex,
        payload: &[u8],
    ) -> Result<(), Error> {
        let msg = GraftMsg::decode(payload)
            .map_err(|e| self.reject("graft", e.into()))?;
        self.accept_graft(src, vif, msg.origin, msg.group)
    }

    pub fn accept_g_ack(
        &mut self,
        src: Ipv4Addr,
        vif: VifIndex,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        let msg = GraftMsg { origin, group };
        let (mut cx, routes, cache) = self.parts();
        let res = cache.accept_g_ack(&mut cx, routes, src, vif, &msg);
        res.map_err(|e| self.reject("graft-ack", e))
    }

    pub fn accept_g_ack_msg(
        &mut self,
        src: Ipv4Addr,
        vif: VifIndex,
        payload: &[u8],
    ) -> Result<(), Error> {
        let msg = GraftMsg::decode(payload)
            .map_err(|e| self.reject("graft-ack", e.into()))?;
        self.accept_g_ack(src, vif, msg.origin, msg.group)
    }

    /// A kernel upcall for traffic with no forwarding entry.
    pub fn add_table_entry(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        let (mut cx, routes, cache) = self.parts();
        let res = cache.add_table_entry(&mut cx, routes, origin, group);
        res.map_err(|e| self.reject("upcall", e))
    }

    pub fn age_routes(&mut self) {
        let mut events = Vec::new();
        self.routes.age_routes(&mut events);
        self.apply(events);
    }

    pub fn age_table_entry(&mut self) {
        let (mut cx, routes, cache) = self.parts();
        cache.age_table_entry(&mut cx, routes);
    }

    /// Recompute the outgoing vifs of a cache entry without touching
    /// the kernel.
    pub fn determine_forwvifs(
        &mut self,
        route: RouteKey,
        group: Ipv4Addr,
    ) -> Option<VifBitmap> {
        let key = CacheKey { route, group };
        let allow = self.cfg.allow_scoped_transit;
        self.cache.determine_forwvifs(&self.vifs, &self.routes, &key, allow)
    }

    /// Seconds until the next graft retransmission for a cache entry.
    pub fn graft_time_left(
        &self,
        route: RouteKey,
        group: Ipv4Addr,
    ) -> Option<u32> {
        let e = self.cache.get(&CacheKey { route, group })?;
        self.timers.time_left(e.graft_timer()?)
    }

    /// A vif came up.
    pub fn add_vif(&mut self, vif: VifIndex) -> Result<(), Error> {
        let mut events = Vec::new();
        let res = self.routes.add_vif(&self.vifs, vif, &mut events);
        self.apply(events);
        res.map_err(|e| self.reject("vif", e))
    }

    /// A vif went down.
    pub fn delete_vif(&mut self, vif: VifIndex) -> Result<(), Error> {
        let mut events = Vec::new();
        let res = self.routes.delete_vif(&self.vifs, vif, &mut events);
        self.apply(events);
        res.map_err(|e| self.reject("vif", e))
    }

    /// A local receiver joined `group` on `vif`. The vif layer must
    /// already report the membership.
    pub fn update_lclgrp(
        &mut self,
        vif: VifIndex,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        if let Err(e) = self.check_lclgrp(vif, group) {
            return Err(self.reject("membership", e));
        }
        let (mut cx, routes, cache) = self.parts();
        cache.update_lclgrp(&mut cx, routes, vif, group);
        Ok(())
    }

    /// The last local receiver for `group` on `vif` left. The vif
    /// layer must already have dropped the membership.
    pub fn delete_lclgrp(
        &mut self,
        vif: VifIndex,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        if let Err(e) = self.check_lclgrp(vif, group) {
            return Err(self.reject("membership", e));
        }
        let (mut cx, routes, cache) = self.parts();
        cache.delete_lclgrp(&mut cx, routes, vif, group);
        Ok(())
    }

    fn check_lclgrp(
        &self,
        vif: VifIndex,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        if vif >= self.vifs.num_vifs() {
            return Err(Error::UnknownVif(vif));
        }
        if !group.is_multicast() {
            return Err(Error::NotMulticast(group));
        }
        Ok(())
    }

    /// A neighbor was discovered on `vif`. It gets a full report of
    /// our routes right away.
    pub fn neighbor_added(
        &mut self,
        vif: VifIndex,
        addr: Ipv4Addr,
        nbr: NbrIndex,
    ) {
        debug!(self.log, "neighbor added";
            "vif" => vif, "addr" => %addr, "index" => nbr);
        let mut events = Vec::new();
        self.routes.add_neighbor(vif, nbr, &mut events);
        self.apply(events);

        let routes = self.routes.report(vif, ReportKind::All);
        if !routes.is_empty() {
            self.outbox.push(Outgoing::Report { vif, dst: Some(addr), routes });
        }
    }

    /// A neighbor on `vif` timed out or went away.
    pub fn neighbor_removed(
        &mut self,
        vif: VifIndex,
        addr: Ipv4Addr,
        nbr: NbrIndex,
    ) {
        debug!(self.log, "neighbor removed";
            "vif" => vif, "addr" => %addr, "index" => nbr);
        self.cache.neighbor_removed(vif, addr, nbr);
        let mut events = Vec::new();
        self.routes
            .delete_neighbor(&self.vifs, vif, addr, nbr, &mut events);
        self.apply(events);
    }

    /// Queue a report on every vif with neighbors.
    pub fn report_to_all_neighbors(&mut self, kind: ReportKind) {
        for vif in 0..self.vifs.num_vifs() {
            if !self.vifs.flags(vif).is_usable()
                || self.vifs.neighbors(vif).is_empty()
            {
                continue;
            }
            let routes = self.routes.report(vif, kind);
            if !routes.is_empty() {
                self.outbox.push(Outgoing::Report { vif, dst: None, routes });
            }
        }
        self.routes.clear_changed();
    }

    /// Move time forward by `elapsed` seconds, firing every timer that
    /// comes due.
    pub fn advance(&mut self, elapsed: u32) {
        let until = self.timers.now() + u64::from(elapsed);
        while let Some(ev) = self.timers.pop_due(until) {
            trace!(self.timer_log, "timer fired";
                "event" => ?ev, "now" => self.timers.now());
            if let TimerAction::Rearm { delay } = self.fire(ev) {
                let handle = self.timers.schedule(delay, ev);
                self.cache.rearmed(&ev, handle);
            }
        }
        self.timers.settle(until);
    }

    fn fire(&mut self, ev: TimerEvent) -> TimerAction {
        match ev {
            TimerEvent::AgeTick => {
                self.age_routes();
                self.age_table_entry();
                if self.routes.changed() {
                    self.report_to_all_neighbors(ReportKind::Changed);
                }
                TimerAction::Rearm { delay: TIMER_INTERVAL }
            }

            TimerEvent::RouteReport => {
                self.report_to_all_neighbors(ReportKind::All);
                TimerAction::Rearm { delay: ROUTE_REPORT_INTERVAL }
            }

            TimerEvent::PruneRetransmit(key) => {
                let (mut cx, _, cache) = self.parts();
                cache.prune_rexmit(&mut cx, key)
            }

            TimerEvent::GraftRetransmit(key) => {
                let (mut cx, _, cache) = self.parts();
                cache.graft_rexmit(&mut cx, key)
            }
        }
    }

    pub fn dump_routes(&self) -> DumpRoutesResp {
        DumpRoutesResp {
            routes: self
                .routes
                .iter()
                .map(|r| r.dump(self.cache.groups_for(&r.key())))
                .collect(),
        }
    }

    pub fn dump_cache(&self) -> DumpCacheResp {
        DumpCacheResp { entries: self.cache.dump(self.timers.now()) }
    }
}
