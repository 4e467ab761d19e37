// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub use dvmrp::Error;
pub use dvmrp::ErrorKind;
pub use dvmrp::Outgoing;
pub use dvmrp::Router;
pub use dvmrp::api::NbrIndex;
pub use dvmrp::api::RouteFlags;
pub use dvmrp::api::RouteKey;
pub use dvmrp::api::TIMER_INTERVAL;
pub use dvmrp::api::UNREACHABLE;
pub use dvmrp::api::UpstreamPrune;
pub use dvmrp::api::VifBitmap;
pub use dvmrp::api::VifIndex;
pub use dvmrp::api::wire::GraftMsg;
pub use dvmrp::api::wire::PruneMsg;
pub use dvmrp::api::wire::ReportedRoute;
pub use dvmrp::config::Config;
pub use dvmrp::kern::SimKernel;
pub use dvmrp::prune::CacheKey;
pub use dvmrp::route::ReportKind;
pub use dvmrp::vif::VifLayer;
pub use dvmrp::vif::VifTable;
pub use slog::Logger;
pub use std::net::Ipv4Addr;

pub type TestRouter = Router<VifTable, SimKernel>;

pub const M24: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Upstream router on vif 0.
pub const R1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
/// Downstream router on vif 1.
pub const N1: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);
/// Downstream router on vif 2.
pub const N2: Ipv4Addr = Ipv4Addr::new(10, 2, 0, 2);

/// A remote origin subnet reached through `R1`.
pub const SRC_NET: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 0);
pub const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const GROUP: Ipv4Addr = Ipv4Addr::new(224, 1, 1, 1);

pub fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

pub fn src_route() -> RouteKey {
    RouteKey::new(SRC_NET, M24)
}

pub fn src_key() -> CacheKey {
    CacheKey { route: src_route(), group: GROUP }
}

/// Three LAN vifs, 10.{0,1,2}.0.0/24, with us at .1 on each.
pub const THREE_LAN: &str = r#"
[engine]
rng_seed = 7

[[vif]]
name = "up0"
local_addr = "10.0.0.1"
subnet = "10.0.0.0/24"

[[vif]]
name = "lan1"
local_addr = "10.1.0.1"
subnet = "10.1.0.0/24"

[[vif]]
name = "lan2"
local_addr = "10.2.0.1"
subnet = "10.2.0.0/24"
boundaries = ["239.192.0.0/16"]
"#;

pub fn router_from(toml: &str) -> TestRouter {
    let cfg = Config::from_toml(toml).unwrap();
    let vifs = VifTable::new(&cfg.vifs);
    Router::new(cfg.engine, vifs, SimKernel::new(), &test_logger())
}

/// Register a pruning neighbor with both the vif layer and the router.
pub fn add_nbr(r: &mut TestRouter, vif: VifIndex, nbr: Ipv4Addr) -> NbrIndex {
    let idx = r.vifs_mut().add_neighbor(vif, nbr, true).unwrap();
    r.neighbor_added(vif, nbr, idx);
    idx
}

pub fn remove_nbr(r: &mut TestRouter, vif: VifIndex, nbr: Ipv4Addr) {
    let idx = r.vifs_mut().remove_neighbor(vif, nbr).unwrap();
    r.neighbor_removed(vif, nbr, idx);
}

/// A local receiver joins `group` on `vif`.
pub fn join(r: &mut TestRouter, vif: VifIndex, group: Ipv4Addr) {
    r.vifs_mut().join(vif, group).unwrap();
    r.update_lclgrp(vif, group).unwrap();
}

pub fn leave(r: &mut TestRouter, vif: VifIndex, group: Ipv4Addr) {
    r.vifs_mut().leave(vif, group).unwrap();
    r.delete_lclgrp(vif, group).unwrap();
}

/// The standard topology: `R1` upstream on vif 0, `N1` and `N2`
/// downstream on vifs 1 and 2, and a route to `SRC_NET` via `R1` at
/// metric 1. The outbox is drained.
pub fn three_lan() -> TestRouter {
    let mut r = router_from(THREE_LAN);
    add_nbr(&mut r, 0, R1);
    add_nbr(&mut r, 1, N1);
    add_nbr(&mut r, 2, N2);
    refresh_src_route(&mut r);
    r.take_outgoing();
    r
}

/// Have `R1` re-advertise `SRC_NET`.
pub fn refresh_src_route(r: &mut TestRouter) {
    r.update_route(SRC_NET, M24, 1, Some(R1), 0).unwrap();
}

/// `three_lan` plus an installed (`SRC`, `GROUP`) entry.
pub fn three_lan_with_traffic() -> TestRouter {
    let mut r = three_lan();
    r.add_table_entry(SRC, GROUP).unwrap();
    r
}

/// Advance `secs` seconds one tick at a time, with `R1` refreshing
/// `SRC_NET` each tick so the route never ages out.
pub fn run_for(r: &mut TestRouter, secs: u32) {
    let mut left = secs;
    while left > 0 {
        let step = left.min(TIMER_INTERVAL);
        refresh_src_route(r);
        r.advance(step);
        left -= step;
    }
}

pub fn grpmems(r: &TestRouter) -> VifBitmap {
    r.cache().get(&src_key()).unwrap().grpmems()
}

pub fn vifs(v: &[VifIndex]) -> VifBitmap {
    v.iter().copied().collect()
}

pub fn prunes(out: &[Outgoing]) -> Vec<(VifIndex, Ipv4Addr, PruneMsg)> {
    out.iter()
        .filter_map(|m| match m {
            Outgoing::Prune { vif, dst, msg } => Some((*vif, *dst, *msg)),
            _ => None,
        })
        .collect()
}

pub fn grafts(out: &[Outgoing]) -> Vec<(VifIndex, Ipv4Addr, GraftMsg)> {
    out.iter()
        .filter_map(|m| match m {
            Outgoing::Graft { vif, dst, msg } => Some((*vif, *dst, *msg)),
            _ => None,
        })
        .collect()
}

pub fn graft_acks(out: &[Outgoing]) -> Vec<(VifIndex, Ipv4Addr, GraftMsg)> {
    out.iter()
        .filter_map(|m| match m {
            Outgoing::GraftAck { vif, dst, msg } => Some((*vif, *dst, *msg)),
            _ => None,
        })
        .collect()
}

pub fn reports(
    out: &[Outgoing],
) -> Vec<(VifIndex, Option<Ipv4Addr>, &[ReportedRoute])> {
    out.iter()
        .filter_map(|m| match m {
            Outgoing::Report { vif, dst, routes } => {
                Some((*vif, *dst, routes.as_slice()))
            }
            _ => None,
        })
        .collect()
}

/// Assert that an operation was rejected with an error of the given
/// kind.
#[macro_export]
macro_rules! assert_rejected {
    ($res:expr, $kind:ident) => {
        match $res {
            Err(e) => assert_eq!(
                e.kind(),
                $crate::ErrorKind::$kind,
                "unexpected error kind for {e}"
            ),
            Ok(()) => panic!("expected {} error", stringify!($kind)),
        }
    };
}
