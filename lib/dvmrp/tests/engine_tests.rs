// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Whole-router behavior: timers, reports, message decoding and the
//! operator views.

use dvmrp::api::ROUTE_REPORT_INTERVAL;
use dvmrp::api::wire::encode_report;
use dvmrp::print::print_cache_into;
use dvmrp::print::print_outgoing_into;
use dvmrp::print::print_routes_into;
use dvmrp_test_utils as common;

use common::*;

#[test]
fn timers_bound_the_wait() {
    let mut r = three_lan();
    assert_eq!(r.time_until_next(), Some(TIMER_INTERVAL));
    r.advance(3);
    assert_eq!(r.now(), 3);
    assert_eq!(r.time_until_next(), Some(TIMER_INTERVAL - 3));
}

#[test]
fn periodic_full_report_poisons_upstream() {
    let mut r = three_lan();
    r.advance(ROUTE_REPORT_INTERVAL - TIMER_INTERVAL);
    r.take_outgoing();

    r.advance(TIMER_INTERVAL);
    let out = r.take_outgoing();
    let sent = reports(&out);
    let on: Vec<_> = sent.iter().map(|(vif, dst, _)| (*vif, *dst)).collect();
    assert_eq!(on, vec![(0, None), (1, None), (2, None)]);

    for (vif, _, routes) in sent {
        let line = routes.iter().find(|l| l.origin == SRC_NET).unwrap();
        let expect = if vif == 0 { 2 + UNREACHABLE } else { 2 };
        assert_eq!(line.metric, expect, "vif {vif}");
    }
}

#[test]
fn changes_are_reported_on_the_next_tick() {
    let mut r = three_lan();
    run_for(&mut r, TIMER_INTERVAL);
    r.take_outgoing();

    let net = Ipv4Addr::new(172, 20, 0, 0);
    r.update_route(net, M24, 4, Some(R1), 0).unwrap();
    run_for(&mut r, TIMER_INTERVAL);
    let out = r.take_outgoing();
    let sent = reports(&out);
    assert_eq!(sent.len(), 3);
    for (_, dst, routes) in sent {
        assert_eq!(dst, None);
        let origins: Vec<_> = routes.iter().map(|l| l.origin).collect();
        assert_eq!(origins, vec![net]);
    }

    // Nothing new, nothing sent.
    run_for(&mut r, TIMER_INTERVAL);
    assert!(reports(&r.take_outgoing()).is_empty());
}

#[test]
fn report_from_the_wire() {
    let mut r = three_lan();
    let net = Ipv4Addr::new(172, 16, 0, 0);
    let m16 = Ipv4Addr::new(255, 255, 0, 0);
    let payload = encode_report(&[ReportedRoute {
        origin: net,
        mask: m16,
        metric: 3,
    }])
    .unwrap();

    r.accept_report(N1, 1, &payload).unwrap();
    let route = r.routes().get(&RouteKey::new(net, m16)).unwrap();
    assert_eq!(route.metric(), 4);
    assert_eq!(route.parent(), 1);
    assert_eq!(route.gateway(), Some(N1));

    let before = r.routes().len();
    assert_rejected!(r.accept_report(N1, 1, &payload[..4]), Malformed);
    let stranger = Ipv4Addr::new(10, 1, 0, 77);
    assert_rejected!(r.accept_report(stranger, 1, &payload), Malformed);
    assert_eq!(r.routes().len(), before);
}

#[test]
fn prune_and_graft_from_the_wire() {
    let mut r = three_lan_with_traffic();
    let prune = PruneMsg { origin: SRC, group: GROUP, lifetime: 600 };
    let bytes = prune.encode();

    assert_rejected!(r.accept_prune_msg(N2, 2, &bytes[..11]), Malformed);
    assert_eq!(grpmems(&r), vifs(&[1, 2]));
    r.accept_prune_msg(N2, 2, &bytes).unwrap();
    assert_eq!(grpmems(&r), vifs(&[1]));

    let graft = GraftMsg { origin: SRC, group: GROUP };
    r.accept_graft_msg(N2, 2, &graft.encode()).unwrap();
    assert_eq!(grpmems(&r), vifs(&[1, 2]));

    let out = r.take_outgoing();
    let ack = out
        .iter()
        .find(|m| matches!(m, Outgoing::GraftAck { .. }))
        .unwrap();
    assert_eq!(ack.vif(), 2);
    assert_eq!(ack.encode().unwrap(), graft.encode());

    assert_rejected!(r.accept_g_ack_msg(R1, 0, &[224, 1]), Malformed);
}

#[test]
fn pruning_can_be_disabled() {
    let toml =
        THREE_LAN.replace("rng_seed = 7", "rng_seed = 7\npruning = false");
    let mut r = router_from(&toml);
    add_nbr(&mut r, 0, R1);
    add_nbr(&mut r, 1, N1);
    add_nbr(&mut r, 2, N2);
    refresh_src_route(&mut r);
    r.add_table_entry(SRC, GROUP).unwrap();

    r.accept_prune(N1, 1, SRC, GROUP, 600).unwrap();
    r.accept_prune(N2, 2, SRC, GROUP, 600).unwrap();
    assert!(grpmems(&r).is_empty());
    assert!(prunes(&r.take_outgoing()).is_empty());
    let e = r.cache().get(&src_key()).unwrap();
    assert_eq!(e.upstream(), UpstreamPrune::NotPruned);
}

#[test]
fn local_members_keep_vif() {
    let mut r = three_lan();
    r.vifs_mut().join(2, GROUP).unwrap();
    r.add_table_entry(SRC, GROUP).unwrap();
    r.accept_prune(N2, 2, SRC, GROUP, 600).unwrap();
    assert_eq!(grpmems(&r), vifs(&[1, 2]));

    r.vifs_mut().leave(2, GROUP).unwrap();
    assert_eq!(r.determine_forwvifs(src_route(), GROUP), Some(vifs(&[1])));
    // Recomputing alone leaves the kernel as it was.
    let mfc = r.kernel().entry(SRC, GROUP).unwrap();
    assert_eq!(mfc.ttls.forwarding(), vifs(&[1, 2]));

    let other = Ipv4Addr::new(224, 7, 7, 7);
    assert_eq!(r.determine_forwvifs(src_route(), other), None);
}

#[test]
fn neighbor_loss_forgets_its_prunes() {
    let mut r = three_lan_with_traffic();
    r.accept_prune(N2, 2, SRC, GROUP, 600).unwrap();
    assert_eq!(grpmems(&r), vifs(&[1]));

    remove_nbr(&mut r, 2, N2);
    let e = r.cache().get(&src_key()).unwrap();
    assert!(e.prunes().is_empty());
    // Nobody left on vif 2 to forward to.
    assert_eq!(e.grpmems(), vifs(&[1]));

    // It comes back, is assumed to depend on us and gets our routes.
    add_nbr(&mut r, 2, N2);
    assert_eq!(grpmems(&r), vifs(&[1, 2]));
    let out = r.take_outgoing();
    let sent = reports(&out);
    assert_eq!(sent.len(), 1);
    assert_eq!((sent[0].0, sent[0].1), (2, Some(N2)));
}

#[test]
fn child_vif_down_stops_forwarding() {
    let mut r = three_lan_with_traffic();
    r.delete_vif(2).unwrap();
    assert_eq!(grpmems(&r), vifs(&[1]));
    let mfc = r.kernel().entry(SRC, GROUP).unwrap();
    assert_eq!(mfc.ttls.forwarding(), vifs(&[1]));

    r.add_vif(2).unwrap();
    assert_eq!(grpmems(&r), vifs(&[1, 2]));
}

#[test]
fn dumps_and_printing() {
    let mut r = three_lan_with_traffic();
    r.accept_prune(N1, 1, SRC, GROUP, 600).unwrap();
    r.accept_prune(N2, 2, SRC, GROUP, 600).unwrap();

    let routes = r.dump_routes();
    let d = routes.routes.iter().find(|d| d.key == src_route()).unwrap();
    assert_eq!(d.metric, 2);
    assert_eq!(d.parent, 0);
    assert_eq!(d.gateway, Some(R1));
    assert_eq!(d.children, vifs(&[1, 2]));
    assert_eq!(d.groups, 1);

    let cache = r.dump_cache();
    assert_eq!(cache.entries.len(), 1);
    let e = &cache.entries[0];
    assert_eq!(e.route, Some(src_route()));
    assert_eq!(e.sources.len(), 1);
    assert_eq!(e.prunes.len(), 2);
    assert!(e.upstream_prune.is_pending());

    let mut buf = Vec::new();
    print_routes_into(&mut buf, &routes).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("192.168.1.0/24"), "{text}");
    assert!(text.contains("10.0.0.2"), "{text}");

    let mut buf = Vec::new();
    print_cache_into(&mut buf, &cache).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("pruned by 10.2.0.2"), "{text}");
    assert!(text.contains("source 192.168.1.10"), "{text}");

    let mut buf = Vec::new();
    print_outgoing_into(&mut buf, &r.take_outgoing()).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("lifetime 600"), "{text}");
}
