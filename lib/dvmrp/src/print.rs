// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print engine state in a human-friendly manner.
//!
//! Shared by mrtsim and the integration tests.

use crate::router::Outgoing;
use crate::vif::VifTable;
use dvmrp_api::CacheEntryDump;
use dvmrp_api::DumpCacheResp;
use dvmrp_api::DumpRoutesResp;
use dvmrp_api::RouteEntryDump;
use dvmrp_api::RouteFlags;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpRoutesResp`].
pub fn print_routes(resp: &DumpRoutesResp) -> std::io::Result<()> {
    print_routes_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpRoutesResp`] into a given writer.
pub fn print_routes_into(
    writer: &mut impl Write,
    resp: &DumpRoutesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Routes: {}", resp.routes.len())?;
    write_hr(&mut t)?;
    writeln!(
        t,
        "ORIGIN\tMETRIC\tPARENT\tGATEWAY\tCHILDREN\tSUBORD\tAGE\tFLAGS\tGROUPS"
    )?;
    for r in &resp.routes {
        print_route(&mut t, r)?;
    }
    t.flush()
}

fn print_route(t: &mut impl Write, r: &RouteEntryDump) -> std::io::Result<()> {
    let gateway = match r.gateway {
        Some(gw) => gw.to_string(),
        None => "local".to_string(),
    };
    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        r.key,
        r.metric,
        r.parent,
        gateway,
        r.children,
        r.subordinates,
        r.age,
        route_flags(r.flags),
        r.groups,
    )?;
    for (vif, dom) in &r.dominants {
        writeln!(t, "  dominant on vif {vif}: {dom}")?;
    }
    Ok(())
}

fn route_flags(flags: RouteFlags) -> String {
    let mut s = String::new();
    if flags.contains(RouteFlags::CHANGED) {
        s.push('C');
    }
    if flags.contains(RouteFlags::HOLDDOWN) {
        s.push('H');
    }
    if s.is_empty() {
        s.push('-');
    }
    s
}

/// Print a [`DumpCacheResp`].
pub fn print_cache(resp: &DumpCacheResp) -> std::io::Result<()> {
    print_cache_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpCacheResp`] into a given writer.
pub fn print_cache_into(
    writer: &mut impl Write,
    resp: &DumpCacheResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Forwarding Cache: {}", resp.entries.len())?;
    write_hr(&mut t)?;
    writeln!(t, "ROUTE\tGROUP\tPARENT\tOUT\tSCOPE\tPRUNE\tGRAFTS\tAGE")?;
    for e in &resp.entries {
        print_cache_entry(&mut t, e)?;
    }
    t.flush()
}

fn print_cache_entry(
    t: &mut impl Write,
    e: &CacheEntryDump,
) -> std::io::Result<()> {
    let route = e.route.map_or_else(|| "none".to_string(), |r| r.to_string());
    let parent = e.parent.map_or_else(|| "-".to_string(), |p| p.to_string());
    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        route,
        e.group,
        parent,
        e.grpmems,
        e.scope,
        e.upstream_prune,
        e.graft_sent,
        e.age,
    )?;

    for s in &e.sources {
        match s.installed_for {
            Some(secs) => writeln!(
                t,
                "  source {}\tinstalled {}s\t{} pkts",
                s.origin, secs, s.pkts
            )?,
            None => {
                writeln!(t, "  source {}\tevicted\t{} pkts", s.origin, s.pkts)?
            }
        }
    }
    for p in &e.prunes {
        writeln!(
            t,
            "  pruned by {}\tvif {}\t{}s left",
            p.nbr, p.vif, p.remaining
        )?;
    }
    Ok(())
}

/// Print queued protocol messages into a given writer.
pub fn print_outgoing_into(
    writer: &mut impl Write,
    msgs: &[Outgoing],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "MSG\tVIF\tDST\tDETAIL")?;
    for m in msgs {
        match m {
            Outgoing::Report { vif, dst, routes } => {
                let dst =
                    dst.map_or_else(|| "all".to_string(), |d| d.to_string());
                writeln!(t, "report\t{vif}\t{dst}\t{} routes", routes.len())?;
                for r in routes {
                    writeln!(
                        t,
                        "\t\t\t{}/{} metric {}",
                        r.origin,
                        dvmrp_api::mask_width(r.mask).unwrap_or(0),
                        r.metric
                    )?;
                }
            }
            Outgoing::Prune { vif, dst, msg } => writeln!(
                t,
                "prune\t{vif}\t{dst}\t({}, {}) lifetime {}",
                msg.origin, msg.group, msg.lifetime
            )?,
            Outgoing::Graft { vif, dst, msg } => writeln!(
                t,
                "graft\t{vif}\t{dst}\t({}, {})",
                msg.origin, msg.group
            )?,
            Outgoing::GraftAck { vif, dst, msg } => writeln!(
                t,
                "graft-ack\t{vif}\t{dst}\t({}, {})",
                msg.origin, msg.group
            )?,
        }
    }
    t.flush()
}

/// Print the configured vifs into a given writer.
pub fn print_vifs_into(
    writer: &mut impl Write,
    vifs: &VifTable,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "VIF\tNAME\tLOCAL\tNET\tMETRIC\tTHRESH\tFLAGS")?;
    for (idx, v) in vifs.iter() {
        let remote = match (v.remote_addr, v.subnet) {
            (Some(addr), _) => addr.to_string(),
            (None, Some(net)) => net.to_string(),
            (None, None) => "-".to_string(),
        };
        let flags: Vec<_> =
            v.flags.iter_names().map(|(n, _)| n.to_lowercase()).collect();
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            idx,
            v.name,
            v.local_addr,
            remote,
            v.metric,
            v.threshold,
            if flags.is_empty() { "-".to_string() } else { flags.join(",") },
        )?;
        for b in &v.boundaries {
            writeln!(t, "  boundary {b}")?;
        }
    }
    t.flush()
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use dvmrp_api::NbrBitmap;
    use dvmrp_api::RouteKey;

    #[test]
    fn route_table_output() {
        let resp = DumpRoutesResp {
            routes: vec![RouteEntryDump {
                key: RouteKey::new(
                    "10.1.0.0".parse().unwrap(),
                    "255.255.0.0".parse().unwrap(),
                ),
                metric: 3,
                parent: 0,
                gateway: Some("10.0.0.2".parse().unwrap()),
                children: [1, 2].into_iter().collect(),
                subordinates: NbrBitmap::EMPTY,
                dominants: vec![(2, "10.2.0.9".parse().unwrap())],
                age: 15,
                flags: RouteFlags::CHANGED,
                groups: 1,
            }],
        };
        let mut out = Vec::new();
        print_routes_into(&mut out, &resp).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Routes: 1\n"));
        assert!(out.contains("10.1.0.0/16"));
        assert!(out.contains("10.0.0.2"));
        assert!(out.contains("dominant on vif 2: 10.2.0.9"));
    }

    #[test]
    fn vif_table_output() {
        let cfg = crate::config::Config::from_toml(
            r#"
            [[vif]]
            name = "lan0"
            local_addr = "10.0.0.1"
            subnet = "10.0.0.0/24"
            boundaries = ["239.192.0.0/16"]

            [[vif]]
            name = "tun0"
            local_addr = "10.9.0.1"
            remote_addr = "10.9.0.2"
            metric = 3
            "#,
        )
        .unwrap();
        let mut out = Vec::new();
        print_vifs_into(&mut out, &VifTable::new(&cfg.vifs)).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("10.0.0.0/24"));
        assert!(out.contains("boundary 239.192.0.0/16"));
        assert!(out.contains("tunnel"));
    }
}
