// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use serde::Deserialize;
use slog::Drain;
use slog::FilterLevel;
use slog::Logger;
use slog::o;

use dvmrp::Router;
use dvmrp::api::VifIndex;
use dvmrp::config::Config;
use dvmrp::kern::SimKernel;
use dvmrp::print::print_cache;
use dvmrp::print::print_outgoing_into;
use dvmrp::print::print_routes;
use dvmrp::print::print_vifs_into;
use dvmrp::vif::VifLayer;
use dvmrp::vif::VifTable;

/// Replay DVMRP protocol events against the routing engine
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Log verbosity; repeat for more. RUST_LOG overrides per module.
    #[arg(short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a config file and print its vifs.
    Check {
        #[arg(short)]
        config: PathBuf,
    },

    /// Run an event script against a config.
    Run {
        #[arg(short)]
        config: PathBuf,

        /// TOML file of `[[event]]` tables.
        script: PathBuf,

        /// Emit dumps as JSON instead of tables.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Script {
    #[serde(default, rename = "event")]
    events: Vec<Event>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum Event {
    NeighborUp {
        vif: VifIndex,
        addr: Ipv4Addr,
        #[serde(default = "yes")]
        pruning: bool,
    },
    NeighborDown {
        vif: VifIndex,
        addr: Ipv4Addr,
    },
    VifUp {
        vif: VifIndex,
    },
    VifDown {
        vif: VifIndex,
    },
    /// One route from a neighbor's report.
    Route {
        vif: VifIndex,
        from: Ipv4Addr,
        origin: Ipv4Addr,
        mask: Ipv4Addr,
        metric: u8,
    },
    Prune {
        vif: VifIndex,
        from: Ipv4Addr,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        lifetime: u32,
    },
    Graft {
        vif: VifIndex,
        from: Ipv4Addr,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    },
    GAck {
        vif: VifIndex,
        from: Ipv4Addr,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    },
    /// A packet with no forwarding entry reached the kernel.
    Upcall {
        origin: Ipv4Addr,
        group: Ipv4Addr,
    },
    /// Packets forwarded by an installed entry.
    Traffic {
        origin: Ipv4Addr,
        group: Ipv4Addr,
        pkts: u64,
    },
    Join {
        vif: VifIndex,
        group: Ipv4Addr,
    },
    Leave {
        vif: VifIndex,
        group: Ipv4Addr,
    },
    Advance {
        secs: u32,
    },
    Dump {
        #[serde(default)]
        what: DumpWhat,
    },
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum DumpWhat {
    Routes,
    Cache,
    #[default]
    All,
}

type SimRouter = Router<VifTable, SimKernel>;

fn build_logger(verbose: u8) -> (Logger, slog_async::AsyncGuard) {
    let level = match verbose {
        0 => FilterLevel::Warning,
        1 => FilterLevel::Info,
        2 => FilterLevel::Debug,
        _ => FilterLevel::Trace,
    };
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let mut builder =
        slog_envlogger::LogBuilder::new(drain).filter(None, level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder = builder.parse(&spec);
    }
    let (drain, guard) =
        slog_async::Async::new(builder.build().fuse()).build_with_guard();
    (Logger::root(drain.fuse(), o!("name" => "mrtsim")), guard)
}

fn dump(r: &SimRouter, what: DumpWhat, json: bool) -> anyhow::Result<()> {
    let routes = matches!(what, DumpWhat::Routes | DumpWhat::All);
    let cache = matches!(what, DumpWhat::Cache | DumpWhat::All);

    if json {
        if routes {
            println!("{}", serde_json::to_string_pretty(&r.dump_routes())?);
        }
        if cache {
            println!("{}", serde_json::to_string_pretty(&r.dump_cache())?);
        }
        return Ok(());
    }

    if routes {
        print_routes(&r.dump_routes())?;
        println!();
    }
    if cache {
        print_cache(&r.dump_cache())?;
        println!();
    }
    Ok(())
}

fn apply(
    r: &mut SimRouter,
    ev: &Event,
    json: bool,
) -> anyhow::Result<Result<(), dvmrp::Error>> {
    let res = match *ev {
        Event::NeighborUp { vif, addr, pruning } => {
            let idx = r.vifs_mut().add_neighbor(vif, addr, pruning)?;
            r.neighbor_added(vif, addr, idx);
            Ok(())
        }

        Event::NeighborDown { vif, addr } => {
            let idx = r
                .vifs_mut()
                .remove_neighbor(vif, addr)
                .with_context(|| format!("{addr} is not a neighbor on {vif}"))?;
            r.neighbor_removed(vif, addr, idx);
            Ok(())
        }

        Event::VifUp { vif } => {
            let flags = dvmrp::api::VifFlags::DOWN;
            r.vifs_mut().set_flags(vif, flags, false)?;
            r.add_vif(vif)
        }

        Event::VifDown { vif } => {
            let res = r.delete_vif(vif);
            if res.is_ok() {
                let flags = dvmrp::api::VifFlags::DOWN;
                r.vifs_mut().set_flags(vif, flags, true)?;
            }
            res
        }

        Event::Route { vif, from, origin, mask, metric } => {
            r.update_route(origin, mask, metric, Some(from), vif)
        }

        Event::Prune { vif, from, origin, group, lifetime } => {
            r.accept_prune(from, vif, origin, group, lifetime)
        }

        Event::Graft { vif, from, origin, group } => {
            r.accept_graft(from, vif, origin, group)
        }

        Event::GAck { vif, from, origin, group } => {
            r.accept_g_ack(from, vif, origin, group)
        }

        Event::Upcall { origin, group } => r.add_table_entry(origin, group),

        Event::Traffic { origin, group, pkts } => {
            r.kernel_mut().forward(origin, group, pkts, pkts * 1000);
            Ok(())
        }

        Event::Join { vif, group } => {
            r.vifs_mut().join(vif, group)?;
            r.update_lclgrp(vif, group)
        }

        Event::Leave { vif, group } => {
            r.vifs_mut().leave(vif, group)?;
            r.delete_lclgrp(vif, group)
        }

        Event::Advance { secs } => {
            r.advance(secs);
            Ok(())
        }

        Event::Dump { what } => {
            dump(r, what, json)?;
            Ok(())
        }
    };
    Ok(res)
}

fn run(
    cfg: Config,
    script: Script,
    json: bool,
    log: &Logger,
) -> anyhow::Result<()> {
    let vifs = VifTable::new(&cfg.vifs);
    let mut r = Router::new(cfg.engine, vifs, SimKernel::new(), log);
    let mut stdout = io::stdout();

    for (i, ev) in script.events.iter().enumerate() {
        if let Err(e) = apply(&mut r, ev, json)? {
            println!("t={} event {i}: rejected: {e}", r.now());
        }

        let out = r.take_outgoing();
        if !out.is_empty() {
            println!("t={} event {i}: {} message(s)", r.now(), out.len());
            print_outgoing_into(&mut stdout, &out)?;
            println!();
        }
    }

    println!(
        "done at t={}: {} route(s), {} cache entr(ies), {} kernel entr(ies)",
        r.now(),
        r.routes().len(),
        r.cache().len(),
        r.kernel().len(),
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (log, _guard) = build_logger(cli.verbose);

    match cli.cmd {
        Command::Check { config } => {
            let cfg = Config::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let vifs = VifTable::new(&cfg.vifs);
            println!("{} vif(s)", vifs.num_vifs());
            print_vifs_into(&mut io::stdout(), &vifs)?;
        }

        Command::Run { config, script, json } => {
            let cfg = Config::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let text = std::fs::read_to_string(&script)
                .with_context(|| format!("reading {}", script.display()))?;
            let script: Script = toml::from_str(&text)
                .with_context(|| format!("parsing {}", script.display()))?;
            run(cfg, script, json, &log)?;
        }
    }

    Ok(())
}
