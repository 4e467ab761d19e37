// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Snapshots of engine state for printing and inspection.

use super::NbrBitmap;
use super::RouteFlags;
use super::RouteKey;
use super::UpstreamPrune;
use super::VifBitmap;
use super::VifIndex;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteEntryDump {
    pub key: RouteKey,
    pub metric: u8,
    pub parent: VifIndex,
    pub gateway: Option<Ipv4Addr>,
    pub children: VifBitmap,
    pub subordinates: NbrBitmap,
    pub dominants: Vec<(VifIndex, Ipv4Addr)>,
    pub age: u32,
    pub flags: RouteFlags,
    pub groups: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DumpRoutesResp {
    pub routes: Vec<RouteEntryDump>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SourceDump {
    pub origin: Ipv4Addr,
    /// Seconds since the source was installed in the kernel, or `None`
    /// if it is currently evicted.
    pub installed_for: Option<u64>,
    pub pkts: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PruneDump {
    pub nbr: Ipv4Addr,
    pub vif: VifIndex,
    pub remaining: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheEntryDump {
    pub route: Option<RouteKey>,
    pub group: Ipv4Addr,
    pub parent: Option<VifIndex>,
    pub grpmems: VifBitmap,
    pub scope: VifBitmap,
    pub upstream_prune: UpstreamPrune,
    pub graft_sent: u32,
    pub age: u32,
    pub sources: Vec<SourceDump>,
    pub prunes: Vec<PruneDump>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DumpCacheResp {
    pub entries: Vec<CacheEntryDump>,
}
