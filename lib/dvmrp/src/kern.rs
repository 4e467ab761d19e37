// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The kernel multicast forwarding cache.
//!
//! The engine treats the kernel's (source, group) forwarding table as
//! an external collaborator reached through [`KernelCache`].
//! [`SimKernel`] is an in-memory stand-in that also records how it was
//! driven.

use dvmrp_api::SgCounters;
use dvmrp_api::TtlVector;
use dvmrp_api::VifIndex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum KernelError {
    #[error("no forwarding entry for ({origin}, {group})")]
    NoEntry { origin: Ipv4Addr, group: Ipv4Addr },

    #[error("kernel rejected request: {0}")]
    Rejected(String),
}

/// Install, remove and query (source, group) forwarding entries.
pub trait KernelCache {
    /// Install a forwarding entry, replacing any existing entry for
    /// the same (origin, group). A `parent` of `None` installs a
    /// negative entry that drops the traffic.
    fn install(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        parent: Option<VifIndex>,
        ttls: &TtlVector,
    ) -> Result<(), KernelError>;

    /// Remove a forwarding entry, returning its final packet count.
    fn remove(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<u64, KernelError>;

    fn counters(
        &self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<SgCounters, KernelError>;
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MfcEntry {
    pub parent: Option<VifIndex>,
    pub ttls: TtlVector,
    pub counters: SgCounters,
}

/// An in-memory forwarding cache.
#[derive(Debug, Default)]
pub struct SimKernel {
    entries: BTreeMap<(Ipv4Addr, Ipv4Addr), MfcEntry>,
    installs: BTreeMap<(Ipv4Addr, Ipv4Addr), u32>,
    removals: BTreeMap<(Ipv4Addr, Ipv4Addr), u32>,
    fail: bool,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(
        &self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<&MfcEntry> {
        self.entries.get(&(origin, group))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many times (origin, group) was installed.
    pub fn install_count(&self, origin: Ipv4Addr, group: Ipv4Addr) -> u32 {
        self.installs.get(&(origin, group)).copied().unwrap_or(0)
    }

    /// How many times (origin, group) was removed.
    pub fn remove_count(&self, origin: Ipv4Addr, group: Ipv4Addr) -> u32 {
        self.removals.get(&(origin, group)).copied().unwrap_or(0)
    }

    pub fn total_installs(&self) -> u32 {
        self.installs.values().sum()
    }

    /// Account forwarded traffic against an installed entry.
    pub fn forward(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        pkts: u64,
        bytes: u64,
    ) {
        if let Some(e) = self.entries.get_mut(&(origin, group)) {
            e.counters.pkts += pkts;
            e.counters.bytes += bytes;
        }
    }

    /// Make every subsequent call fail until cleared.
    pub fn set_failing(&mut self, fail: bool) {
        self.fail = fail;
    }

    fn check(&self) -> Result<(), KernelError> {
        if self.fail {
            return Err(KernelError::Rejected("simulated failure".into()));
        }
        Ok(())
    }
}

impl KernelCache for SimKernel {
    fn install(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
        parent: Option<VifIndex>,
        ttls: &TtlVector,
    ) -> Result<(), KernelError> {
        *self.installs.entry((origin, group)).or_default() += 1;
        self.check()?;
        let e = self.entries.entry((origin, group)).or_default();
        e.parent = parent;
        e.ttls = *ttls;
        Ok(())
    }

    fn remove(
        &mut self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<u64, KernelError> {
        *self.removals.entry((origin, group)).or_default() += 1;
        self.check()?;
        self.entries
            .remove(&(origin, group))
            .map(|e| e.counters.pkts)
            .ok_or(KernelError::NoEntry { origin, group })
    }

    fn counters(
        &self,
        origin: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<SgCounters, KernelError> {
        self.check()?;
        self.entries
            .get(&(origin, group))
            .map(|e| e.counters)
            .ok_or(KernelError::NoEntry { origin, group })
    }
}
