// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use dvmrp_api::VifIndex;
use dvmrp_api::wire::WireError;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Why a received message or request was rejected.
///
/// A rejected message never changes engine state.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("malformed message: {0}")]
    Wire(#[from] WireError),

    #[error("invalid subnet {origin} mask {mask}")]
    InvalidSubnet { origin: Ipv4Addr, mask: Ipv4Addr },

    #[error("invalid metric {metric} for {origin} from {src}")]
    BadMetric { metric: u8, origin: Ipv4Addr, src: Ipv4Addr },

    #[error("unknown vif {0}")]
    UnknownVif(VifIndex),

    #[error("{src} is not a known neighbor on vif {vif}")]
    UnknownNeighbor { src: Ipv4Addr, vif: VifIndex },

    #[error("{0} is not a multicast group")]
    NotMulticast(Ipv4Addr),

    #[error("neighbor table is full")]
    NeighborTableFull,

    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("{what} from {src} on non-child vif {vif} for origin {origin}")]
    NonChild {
        what: &'static str,
        src: Ipv4Addr,
        vif: VifIndex,
        origin: Ipv4Addr,
    },

    #[error("{what} from {src} on vif {vif} which is scoped for {group}")]
    Scoped {
        what: &'static str,
        src: Ipv4Addr,
        vif: VifIndex,
        group: Ipv4Addr,
    },

    #[error("no cache entry for ({origin}, {group})")]
    NoCacheEntry { origin: Ipv4Addr, group: Ipv4Addr },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The message itself is bad: truncated, out of range, or from
    /// somewhere we cannot place.
    Malformed,
    /// The message is well formed but disagrees with our state.
    Inconsistent,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Wire(_)
            | Self::InvalidSubnet { .. }
            | Self::BadMetric { .. }
            | Self::UnknownVif(_)
            | Self::UnknownNeighbor { .. }
            | Self::NotMulticast(_)
            | Self::NeighborTableFull => ErrorKind::Malformed,

            Self::NoRoute(_)
            | Self::NonChild { .. }
            | Self::Scoped { .. }
            | Self::NoCacheEntry { .. } => ErrorKind::Inconsistent,
        }
    }
}
