// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! DVMRP message bodies.
//!
//! Only the payload following the IGMP/DVMRP header is handled here;
//! framing belongs to the I/O layer.
//!
//! A route report is a sequence of per-mask runs:
//!
//! ```text
//! +--------+--------+--------+
//! | mask1  | mask2  | mask3  |    (mask0 is implicitly 255)
//! +--------+--------+--------+-----+--------+
//! | origin (width bytes)           | metric |  repeated until the
//! +--------------------------------+--------+  metric has bit 7 set
//! ```
//!
//! `width` is one plus the number of non-zero mask bytes. An origin of
//! zero under the implicit 255.0.0.0 mask denotes the default route.

use super::UNREACHABLE;
use super::mask_width;
use std::net::Ipv4Addr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::network_endian::U32;

/// Marks the final (origin, metric) pair of a mask run.
pub const LAST_IN_RUN: u8 = 0x80;

const DEFAULT_ROUTE_MASK: u32 = 0xff00_0000;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum WireError {
    #[error("truncated {what}: {len} bytes remaining")]
    Truncated { what: &'static str, len: usize },

    #[error("invalid netmask {0}")]
    InvalidMask(Ipv4Addr),

    #[error("netmask {0} cannot be carried in a route report")]
    UnencodableMask(Ipv4Addr),
}

/// One (origin, mask, metric) line of a route report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReportedRoute {
    pub origin: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub metric: u8,
}

impl ReportedRoute {
    /// Is this the poison-reverse form of the route?
    pub fn is_poisoned(&self) -> bool {
        self.metric > UNREACHABLE
    }
}

/// Decode a complete route report.
///
/// Nothing is returned unless the entire report is well formed.
pub fn decode_report(buf: &[u8]) -> Result<Vec<ReportedRoute>, WireError> {
    let mut routes = Vec::new();
    let mut p = buf;

    while !p.is_empty() {
        if p.len() < 3 {
            return Err(WireError::Truncated {
                what: "report mask",
                len: p.len(),
            });
        }

        let mask_bytes = [0xff, p[0], p[1], p[2]];
        let width = 1 + p[..3].iter().filter(|b| **b != 0).count();
        let mask = Ipv4Addr::from(mask_bytes);
        if mask_width(mask).is_none() {
            return Err(WireError::InvalidMask(mask));
        }
        p = &p[3..];

        loop {
            if p.len() < width + 1 {
                return Err(WireError::Truncated {
                    what: "report origin",
                    len: p.len(),
                });
            }

            let mut origin = [0u8; 4];
            origin[..width].copy_from_slice(&p[..width]);
            let metric = p[width];
            p = &p[width + 1..];

            let origin = Ipv4Addr::from(origin);
            let route_mask = if origin.is_unspecified()
                && u32::from(mask) == DEFAULT_ROUTE_MASK
            {
                Ipv4Addr::UNSPECIFIED
            } else {
                mask
            };

            routes.push(ReportedRoute {
                origin,
                mask: route_mask,
                metric: metric & !LAST_IN_RUN,
            });

            if metric & LAST_IN_RUN != 0 {
                break;
            }
        }
    }

    Ok(routes)
}

/// Can `mask` be carried in a report?
pub fn encodable_mask(mask: Ipv4Addr) -> bool {
    match mask_width(mask) {
        Some(0) => true,
        Some(w) => w >= 8,
        None => false,
    }
}

/// Encode routes into a report body. Consecutive routes sharing a
/// mask share a run, so callers should pass routes grouped by mask.
pub fn encode_report(routes: &[ReportedRoute]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    let mut i = 0;

    while i < routes.len() {
        let mask = routes[i].mask;
        if !encodable_mask(mask) {
            return Err(WireError::UnencodableMask(mask));
        }

        let run_end = routes[i..]
            .iter()
            .position(|r| r.mask != mask)
            .map(|n| i + n)
            .unwrap_or(routes.len());

        let m = mask.octets();
        out.extend_from_slice(&m[1..]);
        let width = 1 + m[1..].iter().filter(|b| **b != 0).count();

        for (j, r) in routes[i..run_end].iter().enumerate() {
            out.extend_from_slice(&r.origin.octets()[..width]);
            let mut metric = r.metric & !LAST_IN_RUN;
            if i + j + 1 == run_end {
                metric |= LAST_IN_RUN;
            }
            out.push(metric);
        }

        i = run_end;
    }

    Ok(out)
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct PruneBody {
    origin: [u8; 4],
    group: [u8; 4],
    lifetime: U32,
}

#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
#[repr(C)]
struct GraftBody {
    origin: [u8; 4],
    group: [u8; 4],
}

/// A Prune: stop forwarding `group` traffic from `origin` for
/// `lifetime` seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PruneMsg {
    pub origin: Ipv4Addr,
    pub group: Ipv4Addr,
    pub lifetime: u32,
}

impl PruneMsg {
    pub const LEN: usize = core::mem::size_of::<PruneBody>();

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (body, _) = PruneBody::read_from_prefix(buf).map_err(|_| {
            WireError::Truncated { what: "prune", len: buf.len() }
        })?;
        Ok(Self {
            origin: Ipv4Addr::from(body.origin),
            group: Ipv4Addr::from(body.group),
            lifetime: body.lifetime.get(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = PruneBody {
            origin: self.origin.octets(),
            group: self.group.octets(),
            lifetime: U32::new(self.lifetime),
        };
        body.as_bytes().to_vec()
    }
}

/// The body shared by Graft and Graft-Ack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GraftMsg {
    pub origin: Ipv4Addr,
    pub group: Ipv4Addr,
}

impl GraftMsg {
    pub const LEN: usize = core::mem::size_of::<GraftBody>();

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (body, _) = GraftBody::read_from_prefix(buf).map_err(|_| {
            WireError::Truncated { what: "graft", len: buf.len() }
        })?;
        Ok(Self {
            origin: Ipv4Addr::from(body.origin),
            group: Ipv4Addr::from(body.group),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = GraftBody {
            origin: self.origin.octets(),
            group: self.group.octets(),
        };
        body.as_bytes().to_vec()
    }
}
