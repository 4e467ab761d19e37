// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A DVMRP routing and pruning engine.
//!
//! The engine maintains a distance-vector table of multicast origins,
//! a forwarding cache of (route, group) entries kept in sync with the
//! kernel, and the prune/graft exchange with upstream routers. It is
//! single threaded and never blocks: all work happens inside calls on
//! [`router::Router`].

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub use dvmrp_api as api;

pub mod callout;
pub mod config;
pub mod error;
pub mod kern;
pub mod print;
pub mod prune;
pub mod route;
pub mod router;
pub mod vif;

pub use error::Error;
pub use error::ErrorKind;
pub use router::Outgoing;
pub use router::Router;
