// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! A small library of concrete [`streamgraph_engine::Node`] implementations.
//!
//! None of this is part of the core: every type here is an ordinary node
//! built against the public [`streamgraph_engine`] authoring interface, and
//! a downstream crate could implement any of them itself. They exist to
//! give pipeline authors a few common building blocks (a closure-based
//! transform, a deterministic list source, a remaining-count probe, a
//! fixed delay) without writing a new `struct` for every pipeline, and to
//! give the engine's own test suite concrete, reusable stand-ins for the
//! specification's example nodes.

mod fault;
mod map;
mod remaining_hint;
mod sleep;
mod unpack;

pub use fault::{Kill, Raise, RaisedError};
pub use map::Map;
pub use remaining_hint::RemainingHint;
pub use sleep::Sleep;
pub use unpack::Unpack;
