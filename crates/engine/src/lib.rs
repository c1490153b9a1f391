// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! Core execution engine for composable, port-based streaming dataflow
//! pipelines.
//!
//! A pipeline is a tree of scopes built with an ambient [`builder`] stack:
//! the outermost scope is an ordinary [`pipeline::Pipeline`]; nested scopes
//! are a [`batch::BatchPipeline`] (regroups objects so an inner pipeline
//! sees sequence-valued ports) or a [`parallel::ParallelPipeline`] (farms
//! its inner pipeline out to a pool of worker threads while preserving
//! input order). Every scope, and every ordinary [`node::Node`], produces a
//! lazy, closable [`node::ObjectStream`] of [`object::Object`]s keyed by
//! [`port::Port`].
//!
//! See each module's docs for the part of the model it owns.

pub mod batch;
pub mod builder;
pub mod error;
mod key;
pub mod node;
pub mod object;
pub mod parallel;
pub mod pipeline;
pub mod port;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use error::Error;
pub use node::{Node, NodeName, ObjectStream, wrap_with_lifecycle};
pub use object::Object;
pub use pipeline::Pipeline;
pub use port::{Port, PortId};
