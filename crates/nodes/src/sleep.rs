// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! `Sleep`: a node that blocks the calling thread for a fixed duration on
//! every object, unmodified otherwise.
//!
//! Used to give a [`streamgraph_engine::parallel::ParallelPipeline`]'s inner
//! pipeline enough per-object work that worker threads actually overlap,
//! which is what the sequential-equivalence property in the specification's
//! test scenarios is checking: with real concurrent work, a pool of workers
//! must still reassemble the same order as running the same graph with one
//! worker.

use streamgraph_engine::{builder, Error, Node, NodeName, Object};
use std::sync::Arc;
use std::time::Duration;

/// See the module documentation.
pub struct Sleep {
    name: NodeName,
    duration: Duration,
}

impl Sleep {
    /// Registers a `Sleep` node with the ambient scope. Declares no ports:
    /// it neither reads nor binds anything, only delays.
    #[must_use]
    pub fn build(duration: Duration) -> Arc<Sleep> {
        let node = Arc::new(Sleep {
            name: Arc::from("Sleep"),
            duration,
        });
        builder::register(node.clone());
        node
    }
}

impl Node for Sleep {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform(&self, object: Object) -> Result<Object, Error> {
        std::thread::sleep(self.duration);
        Ok(object)
    }
}
