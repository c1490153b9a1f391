// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! `RemainingHint`: binds an estimate of how many objects remain in the
//! stream, as observed at this node's position in the pipeline.
//!
//! The estimate is the input stream's `Iterator::size_hint` lower bound,
//! sampled just before each object is pulled through — so it counts the
//! object about to be emitted plus whatever the upstream iterator reports is
//! still behind it. Every node in this crate is 1:1 and forwards `size_hint`
//! from its own input, as do the 1:1 scopes in `streamgraph_engine` (see
//! e.g. `BatchPipeline`'s `size_hint` impls), so a `RemainingHint` placed
//! before a `BatchPipeline` and one placed after it observe the same count
//! for the same object. `ParallelPipeline` is the exception: its inner
//! pipeline can fan out per outer object, so its stream reports the
//! conservative default `(0, None)` rather than a derived bound.

use streamgraph_engine::node::{self, Node, NodeName, ObjectStream};
use streamgraph_engine::{builder, Error, Object, Port};
use std::sync::Arc;

/// See the module documentation.
pub struct RemainingHint {
    name: NodeName,
    port: Port,
}

impl RemainingHint {
    /// Registers a `RemainingHint` node with the ambient scope. `port_name`
    /// names the output port each object carries its remaining-count
    /// estimate under.
    #[must_use]
    pub fn build(port_name: &'static str) -> Arc<RemainingHint> {
        let port = Port::new(port_name);
        builder::bind_output(&port);
        let node = Arc::new(RemainingHint {
            name: Arc::from(format!("RemainingHint({port_name})").as_str()),
            port,
        });
        builder::register(node.clone());
        node
    }

    /// The port this node binds on every object it produces.
    #[must_use]
    pub fn port(&self) -> &Port {
        &self.port
    }
}

impl Node for RemainingHint {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform_stream(self: Arc<Self>, input: ObjectStream) -> ObjectStream {
        node::wrap_with_lifecycle(
            self.clone(),
            Box::new(RemainingHintStream { node: self, input }),
        )
    }
}

struct RemainingHintStream {
    node: Arc<RemainingHint>,
    input: ObjectStream,
}

impl Iterator for RemainingHintStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let (remaining, _) = self.input.size_hint();
        match self.input.next()? {
            Ok(object) => Some(object.bind(&self.node.port, remaining)),
            Err(err) => Some(Err(err)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Map, Unpack};
    use streamgraph_engine::batch::BatchPipeline;
    use streamgraph_engine::Pipeline;

    #[test]
    fn agrees_before_and_after_a_batch_pipeline() {
        let matches = Port::new("matches");
        let matches_for_build = matches.clone();
        let mut before_port = None;
        let pipeline = Pipeline::build(|| {
            let _source = Unpack::build("n", (0..11i64).collect());
            let before = RemainingHint::build("before").port().clone();
            before_port = Some(before.clone());
            BatchPipeline::build(4, None, || {
                // inner pipeline: identity, nothing added.
            })
            .unwrap();
            let after = RemainingHint::build("after").port().clone();

            builder::bind_output(&matches_for_build);
            let matches_port = matches_for_build.clone();
            Map::build("check", move |object| {
                let before_val: &usize = object.get(&before)?;
                let after_val: &usize = object.get(&after)?;
                object.bind(&matches_port, before_val == after_val)
            });
        });
        let before_port = before_port.unwrap();

        let mut befores = Vec::new();
        for result in pipeline.transform_stream() {
            let object = result.unwrap();
            assert!(*object.get::<bool>(&matches).unwrap());
            befores.push(*object.get::<usize>(&before_port).unwrap());
        }

        // Not a disguised no-op: the hint must actually count down rather
        // than reporting the same (e.g. always-0) value for every object.
        assert_eq!(befores, (1..=11usize).rev().collect::<Vec<_>>());
    }
}
