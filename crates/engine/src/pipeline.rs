// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! The ordinary stream executor: composes a scope's nodes in registration
//! order and drives objects through them lazily.

use crate::builder;
use crate::node::{Node, ObjectStream};
use std::sync::Arc;

/// A pipeline is a tree of scopes; this type is the outermost one (or, when
/// used as a [`crate::batch::BatchPipeline`] or
/// [`crate::parallel::ParallelPipeline`]'s inner sub-pipeline, a nested
/// scope reconstructed from the same closure).
///
/// Construction composes children in registration order:
/// `stream = nodes[0].transform_stream(stream)`, then each subsequent node
/// wraps the previous stream in turn. Iteration is demand-driven and
/// single-threaded; nothing runs until the outermost stream is pulled.
#[derive(Clone)]
pub struct Pipeline {
    nodes: Arc<Vec<Arc<dyn Node>>>,
}

impl Pipeline {
    /// Enters a fresh scope, runs `f` (which constructs nodes that
    /// ambiently register themselves against that scope), and freezes the
    /// resulting child list. Exiting does not execute anything; execution
    /// starts only when the returned pipeline's stream is pulled.
    #[must_use]
    pub fn build(f: impl FnOnce()) -> Pipeline {
        // `f` only ever needs to run once for an ordinary, outermost
        // pipeline, so we adapt it to the `Fn() + Send + Sync` shape
        // `builder::build_scope` shares with the scope-rewriting pipelines,
        // via a one-shot cell rather than requiring callers to write `Fn`
        // themselves for the common case.
        let cell = std::sync::Mutex::new(Some(f));
        let nodes = builder::build_scope(&move || {
            if let Some(f) = cell.lock().expect("build closure poisoned").take() {
                f();
            }
        });
        Pipeline {
            nodes: Arc::new(nodes),
        }
    }

    /// Builds a pipeline directly from an already-constructed node list.
    /// Used internally by scope-rewriting nodes (and available to tests)
    /// when a pipeline needs to be assembled without going through the
    /// ambient builder.
    #[must_use]
    pub(crate) fn from_nodes(nodes: Vec<Arc<dyn Node>>) -> Pipeline {
        Pipeline {
            nodes: Arc::new(nodes),
        }
    }

    /// The registered node count, mostly useful for tests and diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Composes every registered node into one closable, lazily-pulled
    /// stream of objects.
    #[must_use]
    pub fn transform_stream(&self) -> ObjectStream {
        self.transform_stream_from(Box::new(std::iter::empty()))
    }

    /// As [`Pipeline::transform_stream`], but seeds the chain with `input`
    /// instead of an empty stream. Used by a [`crate::batch::BatchPipeline`]
    /// to feed a single synthetic object through the inner pipeline, and by
    /// a [`crate::parallel::ParallelPipeline`] worker to feed its queue of
    /// incoming outer objects through the inner pipeline exactly once per
    /// worker lifetime.
    #[must_use]
    pub(crate) fn transform_stream_from(&self, input: ObjectStream) -> ObjectStream {
        let mut stream = input;
        for node in self.nodes.iter() {
            stream = node.clone().transform_stream(stream);
        }
        stream
    }

    /// Iterates the pipeline to exhaustion, discarding objects. The first
    /// error encountered aborts iteration and is returned.
    pub fn run(&self) -> Result<(), crate::error::Error> {
        for object in self.transform_stream() {
            object?;
        }
        Ok(())
    }
}

/// Replays `f` inside a fresh nested scope seeded with `seed`, producing an
/// independent [`Pipeline`] each call.
///
/// Shared by [`crate::batch::BatchPipeline`] (which calls this once, since
/// it only ever runs on the construction thread) and
/// [`crate::parallel::ParallelPipeline`] (which calls this once per worker
/// thread, giving each worker its own private deep copy of the inner
/// pipeline rather than sharing node state across threads). `seed` is the
/// bound-port set captured from the enclosing scope at `build` time: `f`
/// here is replayed lazily, long after (and, for a worker thread, somewhere
/// other than) the scope that originally enclosed it, so it cannot rely on
/// the live builder stack to tell it what the outer pipeline already bound.
pub(crate) fn build_nested_seeded(
    seed: std::collections::HashSet<crate::port::PortId>,
    f: &(dyn Fn() + Send + Sync),
) -> Pipeline {
    Pipeline::from_nodes(crate::builder::build_scope_seeded(seed, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder;
    use crate::error::Error;
    use crate::object::Object;
    use crate::port::Port;

    /// A minimal 0:N source emitting one object per element of `values`,
    /// local to this test module so pipeline-level tests don't need to
    /// depend on the `streamgraph-nodes` crate (which depends on this one).
    struct Source {
        port: Port,
        values: Vec<i64>,
    }

    impl Node for Source {
        fn name(&self) -> NodeName {
            Arc::from("Source")
        }

        fn transform_stream(self: Arc<Self>, _input: ObjectStream) -> ObjectStream {
            let port = self.port.clone();
            Box::new(
                self.values
                    .clone()
                    .into_iter()
                    .map(move |v| Object::empty().bind(&port, v)),
            )
        }
    }

    struct Inc {
        input: Port,
        output: Port,
    }

    impl Node for Inc {
        fn name(&self) -> NodeName {
            Arc::from("Inc")
        }

        fn transform(&self, object: Object) -> Result<Object, Error> {
            let v = *object.get::<i64>(&self.input)?;
            object.bind(&self.output, v + 1)
        }
    }

    #[test]
    fn empty_pipeline_runs_cleanly() {
        let pipeline = Pipeline::build(|| {});
        assert!(pipeline.is_empty());
        pipeline.run().unwrap();
    }

    #[test]
    fn nodes_compose_in_registration_order_and_values_flow_through() {
        let b = Port::new("b");
        let b_for_build = b.clone();
        let pipeline = Pipeline::build(move || {
            let a = Port::new("a");
            builder::bind_output(&a);
            builder::register(Arc::new(Source {
                port: a.clone(),
                values: vec![1, 2, 3],
            }));

            builder::require_input("Inc", &a).unwrap();
            builder::bind_output(&b_for_build);
            builder::register(Arc::new(Inc {
                input: a,
                output: b_for_build,
            }));
        });
        assert_eq!(pipeline.len(), 2);

        let collected: Vec<i64> = pipeline
            .transform_stream()
            .map(|o| *o.unwrap().get::<i64>(&b).unwrap())
            .collect();
        assert_eq!(collected, vec![2, 3, 4]);
    }
}
