// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! Fault-injection nodes used to exercise the engine's failure-propagation
//! paths: [`Raise`] (a node that always fails) and [`Kill`] (a node that
//! terminates its own worker without reporting, standing in for a process
//! killed by a signal in the specification's worker-death scenario).

use streamgraph_engine::{builder, Error, Node, NodeName, Object};
use std::fmt;
use std::sync::Arc;

/// The error [`Raise`] wraps, so a consumer matching on `source()` through
/// [`streamgraph_engine::Error::Node`] sees the original message rather than
/// a generic string.
#[derive(Debug, Clone)]
pub struct RaisedError(pub String);

impl fmt::Display for RaisedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RaisedError {}

/// A node whose `transform` always fails with a fixed message, wrapped in
/// [`streamgraph_engine::Error::Node`]. Used to exercise "worker raises"
/// (§8 scenario 4 of the specification): the error's kind must survive
/// whatever scope the node sits inside, including a worker thread boundary.
pub struct Raise {
    name: NodeName,
    message: String,
}

impl Raise {
    /// Registers a `Raise` node with the ambient scope. Every object it
    /// sees fails with `message`.
    #[must_use]
    pub fn build(message: impl Into<String>) -> Arc<Raise> {
        let node = Arc::new(Raise {
            name: Arc::from("Raise"),
            message: message.into(),
        });
        builder::register(node.clone());
        node
    }
}

impl Node for Raise {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform(&self, _object: Object) -> Result<Object, Error> {
        Err(Error::node(self.name(), RaisedError(self.message.clone())))
    }
}

/// A node that terminates its own worker thread by panicking, without
/// reporting a result for the object it was handed — this engine's
/// translation of a worker process killing itself with `SIGKILL` (§8
/// scenario 5). Outside a [`streamgraph_engine::parallel::ParallelPipeline`]
/// the panic simply unwinds the calling thread, same as any other panic.
pub struct Kill {
    name: NodeName,
}

impl Kill {
    /// Registers a `Kill` node with the ambient scope.
    #[must_use]
    pub fn build() -> Arc<Kill> {
        let node = Arc::new(Kill {
            name: Arc::from("Kill"),
        });
        builder::register(node.clone());
        node
    }
}

impl Node for Kill {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform(&self, _object: Object) -> Result<Object, Error> {
        panic!("Kill node terminated its worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Unpack;
    use streamgraph_engine::Pipeline;

    #[test]
    fn raise_fails_every_object_with_the_given_message() {
        let pipeline = Pipeline::build(|| {
            Unpack::build("n", vec![1i64, 2, 3]);
            Raise::build("boom");
        });
        let err = pipeline.run().unwrap_err();
        assert!(format!("{err}").contains("boom"));
    }

    #[test]
    fn raise_never_runs_when_no_objects_reach_it() {
        let pipeline = Pipeline::build(|| {
            Unpack::<i64>::build("n", vec![]);
            Raise::build("should not matter");
        });
        pipeline.run().unwrap();
    }

    #[test]
    #[should_panic(expected = "Kill node terminated its worker")]
    fn kill_panics_the_calling_thread() {
        let pipeline = Pipeline::build(|| {
            Unpack::build("n", vec![1i64]);
            Kill::build();
        });
        let _ = pipeline.run();
    }
}
