// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the dataflow engine.
//!
//! Every error that can surface while building or running a pipeline is
//! collected here so that a consumer can match on `kind()` regardless of
//! which node, scope, or worker produced it. Build errors are raised
//! synchronously from the scope-registration primitives in [`crate::builder`];
//! everything else is only ever observed from a pulled [`crate::node::ObjectStream`].

use crate::node::NodeName;
use crate::port::PortId;
use std::fmt;
use std::sync::Arc;

/// A boxed, cloneable node-level error.
///
/// Node authors return any `std::error::Error + Send + Sync` from
/// [`crate::node::Node::transform`]; we box it once here so the error can be
/// cloned into a worker-thread result message and still answer `source()`
/// queries at the consumer. Cloning an `Arc` is cheap, which matters because
/// the same [`Error`] may be inspected by the reorder buffer and by every
/// node between the failure point and the outermost scope as the stream
/// tears down.
#[derive(Clone)]
pub struct NodeError(pub(crate) Arc<dyn std::error::Error + Send + Sync>);

impl NodeError {
    /// Wraps an arbitrary error raised by a node's `transform`.
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self(Arc::new(err))
    }

    /// The original error's `Display` rendering, preserved across thread and
    /// (conceptually) process boundaries. This is what the error taxonomy in
    /// the specification calls the error's "kind": callers cannot downcast an
    /// `Arc<dyn Error>` that was reconstructed after crossing a boundary, so
    /// the message is the stable discriminator consumers are expected to
    /// match on.
    #[must_use]
    pub fn message(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Debug for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Every error the engine can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A node referenced a port that was never declared by an ancestor node
    /// in the enclosing scope chain. Raised synchronously at construction.
    #[error("port `{port}` read by node `{reader}` was never bound by an ancestor node in scope")]
    UnboundPort {
        /// The port that could not be resolved.
        port: PortId,
        /// The node that attempted to read it.
        reader: NodeName,
    },

    /// A node attempted to bind a port that some upstream node, or the node
    /// itself earlier in the same object's lifetime, already bound.
    #[error("port `{port}` is already bound on this object")]
    PortAlreadyBound {
        /// The port that was bound twice.
        port: PortId,
    },

    /// A port was read from an object but carries no binding at all.
    #[error("port `{port}` has no value on this object")]
    MissingBinding {
        /// The port that was expected to be bound.
        port: PortId,
    },

    /// A port's bound value could not be downcast to the requested type, or
    /// was bound as a scalar where a sequence view was expected (or vice
    /// versa).
    #[error("port `{port}` is bound with a different shape or type than requested")]
    TypeMismatch {
        /// The port whose binding did not match.
        port: PortId,
    },

    /// [`crate::batch::BatchPipeline`] was constructed with a `batch_size` of
    /// zero.
    #[error("batch_size must be a positive integer, got 0")]
    InvalidBatchSize,

    /// [`crate::parallel::ParallelPipeline`] was constructed with
    /// `num_workers` of zero.
    #[error("num_workers must be a positive integer, got 0")]
    InvalidWorkerCount,

    /// An inner node of a [`crate::batch::BatchPipeline`] bound a sequence
    /// whose length did not match the batch's actual size; per the
    /// scatter/broadcast contract this is ambiguous rather than a broadcast,
    /// so it is rejected.
    #[error(
        "node `{node}` bound port `{port}` with a sequence of length {got}, \
         but the current batch has {expected} objects"
    )]
    BatchScatterLengthMismatch {
        /// The node that produced the mismatched sequence.
        node: NodeName,
        /// The offending port.
        port: PortId,
        /// The sequence length the node actually produced.
        got: usize,
        /// The batch's actual object count.
        expected: usize,
    },

    /// The inner pipeline of a [`crate::batch::BatchPipeline`] did not
    /// produce exactly one synthetic object for the one it was given: it is
    /// 1:1 over that single object, the same contract an ordinary node has,
    /// and a scope whose inner nodes fan out or drop it is a construction
    /// error the batch scope cannot repair.
    #[error(
        "inner pipeline of `{node}` produced {got} objects for one batch, expected exactly 1"
    )]
    BatchInnerObjectCountMismatch {
        /// The batch scope.
        node: NodeName,
        /// How many objects the inner pipeline actually produced.
        got: usize,
    },

    /// A `groupby` port was bound with a value whose type the engine does
    /// not know how to use as a group key.
    #[error("groupby port `{port}` is bound with a type that cannot be used as a group key")]
    UnsupportedGroupKeyType {
        /// The `groupby` port.
        port: PortId,
    },

    /// An error raised from inside a node's `transform` or `transform_stream`.
    /// Tears down the stream: every node that had `before_stream` invoked
    /// still receives a best-effort `after_stream` call as the pipeline
    /// unwinds.
    #[error("node `{node}` failed: {source}")]
    Node {
        /// The node that raised the error.
        node: NodeName,
        /// The underlying error.
        #[source]
        source: NodeError,
    },

    /// A worker thread inside a [`crate::parallel::ParallelPipeline`]
    /// terminated without reporting a result for work it had already
    /// accepted (a panic, in the Rust translation of "processes" the
    /// specification describes). Names the worker index and, when available,
    /// the panic payload.
    #[error("worker {index} died unexpectedly: {cause}")]
    WorkerDied {
        /// Index of the worker, in `0..num_workers`.
        index: usize,
        /// Best-effort description of why the worker thread ended.
        cause: String,
    },
}

impl Error {
    /// Wraps `err`, raised by `node`'s `transform` or `transform_stream`,
    /// as the engine's node-runtime error variant.
    ///
    /// Node authors call this from `transform` to turn their own error type
    /// into the `Result<Object, Error>` the [`crate::node::Node`] contract
    /// requires; the original error's `kind` (its `Display` rendering,
    /// since that is what survives a worker-thread boundary) stays
    /// inspectable through [`Error::Node`]'s `source`.
    #[must_use]
    pub fn node(node: NodeName, err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Node {
            node,
            source: NodeError::new(err),
        }
    }
}
