// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! The node contract: a uniform interface for every unit-of-work stage in a
//! pipeline.

use crate::error::Error;
use crate::object::Object;
use std::fmt;
use std::sync::Arc;

/// A stream of objects.
///
/// Demand-driven and single-threaded by construction: the only suspension
/// points are wherever the consumer stops calling `next`. Sending one across
/// a [`crate::parallel::ParallelPipeline`] worker boundary requires `Send`,
/// which is why it is part of the alias rather than left to each call site.
pub type ObjectStream = Box<dyn Iterator<Item = Result<Object, Error>> + Send>;

/// A node's stable name, used in error messages and, inside a
/// [`crate::parallel::ParallelPipeline`], to identify which worker reported
/// a failure.
pub type NodeName = Arc<str>;

/// A stage with declared input/output ports, optional parameters fixed at
/// construction, and optional lifecycle hooks.
///
/// Implementers provide either [`Node::transform`] (the common case: pure
/// per-object work) or override [`Node::transform_stream`] directly, taking
/// full responsibility for ordering, lifecycle, and error propagation of
/// their sub-stream. The default `transform_stream` wraps `transform`,
/// invoking `before_stream` lazily on first pull and `after_stream` exactly
/// once, whether the stream runs to completion, errors out, or is dropped
/// early by the consumer.
pub trait Node: Send + Sync {
    /// Stable identifier for this node instance, used in error messages.
    fn name(&self) -> NodeName;

    /// Runs once, lazily, the first time this node's stream is pulled.
    fn before_stream(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Runs once, when this node's stream reaches its end, errors, or is
    /// dropped before either — but only if `before_stream` already ran.
    fn after_stream(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Pure per-object work: reads ports bound upstream, optionally adds new
    /// bindings, and returns the augmented object. The default
    /// `transform_stream` calls this once per input object (1:1).
    ///
    /// Implementers that need `before_stream`/`after_stream` bookkeeping
    /// beyond the default wrapping, or that are a source (0:N), a sink
    /// (N:0), or otherwise not 1:1, must override [`Node::transform_stream`]
    /// instead and may leave this unimplemented.
    fn transform(&self, object: Object) -> Result<Object, Error> {
        let _ = object;
        unimplemented!(
            "node `{}` must override either `transform` or `transform_stream`",
            self.name()
        )
    }

    /// The general form. Takes full responsibility for lifecycle and error
    /// propagation of the sub-stream it returns.
    fn transform_stream(self: Arc<Self>, input: ObjectStream) -> ObjectStream {
        Box::new(TransformNodeStream {
            node: self,
            input,
            started: false,
            finished: false,
        })
    }
}

/// Default `transform_stream` wrapper: lazily runs `before_stream` on first
/// pull, maps each input object through `transform`, and guarantees
/// `after_stream` runs exactly once no matter how the stream ends — on
/// normal exhaustion, on the first error, or because the consumer dropped it
/// early. The `Drop` impl is what makes the last case possible without every
/// caller remembering to close the stream explicitly.
struct TransformNodeStream {
    node: Arc<dyn Node>,
    input: ObjectStream,
    started: bool,
    finished: bool,
}

impl TransformNodeStream {
    fn finish(&mut self) {
        if self.started && !self.finished {
            self.finished = true;
            if let Err(err) = self.node.after_stream() {
                tracing::warn!(node = %self.node.name(), error = %err, "after_stream failed during teardown");
            }
        }
    }
}

impl Iterator for TransformNodeStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            if let Err(err) = self.node.before_stream() {
                self.finish();
                return Some(Err(err));
            }
        }
        match self.input.next() {
            None => {
                self.finish();
                None
            }
            Some(Err(err)) => {
                self.finish();
                Some(Err(err))
            }
            Some(Ok(object)) => match self.node.transform(object) {
                Ok(object) => Some(Ok(object)),
                Err(err) => {
                    self.finish();
                    Some(Err(err))
                }
            },
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // Ordinary nodes are 1:1, so the remaining-count contract a
        // RemainingHint node relies on (see crate::batch module docs) holds
        // for free: wrapping a node never changes how many objects are left.
        self.input.size_hint()
    }
}

impl Drop for TransformNodeStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for TransformNodeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformNodeStream")
            .field("node", &self.node.name())
            .field("started", &self.started)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Helper for nodes that override `transform_stream` themselves but still
/// want the same before/after bookkeeping this module gives ordinary nodes.
/// `BatchPipeline` and `ParallelPipeline` both use this so the rest of the
/// pipeline cannot tell a scope apart from an ordinary node by its lifecycle
/// behavior; it is `pub` (also re-exported at the crate root) so that
/// downstream node authors writing their own scope-rewriting nodes outside
/// this crate — such as `streamgraph-nodes`' `Unpack` and `RemainingHint`,
/// which override `transform_stream` to forward `size_hint` — can get the
/// same guarantee without reimplementing it.
pub fn wrap_with_lifecycle(
    node: Arc<dyn Node>,
    body: impl Iterator<Item = Result<Object, Error>> + Send + 'static,
) -> ObjectStream {
    Box::new(LifecycleStream {
        node,
        body: Box::new(body),
        started: false,
        finished: false,
    })
}

struct LifecycleStream {
    node: Arc<dyn Node>,
    body: ObjectStream,
    started: bool,
    finished: bool,
}

impl LifecycleStream {
    fn finish(&mut self) {
        if self.started && !self.finished {
            self.finished = true;
            if let Err(err) = self.node.after_stream() {
                tracing::warn!(node = %self.node.name(), error = %err, "after_stream failed during teardown");
            }
        }
    }
}

impl Iterator for LifecycleStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            if let Err(err) = self.node.before_stream() {
                self.finish();
                return Some(Err(err));
            }
        }
        match self.body.next() {
            None => {
                self.finish();
                None
            }
            Some(Err(err)) => {
                self.finish();
                Some(Err(err))
            }
            Some(Ok(object)) => Some(Ok(object)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.body.size_hint()
    }
}

impl Drop for LifecycleStream {
    fn drop(&mut self) {
        self.finish();
    }
}
