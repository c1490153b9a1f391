// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! `BatchPipeline`: lets an inner sub-pipeline operate on groups of objects
//! while the surrounding stream remains one-object-at-a-time.
//!
//! Every port bound upstream of the scope is, inside the scope, presented on
//! one synthetic object as a sequence whose `i`-th element is the value from
//! the `i`-th object of the batch — the port identity is unchanged, only the
//! shape of the value observed through it. When `groupby` is set, that one
//! port stays scalar (it identifies the group) while every other upstream
//! port is still rewritten to a sequence.
//!
//! A new port the inner pipeline binds on the synthetic object is scattered
//! back onto the individual egress objects, one element per object, if it is
//! a sequence binding of exactly the batch's actual size; any scalar binding
//! (or, degenerately, a sequence of any other length is rejected rather than
//! silently broadcast — see [`crate::error::Error::BatchScatterLengthMismatch`])
//! is instead broadcast unchanged onto every object in the batch.

use crate::builder;
use crate::error::Error;
use crate::key::{self, Key};
use crate::node::{self, Node, NodeName, ObjectStream};
use crate::object::Object;
use crate::pipeline::{self, Pipeline};
use crate::port::{Port, PortId};
use std::sync::Arc;

/// See the module documentation for the batching and scatter/broadcast
/// contract this node implements.
pub struct BatchPipeline {
    name: NodeName,
    batch_size: usize,
    groupby: Option<Port>,
    factory: Arc<dyn Fn() -> Pipeline + Send + Sync>,
}

impl BatchPipeline {
    /// Enters a nested scope, runs `f` to construct the inner sub-pipeline,
    /// and registers the resulting scope as one node of the enclosing
    /// pipeline.
    ///
    /// # Errors
    /// [`Error::InvalidBatchSize`] if `batch_size` is zero. [`Error::UnboundPort`]
    /// if `groupby` references a port not bound by an ancestor node, or if
    /// `f` itself reads a port no ancestor node bound — checked eagerly here
    /// (and not only when the scope is first replayed) so a bad inner
    /// pipeline fails at construction rather than on the first batch.
    pub fn build(
        batch_size: usize,
        groupby: Option<Port>,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Result<Arc<BatchPipeline>, Error> {
        if batch_size == 0 {
            return Err(Error::InvalidBatchSize);
        }
        let name: NodeName = Arc::from("BatchPipeline");
        if let Some(port) = &groupby {
            builder::require_input(name.clone(), port)?;
        }
        // `f` is replayed later, lazily, on the first batch — long after
        // this scope has been exited — so it cannot rely on the live
        // builder stack to see what the enclosing scope bound. Seed it
        // explicitly with a snapshot taken now, while the enclosing scope is
        // still on the stack.
        let seed = builder::current_bound_ports();
        let factory: Arc<dyn Fn() -> Pipeline + Send + Sync> = {
            let f = Arc::new(f);
            let seed = seed.clone();
            Arc::new(move || pipeline::build_nested_seeded(seed.clone(), &*f))
        };
        // Run the inner scope once now so an unbound-port error in `f`
        // surfaces synchronously from `build`, not from the first call to
        // `run_batch`.
        factory();
        let node = Arc::new(BatchPipeline {
            name,
            batch_size,
            groupby,
            factory,
        });
        builder::register(node.clone());
        Ok(node)
    }

    fn run_batch(&self, chunk: &[Object]) -> Result<Vec<Object>, Error> {
        debug_assert!(!chunk.is_empty());
        let actual_size = chunk.len();

        // Every port the first object in the chunk carries is an upstream
        // port; the whole batch is assumed to share the same schema, which
        // holds for any stream produced by this engine (invariant: a node's
        // output ports are fixed at construction).
        let upstream_ports: Vec<PortId> = chunk[0].bound_ports().collect();

        let mut synthetic = Object::empty();
        for port_id in &upstream_ports {
            let is_groupby = self
                .groupby
                .as_ref()
                .is_some_and(|g| g.id() == *port_id);
            if is_groupby {
                let value = chunk[0]
                    .raw_scalar(*port_id)
                    .ok_or(Error::MissingBinding { port: *port_id })?;
                synthetic = synthetic.raw_insert_scalar(*port_id, value);
            } else {
                let mut values = Vec::with_capacity(actual_size);
                for object in chunk {
                    values.push(
                        object
                            .raw_scalar(*port_id)
                            .ok_or(Error::MissingBinding { port: *port_id })?,
                    );
                }
                synthetic = synthetic.raw_insert_sequence(*port_id, values);
            }
        }

        let inner = (self.factory)();
        let mut results = inner
            .transform_stream_from(Box::new(std::iter::once(Ok(synthetic))))
            .collect::<Vec<_>>();
        if results.len() != 1 {
            // The inner pipeline is 1:1 over a single synthetic object, the
            // same contract an ordinary node has over any one object; a
            // scope whose nodes fan out or drop the synthetic object is a
            // construction error in the inner pipeline, not something this
            // scope can repair.
            return Err(Error::BatchInnerObjectCountMismatch {
                node: self.name.clone(),
                got: results.len(),
            });
        }
        let synthetic_out = results.remove(0)?;

        let new_ports: Vec<PortId> = synthetic_out
            .bound_ports()
            .filter(|p| !upstream_ports.contains(p))
            .collect();

        let mut egress: Vec<Object> = chunk.to_vec();
        for port_id in new_ports {
            let is_sequence = synthetic_out
                .raw_binding_is_sequence(port_id)
                .expect("port was just reported as bound");
            if is_sequence {
                let values = synthetic_out
                    .raw_sequence(port_id)
                    .expect("binding reported as sequence");
                if values.len() != actual_size {
                    return Err(Error::BatchScatterLengthMismatch {
                        node: self.name.clone(),
                        port: port_id,
                        got: values.len(),
                        expected: actual_size,
                    });
                }
                for (object, value) in egress.iter_mut().zip(values.iter()) {
                    *object = object.raw_insert_scalar(port_id, value.clone());
                }
            } else {
                let value = synthetic_out
                    .raw_scalar(port_id)
                    .expect("binding reported as scalar");
                for object in egress.iter_mut() {
                    *object = object.raw_insert_scalar(port_id, value.clone());
                }
            }
        }

        Ok(egress)
    }
}

impl Node for BatchPipeline {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform_stream(self: Arc<Self>, input: ObjectStream) -> ObjectStream {
        let body: ObjectStream = if let Some(groupby) = self.groupby.clone() {
            Box::new(GroupedBatchStream {
                scope: self,
                groupby,
                input,
                pending: None,
                ready: Vec::new().into_iter(),
                done: false,
            })
        } else {
            Box::new(FixedBatchStream {
                scope: self,
                input,
                ready: Vec::new().into_iter(),
                done: false,
            })
        };
        // `transform_stream` takes `self: Arc<Self>` by value, but the
        // lifecycle wrapper also needs an `Arc<dyn Node>` to invoke
        // `before_stream`/`after_stream` on. `BatchPipeline` has no lifecycle
        // hooks of its own (the batching buffer is the only state, and it
        // lives entirely in the stream wrappers above), so we hand it a
        // `NoopLifecycle` carrying just the name rather than threading a
        // second `Arc<Self>` through every stream wrapper for a no-op.
        let lifecycle: Arc<dyn Node> = Arc::new(NoopLifecycle {
            name: Arc::from("BatchPipeline"),
        });
        node::wrap_with_lifecycle(lifecycle, body)
    }
}

struct NoopLifecycle {
    name: NodeName,
}

impl Node for NoopLifecycle {
    fn name(&self) -> NodeName {
        self.name.clone()
    }
}

struct FixedBatchStream {
    scope: Arc<BatchPipeline>,
    input: ObjectStream,
    ready: std::vec::IntoIter<Result<Object, Error>>,
    done: bool,
}

impl Iterator for FixedBatchStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.next() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            let mut chunk = Vec::with_capacity(self.scope.batch_size);
            for _ in 0..self.scope.batch_size {
                match self.input.next() {
                    Some(Ok(object)) => chunk.push(object),
                    Some(Err(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    None => break,
                }
            }
            if chunk.is_empty() {
                self.done = true;
                return None;
            }
            if chunk.len() < self.scope.batch_size {
                self.done = true;
            }
            match self.scope.run_batch(&chunk) {
                Ok(objects) => {
                    self.ready = objects.into_iter().map(Ok).collect::<Vec<_>>().into_iter();
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // A batch regroups objects but never changes their count: one
        // object in eventually becomes exactly one object out. So the
        // remaining count at this scope is whatever is already buffered in
        // `ready` plus however many the upstream still has left. This is
        // what lets a `RemainingHint` node placed after a `BatchPipeline`
        // agree with one placed before it.
        let (lo, hi) = self.input.size_hint();
        let ready = self.ready.len();
        (ready + lo, hi.map(|h| ready + h))
    }
}

struct GroupedBatchStream {
    scope: Arc<BatchPipeline>,
    groupby: Port,
    input: ObjectStream,
    pending: Option<(Key, Object)>,
    ready: std::vec::IntoIter<Result<Object, Error>>,
    done: bool,
}

impl GroupedBatchStream {
    fn key_of(&self, object: &Object) -> Result<Key, Error> {
        let raw = object
            .raw_scalar(self.groupby.id())
            .ok_or(Error::MissingBinding {
                port: self.groupby.id(),
            })?;
        key::extract(&raw).ok_or(Error::UnsupportedGroupKeyType {
            port: self.groupby.id(),
        })
    }
}

impl Iterator for GroupedBatchStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.next() {
                return Some(item);
            }
            if self.done {
                return None;
            }

            let mut chunk: Vec<Object> = Vec::new();
            let mut current_key: Option<Key> = None;

            if let Some((key, object)) = self.pending.take() {
                current_key = Some(key);
                chunk.push(object);
            }

            loop {
                if chunk.len() == self.scope.batch_size {
                    break;
                }
                match self.input.next() {
                    None => {
                        self.done = true;
                        break;
                    }
                    Some(Err(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    Some(Ok(object)) => {
                        let key = match self.key_of(&object) {
                            Ok(k) => k,
                            Err(err) => {
                                self.done = true;
                                return Some(Err(err));
                            }
                        };
                        match &current_key {
                            None => {
                                current_key = Some(key);
                                chunk.push(object);
                            }
                            Some(k) if *k == key => {
                                chunk.push(object);
                            }
                            Some(_) => {
                                // Key changed: the object we just pulled
                                // starts the next batch, not this one.
                                self.pending = Some((key, object));
                                break;
                            }
                        }
                    }
                }
            }

            if chunk.is_empty() {
                return None;
            }
            match self.scope.run_batch(&chunk) {
                Ok(objects) => {
                    self.ready = objects.into_iter().map(Ok).collect::<Vec<_>>().into_iter();
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lo, hi) = self.input.size_hint();
        let buffered = self.ready.len() + usize::from(self.pending.is_some());
        (buffered + lo, hi.map(|h| buffered + h))
    }
}
