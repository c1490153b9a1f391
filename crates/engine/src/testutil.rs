// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! Test-only helpers shared by this crate's own tests and by downstream
//! crates that build on the engine (enabled via the `test-utils` feature).
//!
//! Keeping these in the crate itself, rather than copy-pasted into every
//! test module, is what lets `streamgraph-nodes` exercise real sink
//! behavior (a node that is genuinely N:0, not a 1:1 node that happens to
//! discard its output) without depending on an extra crate just for tests.

use crate::error::Error;
use crate::node::{self, Node, NodeName, ObjectStream};
use crate::object::Object;
use crate::port::Port;
use parking_lot::Mutex;
use std::sync::Arc;

/// A deterministic source binding one element of a fixed list per object,
/// with the same fan-out behavior `streamgraph-nodes`' `Unpack` gives
/// downstream crates: used at the top of an ordinary pipeline it is an
/// ordinary 0:N source; used at the top of a
/// [`crate::parallel::ParallelPipeline`]'s inner pipeline, each incoming
/// outer object is expanded into one object per list element, which is
/// what this crate's own tests for the "nested sources fan out" contract
/// (§4.6 of the specification) exercise without depending on the nodes
/// crate (which depends on this one).
pub struct ListSource {
    port: Port,
    values: Vec<i64>,
}

impl ListSource {
    /// Registers a `ListSource` with the ambient scope, declaring `port` as
    /// its output.
    #[must_use]
    pub fn build(port: Port, values: Vec<i64>) -> Arc<ListSource> {
        crate::builder::bind_output(&port);
        let node = Arc::new(ListSource { port, values });
        crate::builder::register(node.clone());
        node
    }
}

impl Node for ListSource {
    fn name(&self) -> NodeName {
        Arc::from("ListSource")
    }

    fn transform_stream(self: Arc<Self>, input: ObjectStream) -> ObjectStream {
        node::wrap_with_lifecycle(self.clone(), Box::new(ListSourceStream {
            node: self,
            input,
            current: None,
            saw_input: false,
            used_implicit_base: false,
        }))
    }
}

struct ListSourceStream {
    node: Arc<ListSource>,
    input: ObjectStream,
    current: Option<(Object, usize)>,
    saw_input: bool,
    used_implicit_base: bool,
}

impl Iterator for ListSourceStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((base, idx)) = &mut self.current {
                if *idx >= self.node.values.len() {
                    self.current = None;
                    continue;
                }
                let value = self.node.values[*idx];
                *idx += 1;
                return Some(base.bind(&self.node.port, value));
            }
            match self.input.next() {
                Some(Ok(object)) => {
                    self.saw_input = true;
                    if self.node.values.is_empty() {
                        continue;
                    }
                    self.current = Some((object, 0));
                }
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    if !self.saw_input && !self.used_implicit_base {
                        self.used_implicit_base = true;
                        if self.node.values.is_empty() {
                            return None;
                        }
                        self.current = Some((Object::empty(), 0));
                        continue;
                    }
                    return None;
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let values_len = self.node.values.len();
        if let Some((_, idx)) = &self.current {
            let left = values_len - idx;
            let (in_lo, in_hi) = self.input.size_hint();
            let lo = left.saturating_add(in_lo.saturating_mul(values_len));
            let hi = in_hi.map(|h| left.saturating_add(h.saturating_mul(values_len)));
            return (lo, hi);
        }
        if self.used_implicit_base {
            return (0, Some(0));
        }
        let (in_lo, in_hi) = self.input.size_hint();
        if in_lo == 0 && in_hi == Some(0) {
            return (values_len, Some(values_len));
        }
        (
            in_lo.saturating_mul(values_len),
            in_hi.map(|h| h.saturating_mul(values_len)),
        )
    }
}

/// A terminal sink that consumes every object it sees into a shared `Vec`
/// and emits nothing, matching the specification's N:0 sink shape.
///
/// Clone the returned [`Arc<CollectSink>`] before registering it with a
/// scope (the builder takes ownership of one clone) so the test retains a
/// handle to read back [`CollectSink::collected`] after the pipeline runs.
pub struct CollectSink {
    name: NodeName,
    collected: Mutex<Vec<Object>>,
}

impl CollectSink {
    /// Registers a `CollectSink` with the ambient scope.
    #[must_use]
    pub fn build() -> Arc<CollectSink> {
        let node = Arc::new(CollectSink {
            name: Arc::from("CollectSink"),
            collected: Mutex::new(Vec::new()),
        });
        crate::builder::register(node.clone());
        node
    }

    /// Every object the sink has consumed so far, in arrival order.
    #[must_use]
    pub fn collected(&self) -> Vec<Object> {
        self.collected.lock().clone()
    }
}

impl Node for CollectSink {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform_stream(self: Arc<Self>, input: ObjectStream) -> ObjectStream {
        crate::node::wrap_with_lifecycle(
            self.clone(),
            Box::new(CollectSinkStream { node: self, input }),
        )
    }
}

struct CollectSinkStream {
    node: Arc<CollectSink>,
    input: ObjectStream,
}

impl Iterator for CollectSinkStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.input.next()? {
                Ok(object) => self.node.collected.lock().push(object),
                Err(err) => return Some(Err(err)),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(0))
    }
}
