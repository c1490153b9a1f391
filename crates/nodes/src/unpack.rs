// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! `Unpack`: a deterministic source that emits one object per element of a
//! fixed, constructor-time list.
//!
//! Used at the top of an ordinary pipeline, it is an ordinary 0:N source.
//! Used at the top of a [`streamgraph_engine::parallel::ParallelPipeline`]'s
//! inner sub-pipeline, the same behavior becomes the fan-out the
//! specification calls for: a worker replays this node's constructor once
//! per worker (the list is captured by value, so every worker's copy is
//! identical), and each incoming outer object is expanded into one object
//! per list element, carrying the outer object's own bindings forward.
//! Nesting two `Unpack`s (one outer, one inside a `ParallelPipeline`)
//! therefore observably produces the cartesian product of the two lists.

use streamgraph_engine::node::{self, Node, NodeName, ObjectStream};
use streamgraph_engine::{builder, Error, Object, Port};
use std::sync::Arc;

/// See the module documentation.
pub struct Unpack<T> {
    name: NodeName,
    port: Port,
    values: Vec<T>,
}

impl<T: Clone + Send + Sync + 'static> Unpack<T> {
    /// Registers an `Unpack` node with the ambient scope. `port_name` names
    /// the output port each produced object carries one `values` element
    /// under.
    #[must_use]
    pub fn build(port_name: &'static str, values: Vec<T>) -> Arc<Unpack<T>> {
        let port = Port::new(port_name);
        builder::bind_output(&port);
        let node = Arc::new(Unpack {
            name: Arc::from(format!("Unpack({port_name})").as_str()),
            port,
            values,
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

impl<T: Clone + Send + Sync + 'static> Node for Unpack<T> {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform_stream(self: Arc<Self>, input: ObjectStream) -> ObjectStream {
        node::wrap_with_lifecycle(
            self.clone(),
            Box::new(UnpackStream {
                node: self,
                input,
                current: None,
                saw_input: false,
                used_implicit_base: false,
            }),
        )
    }
}

struct UnpackStream<T> {
    node: Arc<Unpack<T>>,
    input: ObjectStream,
    current: Option<(Object, usize)>,
    saw_input: bool,
    used_implicit_base: bool,
}

impl<T: Clone + Send + Sync + 'static> Iterator for UnpackStream<T> {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((base, idx)) = &mut self.current {
                if *idx >= self.node.values.len() {
                    self.current = None;
                    continue;
                }
                let value = self.node.values[*idx].clone();
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
                    // No upstream object arrived: this is an ordinary
                    // top-level source, expand once from an empty base.
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
            // Mid-expansion: at least the rest of this one, plus whatever
            // further upstream objects (each worth up to one more full
            // expansion) are still to come.
            let left = values_len - idx;
            let (in_lo, in_hi) = self.input.size_hint();
            let lo = left.saturating_add(in_lo.saturating_mul(values_len));
            let hi = in_hi.map(|h| left.saturating_add(h.saturating_mul(values_len)));
            return (lo, hi);
        }
        if self.used_implicit_base {
            // The one-shot top-level expansion (if any) has already run to
            // completion; nothing more will ever be produced.
            return (0, Some(0));
        }
        let (in_lo, in_hi) = self.input.size_hint();
        if in_lo == 0 && in_hi == Some(0) {
            // Upstream is guaranteed empty: this is the ordinary top-level
            // source case, and exactly one implicit expansion of `values`
            // follows.
            return (values_len, Some(values_len));
        }
        (
            in_lo.saturating_mul(values_len),
            in_hi.map(|h| h.saturating_mul(values_len)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgraph_engine::Pipeline;

    #[test]
    fn standalone_source_emits_one_object_per_value() {
        let mut port = None;
        let pipeline = Pipeline::build(|| {
            port = Some(Unpack::build("a", vec![10i64, 20, 30]).port().clone());
        });
        let port = port.unwrap();
        let out: Vec<i64> = pipeline
            .transform_stream()
            .map(|o| *o.unwrap().get::<i64>(&port).unwrap())
            .collect();
        assert_eq!(out, vec![10, 20, 30]);
    }

    #[test]
    fn nested_unpack_produces_the_cartesian_product_in_order() {
        let mut outer_port = None;
        let mut inner_port = None;
        let pipeline = Pipeline::build(|| {
            let outer = Unpack::build("level1", vec![1i64, 2]);
            outer_port = Some(outer.port().clone());
            let inner = Unpack::build("level2", vec!["a".to_string(), "b".to_string(), "c".to_string()]);
            inner_port = Some(inner.port().clone());
        });
        let outer_port = outer_port.unwrap();
        let inner_port = inner_port.unwrap();

        let pairs: Vec<(i64, String)> = pipeline
            .transform_stream()
            .map(|o| {
                let o = o.unwrap();
                (
                    *o.get::<i64>(&outer_port).unwrap(),
                    o.get::<String>(&inner_port).unwrap().clone(),
                )
            })
            .collect();

        assert_eq!(
            pairs,
            vec![
                (1, "a".to_string()),
                (1, "b".to_string()),
                (1, "c".to_string()),
                (2, "a".to_string()),
                (2, "b".to_string()),
                (2, "c".to_string()),
            ]
        );
    }

    #[test]
    fn empty_values_list_produces_no_objects() {
        let mut port = None;
        let pipeline = Pipeline::build(|| {
            port = Some(Unpack::<i64>::build("a", vec![]).port().clone());
        });
        let port = port.unwrap();
        let out: Vec<i64> = pipeline
            .transform_stream()
            .map(|o| *o.unwrap().get::<i64>(&port).unwrap())
            .collect();
        assert!(out.is_empty());
    }
}
