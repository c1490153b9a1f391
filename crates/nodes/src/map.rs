// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! `Map`: the common case of a node whose entire job is one closure over an
//! object.
//!
//! Most pipelines never need a dedicated `struct` for a per-object
//! transform; `Map` exists so they don't have to write one just to bind a
//! port computed from a closure.

use streamgraph_engine::{builder, Error, Node, NodeName, Object};
use std::sync::Arc;

/// A node that applies a boxed closure to every object it sees, via the
/// default [`Node::transform`] wrapping (1:1, lifecycle hooks are no-ops).
pub struct Map {
    name: NodeName,
    f: Box<dyn Fn(&Object) -> Result<Object, Error> + Send + Sync>,
}

impl Map {
    /// Registers a `Map` node with the ambient scope.
    ///
    /// `f` receives the object as seen so far and returns the object with
    /// whatever new bindings it adds; it is responsible for calling
    /// [`streamgraph_engine::Object::bind`] (or `bind_seq`, inside a batch)
    /// itself, so this constructor does not take a port list: callers that
    /// want build-time port validation should call
    /// [`streamgraph_engine::builder::bind_output`] /
    /// [`streamgraph_engine::builder::require_input`] directly before
    /// calling [`Map::build`].
    #[must_use]
    pub fn build(
        name: &'static str,
        f: impl Fn(&Object) -> Result<Object, Error> + Send + Sync + 'static,
    ) -> Arc<Map> {
        let node = Arc::new(Map {
            name: Arc::from(name),
            f: Box::new(f),
        });
        builder::register(node.clone());
        node
    }
}

impl Node for Map {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform(&self, object: Object) -> Result<Object, Error> {
        (self.f)(&object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Unpack;
    use streamgraph_engine::Pipeline;
    use streamgraph_engine::Port;

    #[test]
    fn binds_a_new_port_from_an_upstream_one() {
        let doubled = Port::new("doubled");
        let doubled_for_map = doubled.clone();
        let pipeline = Pipeline::build(move || {
            let source = Unpack::build("a", vec![1i64, 2, 3]);
            let a = source.port().clone();
            builder::bind_output(&doubled_for_map);
            let doubled = doubled_for_map.clone();
            Map::build("Map(double)", move |object| {
                let v: &i64 = object.get(&a)?;
                object.bind(&doubled, v * 2)
            });
        });
        let out: Vec<i64> = pipeline
            .transform_stream()
            .map(|o| *o.unwrap().get::<i64>(&doubled).unwrap())
            .collect();
        assert_eq!(out, vec![2, 4, 6]);
    }
}
