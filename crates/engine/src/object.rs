// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! Objects: finite, immutable-from-a-node's-viewpoint mappings from port to
//! value, flowing one at a time through a stream.

use crate::error::Error;
use crate::port::{Port, PortId};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A type-erased value bound to a port.
///
/// Values are `Any + Send + Sync` so that an [`Object`] can cross the worker
/// thread boundary inside a [`crate::parallel::ParallelPipeline`] without
/// every node needing to agree on a single concrete payload type up front.
type AnyValue = Arc<dyn Any + Send + Sync>;

/// The two shapes a port's value can take. Outside a
/// [`crate::batch::BatchPipeline`] every binding is a [`Binding::Scalar`];
/// inside one, upstream ports are rewritten to [`Binding::Sequence`] (see
/// module docs on `crate::batch`) while the port identity stays the same.
#[derive(Clone)]
enum Binding {
    Scalar(AnyValue),
    Sequence(Arc<Vec<AnyValue>>),
}

/// A finite mapping from [`Port`] to value, immutable from the point of view
/// of bindings already present: [`Object::bind`] and [`Object::bind_seq`]
/// return a new `Object` rather than mutating in place, and both refuse to
/// overwrite a port that is already bound (invariant: no port is bound twice
/// on the same object).
///
/// Cloning an `Object` is cheap: the backing map is reference-counted and
/// shared until a new binding forces a copy.
#[derive(Clone)]
pub struct Object {
    bindings: Arc<HashMap<PortId, Binding>>,
}

impl Default for Object {
    fn default() -> Self {
        Self::empty()
    }
}

impl Object {
    /// An object with no bindings at all; the starting point for every
    /// source node.
    #[must_use]
    pub fn empty() -> Self {
        Object {
            bindings: Arc::new(HashMap::new()),
        }
    }

    /// Binds `port` to a scalar `value`, returning a new object that also
    /// carries every binding `self` already had.
    ///
    /// # Errors
    /// Returns [`Error::PortAlreadyBound`] if `port` already has a binding on
    /// this object.
    pub fn bind<T: Any + Send + Sync>(&self, port: &Port, value: T) -> Result<Object, Error> {
        self.insert(port, Binding::Scalar(Arc::new(value)))
    }

    /// Binds `port` to a sequence of values, returning a new object.
    ///
    /// Used by nodes running inside a [`crate::batch::BatchPipeline`] to
    /// produce a per-item result for every object in the batch in one call;
    /// the batch scope scatters the elements back onto the individual
    /// egress objects by position.
    ///
    /// # Errors
    /// Returns [`Error::PortAlreadyBound`] if `port` already has a binding on
    /// this object.
    pub fn bind_seq<T: Any + Send + Sync>(
        &self,
        port: &Port,
        values: Vec<T>,
    ) -> Result<Object, Error> {
        let values: Vec<AnyValue> = values.into_iter().map(|v| Arc::new(v) as AnyValue).collect();
        self.insert(port, Binding::Sequence(Arc::new(values)))
    }

    fn insert(&self, port: &Port, binding: Binding) -> Result<Object, Error> {
        if self.bindings.contains_key(&port.id()) {
            return Err(Error::PortAlreadyBound { port: port.id() });
        }
        let mut next = (*self.bindings).clone();
        let _ = next.insert(port.id(), binding);
        Ok(Object {
            bindings: Arc::new(next),
        })
    }

    /// Reads `port`'s scalar value, downcast to `T`.
    ///
    /// # Errors
    /// [`Error::MissingBinding`] if the port was never bound, or
    /// [`Error::TypeMismatch`] if it was bound as a sequence or with a
    /// different concrete type.
    pub fn get<T: Any + Send + Sync>(&self, port: &Port) -> Result<&T, Error> {
        match self.bindings.get(&port.id()) {
            None => Err(Error::MissingBinding { port: port.id() }),
            Some(Binding::Scalar(v)) => v
                .downcast_ref::<T>()
                .ok_or(Error::TypeMismatch { port: port.id() }),
            Some(Binding::Sequence(_)) => Err(Error::TypeMismatch { port: port.id() }),
        }
    }

    /// Reads `port`'s sequence view: the shape every upstream port takes
    /// inside a [`crate::batch::BatchPipeline`] (save the `groupby` port,
    /// which stays scalar).
    ///
    /// # Errors
    /// [`Error::MissingBinding`] if the port was never bound, or
    /// [`Error::TypeMismatch`] if it was bound as a scalar or holds a
    /// different concrete element type.
    pub fn get_seq<T: Any + Send + Sync>(&self, port: &Port) -> Result<Vec<&T>, Error> {
        match self.bindings.get(&port.id()) {
            None => Err(Error::MissingBinding { port: port.id() }),
            Some(Binding::Scalar(_)) => Err(Error::TypeMismatch { port: port.id() }),
            Some(Binding::Sequence(values)) => values
                .iter()
                .map(|v| v.downcast_ref::<T>().ok_or(Error::TypeMismatch { port: port.id() }))
                .collect(),
        }
    }

    /// Whether `port` has any binding (scalar or sequence) on this object.
    #[must_use]
    pub fn contains(&self, port: &Port) -> bool {
        self.bindings.contains_key(&port.id())
    }

    /// Whether `port`'s binding, if any, is a sequence rather than a scalar.
    #[must_use]
    pub fn is_sequence(&self, port: &Port) -> bool {
        matches!(self.bindings.get(&port.id()), Some(Binding::Sequence(_)))
    }

    /// The length of `port`'s sequence binding, if it is one.
    #[must_use]
    pub fn sequence_len(&self, port: &Port) -> Option<usize> {
        match self.bindings.get(&port.id()) {
            Some(Binding::Sequence(v)) => Some(v.len()),
            _ => None,
        }
    }

    /// All port ids currently bound on this object.
    pub(crate) fn bound_ports(&self) -> impl Iterator<Item = PortId> + '_ {
        self.bindings.keys().copied()
    }

    /// Returns a new object without `port`'s binding. Used internally to
    /// strip the sequence-number bookkeeping port
    /// [`crate::parallel::ParallelPipeline`] attaches before it hands an
    /// object to a worker's dispatcher queue.
    pub(crate) fn without(&self, port: &Port) -> Object {
        if !self.bindings.contains_key(&port.id()) {
            return self.clone();
        }
        let mut next = (*self.bindings).clone();
        let _ = next.remove(&port.id());
        Object {
            bindings: Arc::new(next),
        }
    }

    /// Copies the scalar binding at `port_id` from `self` directly, without
    /// knowing the concrete type. Used by [`crate::batch::BatchPipeline`]
    /// when assembling the per-batch sequence view: it only ever needs to
    /// move opaque values around, never inspect them.
    pub(crate) fn raw_scalar(&self, port_id: PortId) -> Option<AnyValue> {
        match self.bindings.get(&port_id) {
            Some(Binding::Scalar(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub(crate) fn raw_insert_scalar(&self, port_id: PortId, value: AnyValue) -> Object {
        let mut next = (*self.bindings).clone();
        let _ = next.insert(port_id, Binding::Scalar(value));
        Object {
            bindings: Arc::new(next),
        }
    }

    pub(crate) fn raw_insert_sequence(&self, port_id: PortId, values: Vec<AnyValue>) -> Object {
        let mut next = (*self.bindings).clone();
        let _ = next.insert(port_id, Binding::Sequence(Arc::new(values)));
        Object {
            bindings: Arc::new(next),
        }
    }

    pub(crate) fn raw_binding_is_sequence(&self, port_id: PortId) -> Option<bool> {
        self.bindings.get(&port_id).map(|b| matches!(b, Binding::Sequence(_)))
    }

    pub(crate) fn raw_sequence(&self, port_id: PortId) -> Option<Arc<Vec<AnyValue>>> {
        match self.bindings.get(&port_id) {
            Some(Binding::Sequence(v)) => Some(v.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("ports", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;

    #[test]
    fn bind_then_get_round_trips() {
        let port = Port::new("a");
        let object = Object::empty().bind(&port, 42i64).unwrap();
        assert_eq!(*object.get::<i64>(&port).unwrap(), 42);
    }

    #[test]
    fn binding_the_same_port_twice_fails() {
        let port = Port::new("a");
        let object = Object::empty().bind(&port, 1i64).unwrap();
        let err = object.bind(&port, 2i64).unwrap_err();
        assert!(matches!(err, Error::PortAlreadyBound { .. }));
    }

    #[test]
    fn reading_an_unbound_port_fails() {
        let port = Port::new("a");
        let err = Object::empty().get::<i64>(&port).unwrap_err();
        assert!(matches!(err, Error::MissingBinding { .. }));
    }

    #[test]
    fn reading_a_scalar_as_the_wrong_type_fails() {
        let port = Port::new("a");
        let object = Object::empty().bind(&port, 1i64).unwrap();
        let err = object.get::<String>(&port).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn reading_a_scalar_as_a_sequence_fails() {
        let port = Port::new("a");
        let object = Object::empty().bind(&port, 1i64).unwrap();
        let err = object.get_seq::<i64>(&port).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn bind_seq_then_get_seq_round_trips() {
        let port = Port::new("a");
        let object = Object::empty().bind_seq(&port, vec![1i64, 2, 3]).unwrap();
        assert!(object.is_sequence(&port));
        assert_eq!(object.sequence_len(&port), Some(3));
        let values = object.get_seq::<i64>(&port).unwrap();
        assert_eq!(values, vec![&1, &2, &3]);
    }

    #[test]
    fn existing_bindings_are_untouched_by_a_new_bind() {
        let a = Port::new("a");
        let b = Port::new("b");
        let o1 = Object::empty().bind(&a, 1i64).unwrap();
        let o2 = o1.bind(&b, 2i64).unwrap();
        assert_eq!(*o1.get::<i64>(&a).unwrap(), 1);
        assert!(!o1.contains(&b));
        assert_eq!(*o2.get::<i64>(&a).unwrap(), 1);
        assert_eq!(*o2.get::<i64>(&b).unwrap(), 2);
    }

    #[test]
    fn without_removes_a_binding_and_leaves_the_rest() {
        let a = Port::new("a");
        let b = Port::new("b");
        let object = Object::empty().bind(&a, 1i64).unwrap().bind(&b, 2i64).unwrap();
        let stripped = object.without(&a);
        assert!(!stripped.contains(&a));
        assert_eq!(*stripped.get::<i64>(&b).unwrap(), 2);
    }
}
