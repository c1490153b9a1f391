// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! Ports: opaque identity tokens labeling one output of one node.
//!
//! A [`Port`] carries no value. It is minted once, at pipeline-build time, by
//! the node that owns it, and afterwards used purely as a key into an
//! [`crate::object::Object`]. Two ports constructed with the same human name
//! from different call sites are distinct, because equality is identity, not
//! name: see `PORT_ID` in this module.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter minting fresh [`PortId`]s.
///
/// A `static` (rather than a per-pipeline counter) keeps id allocation free
/// of any builder state, which matters because [`Port::new`] is called from
/// inside ordinary node constructors, long before a [`crate::builder`] scope
/// exists to hand out ids from.
static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(0);

/// The bare identity half of a [`Port`], used as the key type inside
/// [`crate::object::Object`] and in error messages where the human name adds
/// little.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An opaque identity token labeling one output of one node.
///
/// `Port` is `Clone` so the node that owns it can hand copies to whichever
/// downstream node constructors need to reference it; every clone compares
/// equal because equality is identity (the wrapped [`PortId`]), never the
/// display name.
#[derive(Clone)]
pub struct Port {
    id: PortId,
    name: &'static str,
}

impl Port {
    /// Mints a fresh port with the given human-readable name.
    ///
    /// Call this from inside a node's constructor for each output the node
    /// declares; the returned `Port` is what downstream node constructors
    /// will be given to declare a read dependency on that output.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let id = NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed);
        Port {
            id: PortId(id),
            name,
        }
    }

    /// The bare identity key, suitable for use as a map key.
    #[must_use]
    pub fn id(&self) -> PortId {
        self.id
    }

    /// The human-readable name this port was minted with. Not part of
    /// equality; two distinct ports may share a name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Port {}

impl std::hash::Hash for Port {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({}, {:?})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_identity_not_name() {
        let a = Port::new("x");
        let b = Port::new("x");
        assert_ne!(a, b);
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn clone_compares_equal_to_original() {
        let a = Port::new("a");
        let cloned = a.clone();
        assert_eq!(a, cloned);
        assert_eq!(a.id(), cloned.id());
    }

    #[test]
    fn ids_are_minted_in_increasing_order() {
        let a = Port::new("a");
        let b = Port::new("b");
        assert!(a.id() < b.id());
    }
}
