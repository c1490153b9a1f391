// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! Group keys for `BatchPipeline`'s `groupby` mode.
//!
//! A `groupby` port's value is type-erased like any other binding, but the
//! batch scope needs to compare two bindings for equality to decide whether
//! they belong to the same run. Rather than requiring every possible
//! payload type to implement some engine-specific trait, we recognize a
//! small closed set of scalar types nodes commonly key batches by and
//! downcast into this enum.

use std::any::Any;
use std::sync::Arc;

/// A comparable group key extracted from a `groupby` port's scalar binding.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum Key {
    Int(i64),
    Str(String),
    Bool(bool),
}

/// Attempts to read `value` as one of the supported group-key types.
///
/// Returns `None` if `value`'s concrete type is not one the engine knows how
/// to compare; the caller turns that into
/// [`crate::error::Error::UnsupportedGroupKeyType`].
pub(crate) fn extract(value: &Arc<dyn Any + Send + Sync>) -> Option<Key> {
    if let Some(v) = value.downcast_ref::<i64>() {
        return Some(Key::Int(*v));
    }
    if let Some(v) = value.downcast_ref::<i32>() {
        return Some(Key::Int(i64::from(*v)));
    }
    if let Some(v) = value.downcast_ref::<String>() {
        return Some(Key::Str(v.clone()));
    }
    if let Some(v) = value.downcast_ref::<bool>() {
        return Some(Key::Bool(*v));
    }
    None
}
