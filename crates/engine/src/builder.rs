// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! The ambient pipeline builder.
//!
//! Entering a scope pushes it onto a *thread-local* stack; node constructors
//! register themselves, and the ports they read or declare, against
//! whichever scope is topmost, without the caller having to thread a
//! builder handle through every constructor. Exiting restores the prior
//! scope (or leaves the stack empty, for the outermost [`crate::pipeline::Pipeline`]).
//!
//! The stack is thread-local rather than global so that unrelated pipelines
//! can be constructed concurrently on different threads — including, for a
//! [`crate::parallel::ParallelPipeline`], the very thread that later
//! replays a scope's construction closure to build one worker's private
//! copy of the inner pipeline.

use crate::error::Error;
use crate::node::{Node, NodeName};
use crate::port::{Port, PortId};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

struct ScopeState {
    /// Ports bound by some ancestor-in-stream node in this scope chain,
    /// inherited from the parent scope at entry and grown as nodes in this
    /// scope declare their own outputs.
    bound_ports: HashSet<PortId>,
    nodes: Vec<Arc<dyn Node>>,
}

#[derive(Clone)]
struct Scope(Rc<RefCell<ScopeState>>);

thread_local! {
    static STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

/// Pushes a fresh scope, seeded with the given bound-port set.
fn enter_scope(seed: HashSet<PortId>) -> Scope {
    let scope = Scope(Rc::new(RefCell::new(ScopeState {
        bound_ports: seed,
        nodes: Vec::new(),
    })));
    STACK.with(|stack| stack.borrow_mut().push(scope.clone()));
    scope
}

/// Snapshots the bound-port set of whichever scope is currently topmost
/// (empty if there is no enclosing scope). `BatchPipeline::build` and
/// `ParallelPipeline::build` call this once, at construction time, to
/// capture what the inner closure may legally read from the outer scope —
/// the inner closure itself is replayed later, possibly on a different
/// thread and always after this scope has been exited, so it cannot rely on
/// inheriting from the live stack the way an ordinary nested `build_scope`
/// call does.
pub(crate) fn current_bound_ports() -> HashSet<PortId> {
    STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|scope| scope.0.borrow().bound_ports.clone())
            .unwrap_or_default()
    })
}

/// Pops the topmost scope and returns the nodes registered in registration
/// order, freezing the scope's child list.
fn exit_scope() -> Vec<Arc<dyn Node>> {
    let scope = STACK.with(|stack| {
        stack
            .borrow_mut()
            .pop()
            .expect("exit_scope called without a matching enter_scope")
    });
    let state = Rc::try_unwrap(scope.0)
        .unwrap_or_else(|_| panic!("scope exited while a node constructor still held a reference"))
        .into_inner();
    state.nodes
}

/// Runs `f` inside a fresh scope nested under whichever scope (if any) is
/// currently active, returning the nodes it registered. Shared by
/// [`crate::pipeline::Pipeline::build`], [`crate::batch::BatchPipeline::build`],
/// and [`crate::parallel::ParallelPipeline::build`] — the latter two keep
/// `f` around to call this again, once per worker thread, producing an
/// independent deep copy of the inner pipeline each time.
pub(crate) fn build_scope(f: &(dyn Fn() + Send + Sync)) -> Vec<Arc<dyn Node>> {
    build_scope_seeded(current_bound_ports(), f)
}

/// As [`build_scope`], but seeds the new scope's bound-port set explicitly
/// instead of inheriting from whatever happens to be topmost on the live
/// stack. Used to replay a [`crate::batch::BatchPipeline`] or
/// [`crate::parallel::ParallelPipeline`]'s inner construction closure —
/// possibly much later, and possibly on a worker thread with nothing of the
/// original scope chain on its stack — while still letting it see the outer
/// ports that were bound when the pipeline was first built.
pub(crate) fn build_scope_seeded(
    seed: HashSet<PortId>,
    f: &(dyn Fn() + Send + Sync),
) -> Vec<Arc<dyn Node>> {
    enter_scope(seed);
    f();
    exit_scope()
}

fn current() -> Scope {
    STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .cloned()
            .expect("node constructed outside of Pipeline::build / BatchPipeline::build / ParallelPipeline::build")
    })
}

/// Declares that `port` is now bound by some node in the current scope.
///
/// Call this once, inside a node's constructor, for every output port the
/// node owns; subsequent node constructors in the same scope chain may then
/// reference `port` via [`require_input`].
pub fn bind_output(port: &Port) {
    current().0.borrow_mut().bound_ports.insert(port.id());
}

/// Validates that `port` was already declared by an ancestor-in-stream node
/// in the current scope chain.
///
/// Call this once, inside a node's constructor, for every port the node
/// reads.
///
/// # Errors
/// [`Error::UnboundPort`] if no node registered earlier in this scope chain
/// declared `port` as an output.
pub fn require_input(reader: impl Into<NodeName>, port: &Port) -> Result<(), Error> {
    let bound = current().0.borrow().bound_ports.contains(&port.id());
    if bound {
        Ok(())
    } else {
        Err(Error::UnboundPort {
            port: port.id(),
            reader: reader.into(),
        })
    }
}

/// Registers `node` with the topmost scope, in construction order.
///
/// Call this last, once a node's constructor has validated every input port
/// it reads and declared every output port it owns.
pub fn register(node: Arc<dyn Node>) {
    current().0.borrow_mut().nodes.push(node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use std::sync::atomic::Ordering;

    struct Dummy(NodeName);

    impl Node for Dummy {
        fn name(&self) -> NodeName {
            self.0.clone()
        }

        fn transform(&self, object: Object) -> Result<Object, Error> {
            Ok(object)
        }
    }

    fn dummy(name: &str) -> Arc<dyn Node> {
        Arc::new(Dummy(Arc::from(name)))
    }

    #[test]
    fn unbound_port_is_rejected() {
        let port = Port::new("p");
        build_scope(&move || {
            let err = require_input("reader", &port).unwrap_err();
            assert!(matches!(err, Error::UnboundPort { .. }));
        });
    }

    #[test]
    fn bound_output_is_visible_to_later_require_input() {
        let port = Port::new("p");
        let nodes = build_scope(&move || {
            bind_output(&port);
            require_input("reader", &port).unwrap();
            register(dummy("reader"));
        });
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn nested_scope_inherits_parent_bound_ports() {
        let port = Port::new("p");
        let nested_saw_it = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let nested_saw_it_clone = nested_saw_it.clone();
        build_scope(&move || {
            bind_output(&port);
            let port = port.clone();
            let nested_saw_it_clone = nested_saw_it_clone.clone();
            let _ = build_scope(&move || {
                nested_saw_it_clone.store(
                    require_input("nested-reader", &port).is_ok(),
                    Ordering::SeqCst,
                );
            });
        });
        assert!(nested_saw_it.load(Ordering::SeqCst));
    }

    #[test]
    fn registration_order_is_preserved() {
        let nodes = build_scope(&|| {
            register(dummy("first"));
            register(dummy("second"));
        });
        let names: Vec<NodeName> = nodes.iter().map(|n| n.name()).collect();
        assert_eq!(&*names[0], "first");
        assert_eq!(&*names[1], "second");
    }
}
