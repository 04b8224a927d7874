use std::rc::Rc;

#[cfg(debug_assertions)]
use std::panic::Location;

use crate::error::EngineError;
use crate::graph::{Graph, NodeId};

/// Reads a node's current value without subscribing the caller to it and
/// without triggering a recompute for a dirty Computed.
///
/// For a [`Source`] this always returns a value. For a [`Computed`] it
/// returns `None` if the computed has never successfully recomputed (peeking
/// a brand-new Computed before anything has read it).
pub trait Peek {
    type Output;
    fn peek(&self) -> Self::Output;
}

/// Free-function form of [`Peek::peek`], for call sites that read `peek(&n)`
/// more naturally than `n.peek()`.
pub fn peek<N: Peek>(node: &N) -> N::Output {
    node.peek()
}

/// A mutable reactive cell. Writing a new value that is `!=` the current one
/// marks every dependent Computed/Effect dirty and, outside of a batch,
/// flushes immediately.
pub struct Source<T> {
    graph: Graph,
    id: NodeId,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Source { graph: self.graph.clone(), id: self.id, _marker: std::marker::PhantomData }
    }
}

impl<T: PartialEq + Clone + 'static> Source<T> {
    #[track_caller]
    pub(crate) fn new(graph: &Graph, value: T) -> Result<Self, EngineError> {
        #[cfg(debug_assertions)]
        let location = Location::caller();
        let id = graph.inner.create_source(
            Box::new(value),
            #[cfg(debug_assertions)]
            location,
        )?;
        Ok(Source { graph: graph.clone(), id, _marker: std::marker::PhantomData })
    }

    /// Reads the current value, subscribing the currently-running Computed
    /// or Effect (if any) to future changes.
    pub fn read(&self) -> T {
        self.graph.inner.read_source::<T>(self.id)
    }

    /// Writes a new value. A no-op (no dirtying, no flush) if `value` equals
    /// the current value. Returns an error only if flushing at the end of
    /// this write (or the batch it's nested in) caused an Effect to fail;
    /// the write itself always takes effect.
    pub fn write(&self, value: T) -> Result<(), EngineError> {
        self.graph.inner.write_source(self.id, value)
    }

    /// Replaces the value with `f(current)`. Equivalent to `write(f(peek()))`
    /// but avoids the caller having to clone the value out first.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> Result<(), EngineError> {
        let current = self.peek();
        self.write(f(current))
    }

    /// The [`Graph`] this node belongs to.
    pub fn context(&self) -> Graph {
        self.graph.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.graph.inner.source_subscriber_count(self.id)
    }

    #[cfg(debug_assertions)]
    pub fn debug_label(&self) -> Option<String> {
        self.graph.inner.debug_label(self.id)
    }

    #[cfg(debug_assertions)]
    pub fn set_debug_label(&self, label: impl Into<String>) {
        self.graph.inner.set_debug_label(self.id, label);
    }

    #[cfg(debug_assertions)]
    pub fn defined_at(&self) -> Option<&'static Location<'static>> {
        self.graph.inner.defined_at(self.id)
    }
}

impl<T: Clone + 'static> Peek for Source<T> {
    type Output = T;
    fn peek(&self) -> T {
        self.graph.inner.peek_source::<T>(self.id)
    }
}

/// A pure, lazily recomputed value derived from other nodes. Recomputation
/// happens on read, only when dirty; dependencies are rediscovered on every
/// recompute, so a Computed can change which nodes it depends on between
/// runs (dynamic dependency re-subscription).
pub struct Computed<T> {
    graph: Graph,
    id: NodeId,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Computed { graph: self.graph.clone(), id: self.id, _marker: std::marker::PhantomData }
    }
}

impl<T: Clone + 'static> Computed<T> {
    #[track_caller]
    pub(crate) fn new(
        graph: &Graph,
        f: impl Fn() -> Result<T, Box<dyn std::error::Error>> + 'static,
    ) -> Result<Self, EngineError> {
        #[cfg(debug_assertions)]
        let location = Location::caller();
        let recompute = Rc::new(move || f().map(|v| Box::new(v) as Box<dyn std::any::Any>));
        let id = graph.inner.create_computed(
            recompute,
            #[cfg(debug_assertions)]
            location,
        )?;
        Ok(Computed { graph: graph.clone(), id, _marker: std::marker::PhantomData })
    }

    /// Recomputes (if dirty) and returns the value, subscribing the
    /// currently-running Computed or Effect (if any). Returns
    /// `EngineError::CycleDetected` if recomputing would re-enter a node
    /// already being recomputed further up the call chain, or
    /// `EngineError::UserFailure` if the recompute closure itself failed;
    /// in both cases the node stays dirty so a later read retries.
    pub fn read(&self) -> Result<T, EngineError> {
        self.graph.inner.read_computed::<T>(self.id)
    }

    pub fn context(&self) -> Graph {
        self.graph.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.graph.inner.computed_subscriber_count(self.id)
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.inner.computed_dependency_count(self.id)
    }

    pub fn is_dirty(&self) -> bool {
        self.graph.inner.computed_is_dirty(self.id)
    }

    #[cfg(debug_assertions)]
    pub fn debug_label(&self) -> Option<String> {
        self.graph.inner.debug_label(self.id)
    }

    #[cfg(debug_assertions)]
    pub fn set_debug_label(&self, label: impl Into<String>) {
        self.graph.inner.set_debug_label(self.id, label);
    }

    #[cfg(debug_assertions)]
    pub fn defined_at(&self) -> Option<&'static Location<'static>> {
        self.graph.inner.defined_at(self.id)
    }
}

impl<T: Clone + 'static> Peek for Computed<T> {
    type Output = Option<T>;
    fn peek(&self) -> Option<T> {
        self.graph.inner.peek_computed::<T>(self.id)
    }
}

/// A side-effecting closure that re-runs whenever any Source/Computed it
/// read on its last run changes. Runs once, synchronously, at creation.
#[derive(Clone)]
pub struct Effect {
    graph: Graph,
    id: NodeId,
}

impl Effect {
    #[track_caller]
    pub(crate) fn new(
        graph: &Graph,
        f: impl Fn() -> Result<(), Box<dyn std::error::Error>> + 'static,
    ) -> Result<(Self, Result<(), EngineError>), EngineError> {
        #[cfg(debug_assertions)]
        let location = Location::caller();
        let (id, result) = graph.inner.create_effect(
            Rc::new(f),
            #[cfg(debug_assertions)]
            location,
        )?;
        Ok((Effect { graph: graph.clone(), id }, result))
    }

    pub fn context(&self) -> Graph {
        self.graph.clone()
    }

    /// Disposes the effect: runs its pending cleanup (if any) and removes
    /// it from every dependency's subscriber list. Idempotent: disposing an
    /// already-disposed effect does nothing.
    pub fn dispose(&self) {
        self.graph.inner.dispose_effect(self.id);
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.inner.effect_dependency_count(self.id)
    }

    pub fn is_dirty(&self) -> bool {
        self.graph.inner.effect_is_dirty(self.id)
    }

    #[cfg(debug_assertions)]
    pub fn debug_label(&self) -> Option<String> {
        self.graph.inner.debug_label(self.id)
    }

    #[cfg(debug_assertions)]
    pub fn set_debug_label(&self, label: impl Into<String>) {
        self.graph.inner.set_debug_label(self.id, label);
    }

    #[cfg(debug_assertions)]
    pub fn defined_at(&self) -> Option<&'static Location<'static>> {
        self.graph.inner.defined_at(self.id)
    }

    /// The [`Scope`] this effect was created under, if any.
    #[cfg(debug_assertions)]
    pub fn parent_scope(&self) -> Option<Scope> {
        self.graph
            .inner
            .parent_scope(self.id)
            .map(|id| Scope::from_parts(self.graph.clone(), id))
    }
}

/// A group of nodes created together, disposable as a unit. See
/// [`Graph::create_scope`].
#[derive(Clone)]
pub struct Scope {
    graph: Graph,
    id: NodeId,
}

impl Scope {
    pub(crate) fn from_parts(graph: Graph, id: NodeId) -> Self {
        Scope { graph, id }
    }

    pub fn context(&self) -> Graph {
        self.graph.clone()
    }

    /// Disposes every Effect (and nested Scope) created inside this scope.
    /// Idempotent.
    pub fn dispose(&self) {
        self.graph.inner.dispose_scope(self.id);
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
