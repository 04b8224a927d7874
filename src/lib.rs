//! A fine-grained reactive state graph.
//!
//! Three node kinds live in a [`Graph`]:
//!
//! - [`Source<T>`]: a mutable cell you write directly.
//! - [`Computed<T>`]: a pure value derived from other nodes, recomputed
//!   lazily (on read) only when something it depends on has changed.
//! - [`Effect`]: a side-effecting closure that re-runs whenever a node it
//!   read on its last run changes.
//!
//! Reads performed while a Computed or Effect is running are tracked
//! automatically: no explicit subscribe/unsubscribe calls. Writes to a
//! Source push dirty marks down through its dependents (computeds first,
//! lazily; effects are queued and run once the write, or the batch it's
//! part of, finishes).
//!
//! ```
//! use reactive_graph::{create_source, create_computed};
//!
//! let count = create_source(0).unwrap();
//! let doubled = {
//!     let count = count.clone();
//!     create_computed(move || Ok(count.read() * 2)).unwrap()
//! };
//! assert_eq!(doubled.read().unwrap(), 0);
//! count.write(5).unwrap();
//! assert_eq!(doubled.read().unwrap(), 10);
//! ```
//!
//! Every free function in this crate (`create_source`, `create_computed`,
//! `batch`, ...) operates on a thread-local default [`Graph`]; construct a
//! [`Graph`] directly with [`Graph::new`] for an isolated graph (writes in
//! one graph never affect another).

mod error;
mod graph;
mod node;

use std::cell::RefCell;

pub use error::EngineError;
pub use graph::{Graph, NodeId};
pub use node::{Computed, Effect, Peek, Scope, Source, peek};

thread_local! {
    static DEFAULT_GRAPH: RefCell<Graph> = RefCell::new(Graph::new());
}

/// Returns (a clone of) the thread-local default graph.
pub fn default_graph() -> Graph {
    DEFAULT_GRAPH.with(|g| g.borrow().clone())
}

/// Replaces the thread-local default graph with a fresh, empty one. Existing
/// handles obtained from the old default graph keep working against it
/// (they hold their own `Graph` clone); only subsequent calls to the free
/// functions in this module are affected.
pub fn reset_default_graph() {
    DEFAULT_GRAPH.with(|g| *g.borrow_mut() = Graph::new());
}

/// Creates a new, independent [`Graph`]. Equivalent to [`Graph::new`];
/// provided so callers reaching for "create a graph" find it as a free
/// function next to `create_source`/`create_computed`/`create_effect`.
pub fn new_graph() -> Graph {
    Graph::new()
}

/// Creates a [`Source`] on the default graph. Fails with
/// [`EngineError::GraphDisposed`] if the default graph has been disposed.
#[track_caller]
pub fn create_source<T: PartialEq + Clone + 'static>(value: T) -> Result<Source<T>, EngineError> {
    default_graph().create_source(value)
}

/// Alias for [`create_source`], matching the naming spec.md's external
/// interface table uses alongside `create_derived`/`create_watcher`.
#[track_caller]
#[inline]
pub fn create_state<T: PartialEq + Clone + 'static>(value: T) -> Result<Source<T>, EngineError> {
    create_source(value)
}

/// Creates a [`Computed`] on the default graph. Fails with
/// [`EngineError::GraphDisposed`] if the default graph has been disposed.
#[track_caller]
pub fn create_computed<T, F>(f: F) -> Result<Computed<T>, EngineError>
where
    T: Clone + 'static,
    F: Fn() -> Result<T, Box<dyn std::error::Error>> + 'static,
{
    default_graph().create_computed(f)
}

/// Alias for [`create_computed`].
#[track_caller]
#[inline]
pub fn create_derived<T, F>(f: F) -> Result<Computed<T>, EngineError>
where
    T: Clone + 'static,
    F: Fn() -> Result<T, Box<dyn std::error::Error>> + 'static,
{
    create_computed(f)
}

/// Alias for [`create_computed`].
#[track_caller]
#[inline]
pub fn create_memo<T, F>(f: F) -> Result<Computed<T>, EngineError>
where
    T: Clone + 'static,
    F: Fn() -> Result<T, Box<dyn std::error::Error>> + 'static,
{
    create_computed(f)
}

/// Creates an [`Effect`] on the default graph, running it once immediately.
/// Fails with [`EngineError::GraphDisposed`] if the default graph has been
/// disposed; otherwise returns the handle alongside the result of that
/// initial run so a failure on the very first run isn't silently swallowed.
#[track_caller]
pub fn create_effect<F>(f: F) -> Result<(Effect, Result<(), EngineError>), EngineError>
where
    F: Fn() -> Result<(), Box<dyn std::error::Error>> + 'static,
{
    default_graph().create_effect(f)
}

/// Alias for [`create_effect`].
#[track_caller]
#[inline]
pub fn create_watcher<F>(f: F) -> Result<(Effect, Result<(), EngineError>), EngineError>
where
    F: Fn() -> Result<(), Box<dyn std::error::Error>> + 'static,
{
    create_effect(f)
}

/// Registers `f` to run the next time the currently-running [`Effect`]
/// re-runs or is disposed. A no-op if called outside of an actively-running
/// effect (including from inside a [`Computed`]'s recompute).
pub use graph::on_cleanup;

/// Runs `body` with dependency tracking suspended on the default graph.
pub fn untrack<R>(body: impl FnOnce() -> R) -> R {
    default_graph().untrack(body)
}

/// Defers propagation on the default graph until `body` returns.
pub fn batch<R>(body: impl FnOnce() -> R) -> (R, Result<(), EngineError>) {
    default_graph().batch(body)
}

/// Creates a scope on the default graph. See [`Graph::create_scope`].
pub fn create_scope(body: impl FnOnce()) -> Scope {
    default_graph().create_scope(body)
}
