use thiserror::Error;

use crate::graph::NodeId;

/// Everything that can go wrong while reading, writing, or flushing a
/// [`crate::Graph`].
///
/// `UserFailure` is the only variant that wraps caller code: recompute and
/// effect bodies return `Result<_, Box<dyn std::error::Error>>` rather than
/// panicking, and a failure there is threaded back out through `read`,
/// `write`, or `flush` instead of unwinding the stack.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A Computed's recompute transitively depends on itself. `chain` is the
    /// compute stack at the moment the cycle was discovered, innermost last.
    #[error("cycle detected while recomputing a node: {chain:?}")]
    CycleDetected { chain: Vec<NodeId> },

    /// The node's Graph has already been disposed and the requested
    /// operation has no cached value to fall back on.
    #[error("graph is disposed")]
    GraphDisposed,

    /// Attempted to write to a node that is not a Source (internal
    /// defense-in-depth; the typed handles don't expose `write` on anything
    /// but `Source<T>`, so this should be unreachable from the public API).
    #[error("attempted to write to a non-Source node")]
    InvalidTarget,

    /// A recompute or effect closure returned `Err`.
    #[error("user computation failed: {0}")]
    UserFailure(#[source] Box<dyn std::error::Error>),
}
