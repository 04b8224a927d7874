use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

#[cfg(debug_assertions)]
use std::panic::Location;

use slotmap::{SecondaryMap, SlotMap, new_key_type};

use crate::error::EngineError;

new_key_type! {
    /// Identity of a node inside a [`Graph`]. Opaque, `Copy`, and only ever
    /// meaningful relative to the graph that produced it: using a `NodeId`
    /// against a different graph is a logic error the slotmap generation
    /// check turns into a harmless no-op rather than a dangling read.
    pub struct NodeId;
}

pub(crate) type Recompute =
    Rc<dyn Fn() -> Result<Box<dyn std::any::Any>, Box<dyn std::error::Error>>>;
pub(crate) type EffectBody = Rc<dyn Fn() -> Result<(), Box<dyn std::error::Error>>>;
pub(crate) type Cleanup = Box<dyn FnOnce()>;

pub(crate) struct SourceSlot {
    pub(crate) value: Box<dyn std::any::Any>,
    pub(crate) subscribers: Vec<NodeId>,
}

pub(crate) struct ComputedSlot {
    pub(crate) recompute: Recompute,
    pub(crate) value: Option<Box<dyn std::any::Any>>,
    pub(crate) dependencies: Vec<NodeId>,
    pub(crate) subscribers: Vec<NodeId>,
    pub(crate) dirty: bool,
}

pub(crate) struct EffectSlot {
    pub(crate) body: EffectBody,
    pub(crate) cleanup: Option<Cleanup>,
    pub(crate) dependencies: Vec<NodeId>,
    pub(crate) dirty: bool,
    pub(crate) disposed: bool,
}

#[derive(Default)]
pub(crate) struct NodeAux {
    /// The scope this node was registered under, if any. Needed in every
    /// build (not just debug) so disposal can remove a disposed node from
    /// its parent's `children` list.
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: Option<&'static Location<'static>>,
    #[cfg(debug_assertions)]
    pub(crate) debug_label: Option<String>,
}

/// The arena and scheduler behind a [`Graph`] handle. Never constructed
/// directly outside of [`Graph::new`]; every public node handle (`Source`,
/// `Computed`, `Effect`) holds an `Rc<GraphInner>` (via `Graph`) so the arena
/// outlives whichever handle is read last.
pub(crate) struct GraphInner {
    ids: RefCell<SlotMap<NodeId, ()>>,
    sources: RefCell<SecondaryMap<NodeId, SourceSlot>>,
    computeds: RefCell<SecondaryMap<NodeId, ComputedSlot>>,
    effects: RefCell<SecondaryMap<NodeId, EffectSlot>>,
    aux: RefCell<SecondaryMap<NodeId, NodeAux>>,

    current_consumer: Cell<Option<NodeId>>,
    current_scope: Cell<Option<NodeId>>,
    tracking: Cell<bool>,

    update_queue: RefCell<VecDeque<NodeId>>,
    update_queued: RefCell<SecondaryMap<NodeId, ()>>,
    effect_queue: RefCell<VecDeque<NodeId>>,
    effect_queued: RefCell<SecondaryMap<NodeId, ()>>,

    compute_stack: RefCell<Vec<NodeId>>,
    batch_depth: Cell<usize>,
    flushing: Cell<bool>,

    disposed: Cell<bool>,
}

thread_local! {
    /// Effects currently executing on this thread, innermost last. Used only
    /// so that a bare `on_cleanup(f)` call can find "the current effect"
    /// without the caller having to thread a `Graph` through. Computeds never
    /// push here: cleanup registration is effect-only, per spec.
    static ACTIVE_EFFECT_GRAPHS: RefCell<Vec<Rc<GraphInner>>> = RefCell::new(Vec::new());
}

impl GraphInner {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            ids: RefCell::new(SlotMap::with_key()),
            sources: RefCell::new(SecondaryMap::new()),
            computeds: RefCell::new(SecondaryMap::new()),
            effects: RefCell::new(SecondaryMap::new()),
            aux: RefCell::new(SecondaryMap::new()),
            current_consumer: Cell::new(None),
            current_scope: Cell::new(None),
            tracking: Cell::new(true),
            update_queue: RefCell::new(VecDeque::new()),
            update_queued: RefCell::new(SecondaryMap::new()),
            effect_queue: RefCell::new(VecDeque::new()),
            effect_queued: RefCell::new(SecondaryMap::new()),
            compute_stack: RefCell::new(Vec::new()),
            batch_depth: Cell::new(0),
            flushing: Cell::new(false),
            disposed: Cell::new(false),
        })
    }

    fn register_node(&self) -> NodeId {
        let id = self.ids.borrow_mut().insert(());
        self.aux.borrow_mut().insert(
            id,
            NodeAux {
                parent: self.current_scope.get(),
                ..Default::default()
            },
        );
        if let Some(parent) = self.current_scope.get() {
            if let Some(aux) = self.aux.borrow_mut().get_mut(parent) {
                aux.children.push(id);
            }
        }
        id
    }

    #[cfg(debug_assertions)]
    fn record_location(&self, id: NodeId, location: &'static Location<'static>) {
        if let Some(aux) = self.aux.borrow_mut().get_mut(id) {
            aux.defined_at = Some(location);
        }
    }

    // ---- creation -------------------------------------------------------

    pub(crate) fn create_source(
        self: &Rc<Self>,
        value: Box<dyn std::any::Any>,
        #[cfg(debug_assertions)] location: &'static Location<'static>,
    ) -> Result<NodeId, EngineError> {
        if self.disposed.get() {
            return Err(EngineError::GraphDisposed);
        }
        let id = self.register_node();
        #[cfg(debug_assertions)]
        self.record_location(id, location);
        self.sources.borrow_mut().insert(
            id,
            SourceSlot {
                value,
                subscribers: Vec::new(),
            },
        );
        tracing::trace!(?id, "source created");
        Ok(id)
    }

    pub(crate) fn create_computed(
        self: &Rc<Self>,
        recompute: Recompute,
        #[cfg(debug_assertions)] location: &'static Location<'static>,
    ) -> Result<NodeId, EngineError> {
        if self.disposed.get() {
            return Err(EngineError::GraphDisposed);
        }
        let id = self.register_node();
        #[cfg(debug_assertions)]
        self.record_location(id, location);
        self.computeds.borrow_mut().insert(
            id,
            ComputedSlot {
                recompute,
                value: None,
                dependencies: Vec::new(),
                subscribers: Vec::new(),
                dirty: true,
            },
        );
        tracing::trace!(?id, "computed created");
        Ok(id)
    }

    pub(crate) fn create_effect(
        self: &Rc<Self>,
        body: EffectBody,
        #[cfg(debug_assertions)] location: &'static Location<'static>,
    ) -> Result<(NodeId, Result<(), EngineError>), EngineError> {
        if self.disposed.get() {
            return Err(EngineError::GraphDisposed);
        }
        let id = self.register_node();
        #[cfg(debug_assertions)]
        self.record_location(id, location);
        self.effects.borrow_mut().insert(
            id,
            EffectSlot {
                body,
                cleanup: None,
                dependencies: Vec::new(),
                dirty: true,
                disposed: false,
            },
        );
        tracing::trace!(?id, "effect created");
        let result = self.run_effect(id);
        Ok((id, result))
    }

    pub(crate) fn create_scope(self: &Rc<Self>) -> NodeId {
        self.register_node()
    }

    // ---- tracking ---------------------------------------------------------

    fn track_read(&self, producer: NodeId) {
        if !self.tracking.get() {
            return;
        }
        let Some(consumer) = self.current_consumer.get() else {
            return;
        };
        if consumer == producer {
            return;
        }
        let registered = if let Some(slot) = self.computeds.borrow_mut().get_mut(consumer) {
            if !slot.dependencies.contains(&producer) {
                slot.dependencies.push(producer);
            }
            true
        } else if let Some(slot) = self.effects.borrow_mut().get_mut(consumer) {
            if !slot.dependencies.contains(&producer) {
                slot.dependencies.push(producer);
            }
            true
        } else {
            false
        };
        if !registered {
            return;
        }
        if let Some(slot) = self.sources.borrow_mut().get_mut(producer) {
            if !slot.subscribers.contains(&consumer) {
                slot.subscribers.push(consumer);
            }
        } else if let Some(slot) = self.computeds.borrow_mut().get_mut(producer) {
            if !slot.subscribers.contains(&consumer) {
                slot.subscribers.push(consumer);
            }
        }
    }

    fn remove_subscriber_from_all(&self, deps: &[NodeId], consumer: NodeId) {
        for &dep in deps {
            if let Some(slot) = self.sources.borrow_mut().get_mut(dep) {
                if let Some(pos) = slot.subscribers.iter().position(|&x| x == consumer) {
                    slot.subscribers.swap_remove(pos);
                }
                continue;
            }
            if let Some(slot) = self.computeds.borrow_mut().get_mut(dep) {
                if let Some(pos) = slot.subscribers.iter().position(|&x| x == consumer) {
                    slot.subscribers.swap_remove(pos);
                }
            }
        }
    }

    // ---- reads --------------------------------------------------------

    pub(crate) fn read_source<T: Clone + 'static>(&self, id: NodeId) -> T {
        self.track_read(id);
        let sources = self.sources.borrow();
        let slot = sources.get(id).expect("source id valid for its own graph");
        slot.value
            .downcast_ref::<T>()
            .expect("Source<T> handle type matches stored value")
            .clone()
    }

    pub(crate) fn peek_source<T: Clone + 'static>(&self, id: NodeId) -> T {
        let sources = self.sources.borrow();
        let slot = sources.get(id).expect("source id valid for its own graph");
        slot.value
            .downcast_ref::<T>()
            .expect("Source<T> handle type matches stored value")
            .clone()
    }

    pub(crate) fn read_computed<T: Clone + 'static>(
        self: &Rc<Self>,
        id: NodeId,
    ) -> Result<T, EngineError> {
        if self.disposed.get() {
            let computeds = self.computeds.borrow();
            let slot = computeds.get(id).expect("computed id valid for its own graph");
            return slot
                .value
                .as_ref()
                .map(|v| v.downcast_ref::<T>().expect("Computed<T> handle type matches").clone())
                .ok_or(EngineError::GraphDisposed);
        }

        let dirty = self
            .computeds
            .borrow()
            .get(id)
            .expect("computed id valid for its own graph")
            .dirty;
        if dirty {
            self.recompute(id)?;
        } else {
            self.track_read(id);
        }
        let computeds = self.computeds.borrow();
        let slot = computeds.get(id).expect("computed id valid for its own graph");
        Ok(slot
            .value
            .as_ref()
            .expect("recompute always commits a value on success")
            .downcast_ref::<T>()
            .expect("Computed<T> handle type matches")
            .clone())
    }

    pub(crate) fn peek_computed<T: Clone + 'static>(&self, id: NodeId) -> Option<T> {
        let computeds = self.computeds.borrow();
        computeds
            .get(id)
            .and_then(|s| s.value.as_ref())
            .map(|v| v.downcast_ref::<T>().expect("Computed<T> handle type matches").clone())
    }

    fn recompute(self: &Rc<Self>, id: NodeId) -> Result<(), EngineError> {
        if self.compute_stack.borrow().contains(&id) {
            let chain = self.compute_stack.borrow().clone();
            return Err(EngineError::CycleDetected { chain });
        }

        let old_deps = {
            let mut computeds = self.computeds.borrow_mut();
            std::mem::take(&mut computeds.get_mut(id).expect("valid computed").dependencies)
        };
        self.remove_subscriber_from_all(&old_deps, id);

        let recompute_fn = self
            .computeds
            .borrow()
            .get(id)
            .expect("valid computed")
            .recompute
            .clone();

        let prev_consumer = self.current_consumer.replace(Some(id));
        let prev_tracking = self.tracking.replace(true);
        self.compute_stack.borrow_mut().push(id);

        let result = recompute_fn();

        self.compute_stack.borrow_mut().pop();
        self.current_consumer.set(prev_consumer);
        self.tracking.set(prev_tracking);

        match result {
            Ok(value) => {
                let mut computeds = self.computeds.borrow_mut();
                let slot = computeds.get_mut(id).expect("valid computed");
                slot.value = Some(value);
                slot.dirty = false;
                drop(computeds);
                // current_consumer is already restored to whoever triggered
                // this recompute (possibly nested, via another recompute's
                // own dependency read); register the edge the same way any
                // other producer read would.
                self.track_read(id);
                Ok(())
            }
            Err(e) => Err(unwrap_engine_error(e)),
        }
    }

    // ---- writes ---------------------------------------------------------

    /// Writes `value` into the Source, gated on `PartialEq`: if the new
    /// value equals the old one, nothing is marked dirty and no propagation
    /// happens at all.
    pub(crate) fn write_source<T: PartialEq + 'static>(
        self: &Rc<Self>,
        id: NodeId,
        value: T,
    ) -> Result<(), EngineError> {
        let changed = {
            let mut sources = self.sources.borrow_mut();
            let slot = sources.get_mut(id).expect("source id valid for its own graph");
            let old = slot
                .value
                .downcast_ref::<T>()
                .expect("Source<T> handle type matches stored value");
            let changed = *old != value;
            if changed {
                slot.value = Box::new(value);
            }
            changed
        };
        if !changed || self.disposed.get() {
            return Ok(());
        }
        self.notify_subscribers_of(id);
        if self.batch_depth.get() == 0 {
            self.flush()
        } else {
            Ok(())
        }
    }

    fn notify_subscribers_of(&self, producer: NodeId) {
        let subs: Vec<NodeId> = if let Some(slot) = self.sources.borrow().get(producer) {
            slot.subscribers.clone()
        } else if let Some(slot) = self.computeds.borrow().get(producer) {
            slot.subscribers.clone()
        } else {
            Vec::new()
        };
        for sub in subs {
            if self.computeds.borrow().contains_key(sub) {
                self.computeds.borrow_mut().get_mut(sub).expect("just checked").dirty = true;
                self.enqueue_update(sub);
            } else if self.effects.borrow().contains_key(sub) {
                self.effects.borrow_mut().get_mut(sub).expect("just checked").dirty = true;
                self.enqueue_effect(sub);
            }
        }
    }

    fn enqueue_update(&self, id: NodeId) {
        let mut queued = self.update_queued.borrow_mut();
        if queued.get(id).is_none() {
            queued.insert(id, ());
            self.update_queue.borrow_mut().push_back(id);
        }
    }

    fn enqueue_effect(&self, id: NodeId) {
        let mut queued = self.effect_queued.borrow_mut();
        if queued.get(id).is_none() {
            queued.insert(id, ());
            self.effect_queue.borrow_mut().push_back(id);
        }
    }

    // ---- flush ------------------------------------------------------------

    /// Drains the update queue to fixpoint, then runs queued effects.
    ///
    /// Re-entrant calls (an Effect or Computed writes an unbatched Source
    /// while this is already running) return immediately: the active
    /// invocation's own `loop` picks up whatever that write enqueued on its
    /// next iteration, so writes nested inside a dispatch run in a later
    /// pass of the same flush rather than recursively inside the writer's
    /// call stack. Mirrors `Runtime::run_queue`'s `running_queue` guard in
    /// the teacher.
    pub(crate) fn flush(self: &Rc<Self>) -> Result<(), EngineError> {
        if self.flushing.get() {
            return Ok(());
        }
        self.flushing.set(true);
        let result = self.flush_inner();
        self.flushing.set(false);
        result
    }

    fn flush_inner(self: &Rc<Self>) -> Result<(), EngineError> {
        tracing::debug!("flush start");
        let mut first_error = None;
        loop {
            while let Some(id) = {
                let popped = self.update_queue.borrow_mut().pop_front();
                if let Some(id) = popped {
                    self.update_queued.borrow_mut().remove(id);
                }
                popped
            } {
                self.notify_subscribers_of(id);
            }

            let Some(id) = ({
                let popped = self.effect_queue.borrow_mut().pop_front();
                if let Some(id) = popped {
                    self.effect_queued.borrow_mut().remove(id);
                }
                popped
            }) else {
                break;
            };

            let still_dirty = self
                .effects
                .borrow()
                .get(id)
                .map(|s| s.dirty && !s.disposed)
                .unwrap_or(false);
            if !still_dirty {
                continue;
            }
            if let Err(e) = self.run_effect(id) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        tracing::debug!("flush end");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn batch<R>(self: &Rc<Self>, body: impl FnOnce() -> R) -> (R, Result<(), EngineError>) {
        self.batch_depth.set(self.batch_depth.get() + 1);
        let result = body();
        self.batch_depth.set(self.batch_depth.get() - 1);
        let flushed = if self.batch_depth.get() == 0 {
            self.flush()
        } else {
            Ok(())
        };
        (result, flushed)
    }

    pub(crate) fn untrack<R>(&self, body: impl FnOnce() -> R) -> R {
        let prev = self.tracking.replace(false);
        let result = body();
        self.tracking.set(prev);
        result
    }

    // ---- effects ------------------------------------------------------

    fn run_effect(self: &Rc<Self>, id: NodeId) -> Result<(), EngineError> {
        if self.disposed.get() {
            return Ok(());
        }

        let prev_cleanup = self
            .effects
            .borrow_mut()
            .get_mut(id)
            .and_then(|s| s.cleanup.take());
        if let Some(cleanup) = prev_cleanup {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup)).is_err() {
                tracing::warn!(?id, "effect cleanup panicked; ignoring");
            }
        }

        let deps = self
            .effects
            .borrow_mut()
            .get_mut(id)
            .map(|s| std::mem::take(&mut s.dependencies))
            .unwrap_or_default();
        self.remove_subscriber_from_all(&deps, id);
        if let Some(slot) = self.effects.borrow_mut().get_mut(id) {
            slot.dirty = false;
        }

        let body = self
            .effects
            .borrow()
            .get(id)
            .expect("effect id valid for its own graph")
            .body
            .clone();

        ACTIVE_EFFECT_GRAPHS.with(|stack| stack.borrow_mut().push(self.clone()));
        let prev_consumer = self.current_consumer.replace(Some(id));
        let prev_tracking = self.tracking.replace(true);

        let result = body();

        self.current_consumer.set(prev_consumer);
        self.tracking.set(prev_tracking);
        ACTIVE_EFFECT_GRAPHS.with(|stack| {
            stack.borrow_mut().pop();
        });

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(slot) = self.effects.borrow_mut().get_mut(id) {
                    slot.dirty = true;
                }
                Err(unwrap_engine_error(e))
            }
        }
    }

    pub(crate) fn register_cleanup(&self, f: Cleanup) {
        let Some(consumer) = self.current_consumer.get() else {
            return;
        };
        let mut effects = self.effects.borrow_mut();
        let Some(slot) = effects.get_mut(consumer) else {
            return;
        };
        match slot.cleanup.take() {
            None => slot.cleanup = Some(f),
            Some(prev) => {
                slot.cleanup = Some(Box::new(move || {
                    prev();
                    f();
                }))
            }
        }
    }

    // ---- disposal ------------------------------------------------------

    pub(crate) fn dispose_effect(&self, id: NodeId) {
        let already = self
            .effects
            .borrow()
            .get(id)
            .map(|s| s.disposed)
            .unwrap_or(true);
        if already {
            return;
        }
        let (cleanup, deps) = {
            let mut effects = self.effects.borrow_mut();
            let Some(slot) = effects.get_mut(id) else {
                return;
            };
            slot.disposed = true;
            (slot.cleanup.take(), std::mem::take(&mut slot.dependencies))
        };
        if let Some(cleanup) = cleanup {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup)).is_err() {
                tracing::warn!(?id, "effect cleanup panicked during dispose; ignoring");
            }
        }
        self.remove_subscriber_from_all(&deps, id);
        self.effects.borrow_mut().remove(id);

        self.dispose_children(id);
        self.unlink_from_parent(id);
        self.aux.borrow_mut().remove(id);
    }

    fn dispose_children(&self, id: NodeId) {
        let children = self
            .aux
            .borrow_mut()
            .get_mut(id)
            .map(|a| std::mem::take(&mut a.children))
            .unwrap_or_default();
        for child in children {
            if self.effects.borrow().contains_key(child) {
                self.dispose_effect(child);
            } else {
                self.dispose_scope(child);
            }
        }
    }

    /// Disposes a scope created by [`Graph::create_scope`]: recursively
    /// disposes every child effect and nested scope, then forgets the scope
    /// itself. Scopes don't own a Source/Computed/Effect slot of their own,
    /// only an entry in the aux parent/children side-table.
    pub(crate) fn dispose_scope(&self, id: NodeId) {
        self.dispose_children(id);
        self.unlink_from_parent(id);
        self.aux.borrow_mut().remove(id);
    }

    pub(crate) fn dispose_graph(&self) {
        if self.disposed.get() {
            return;
        }
        let ids: Vec<NodeId> = self.effects.borrow().keys().collect();
        for id in ids {
            let cleanup = self
                .effects
                .borrow_mut()
                .get_mut(id)
                .and_then(|s| s.cleanup.take());
            if let Some(cleanup) = cleanup {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup)).is_err() {
                    tracing::warn!(?id, "effect cleanup panicked during graph disposal; ignoring");
                }
            }
        }
        self.effects.borrow_mut().clear();
        self.update_queue.borrow_mut().clear();
        self.update_queued.borrow_mut().clear();
        self.effect_queue.borrow_mut().clear();
        self.effect_queued.borrow_mut().clear();
        self.disposed.set(true);
        tracing::debug!("graph disposed");
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub(crate) fn signal_count(&self) -> usize {
        self.sources.borrow().len() + self.computeds.borrow().len()
    }

    pub(crate) fn effect_count(&self) -> usize {
        self.effects.borrow().len()
    }

    pub(crate) fn source_subscriber_count(&self, id: NodeId) -> usize {
        self.sources.borrow().get(id).map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub(crate) fn computed_subscriber_count(&self, id: NodeId) -> usize {
        self.computeds.borrow().get(id).map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub(crate) fn computed_dependency_count(&self, id: NodeId) -> usize {
        self.computeds.borrow().get(id).map(|s| s.dependencies.len()).unwrap_or(0)
    }

    pub(crate) fn computed_is_dirty(&self, id: NodeId) -> bool {
        self.computeds.borrow().get(id).map(|s| s.dirty).unwrap_or(false)
    }

    pub(crate) fn effect_dependency_count(&self, id: NodeId) -> usize {
        self.effects.borrow().get(id).map(|s| s.dependencies.len()).unwrap_or(0)
    }

    pub(crate) fn effect_is_dirty(&self, id: NodeId) -> bool {
        self.effects.borrow().get(id).map(|s| s.dirty).unwrap_or(false)
    }

    #[cfg(debug_assertions)]
    pub(crate) fn debug_label(&self, id: NodeId) -> Option<String> {
        self.aux.borrow().get(id).and_then(|a| a.debug_label.clone())
    }

    #[cfg(debug_assertions)]
    pub(crate) fn set_debug_label(&self, id: NodeId, label: impl Into<String>) {
        if let Some(aux) = self.aux.borrow_mut().get_mut(id) {
            aux.debug_label = Some(label.into());
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn defined_at(&self, id: NodeId) -> Option<&'static Location<'static>> {
        self.aux.borrow().get(id).and_then(|a| a.defined_at)
    }

    /// The scope a node was created under, if any. `None` for nodes created
    /// outside of any [`Graph::create_scope`] call.
    #[cfg(debug_assertions)]
    pub(crate) fn parent_scope(&self, id: NodeId) -> Option<NodeId> {
        self.parent_of(id)
    }

    /// Same lookup as [`Self::parent_scope`], available in every build:
    /// disposal needs this to unlink a disposed node from its parent's
    /// `children` list, not just debug-build diagnostics.
    fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.aux.borrow().get(id).and_then(|a| a.parent)
    }

    /// Removes `child` from `parent`'s `children` list, if present.
    fn unlink_from_parent(&self, id: NodeId) {
        let Some(parent) = self.parent_of(id) else {
            return;
        };
        if let Some(aux) = self.aux.borrow_mut().get_mut(parent) {
            if let Some(pos) = aux.children.iter().position(|&c| c == id) {
                aux.children.swap_remove(pos);
            }
        }
    }
}

/// A recompute or effect closure propagates dependency errors with `?`,
/// which boxes them as `Box<dyn Error>` at each nested call. Without this,
/// a `CycleDetected` raised several levels down would arrive at the
/// original caller buried in nested `UserFailure`s. Downcasting first keeps
/// the original `EngineError` variant intact as it crosses each boundary.
fn unwrap_engine_error(e: Box<dyn std::error::Error>) -> EngineError {
    match e.downcast::<EngineError>() {
        Ok(engine_err) => *engine_err,
        Err(other) => EngineError::UserFailure(other),
    }
}

/// A reactive state graph: the arena that owns every Source, Computed, and
/// Effect created against it, plus the scheduler that propagates writes and
/// runs effects. Cheap to clone (an `Rc` bump); clones refer to the same
/// underlying graph.
#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Rc<GraphInner>,
}

impl Graph {
    /// Creates a new, empty, independent graph. Writes in one `Graph` never
    /// affect another, even if nodes happen to hold equal values.
    pub fn new() -> Self {
        Graph { inner: GraphInner::new() }
    }

    /// Runs `body`, deferring all propagation until `body` returns. Nested
    /// batches only flush when the outermost batch exits. Returns `body`'s
    /// result; if flushing at the outermost exit triggers an effect failure,
    /// that error is returned separately.
    pub fn batch<R>(&self, body: impl FnOnce() -> R) -> (R, Result<(), EngineError>) {
        self.inner.batch(body)
    }

    /// Runs `body` with dependency tracking suspended: reads performed
    /// inside `body` do not register the currently-running Computed or
    /// Effect as a subscriber.
    pub fn untrack<R>(&self, body: impl FnOnce() -> R) -> R {
        self.inner.untrack(body)
    }

    /// Runs `body`, registering every Source/Computed/Effect it creates as a
    /// child of a new scope. Disposing the returned `Scope` disposes those
    /// children (recursively, including nested scopes) without disposing
    /// the whole graph.
    pub fn create_scope(&self, body: impl FnOnce()) -> crate::node::Scope {
        let id = self.inner.create_scope();
        let prev = self.inner.current_scope.replace(Some(id));
        body();
        self.inner.current_scope.set(prev);
        crate::node::Scope::from_parts(self.clone(), id)
    }

    /// Disposes every Effect in the graph (idempotent) and clears the
    /// scheduler's queues. Sources and Computeds keep their last values and
    /// remain individually readable; see `Source::read`/`Computed::read` for
    /// post-disposal semantics.
    pub fn dispose(&self) {
        self.inner.dispose_graph();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Number of Source + Computed nodes currently alive in the graph.
    pub fn signal_count(&self) -> usize {
        self.inner.signal_count()
    }

    /// Number of Effect nodes currently alive (not yet disposed) in the graph.
    pub fn effect_count(&self) -> usize {
        self.inner.effect_count()
    }

    /// Creates a [`crate::Source`] with initial value `value` on this graph.
    /// Fails with [`EngineError::GraphDisposed`] if the graph has already
    /// been disposed.
    #[track_caller]
    pub fn create_source<T: PartialEq + Clone + 'static>(
        &self,
        value: T,
    ) -> Result<crate::node::Source<T>, EngineError> {
        crate::node::Source::new(self, value)
    }

    /// Creates a [`crate::Computed`] on this graph. `f` is re-run, with
    /// dependency tracking, every time the node is read while dirty. Fails
    /// with [`EngineError::GraphDisposed`] if the graph has already been
    /// disposed.
    #[track_caller]
    pub fn create_computed<T, F>(&self, f: F) -> Result<crate::node::Computed<T>, EngineError>
    where
        T: Clone + 'static,
        F: Fn() -> Result<T, Box<dyn std::error::Error>> + 'static,
    {
        crate::node::Computed::new(self, f)
    }

    /// Creates a [`crate::Effect`] on this graph and runs it once
    /// immediately, synchronously, to capture its initial dependencies.
    /// Fails with [`EngineError::GraphDisposed`] if the graph has already
    /// been disposed; otherwise returns the handle alongside the result of
    /// that initial run (which may itself carry a [`EngineError::UserFailure`]).
    #[track_caller]
    pub fn create_effect<F>(
        &self,
        f: F,
    ) -> Result<(crate::node::Effect, Result<(), EngineError>), EngineError>
    where
        F: Fn() -> Result<(), Box<dyn std::error::Error>> + 'static,
    {
        crate::node::Effect::new(self, f)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers `f` to run the next time the current Effect re-runs or is
/// disposed. Cleanups accumulate in registration order and all run before
/// the effect body re-executes. A no-op outside of an actively-running
/// Effect (including from inside a Computed).
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    ACTIVE_EFFECT_GRAPHS.with(|stack| {
        if let Some(graph) = stack.borrow().last() {
            graph.register_cleanup(Box::new(f));
        }
    });
}
