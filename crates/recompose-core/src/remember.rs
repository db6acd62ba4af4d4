//! Lifecycle of values stored by `remember`.
//!
//! Callbacks never run while a pass is building its changes. They are queued
//! and dispatched once the pass commits, or abandoned when it does not.

use std::any::Any;
use std::rc::Rc;

use crate::owned::Owned;

/// Implemented by remembered values that want to know when they enter or
/// leave the composition.
pub trait RememberObserver {
    /// The value was stored by a committed pass.
    fn on_remembered(&self);

    /// The group holding the value was removed, or the value was replaced.
    fn on_forgotten(&self);

    /// The value was created by a pass that never committed.
    fn on_abandoned(&self);
}

/// Lets an [`Owned`] value observe its own lifecycle.
struct OwnedObserver<T>(Owned<T>);

impl<T: RememberObserver> RememberObserver for OwnedObserver<T> {
    fn on_remembered(&self) {
        self.0.with(|value| value.on_remembered());
    }

    fn on_forgotten(&self) {
        self.0.with(|value| value.on_forgotten());
    }

    fn on_abandoned(&self) {
        self.0.with(|value| value.on_abandoned());
    }
}

/// What a `remember` slot holds.
pub(crate) struct RememberedValue {
    value: Box<dyn Any>,
    observer: Option<Rc<dyn RememberObserver>>,
}

impl RememberedValue {
    pub(crate) fn plain<T: 'static>(value: Owned<T>) -> Self {
        Self {
            value: Box::new(value),
            observer: None,
        }
    }

    pub(crate) fn observed<T: RememberObserver + 'static>(value: Owned<T>) -> Self {
        Self {
            observer: Some(Rc::new(OwnedObserver(value.clone()))),
            value: Box::new(value),
        }
    }

    /// The stored handle, if it holds a `T`.
    pub(crate) fn get<T: 'static>(&self) -> Option<Owned<T>> {
        self.value.downcast_ref::<Owned<T>>().cloned()
    }

    pub(crate) fn observer(&self) -> Option<&Rc<dyn RememberObserver>> {
        self.observer.as_ref()
    }
}

/// Callbacks collected during one pass.
#[derive(Default)]
pub(crate) struct RememberEvents {
    remembering: Vec<Rc<dyn RememberObserver>>,
    forgetting: Vec<Rc<dyn RememberObserver>>,
}

impl RememberEvents {
    pub(crate) fn remembering(&mut self, observer: Rc<dyn RememberObserver>) {
        self.remembering.push(observer);
    }

    pub(crate) fn forgetting(&mut self, observer: Rc<dyn RememberObserver>) {
        self.forgetting.push(observer);
    }

    /// Forgotten values are told first, innermost and latest first, then new
    /// values in the order they were remembered.
    pub(crate) fn dispatch(&mut self) {
        let forgetting = std::mem::take(&mut self.forgetting);
        let remembering = std::mem::take(&mut self.remembering);
        if !forgetting.is_empty() || !remembering.is_empty() {
            log::trace!(
                "dispatching {} forgotten and {} remembered values",
                forgetting.len(),
                remembering.len()
            );
        }
        for observer in forgetting.iter().rev() {
            observer.on_forgotten();
        }
        for observer in &remembering {
            observer.on_remembered();
        }
    }

    /// The pass is thrown away: new values are abandoned and values slated for
    /// forgetting stay in the composition.
    pub(crate) fn abandon(&mut self) {
        self.forgetting.clear();
        for observer in std::mem::take(&mut self.remembering).iter().rev() {
            observer.on_abandoned();
        }
    }
}
