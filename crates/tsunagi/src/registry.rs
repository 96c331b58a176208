use crate::handler::{EventKind, HandlerDescriptor};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// `first_for_kind` is set when the kind had no handlers before, so its routing key needs binding.
    Added { first_for_kind: bool },
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// `last_for_kind` is set when no handlers remain, so its routing key can be unbound.
    Removed { last_for_kind: bool },
    NotFound,
}

/// Kind name to handler descriptors, in subscription order.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Vec<HandlerDescriptor>>,
    kinds: HashMap<&'static str, EventKind>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, descriptor: HandlerDescriptor) -> Registration {
        let kind = descriptor.kind();
        let handlers = self.handlers.entry(kind.name()).or_default();
        if handlers.contains(&descriptor) {
            return Registration::AlreadyRegistered;
        }

        let first_for_kind = handlers.is_empty();
        handlers.push(descriptor);
        self.kinds.insert(kind.name(), kind);
        Registration::Added { first_for_kind }
    }

    pub fn remove(&mut self, descriptor: &HandlerDescriptor) -> Removal {
        let name = descriptor.kind_name();
        let Some(handlers) = self.handlers.get_mut(name) else {
            return Removal::NotFound;
        };
        let Some(position) = handlers.iter().position(|d| d == descriptor) else {
            return Removal::NotFound;
        };

        handlers.remove(position);
        let last_for_kind = handlers.is_empty();
        if last_for_kind {
            self.handlers.remove(name);
            self.kinds.remove(name);
        }
        Removal::Removed { last_for_kind }
    }

    pub fn contains(&self, descriptor: &HandlerDescriptor) -> bool {
        self.handlers
            .get(descriptor.kind_name())
            .is_some_and(|handlers| handlers.contains(descriptor))
    }

    pub fn has_subscriptions_for(&self, kind: &str) -> bool {
        self.handlers.get(kind).is_some_and(|handlers| !handlers.is_empty())
    }

    /// Snapshot of the descriptors for `kind`; empty when the kind is unknown.
    pub fn handlers_for(&self, kind: &str) -> Vec<HandlerDescriptor> {
        self.handlers.get(kind).cloned().unwrap_or_default()
    }

    pub fn kind(&self, kind: &str) -> Option<EventKind> {
        self.kinds.get(kind).copied()
    }

    /// Sorted kind names with at least one handler.
    pub fn subscribed_kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.kinds.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
        self.kinds.clear();
    }
}
