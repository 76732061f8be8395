//! Event filters and subscriptions
//!
//! A [`Filter`] is an immutable predicate over events. A
//! [`Subscription`] chains filters with AND semantics and notifies
//! registered observers whenever its filter set changes, so connectors
//! can narrow what they receive. Reconfiguration replaces filters —
//! a filter instance is never mutated.

use std::sync::Arc;

use crate::event::{Event, EventId, ParticipantId};
use crate::scope::Scope;

/// An immutable event predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches events whose scope equals or is a sub-scope of `scope`
    Scope { scope: Scope },

    /// Matches events by origin participant; `invert` negates
    Origin {
        participant_id: ParticipantId,
        invert: bool,
    },

    /// Matches events carrying `cause` in their causal vector; `invert`
    /// is the exact logical negation
    Cause { cause: EventId, invert: bool },

    /// Matches events by payload type tag
    Type { type_tag: String },
}

impl Filter {
    /// Filter on a scope and its descendants
    pub fn scope(scope: Scope) -> Self {
        Filter::Scope { scope }
    }

    /// Filter on the origin participant
    pub fn origin(participant_id: ParticipantId) -> Self {
        Filter::Origin {
            participant_id,
            invert: false,
        }
    }

    /// Filter out the origin participant
    pub fn origin_inverted(participant_id: ParticipantId) -> Self {
        Filter::Origin {
            participant_id,
            invert: true,
        }
    }

    /// Filter on a causal link
    pub fn cause(cause: EventId) -> Self {
        Filter::Cause {
            cause,
            invert: false,
        }
    }

    /// Filter out events carrying a causal link
    pub fn cause_inverted(cause: EventId) -> Self {
        Filter::Cause {
            cause,
            invert: true,
        }
    }

    /// Filter on the payload type tag
    pub fn payload_type(type_tag: impl Into<String>) -> Self {
        Filter::Type {
            type_tag: type_tag.into(),
        }
    }

    /// Evaluate this filter against an event
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Filter::Scope { scope } => {
                *scope == event.scope || scope.is_super_scope_of(&event.scope)
            }
            Filter::Origin {
                participant_id,
                invert,
            } => {
                let from_origin = event
                    .id()
                    .map(|id| id.participant_id == *participant_id)
                    .unwrap_or(false);
                from_origin != *invert
            }
            Filter::Cause { cause, invert } => event.is_cause(cause) != *invert,
            Filter::Type { type_tag } => event.type_tag == *type_tag,
        }
    }
}

/// What happened to a filter in a [`Subscription`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Added,
    Removed,
}

/// Observer of filter changes on a subscription
///
/// Connectors register one of these when they want to narrow what they
/// receive based on the current filter set.
pub trait FilterObserver: Send + Sync {
    fn filter_changed(&self, filter: &Filter, action: FilterAction);
}

/// An ordered filter chain with AND semantics plus observer registration
#[derive(Default)]
pub struct Subscription {
    filters: Vec<Filter>,
    observers: Vec<Arc<dyn FilterObserver>>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current filter chain, in registration order
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Append a filter and notify observers
    pub fn add_filter(&mut self, filter: Filter) {
        for observer in &self.observers {
            observer.filter_changed(&filter, FilterAction::Added);
        }
        self.filters.push(filter);
    }

    /// Remove the first matching filter and notify observers; returns
    /// false if no filter matched
    pub fn remove_filter(&mut self, filter: &Filter) -> bool {
        let Some(position) = self.filters.iter().position(|f| f == filter) else {
            return false;
        };
        let removed = self.filters.remove(position);
        for observer in &self.observers {
            observer.filter_changed(&removed, FilterAction::Removed);
        }
        true
    }

    /// Register a filter-change observer
    pub fn add_observer(&mut self, observer: Arc<dyn FilterObserver>) {
        self.observers.push(observer);
    }

    /// True iff the event satisfies every filter in the chain
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().all(|f| f.matches(event))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("filters", &self.filters)
            .field("observers", &self.observers.len())
            .finish()
    }
}
