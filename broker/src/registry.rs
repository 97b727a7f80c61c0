//! Slug → binding map, and the per-slug queue of unforwarded pending
//! record ids awaiting a binding (§4.2).

use std::time::Instant;

use dashmap::DashMap;

use crate::control::SessionId;
use crate::types::{RequestId, Slug};

#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub session_id: SessionId,
    pub bound_at: Instant,
}

/// Owns the single-holder mapping from slug to binding, and the ordered
/// queue of request ids waiting on a slug that has no binding yet.
#[derive(Default)]
pub struct SlugRegistry {
    bindings: DashMap<Slug, Binding>,
    queues: DashMap<Slug, Vec<RequestId>>,
}

impl SlugRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding_for(&self, slug: &Slug) -> Option<Binding> {
        self.bindings.get(slug).map(|b| *b)
    }

    pub fn is_bound_by(&self, slug: &Slug, session_id: SessionId) -> bool {
        self.bindings.get(slug).is_some_and(|b| b.session_id == session_id)
    }

    /// Installs `binding` for `slug`, returning the previous binding if one
    /// existed. The caller is responsible for closing the old session
    /// *before* calling this, per the replacement protocol in §4.2.
    pub fn set_binding(&self, slug: Slug, binding: Binding) -> Option<Binding> {
        self.bindings.insert(slug, binding)
    }

    /// Removes the binding for `slug` only if it is still held by
    /// `session_id`. Returns `true` if a binding was removed.
    pub fn remove_binding_if(&self, slug: &Slug, session_id: SessionId) -> bool {
        let Some(entry) = self.bindings.get(slug) else {
            return false;
        };
        if entry.session_id != session_id {
            return false;
        }
        drop(entry);
        self.bindings.remove(slug).is_some()
    }

    /// Appends `id` to the tail of the unforwarded queue for `slug`,
    /// preserving admission order.
    pub fn enqueue(&self, slug: &Slug, id: RequestId) {
        self.queues.entry(slug.clone()).or_default().push(id);
    }

    /// Removes and returns the entire queue for `slug`, in admission order,
    /// for draining against a newly installed binding.
    pub fn take_queue(&self, slug: &Slug) -> Vec<RequestId> {
        self.queues.remove(slug).map(|(_, v)| v).unwrap_or_default()
    }

    /// Removes a single id from a slug's queue, used when a queued record's
    /// wait deadline fires before any binding arrives.
    pub fn remove_from_queue(&self, slug: &Slug, id: RequestId) {
        if let Some(mut queue) = self.queues.get_mut(slug) {
            queue.retain(|queued| *queued != id);
        }
    }

    /// A point-in-time copy of every live binding. Used only for the rare
    /// reverse lookup (session id -> its bound slug) on session loss; the
    /// live binding set is expected to be small relative to request volume.
    pub fn bindings_snapshot(&self) -> Vec<(Slug, Binding)> {
        self.bindings.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    /// The slugs currently bound to a live handler, for the status
    /// dashboard's `activeClients` listing.
    pub fn bound_slugs(&self) -> Vec<String> {
        self.bindings.iter().map(|e| e.key().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(n: u64) -> SessionId {
        SessionId::from_raw(n)
    }

    fn slug(s: &str) -> Slug {
        crate::validation::validate_slug(s).unwrap()
    }

    #[test]
    fn at_most_one_binding_per_slug() {
        let registry = SlugRegistry::new();
        let s = slug("svc-a");
        let old = registry.set_binding(
            s.clone(),
            Binding { session_id: session(1), bound_at: Instant::now() },
        );
        assert!(old.is_none());
        let old = registry.set_binding(
            s.clone(),
            Binding { session_id: session(2), bound_at: Instant::now() },
        );
        assert_eq!(old.unwrap().session_id, session(1));
        assert_eq!(registry.binding_for(&s).unwrap().session_id, session(2));
    }

    #[test]
    fn remove_binding_if_only_removes_current_holder() {
        let registry = SlugRegistry::new();
        let s = slug("svc-b");
        registry.set_binding(s.clone(), Binding { session_id: session(1), bound_at: Instant::now() });
        assert!(!registry.remove_binding_if(&s, session(2)));
        assert!(registry.binding_for(&s).is_some());
        assert!(registry.remove_binding_if(&s, session(1)));
        assert!(registry.binding_for(&s).is_none());
    }

    #[test]
    fn queue_preserves_admission_order() {
        let registry = SlugRegistry::new();
        let s = slug("svc-c");
        let ids: Vec<_> = (0..3).map(|_| RequestId::new()).collect();
        for id in &ids {
            registry.enqueue(&s, *id);
        }
        assert_eq!(registry.take_queue(&s), ids);
        assert!(registry.take_queue(&s).is_empty());
    }
}
