use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

type Factory = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

struct Registration {
    name: &'static str,
    factory: Factory,
}

/// Process-wide service container from which handlers are resolved at dispatch time.
///
/// Handlers are registered either as a shared singleton or as a transient factory invoked on every
/// resolution. The bus only keeps descriptors and asks the container for a live instance per delivery.
#[derive(Clone, Default)]
pub struct ServiceContainer {
    registrations: Arc<RwLock<HashMap<TypeId, Registration>>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_singleton<H>(&self, service: H) -> &Self
    where
        H: Send + Sync + 'static,
    {
        let service = Arc::new(service);
        self.insert::<H>(Arc::new(move || Arc::clone(&service) as Arc<dyn Any + Send + Sync>))
    }

    pub fn register_transient<H, F>(&self, factory: F) -> &Self
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.insert::<H>(Arc::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>))
    }

    fn insert<H: 'static>(&self, factory: Factory) -> &Self {
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                TypeId::of::<H>(),
                Registration {
                    name: type_name::<H>(),
                    factory,
                },
            );
        self
    }

    pub fn resolve<H>(&self) -> Option<Arc<H>>
    where
        H: Send + Sync + 'static,
    {
        let factory = {
            let registrations = self.registrations.read().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(&registrations.get(&TypeId::of::<H>())?.factory)
        };
        factory().downcast::<H>().ok()
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<H>())
    }

    pub fn remove<H: 'static>(&self) -> bool {
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<H>())
            .is_some()
    }
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registrations = self.registrations.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&str> = registrations.values().map(|r| r.name).collect();
        names.sort_unstable();
        f.debug_struct("ServiceContainer").field("services", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Mailer {
        sent: AtomicUsize,
    }

    struct AuditLog;

    #[test]
    fn test_singleton_is_shared() {
        let container = ServiceContainer::new();
        container.register_singleton(Mailer {
            sent: AtomicUsize::new(0),
        });

        let first = container.resolve::<Mailer>().unwrap();
        first.sent.fetch_add(1, Ordering::SeqCst);
        let second = container.resolve::<Mailer>().unwrap();

        assert_eq!(second.sent.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_transient_builds_fresh_instances() {
        let container = ServiceContainer::new();
        container.register_transient(|| Mailer {
            sent: AtomicUsize::new(0),
        });

        let first = container.resolve::<Mailer>().unwrap();
        first.sent.fetch_add(1, Ordering::SeqCst);
        let second = container.resolve::<Mailer>().unwrap();

        assert_eq!(second.sent.load(Ordering::SeqCst), 0);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unregistered_service_is_not_resolved() {
        let container = ServiceContainer::new();
        container.register_singleton(AuditLog);
        assert!(container.resolve::<Mailer>().is_none());
        assert!(container.contains::<AuditLog>());
        assert!(container.remove::<AuditLog>());
        assert!(!container.contains::<AuditLog>());
    }

    #[test]
    fn test_clones_share_registrations() {
        let container = ServiceContainer::new();
        let clone = container.clone();
        clone.register_singleton(AuditLog);
        assert!(container.resolve::<AuditLog>().is_some());
        assert!(format!("{container:?}").contains("AuditLog"));
    }
}
