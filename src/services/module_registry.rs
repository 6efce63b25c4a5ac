// Module Registry
// Typed DI container with a uniform lifecycle contract across components

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::services::{RelayError, RelayResult};

/// Lifecycle state of a registered module.
///
/// The happy path is strictly linear; `Error` is terminal and reachable from
/// any state when a lifecycle operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    Created,
    Initializing,
    Initialized,
    Activating,
    Active,
    Deactivating,
    Deactivated,
    Destroying,
    Destroyed,
    Error,
}

impl ModuleState {
    /// The state a lifecycle operation must start from.
    fn required_predecessor(self) -> Option<ModuleState> {
        match self {
            ModuleState::Initializing => Some(ModuleState::Created),
            ModuleState::Activating => Some(ModuleState::Initialized),
            ModuleState::Deactivating => Some(ModuleState::Active),
            ModuleState::Destroying => Some(ModuleState::Deactivated),
            _ => None,
        }
    }
}

/// Uniform component contract driven by the registry.
///
/// Implementations keep these operations idempotent-friendly: the registry
/// guards transitions, so a module method is only ever invoked from the
/// matching state.
#[async_trait]
pub trait Module: Send + Sync {
    async fn initialize(&self) -> RelayResult<()> {
        Ok(())
    }

    async fn activate(&self) -> RelayResult<()> {
        Ok(())
    }

    async fn deactivate(&self) -> RelayResult<()> {
        Ok(())
    }

    async fn destroy(&self) -> RelayResult<()> {
        Ok(())
    }

    /// Synchronous status snapshot for diagnostics.
    fn status(&self) -> Value {
        json!({})
    }
}

type ModuleFactory = Box<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

struct Registration {
    name: String,
    dependencies: Vec<String>,
    exports: Vec<String>,
    factory: ModuleFactory,
    singleton: bool,
    instance: Mutex<Option<Arc<dyn Module>>>,
    state: Mutex<ModuleState>,
}

impl Registration {
    fn state(&self) -> ModuleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ModuleState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Guarded transition into an `-ing` state. Fails without mutating
    /// state when the module is not in the required predecessor state.
    fn begin(&self, next: ModuleState) -> RelayResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let required = next.required_predecessor();
        if required != Some(*state) {
            return Err(RelayError::StateMismatch {
                module: self.name.clone(),
                from: *state,
                requested: next,
            });
        }
        *state = next;
        Ok(())
    }

    fn instantiate(&self) -> Arc<dyn Module> {
        if !self.singleton {
            return (self.factory)();
        }
        let mut instance = self.instance.lock().unwrap_or_else(|e| e.into_inner());
        match instance.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = (self.factory)();
                *instance = Some(Arc::clone(&created));
                created
            }
        }
    }
}

/// Registry of all components, driven in registration (dependency) order on
/// the way up and in reverse order on the way down.
pub struct ModuleRegistry {
    registrations: Mutex<Vec<Arc<Registration>>>,
    resolve_cache: Mutex<HashMap<String, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            resolve_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register a singleton module. Re-registering an existing name fails.
    pub fn register<F>(
        &self,
        name: &str,
        dependencies: &[&str],
        exports: &[&str],
        factory: F,
    ) -> RelayResult<()>
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        self.register_full(name, dependencies, exports, true, factory)
    }

    pub fn register_full<F>(
        &self,
        name: &str,
        dependencies: &[&str],
        exports: &[&str],
        singleton: bool,
        factory: F,
    ) -> RelayResult<()>
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        let mut registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        if registrations.iter().any(|r| r.name == name) {
            return Err(RelayError::AlreadyRegistered(name.to_string()));
        }
        registrations.push(Arc::new(Registration {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
            exports: exports.iter().map(|s| s.to_string()).collect(),
            factory: Box::new(factory),
            singleton,
            instance: Mutex::new(None),
            state: Mutex::new(ModuleState::Created),
        }));
        drop(registrations);

        // Any registration invalidates previously resolved lookups
        self.resolve_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    /// Resolve by module name or by exported interface name. The first
    /// registration wins for exports; results are cached until the next
    /// registration.
    pub fn resolve(&self, name_or_export: &str) -> RelayResult<Arc<dyn Module>> {
        if let Some(cached) = self
            .resolve_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name_or_export)
        {
            return Ok(Arc::clone(cached));
        }

        let registration = {
            let registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
            registrations
                .iter()
                .find(|r| r.name == name_or_export)
                .or_else(|| {
                    registrations
                        .iter()
                        .find(|r| r.exports.iter().any(|e| e == name_or_export))
                })
                .map(Arc::clone)
        }
        .ok_or_else(|| RelayError::UnknownModule(name_or_export.to_string()))?;

        let instance = registration.instantiate();
        if registration.singleton {
            self.resolve_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name_or_export.to_string(), Arc::clone(&instance));
        }
        Ok(instance)
    }

    /// Every singleton exporting the given interface, in registration order.
    pub fn resolve_all(&self, export: &str) -> Vec<Arc<dyn Module>> {
        let registrations: Vec<Arc<Registration>> = {
            let registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
            registrations
                .iter()
                .filter(|r| r.exports.iter().any(|e| e == export))
                .map(Arc::clone)
                .collect()
        };
        registrations.iter().map(|r| r.instantiate()).collect()
    }

    fn ordered(&self) -> Vec<Arc<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(Arc::clone)
            .collect()
    }

    /// Verify every declared dependency is exported by an earlier
    /// registration; registration order is the dependency order.
    fn check_dependencies(&self, ordered: &[Arc<Registration>]) -> RelayResult<()> {
        let mut provided: Vec<&str> = Vec::new();
        for registration in ordered {
            for dep in &registration.dependencies {
                if !provided.iter().any(|p| p == dep) {
                    return Err(RelayError::UnknownModule(format!(
                        "{} (required by {})",
                        dep, registration.name
                    )));
                }
            }
            provided.push(registration.name.as_str());
            provided.extend(registration.exports.iter().map(|e| e.as_str()));
        }
        Ok(())
    }

    /// Initialize all modules in registration order; the first failure marks
    /// the offending module `Error` and aborts.
    pub async fn initialize_all(&self) -> RelayResult<()> {
        let ordered = self.ordered();
        self.check_dependencies(&ordered)?;
        for registration in ordered {
            registration.begin(ModuleState::Initializing)?;
            let instance = registration.instantiate();
            match instance.initialize().await {
                Ok(()) => registration.set_state(ModuleState::Initialized),
                Err(err) => {
                    registration.set_state(ModuleState::Error);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Activate all modules in registration order; aborts on first failure.
    pub async fn activate_all(&self) -> RelayResult<()> {
        for registration in self.ordered() {
            registration.begin(ModuleState::Activating)?;
            let instance = registration.instantiate();
            match instance.activate().await {
                Ok(()) => registration.set_state(ModuleState::Active),
                Err(err) => {
                    registration.set_state(ModuleState::Error);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Deactivate in reverse registration order, best effort. Errors are
    /// collected, never rethrown.
    pub async fn deactivate_all(&self) -> Vec<RelayError> {
        let mut errors = Vec::new();
        for registration in self.ordered().into_iter().rev() {
            if let Err(err) = registration.begin(ModuleState::Deactivating) {
                errors.push(err);
                continue;
            }
            let instance = registration.instantiate();
            match instance.deactivate().await {
                Ok(()) => registration.set_state(ModuleState::Deactivated),
                Err(err) => {
                    registration.set_state(ModuleState::Error);
                    errors.push(err);
                }
            }
        }
        errors
    }

    /// Destroy in reverse registration order, best effort.
    pub async fn destroy_all(&self) -> Vec<RelayError> {
        let mut errors = Vec::new();
        for registration in self.ordered().into_iter().rev() {
            if let Err(err) = registration.begin(ModuleState::Destroying) {
                errors.push(err);
                continue;
            }
            let instance = registration.instantiate();
            match instance.destroy().await {
                Ok(()) => registration.set_state(ModuleState::Destroyed),
                Err(err) => {
                    registration.set_state(ModuleState::Error);
                    errors.push(err);
                }
            }
        }
        errors
    }

    /// Per-module lifecycle states, in registration order.
    pub fn states(&self) -> Vec<(String, ModuleState)> {
        self.ordered()
            .iter()
            .map(|r| (r.name.clone(), r.state()))
            .collect()
    }

    /// Combined diagnostic snapshot across all modules.
    pub fn status_snapshot(&self) -> Value {
        let modules: Vec<Value> = self
            .ordered()
            .iter()
            .map(|r| {
                let status = r
                    .instance
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .map(|m| m.status())
                    .unwrap_or(Value::Null);
                json!({
                    "name": r.name,
                    "state": r.state(),
                    "exports": r.exports,
                    "status": status,
                })
            })
            .collect();
        json!({ "modules": modules })
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records lifecycle invocation order into a shared journal.
    struct JournalModule {
        name: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        fail_on_activate: bool,
    }

    #[async_trait]
    impl Module for JournalModule {
        async fn initialize(&self) -> RelayResult<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("init:{}", self.name));
            Ok(())
        }

        async fn activate(&self) -> RelayResult<()> {
            if self.fail_on_activate {
                return Err(RelayError::NotFound("boom".to_string()));
            }
            self.journal
                .lock()
                .unwrap()
                .push(format!("activate:{}", self.name));
            Ok(())
        }

        async fn deactivate(&self) -> RelayResult<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("deactivate:{}", self.name));
            Ok(())
        }

        async fn destroy(&self) -> RelayResult<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("destroy:{}", self.name));
            Ok(())
        }
    }

    fn journal_factory(
        name: &'static str,
        journal: &Arc<Mutex<Vec<String>>>,
        fail_on_activate: bool,
    ) -> impl Fn() -> Arc<dyn Module> + Send + Sync + 'static {
        let journal = Arc::clone(journal);
        move || {
            Arc::new(JournalModule {
                name,
                journal: Arc::clone(&journal),
                fail_on_activate,
            }) as Arc<dyn Module>
        }
    }

    #[tokio::test]
    async fn test_lifecycle_order_and_reverse_teardown() {
        let registry = ModuleRegistry::new();
        let journal = Arc::new(Mutex::new(Vec::new()));

        registry
            .register("config", &[], &["config"], journal_factory("config", &journal, false))
            .unwrap();
        registry
            .register("bus", &["config"], &["bus"], journal_factory("bus", &journal, false))
            .unwrap();
        registry
            .register(
                "supervisor",
                &["config", "bus"],
                &["supervisor"],
                journal_factory("supervisor", &journal, false),
            )
            .unwrap();

        registry.initialize_all().await.unwrap();
        registry.activate_all().await.unwrap();
        assert!(registry.deactivate_all().await.is_empty());
        assert!(registry.destroy_all().await.is_empty());

        let journal = journal.lock().unwrap();
        let activations: Vec<&String> =
            journal.iter().filter(|e| e.starts_with("activate:")).collect();
        let deactivations: Vec<&String> = journal
            .iter()
            .filter(|e| e.starts_with("deactivate:"))
            .collect();

        assert_eq!(
            activations,
            vec!["activate:config", "activate:bus", "activate:supervisor"]
        );
        // Deactivation order is the reverse of activation order
        assert_eq!(
            deactivations,
            vec![
                "deactivate:supervisor",
                "deactivate:bus",
                "deactivate:config"
            ]
        );
    }

    #[tokio::test]
    async fn test_activation_failure_aborts_and_marks_error() {
        let registry = ModuleRegistry::new();
        let journal = Arc::new(Mutex::new(Vec::new()));

        registry
            .register("ok", &[], &[], journal_factory("ok", &journal, false))
            .unwrap();
        registry
            .register("bad", &[], &[], journal_factory("bad", &journal, true))
            .unwrap();
        registry
            .register("after", &[], &[], journal_factory("after", &journal, false))
            .unwrap();

        registry.initialize_all().await.unwrap();
        assert!(registry.activate_all().await.is_err());

        let states: Vec<ModuleState> =
            registry.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            vec![
                ModuleState::Active,
                ModuleState::Error,
                ModuleState::Initialized
            ]
        );

        // "after" was never activated
        let journal = journal.lock().unwrap();
        assert!(!journal.contains(&"activate:after".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let registry = ModuleRegistry::new();
        let journal = Arc::new(Mutex::new(Vec::new()));

        registry
            .register("config", &[], &[], journal_factory("config", &journal, false))
            .unwrap();
        let result =
            registry.register("config", &[], &[], journal_factory("config", &journal, false));
        assert!(matches!(result, Err(RelayError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn test_resolve_caches_singletons() {
        let registry = ModuleRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);

        registry
            .register("counted", &[], &["counted-iface"], move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(NoopModule) as Arc<dyn Module>
            })
            .unwrap();

        let a = registry.resolve("counted").unwrap();
        let b = registry.resolve("counted").unwrap();
        let c = registry.resolve("counted-iface").unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_resolve_all_in_registration_order() {
        let registry = ModuleRegistry::new();
        registry
            .register("driver-a", &[], &["driver"], || Arc::new(NoopModule) as Arc<dyn Module>)
            .unwrap();
        registry
            .register("driver-b", &[], &["driver"], || Arc::new(NoopModule) as Arc<dyn Module>)
            .unwrap();

        assert_eq!(registry.resolve_all("driver").len(), 2);
        assert!(registry.resolve_all("missing").is_empty());
    }

    #[tokio::test]
    async fn test_missing_dependency_rejected() {
        let registry = ModuleRegistry::new();
        registry
            .register("late", &["not-registered"], &[], || {
                Arc::new(NoopModule) as Arc<dyn Module>
            })
            .unwrap();
        assert!(registry.initialize_all().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_transition_does_not_mutate_state() {
        let registry = ModuleRegistry::new();
        registry
            .register("solo", &[], &[], || Arc::new(NoopModule) as Arc<dyn Module>)
            .unwrap();

        // Activating before initializing is a state mismatch
        let err = registry.activate_all().await.unwrap_err();
        assert!(matches!(err, RelayError::StateMismatch { .. }));
        assert_eq!(registry.states()[0].1, ModuleState::Created);

        // The module can still be driven through the proper sequence
        registry.initialize_all().await.unwrap();
        registry.activate_all().await.unwrap();
        assert_eq!(registry.states()[0].1, ModuleState::Active);
    }

    struct NoopModule;

    #[async_trait]
    impl Module for NoopModule {}
}
