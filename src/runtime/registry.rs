//! Versioned registries for workflows and activities.
//!
//! One generic `Registry<H>` stores both handler kinds. Workflows support
//! explicit semver versions with a per-name resolution policy; activities
//! are always registered at 1.0.0 with the Latest policy. A run pins the
//! version it started under in its `WorkflowStarted` event, and replay
//! resolves that exact version for the rest of the run's life.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use semver::Version;

use crate::workflow::{WorkflowDefinition, WorkflowHandler};
use crate::{ActivityContext, AppError};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// Handler for one activity invocation. At-least-once: the same attempt
/// may be invoked again after a crash, so side effects should be keyed on
/// the workflow id and schedule event id from the context.
#[async_trait::async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, AppError>;
}

/// Function adapter for activity closures.
pub struct FnActivity<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<String, AppError>> + Send,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, AppError> {
        (self.0)(ctx, input).await
    }
}

#[derive(Clone, Debug)]
pub enum VersionPolicy {
    /// Resolve to the highest registered version.
    Latest,
    /// Resolve to one pinned version only.
    Exact(Version),
}

/// Versioned handler registry. Cheap to clone; immutable after build
/// except for version policies.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// H: ?Sized rules out derive(Clone)
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub type WorkflowRegistry = Registry<dyn WorkflowHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type WorkflowRegistryBuilder = RegistryBuilder<dyn WorkflowHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Resolve a handler by name using the name's version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let policy = self
            .policy
            .lock()
            .expect("registry policy mutex poisoned")
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);

        let result = match &policy {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|versions| versions.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };

        if result.is_none() {
            self.log_registry_miss(name, None, Some(&policy));
        }
        result
    }

    /// Resolve one exact version, as pinned by a run's start event.
    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .expect("registry policy mutex poisoned")
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str, version: Option<&Version>, policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "workloom::runtime::registry",
            requested_name = %name,
            requested_version = ?version,
            requested_policy = ?policy,
            available_versions = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, failing if any registration was rejected.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn check_duplicate(&mut self, name: &str, version: &Version, what: &str) -> bool {
        let entry = self.map.entry(name.to_string()).or_default();
        if entry.contains_key(version) {
            self.errors
                .push(format!("duplicate {what} registration: {name}@{version}"));
            true
        } else {
            false
        }
    }
}

impl WorkflowRegistryBuilder {
    /// Register a workflow definition at version 1.0.0.
    pub fn register<S: Send + 'static>(self, def: WorkflowDefinition<S>) -> Self {
        self.register_at(DEFAULT_VERSION, def)
    }

    /// Register a workflow definition at an explicit version. Versions for
    /// one name must be registered in increasing order.
    pub fn register_versioned<S: Send + 'static>(
        mut self,
        version: impl AsRef<str>,
        def: WorkflowDefinition<S>,
    ) -> Self {
        let v = match Version::parse(version.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                self.errors
                    .push(format!("invalid version for workflow '{}': {e}", def.name()));
                return self;
            }
        };
        self.register_at(v, def)
    }

    fn register_at<S: Send + 'static>(mut self, v: Version, def: WorkflowDefinition<S>) -> Self {
        let name = def.name().to_string();
        if !def.has_run_body() {
            self.errors.push(format!("workflow '{name}' has no run body"));
            return self;
        }
        if self.check_duplicate(&name, &v, "workflow") {
            return self;
        }
        let entry = self.map.entry(name.clone()).or_default();
        if let Some((latest, _)) = entry.iter().next_back() {
            if &v <= latest {
                panic!("non-monotonic workflow version for {name}: {v} is not later than existing latest {latest}");
            }
        }
        entry.insert(v, Arc::new(def) as Arc<dyn WorkflowHandler>);
        self
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, AppError>> + Send + 'static,
    {
        let name = name.into();
        if self.check_duplicate(&name, &DEFAULT_VERSION, "activity") {
            return self;
        }
        self.map
            .entry(name.clone())
            .or_default()
            .insert(DEFAULT_VERSION, Arc::new(FnActivity(f)));
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    /// Register an activity whose input and output go through the JSON
    /// codec.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, AppError>> + Send + 'static,
    {
        use crate::_typed_codec::{Codec, Json};
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In =
                    Json::decode(&input_s).map_err(|e| AppError::non_retryable("codec", e))?;
                let out: Out = (f)(ctx, input).await?;
                Json::encode(&out).map_err(|e| AppError::non_retryable("codec", e))
            }
        };
        let name = name.into();
        if self.check_duplicate(&name, &DEFAULT_VERSION, "activity") {
            return self;
        }
        self.map
            .entry(name.clone())
            .or_default()
            .insert(DEFAULT_VERSION, Arc::new(FnActivity(wrapper)));
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowError;

    fn noop_def(name: &str) -> WorkflowDefinition<()> {
        WorkflowDefinition::function(name, |_ctx, _input| async move { Ok(String::new()) })
    }

    #[test]
    fn latest_policy_resolves_highest_version() {
        let registry = WorkflowRegistry::builder()
            .register_versioned("1.0.0", noop_def("order"))
            .register_versioned("1.2.0", noop_def("order"))
            .build();
        let (v, _) = registry.resolve_handler("order").unwrap();
        assert_eq!(v, Version::new(1, 2, 0));
        assert!(registry.has("order"));
        assert!(!registry.has("ghost"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn exact_policy_pins_resolution() {
        let registry = WorkflowRegistry::builder()
            .register_versioned("1.0.0", noop_def("order"))
            .register_versioned("1.2.0", noop_def("order"))
            .build();
        registry.set_version_policy("order", VersionPolicy::Exact(Version::new(1, 0, 0)));
        let (v, _) = registry.resolve_handler("order").unwrap();
        assert_eq!(v, Version::new(1, 0, 0));
        assert!(registry
            .resolve_handler_exact("order", &Version::new(1, 2, 0))
            .is_some());
        assert!(registry
            .resolve_handler_exact("order", &Version::new(9, 0, 0))
            .is_none());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let result = WorkflowRegistry::builder()
            .register(noop_def("order"))
            .register(noop_def("order"))
            .build_result();
        let err = result.err().unwrap();
        assert!(err.contains("duplicate workflow registration"), "{err}");
    }

    #[test]
    #[should_panic(expected = "non-monotonic")]
    fn out_of_order_versions_panic() {
        let _ = WorkflowRegistry::builder()
            .register_versioned("2.0.0", noop_def("order"))
            .register_versioned("1.0.0", noop_def("order"))
            .build();
    }

    #[test]
    fn missing_run_body_is_an_error() {
        let def: WorkflowDefinition<()> = WorkflowDefinition::new("empty", |_| ());
        let result = WorkflowRegistry::builder().register(def).build_result();
        assert!(result.err().unwrap().contains("no run body"));
    }

    #[tokio::test]
    async fn activities_register_and_invoke() {
        let registry = ActivityRegistry::builder()
            .register("double", |_ctx, input: String| async move {
                let n: i64 = input
                    .parse()
                    .map_err(|_| AppError::non_retryable("bad_input", "not a number"))?;
                Ok((n * 2).to_string())
            })
            .build();
        let (_, handler) = registry.resolve_handler("double").unwrap();
        let ctx = ActivityContext {
            workflow_id: "wf".to_string(),
            run_id: 1,
            activity_name: "double".to_string(),
            event_id: 2,
            attempt: 1,
        };
        assert_eq!(handler.invoke(ctx, "21".to_string()).await.unwrap(), "42");
    }

    #[test]
    fn workflow_error_from_registry_miss_is_configuration() {
        // Shape check for the error the runtime reports on a miss.
        let err = WorkflowError::configuration("workflow 'ghost' is not registered");
        assert_eq!(err.kind(), "configuration");
        assert!(!err.retryable());
    }
}
