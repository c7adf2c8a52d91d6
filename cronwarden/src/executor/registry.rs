//! The explicit registry mapping job targets to handlers.
//!
//! Services are registered at process start, each exposing a number of named methods. A job's
//! [`crate::job::TargetRef`] selects a service by name (and optionally path) and a method on it.
//!
//! # Example
//!
//! ```
//! use cronwarden::executor::{registry::TargetRegistry, HandlerError, HandlerResult, JobContext};
//!
//! async fn nightly(ctx: JobContext) -> HandlerResult {
//!     Ok(serde_json::json!({ "job": ctx.job_name }))
//! }
//!
//! let registry = TargetRegistry::new()
//!     .with_handler("reports", "nightly", nightly)
//!     .with_handler("reports", "hourly", |_ctx: JobContext| async {
//!         Ok::<_, HandlerError>(serde_json::Value::Null)
//!     });
//!
//! assert!(registry.contains("reports", None));
//! ```
use std::sync::Arc;

use fxhash::FxHashMap;
use thiserror::Error;

use super::JobHandler;

/// A named collection of job handlers.
#[derive(Default, Clone)]
pub struct Service {
    name: String,
    methods: FxHashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods = self.methods.keys().collect::<Vec<_>>();
        methods.sort();
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &methods)
            .finish()
    }
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Default::default(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>, handler: impl JobHandler) -> Self {
        self.methods.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, method: &str) -> Option<Arc<dyn JobHandler>> {
        self.methods.get(method).cloned()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Service '{service}' not found")]
    NotFound {
        service: String,
        path: Option<String>,
    },
}

/// Resolves services by name, and optionally the path they were registered under.
pub trait TargetLoader: Send + Sync {
    fn load(&self, service: &str, path: Option<&str>) -> Result<Arc<Service>, LoadError>;
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct ServiceKey {
    name: String,
    path: Option<String>,
}

/// The default [`TargetLoader`]: an in process map populated at startup.
///
/// A lookup with an explicit path only matches a service registered under that path. A lookup
/// without a path prefers a service registered without one and otherwise falls back to any
/// service with a matching name.
#[derive(Debug, Default, Clone)]
pub struct TargetRegistry {
    services: FxHashMap<ServiceKey, Arc<Service>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a whole service.
    pub fn with_service(mut self, service: Service) -> Self {
        self.insert(None, service);
        self
    }

    /// Registers (or replaces) a service under an explicit path.
    pub fn with_service_at(mut self, path: impl Into<String>, service: Service) -> Self {
        self.insert(Some(path.into()), service);
        self
    }

    /// Adds a single handler, creating the service if needed.
    pub fn with_handler(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        handler: impl JobHandler,
    ) -> Self {
        let key = ServiceKey {
            name: service.into(),
            path: None,
        };
        let existing = self
            .services
            .remove(&key)
            .map(|service| Service::clone(&service))
            .unwrap_or_else(|| Service::new(key.name.clone()));
        self.services
            .insert(key, Arc::new(existing.with_method(method, handler)));
        self
    }

    pub fn contains(&self, service: &str, path: Option<&str>) -> bool {
        self.load(service, path).is_ok()
    }

    fn insert(&mut self, path: Option<String>, service: Service) {
        let key = ServiceKey {
            name: service.name.clone(),
            path,
        };
        self.services.insert(key, Arc::new(service));
    }
}

impl TargetLoader for TargetRegistry {
    fn load(&self, service: &str, path: Option<&str>) -> Result<Arc<Service>, LoadError> {
        let key = ServiceKey {
            name: service.to_owned(),
            path: path.map(ToOwned::to_owned),
        };
        self.services
            .get(&key)
            .or_else(|| match path {
                Some(_) => None,
                None => self
                    .services
                    .iter()
                    .filter(|(key, _)| key.name == service)
                    .min_by(|(a, _), (b, _)| a.path.cmp(&b.path))
                    .map(|(_, service)| service),
            })
            .cloned()
            .ok_or_else(|| LoadError::NotFound {
                service: service.to_owned(),
                path: path.map(ToOwned::to_owned),
            })
    }
}
