//! External predicate plugins
//!
//! `external_function` conditions name a module path and, optionally, an
//! export. Modules are resolved through a [`ModuleLoader`] on every
//! evaluation. [`StaticModuleLoader`] is an in-process registry that hosts
//! register predicates with at startup; `WasmModuleLoader` (behind the
//! `wasm` feature) loads them from WebAssembly files on disk.
//!
//! Every call is bounded by a timeout and isolated from panics. A predicate
//! that fails in any way makes its condition evaluate to `false`.
//!
//! ```rust
//! use serde_json::json;
//! use switchboard_routing::{PredicateModule, StaticModuleLoader, predicate_fn};
//!
//! let loader = StaticModuleLoader::new();
//! loader.register(
//!     "./user-check",
//!     PredicateModule::new().with_export(
//!         "checkUserType",
//!         predicate_fn(|context, _condition| {
//!             let email = context.request.headers.get("x-user-email");
//!             Ok(json!(email.is_some_and(|e| e.ends_with("@company.com"))))
//!         }),
//!     ),
//! );
//! assert!(loader.contains("./user-check"));
//! ```

use crate::context::RouteContext;
use crate::rule::{ExternalFunctionRef, RouteCondition};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{Error, Result, is_truthy};

/// Export name tried when neither the requested export nor a default exists
pub const FALLBACK_EXPORT: &str = "evaluate";

/// A predicate supplied from outside the router
///
/// The returned value is coerced to a boolean with loose truthiness.
#[async_trait]
pub trait ExternalPredicate: Send + Sync {
    async fn evaluate(
        &self,
        context: &RouteContext<'_>,
        condition: &RouteCondition,
    ) -> anyhow::Result<Value>;
}

struct FnPredicate<F>(F);

#[async_trait]
impl<F> ExternalPredicate for FnPredicate<F>
where
    F: Fn(&RouteContext<'_>, &RouteCondition) -> anyhow::Result<Value> + Send + Sync,
{
    async fn evaluate(
        &self,
        context: &RouteContext<'_>,
        condition: &RouteCondition,
    ) -> anyhow::Result<Value> {
        (self.0)(context, condition)
    }
}

/// Wrap a synchronous closure as an [`ExternalPredicate`]
pub fn predicate_fn<F>(f: F) -> Arc<dyn ExternalPredicate>
where
    F: Fn(&RouteContext<'_>, &RouteCondition) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnPredicate(f))
}

/// The exports of one predicate module
#[derive(Clone, Default)]
pub struct PredicateModule {
    default_export: Option<Arc<dyn ExternalPredicate>>,
    exports: HashMap<String, Arc<dyn ExternalPredicate>>,
}

impl PredicateModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default export
    pub fn with_default(mut self, predicate: Arc<dyn ExternalPredicate>) -> Self {
        self.default_export = Some(predicate);
        self
    }

    /// Add a named export
    pub fn with_export(mut self, name: impl Into<String>, predicate: Arc<dyn ExternalPredicate>) -> Self {
        self.exports.insert(name.into(), predicate);
        self
    }

    /// Pick the export to call
    ///
    /// Order: the requested name, the default export, then `evaluate`.
    pub fn select(&self, function_name: Option<&str>) -> Option<Arc<dyn ExternalPredicate>> {
        function_name
            .and_then(|name| self.exports.get(name))
            .or(self.default_export.as_ref())
            .or_else(|| self.exports.get(FALLBACK_EXPORT))
            .cloned()
    }
}

impl std::fmt::Debug for PredicateModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut exports: Vec<&String> = self.exports.keys().collect();
        exports.sort();
        f.debug_struct("PredicateModule")
            .field("default_export", &self.default_export.is_some())
            .field("exports", &exports)
            .finish()
    }
}

/// Resolves module paths to predicate modules
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, path: &str) -> Result<Arc<PredicateModule>>;
}

/// In-process module registry keyed by path
#[derive(Debug, Default)]
pub struct StaticModuleLoader {
    modules: DashMap<String, Arc<PredicateModule>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the module served under `path`
    pub fn register(&self, path: impl Into<String>, module: PredicateModule) {
        let path = path.into();
        tracing::debug!(path = %path, "Registered external predicate module");
        self.modules.insert(path, Arc::new(module));
    }

    /// Remove a module; returns whether it was registered
    pub fn unregister(&self, path: &str) -> bool {
        self.modules.remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, path: &str) -> Result<Arc<PredicateModule>> {
        self.modules
            .get(path)
            .map(|module| Arc::clone(module.value()))
            .ok_or_else(|| Error::ExternalPredicate(format!("module not found: {}", path)))
    }
}

/// Loads and runs external predicates under a time budget
#[derive(Clone)]
pub struct ExternalEvaluator {
    loader: Arc<dyn ModuleLoader>,
    timeout: Duration,
}

impl ExternalEvaluator {
    pub fn new(loader: Arc<dyn ModuleLoader>, timeout: Duration) -> Self {
        Self { loader, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate an external predicate
    ///
    /// The budget is the configured timeout, shortened to `deadline` when
    /// one is given. Every failure is reported as [`Error::ExternalPredicate`].
    pub async fn evaluate(
        &self,
        reference: &ExternalFunctionRef,
        context: &RouteContext<'_>,
        condition: &RouteCondition,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<bool> {
        let budget = match deadline {
            Some(deadline) => self
                .timeout
                .min(deadline.saturating_duration_since(tokio::time::Instant::now())),
            None => self.timeout,
        };

        let call = async {
            let module = self.loader.load(&reference.path).await?;
            let predicate = module
                .select(reference.function_name.as_deref())
                .ok_or_else(|| {
                    Error::ExternalPredicate(format!(
                        "{} exports no callable predicate",
                        reference.path
                    ))
                })?;

            tracing::debug!(path = %reference.path, "Calling external predicate");
            let value = AssertUnwindSafe(predicate.evaluate(context, condition))
                .catch_unwind()
                .await
                .map_err(|_| Error::ExternalPredicate(format!("{} panicked", reference.path)))?
                .map_err(|e| Error::ExternalPredicate(format!("{}: {}", reference.path, e)))?;
            Ok::<Value, Error>(value)
        };

        let value = tokio::time::timeout(budget, call).await.map_err(|_| {
            Error::ExternalPredicate(format!(
                "{} timed out after {}ms",
                reference.path,
                budget.as_millis()
            ))
        })??;

        let matches = is_truthy(&value);
        tracing::debug!(path = %reference.path, matches, "External predicate result");
        Ok(matches)
    }
}
