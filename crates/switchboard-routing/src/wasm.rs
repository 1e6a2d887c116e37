//! WebAssembly predicate modules
//!
//! [`WasmModuleLoader`] serves `external_function` module paths from `.wasm`
//! binaries or `.wat` text files. Every exported function with one of these
//! signatures becomes a predicate:
//!
//! | Signature | Input |
//! |-----------|-------|
//! | `() -> i32` | none |
//! | `(ptr: i32, len: i32) -> i32` | the routing context as JSON |
//!
//! Context-taking predicates need two more exports: `memory`, and
//! `alloc(len: i32) -> i32` returning where the host may write `len` bytes.
//! The JSON document carries `tokenCount`, `model`, `sessionId`, `headers`,
//! `body`, `lastUsage` and `event`.
//!
//! A non-zero result matches. An export named `default` is the module's
//! default export. Modules may not import anything; each call gets a fresh
//! store with its own fuel budget and memory ceiling.

use crate::context::RouteContext;
use crate::external::{ExternalPredicate, ModuleLoader, PredicateModule};
use crate::rule::RouteCondition;
use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use switchboard_core::{Error, Result};
use wasmtime::{Engine, ExternType, FuncType, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, ValType};

/// Fuel granted to one predicate call
pub const DEFAULT_FUEL: u64 = 50_000_000;
/// Linear memory ceiling of one predicate call (16 MB)
pub const DEFAULT_MAX_MEMORY: usize = 16 * 1024 * 1024;

const DEFAULT_EXPORT: &str = "default";
const MEMORY_EXPORT: &str = "memory";
const ALLOC_EXPORT: &str = "alloc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abi {
    Bare,
    Context,
}

impl Abi {
    fn of(ty: &FuncType) -> Option<Self> {
        let params: Vec<ValType> = ty.params().collect();
        let results: Vec<ValType> = ty.results().collect();
        if !matches!(results.as_slice(), [ValType::I32]) {
            return None;
        }
        match params.as_slice() {
            [] => Some(Abi::Bare),
            [ValType::I32, ValType::I32] => Some(Abi::Context),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    fuel: u64,
    max_memory: usize,
}

struct CallState {
    limits: StoreLimits,
}

/// One exported predicate function
#[derive(Clone)]
struct WasmPredicate {
    engine: Engine,
    module: Module,
    export: String,
    abi: Abi,
    limits: Limits,
}

impl WasmPredicate {
    fn call(&self, input: Option<Vec<u8>>) -> anyhow::Result<i32> {
        let state = CallState {
            limits: StoreLimitsBuilder::new()
                .memory_size(self.limits.max_memory)
                .instances(1)
                .memories(1)
                .build(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store.set_fuel(self.limits.fuel)?;

        let instance = Instance::new(&mut store, &self.module, &[]).context("instantiate")?;
        let Some(input) = input else {
            let func = instance.get_typed_func::<(), i32>(&mut store, &self.export)?;
            return func.call(&mut store, ());
        };

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| anyhow!("no `{MEMORY_EXPORT}` export"))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)?;
        let len = i32::try_from(input.len()).context("context document too large")?;
        let ptr = alloc.call(&mut store, len)?;
        let offset = usize::try_from(ptr).map_err(|_| anyhow!("`{ALLOC_EXPORT}` returned {ptr}"))?;
        memory.write(&mut store, offset, &input)?;

        let func = instance.get_typed_func::<(i32, i32), i32>(&mut store, &self.export)?;
        func.call(&mut store, (ptr, len))
    }
}

#[async_trait]
impl ExternalPredicate for WasmPredicate {
    async fn evaluate(&self, context: &RouteContext<'_>, _condition: &RouteCondition) -> anyhow::Result<Value> {
        let input = match self.abi {
            Abi::Bare => None,
            Abi::Context => Some(serde_json::to_vec(&context_document(context))?),
        };

        let predicate = self.clone();
        let result = tokio::task::spawn_blocking(move || predicate.call(input))
            .await
            .context("predicate task aborted")?
            .with_context(|| format!("export `{}`", self.export))?;
        Ok(Value::from(result))
    }
}

fn context_document(context: &RouteContext<'_>) -> Value {
    json!({
        "tokenCount": context.token_count,
        "model": context.model(),
        "sessionId": context.session_id,
        "headers": context.request.headers,
        "body": context.request.body,
        "lastUsage": context.last_usage,
        "event": context.event,
    })
}

struct CachedModule {
    modified: Option<SystemTime>,
    module: Arc<PredicateModule>,
}

/// Loads predicate modules from WebAssembly files
///
/// Relative paths resolve against the base directory when one is set.
/// Compiled modules are cached and recompiled when the file's modification
/// time changes.
pub struct WasmModuleLoader {
    engine: Engine,
    base_dir: Option<PathBuf>,
    limits: Limits,
    modules: DashMap<PathBuf, CachedModule>,
}

impl WasmModuleLoader {
    pub fn new() -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config)
            .map_err(|e| Error::ExternalPredicate(format!("wasm engine init: {e}")))?;

        Ok(Self {
            engine,
            base_dir: None,
            limits: Limits {
                fuel: DEFAULT_FUEL,
                max_memory: DEFAULT_MAX_MEMORY,
            },
            modules: DashMap::new(),
        })
    }

    /// Resolve relative module paths against `dir`
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.limits.fuel = fuel;
        self
    }

    /// Linear memory ceiling in bytes
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.limits.max_memory = bytes;
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn compile(&self, path: &Path, bytes: &[u8]) -> Result<PredicateModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| Error::ExternalPredicate(format!("{}: {e}", path.display())))?;

        let mut predicates = PredicateModule::new();
        for export in module.exports() {
            let ExternType::Func(ty) = export.ty() else {
                continue;
            };
            let Some(abi) = Abi::of(&ty) else {
                continue;
            };

            let name = export.name();
            let predicate: Arc<dyn ExternalPredicate> = Arc::new(WasmPredicate {
                engine: self.engine.clone(),
                module: module.clone(),
                export: name.to_string(),
                abi,
                limits: self.limits,
            });
            predicates = if name == DEFAULT_EXPORT {
                predicates.with_default(predicate)
            } else {
                predicates.with_export(name, predicate)
            };
        }
        Ok(predicates)
    }
}

#[async_trait]
impl ModuleLoader for WasmModuleLoader {
    async fn load(&self, path: &str) -> Result<Arc<PredicateModule>> {
        let resolved = self.resolve(path);
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| Error::ExternalPredicate(format!("{}: {e}", resolved.display())))?;
        let modified = metadata.modified().ok();

        if let Some(cached) = self.modules.get(&resolved)
            && modified.is_some()
            && cached.modified == modified
        {
            return Ok(Arc::clone(&cached.module));
        }

        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| Error::ExternalPredicate(format!("{}: {e}", resolved.display())))?;
        let module = Arc::new(self.compile(&resolved, &bytes)?);
        tracing::info!(path = %resolved.display(), module = ?module, "Loaded wasm predicate module");

        self.modules.insert(
            resolved,
            CachedModule {
                modified,
                module: Arc::clone(&module),
            },
        );
        Ok(module)
    }
}

impl std::fmt::Debug for WasmModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModuleLoader")
            .field("base_dir", &self.base_dir)
            .field("limits", &self.limits)
            .field("cached", &self.modules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ExternalEvaluator;
    use crate::rule::ExternalFunctionRef;
    use std::time::Duration;
    use switchboard_core::RouteRequest;
    use tempfile::TempDir;

    const FLAGS: &str = r#"(module
        (func (export "alwaysOn") (result i32) i32.const 1)
        (func (export "default") (result i32) i32.const 0)
        (func (export "spin") (result i32)
            (loop $l (br $l))
            i32.const 1)
    )"#;

    // Matches requests whose context document is longer than 200 bytes
    const LONG_CONTEXT: &str = r#"(module
        (memory (export "memory") 1)
        (func (export "alloc") (param i32) (result i32) i32.const 1024)
        (func (export "evaluate") (param $ptr i32) (param $len i32) (result i32)
            (i32.and
                (i32.eq (i32.load8_u (local.get $ptr)) (i32.const 123))
                (i32.gt_u (local.get $len) (i32.const 200))))
    )"#;

    fn module_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("flags.wat"), FLAGS).unwrap();
        std::fs::write(dir.path().join("long.wat"), LONG_CONTEXT).unwrap();
        dir
    }

    fn reference(path: &str, function_name: Option<&str>) -> (ExternalFunctionRef, RouteCondition) {
        let reference = ExternalFunctionRef {
            path: path.to_string(),
            function_name: function_name.map(str::to_string),
        };
        let condition = RouteCondition::ExternalFunction {
            external_function: reference.clone(),
        };
        (reference, condition)
    }

    fn evaluator(loader: WasmModuleLoader) -> ExternalEvaluator {
        ExternalEvaluator::new(Arc::new(loader), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_bare_exports_and_default() {
        let dir = module_dir();
        let evaluator = evaluator(WasmModuleLoader::new().unwrap().with_base_dir(dir.path()));
        let request = RouteRequest::new(json!({"model": "m"}));
        let context = RouteContext::new(&request, 0, None);

        let (r, c) = reference("flags.wat", Some("alwaysOn"));
        assert!(evaluator.evaluate(&r, &context, &c, None).await.unwrap());

        let (r, c) = reference("flags.wat", Some("missing"));
        assert!(!evaluator.evaluate(&r, &context, &c, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_context_is_passed_as_json() {
        let dir = module_dir();
        let evaluator = evaluator(WasmModuleLoader::new().unwrap().with_base_dir(dir.path()));
        let (r, c) = reference("long.wat", None);

        let short = RouteRequest::new(json!({"model": "m"}));
        let context = RouteContext::new(&short, 0, None);
        assert!(!evaluator.evaluate(&r, &context, &c, None).await.unwrap());

        let long = RouteRequest::new(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x".repeat(300)}]
        }));
        let context = RouteContext::new(&long, 0, None);
        assert!(evaluator.evaluate(&r, &context, &c, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_fuel_exhaustion_is_an_error() {
        let dir = module_dir();
        let loader = WasmModuleLoader::new()
            .unwrap()
            .with_base_dir(dir.path())
            .with_fuel(10_000);
        let evaluator = evaluator(loader);
        let request = RouteRequest::new(json!({}));
        let context = RouteContext::new(&request, 0, None);

        let (r, c) = reference("flags.wat", Some("spin"));
        let err = evaluator.evaluate(&r, &context, &c, None).await.unwrap_err();
        assert!(matches!(err, Error::ExternalPredicate(_)));
        assert!(err.to_string().contains("spin"));
    }

    #[tokio::test]
    async fn test_modules_are_cached_per_path() {
        let dir = module_dir();
        let loader = WasmModuleLoader::new().unwrap().with_base_dir(dir.path());

        let first = loader.load("flags.wat").await.unwrap();
        let absolute = dir.path().join("flags.wat");
        let second = loader.load(absolute.to_str().unwrap()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.select(Some("alwaysOn")).is_some());
        assert!(first.select(None).is_some());
    }

    #[tokio::test]
    async fn test_missing_and_invalid_files_are_errors() {
        let dir = module_dir();
        std::fs::write(dir.path().join("broken.wat"), "(module (func").unwrap();
        let loader = WasmModuleLoader::new().unwrap().with_base_dir(dir.path());

        assert!(matches!(loader.load("nowhere.wasm").await, Err(Error::ExternalPredicate(_))));
        assert!(matches!(loader.load("broken.wat").await, Err(Error::ExternalPredicate(_))));
    }
}
