//! Task registry: named, parameterized units of work
//!
//! Tasks are registered explicitly at startup and never change afterwards.
//! Resolution binds caller arguments to the task's declared parameters.
//!
//! # Example
//!
//! ```
//! use hostrun::registry::{Args, Param, TaskRegistry};
//! use hostrun::models::TaskValue;
//!
//! let mut registry = TaskRegistry::new();
//! registry.register_fn(
//!     "hello",
//!     vec![Param::required("name"), Param::optional("treat", "Sr")],
//!     |scope, args| {
//!         Box::pin(async move {
//!             scope.echo(&format!("Hello {} {}", args.value("treat")?, args.value("name")?));
//!             Ok(TaskValue::Done)
//!         })
//!     },
//! )?;
//!
//! let bound = registry.resolve("hello", &Args::parse(["name=Lluc"])?)?;
//! assert_eq!(bound.args().get("treat"), Some("Sr"));
//! # Ok::<(), hostrun::error::HostrunError>(())
//! ```

use crate::error::{HostrunError, Result};
use crate::models::TaskValue;
use crate::scope::TaskScope;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A declared task parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub default: Option<String>,
}

impl Param {
    /// A parameter the caller must supply
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    /// A parameter that falls back to `default`
    pub fn optional(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }
}

/// Body of a task
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn call(&self, scope: &mut TaskScope, args: &BoundArgs) -> Result<TaskValue>;
}

/// Closure shape accepted by [`TaskRegistry::register_fn`]
pub type TaskFuture<'a> = BoxFuture<'a, Result<TaskValue>>;

struct FnTask<F>(F);

#[async_trait]
impl<F> TaskBody for FnTask<F>
where
    F: for<'a> Fn(&'a mut TaskScope, &'a BoundArgs) -> TaskFuture<'a> + Send + Sync,
{
    async fn call(&self, scope: &mut TaskScope, args: &BoundArgs) -> Result<TaskValue> {
        (self.0)(scope, args).await
    }
}

/// A registered task
pub struct TaskDef {
    pub name: String,
    pub description: Option<String>,
    pub params: Vec<Param>,
    body: Arc<dyn TaskBody>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>, body: impl TaskBody + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            params: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Task whose body is a closure or `fn`
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut TaskScope, &'a BoundArgs) -> TaskFuture<'a> + Send + Sync + 'static,
    {
        Self::new(name, FnTask(body))
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// `name(a, b=x)` style signature
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match &p.default {
                Some(default) => format!("{}={}", p.name, default),
                None => p.name.clone(),
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

impl std::fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Caller-supplied arguments: positional first, then keywords
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    pub positional: Vec<String>,
    pub named: Vec<(String, String)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.named.push((key.into(), value.into()));
        self
    }

    /// Parse `value` and `key=value` tokens
    pub fn parse<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Args::new();
        for token in tokens {
            let token = token.as_ref();
            match token.split_once('=') {
                Some((key, _)) if key.trim().is_empty() => {
                    return Err(HostrunError::Argument {
                        task: String::new(),
                        message: format!("empty keyword in '{}'", token),
                    });
                }
                Some((key, value)) => args.named.push((key.trim().to_string(), value.to_string())),
                None => args.positional.push(token.to_string()),
            }
        }
        Ok(args)
    }
}

/// Arguments bound to a task's parameters, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundArgs {
    task: String,
    values: Vec<(String, String)>,
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Like `get`, but an undeclared name is an `Argument` error
    pub fn value(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| HostrunError::Argument {
            task: self.task.clone(),
            message: format!("no parameter named '{}'", name),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A task with its arguments resolved, ready to invoke per host
#[derive(Debug, Clone)]
pub struct BoundTask {
    task: Arc<TaskDef>,
    args: BoundArgs,
}

impl BoundTask {
    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn args(&self) -> &BoundArgs {
        &self.args
    }

    pub async fn invoke(&self, scope: &mut TaskScope) -> Result<TaskValue> {
        self.task.body.call(scope, &self.args).await
    }
}

/// Name → task table
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Arc<TaskDef>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. The first registration of a name wins.
    pub fn register(&mut self, task: TaskDef) -> Result<()> {
        if self.tasks.contains_key(&task.name) {
            return Err(HostrunError::DuplicateTask { name: task.name });
        }
        debug!("Registered task {}", task.signature());
        self.tasks.insert(task.name.clone(), Arc::new(task));
        Ok(())
    }

    /// Register a closure body
    pub fn register_fn<F>(&mut self, name: &str, params: Vec<Param>, body: F) -> Result<()>
    where
        F: for<'a> Fn(&'a mut TaskScope, &'a BoundArgs) -> TaskFuture<'a> + Send + Sync + 'static,
    {
        let mut task = TaskDef::from_fn(name, body);
        task.params = params;
        self.register(task)
    }

    pub fn get(&self, name: &str) -> Option<&TaskDef> {
        self.tasks.get(name).map(|t| t.as_ref())
    }

    /// Registered tasks sorted by name
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDef> {
        self.tasks.values().map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Bind `args` to the named task's parameters.
    ///
    /// Positional arguments bind in declaration order, then keywords by name.
    /// Parameters left unbound take their default.
    ///
    /// # Errors
    ///
    /// * `HostrunError::UnknownTask` - no task with this name
    /// * `HostrunError::Argument` - too many positionals, unknown or repeated
    ///   keyword, or a required parameter left unbound
    pub fn resolve(&self, name: &str, args: &Args) -> Result<BoundTask> {
        let task = self
            .tasks
            .get(name)
            .ok_or_else(|| HostrunError::UnknownTask {
                name: name.to_string(),
            })?;

        let argument_error = |message: String| HostrunError::Argument {
            task: name.to_string(),
            message,
        };

        if args.positional.len() > task.params.len() {
            return Err(argument_error(format!(
                "takes at most {} argument(s), {} given",
                task.params.len(),
                args.positional.len()
            )));
        }

        let mut values: Vec<Option<String>> = vec![None; task.params.len()];
        for (slot, value) in values.iter_mut().zip(&args.positional) {
            *slot = Some(value.clone());
        }

        for (key, value) in &args.named {
            let index = task
                .params
                .iter()
                .position(|p| &p.name == key)
                .ok_or_else(|| argument_error(format!("unexpected keyword argument '{}'", key)))?;
            if values[index].is_some() {
                return Err(argument_error(format!(
                    "multiple values for argument '{}'",
                    key
                )));
            }
            values[index] = Some(value.clone());
        }

        let missing: Vec<&str> = task
            .params
            .iter()
            .zip(&values)
            .filter(|(p, v)| v.is_none() && p.default.is_none())
            .map(|(p, _)| p.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(argument_error(format!(
                "missing required argument(s): {}",
                missing.join(", ")
            )));
        }

        let values = task
            .params
            .iter()
            .zip(values)
            .map(|(p, v)| {
                let value = v.or_else(|| p.default.clone()).unwrap_or_default();
                (p.name.clone(), value)
            })
            .collect();

        Ok(BoundTask {
            task: Arc::clone(task),
            args: BoundArgs {
                task: task.name.clone(),
                values,
            },
        })
    }
}
