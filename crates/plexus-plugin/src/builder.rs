use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use plexus_protocol::{Args, ErrorCode, ErrorInfo};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::PluginContext;

/// Key a handler is registered under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKey {
    /// Target of `TRIGGER`.
    Entry(String),
    /// Target of `TRIGGER_CUSTOM`.
    Custom { event_type: String, event_id: String },
}

impl EventKey {
    pub fn entry(name: impl Into<String>) -> Self {
        EventKey::Entry(name.into())
    }

    pub fn custom(event_type: impl Into<String>, event_id: impl Into<String>) -> Self {
        EventKey::Custom {
            event_type: event_type.into(),
            event_id: event_id.into(),
        }
    }

    fn has_empty_name(&self) -> bool {
        match self {
            EventKey::Entry(name) => name.trim().is_empty(),
            EventKey::Custom {
                event_type,
                event_id,
            } => event_type.trim().is_empty() || event_id.trim().is_empty(),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Entry(name) => write!(f, "entry:{name}"),
            EventKey::Custom {
                event_type,
                event_id,
            } => write!(f, "{event_type}:{event_id}"),
        }
    }
}

/// One invocation handed to a handler.
#[derive(Clone, Debug)]
pub struct Call {
    pub req_id: String,
    pub args: Args,
    /// Cancelled on `CANCEL`, timeout or plugin shutdown.
    pub cancel: CancellationToken,
}

impl Call {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    pub fn str_arg(&self, name: &str) -> Result<&str, HandlerError> {
        self.args
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidArgs(format!("missing string argument `{name}`")))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("canceled")]
    Canceled,
    #[error(transparent)]
    Bus(#[from] ErrorInfo),
}

impl HandlerError {
    pub fn msg(message: impl fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Failed(format!("{err:#}"))
    }
}

impl From<HandlerError> for ErrorInfo {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Bus(info) => info,
            HandlerError::InvalidArgs(_) => ErrorInfo::new(ErrorCode::InvalidRequest, err.to_string()),
            HandlerError::Canceled | HandlerError::Failed(_) => {
                ErrorInfo::new(ErrorCode::Execution, err.to_string())
            }
        }
    }
}

pub type HandlerResult = Result<Value, HandlerError>;
type SyncFn = dyn Fn(&PluginContext, Call) -> HandlerResult + Send + Sync;
pub(crate) type AsyncFn = dyn Fn(PluginContext, Call) -> BoxFuture<'static, HandlerResult> + Send + Sync;
pub(crate) type HookFn = dyn Fn(&PluginContext) -> Result<(), HandlerError> + Send + Sync;
pub(crate) type TimerFn = dyn Fn(PluginContext) -> BoxFuture<'static, ()> + Send + Sync;

/// Sync handlers run inline on the command loop; async handlers run on the
/// plugin's worker pool.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Handler {
    pub fn is_async(&self) -> bool {
        matches!(self, Handler::Async(_))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_async() { "Handler::Async" } else { "Handler::Sync" })
    }
}

#[derive(Clone)]
pub(crate) struct TimerSpec {
    pub name: String,
    pub every: Duration,
    pub run: Arc<TimerFn>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("plugin id must not be empty")]
    EmptyId,
    #[error("handler registered with an empty name")]
    EmptyName,
    #[error("duplicate handler for `{0}`")]
    Duplicate(String),
    #[error("declared entries without a handler: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),
    #[error("timer `{0}` needs a non-zero interval")]
    ZeroInterval(String),
}

/// Collects handlers and hooks; [`PluginBuilder::build`] validates the table.
pub struct PluginBuilder {
    id: String,
    handlers: Vec<(EventKey, Handler)>,
    declared: Vec<String>,
    startup: Vec<Arc<HookFn>>,
    shutdown: Vec<Arc<HookFn>>,
    timers: Vec<TimerSpec>,
}

impl PluginBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handlers: Vec::new(),
            declared: Vec::new(),
            startup: Vec::new(),
            shutdown: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn entry<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&PluginContext, Call) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .push((EventKey::entry(name), Handler::Sync(Arc::new(f))));
        self
    }

    pub fn entry_async<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(PluginContext, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.push((
            EventKey::entry(name),
            Handler::Async(Arc::new(move |ctx, call| f(ctx, call).boxed())),
        ));
        self
    }

    pub fn custom<F>(mut self, event_type: impl Into<String>, event_id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&PluginContext, Call) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.push((
            EventKey::custom(event_type, event_id),
            Handler::Sync(Arc::new(f)),
        ));
        self
    }

    pub fn custom_async<F, Fut>(
        mut self,
        event_type: impl Into<String>,
        event_id: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(PluginContext, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.push((
            EventKey::custom(event_type, event_id),
            Handler::Async(Arc::new(move |ctx, call| f(ctx, call).boxed())),
        ));
        self
    }

    /// Entry names promised by the plugin manifest; each must get a handler.
    pub fn declare_entries<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn on_startup<F>(mut self, f: F) -> Self
    where
        F: Fn(&PluginContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.startup.push(Arc::new(f));
        self
    }

    pub fn on_shutdown<F>(mut self, f: F) -> Self
    where
        F: Fn(&PluginContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shutdown.push(Arc::new(f));
        self
    }

    /// Runs `f` every `every` until the plugin stops.
    pub fn timer<F, Fut>(mut self, name: impl Into<String>, every: Duration, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.timers.push(TimerSpec {
            name: name.into(),
            every,
            run: Arc::new(move |ctx| f(ctx).boxed()),
        });
        self
    }

    pub fn build(self) -> Result<PluginSpec, BuildError> {
        if self.id.trim().is_empty() {
            return Err(BuildError::EmptyId);
        }
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (key, handler) in self.handlers {
            if key.has_empty_name() {
                return Err(BuildError::EmptyName);
            }
            if handlers.contains_key(&key) {
                return Err(BuildError::Duplicate(key.to_string()));
            }
            handlers.insert(key, handler);
        }
        let mut missing: Vec<String> = self
            .declared
            .iter()
            .filter(|name| !handlers.contains_key(&EventKey::entry(name.as_str())))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(BuildError::MissingHandlers(missing));
        }
        let mut timer_names = HashSet::new();
        for timer in &self.timers {
            if timer.name.trim().is_empty() {
                return Err(BuildError::EmptyName);
            }
            if timer.every.is_zero() {
                return Err(BuildError::ZeroInterval(timer.name.clone()));
            }
            if !timer_names.insert(timer.name.clone()) {
                return Err(BuildError::Duplicate(format!("timer:{}", timer.name)));
            }
        }
        Ok(PluginSpec {
            id: self.id,
            handlers,
            startup: self.startup,
            shutdown: self.shutdown,
            timers: self.timers,
        })
    }
}

/// A validated plugin: its handler table plus lifecycle hooks and timers.
pub struct PluginSpec {
    id: String,
    handlers: HashMap<EventKey, Handler>,
    pub(crate) startup: Vec<Arc<HookFn>>,
    pub(crate) shutdown: Vec<Arc<HookFn>>,
    pub(crate) timers: Vec<TimerSpec>,
}

impl PluginSpec {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handler(&self, key: &EventKey) -> Option<&Handler> {
        self.handlers.get(key)
    }

    /// Registered keys in a stable order.
    pub fn keys(&self) -> Vec<EventKey> {
        let mut keys: Vec<EventKey> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSpec")
            .field("id", &self.id)
            .field("handlers", &self.keys())
            .field("timers", &self.timers.iter().map(|t| &t.name).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(_: &PluginContext, _: Call) -> HandlerResult {
        Ok(json!(null))
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = PluginBuilder::new("echo")
            .entry("echo", ok)
            .entry("echo", ok)
            .build()
            .expect_err("duplicate");
        assert_eq!(err, BuildError::Duplicate("entry:echo".into()));

        // same name as entry and custom key do not collide
        let spec = PluginBuilder::new("echo")
            .entry("hello", ok)
            .custom("greeting", "hello", ok)
            .build()
            .expect("distinct keys");
        assert_eq!(spec.keys().len(), 2);
    }

    #[test]
    fn empty_names_and_ids_are_rejected() {
        assert_eq!(
            PluginBuilder::new("echo").entry(" ", ok).build().expect_err("empty"),
            BuildError::EmptyName
        );
        assert_eq!(
            PluginBuilder::new("echo")
                .custom("greeting", "", ok)
                .build()
                .expect_err("empty id"),
            BuildError::EmptyName
        );
        assert_eq!(
            PluginBuilder::new("").build().expect_err("no id"),
            BuildError::EmptyId
        );
    }

    #[test]
    fn declared_entries_need_handlers() {
        let err = PluginBuilder::new("echo")
            .declare_entries(["echo", "slow", "publish"])
            .entry("echo", ok)
            .build()
            .expect_err("missing");
        assert_eq!(
            err,
            BuildError::MissingHandlers(vec!["publish".into(), "slow".into()])
        );
    }

    #[test]
    fn timers_need_positive_unique_intervals() {
        let err = PluginBuilder::new("echo")
            .timer("tick", Duration::ZERO, |_| async {})
            .build()
            .expect_err("zero");
        assert_eq!(err, BuildError::ZeroInterval("tick".into()));

        let spec = PluginBuilder::new("echo")
            .entry_async("slow", |_, _| async { Ok(json!(1)) })
            .timer("tick", Duration::from_secs(1), |_| async {})
            .build()
            .expect("valid");
        assert!(spec
            .handler(&EventKey::entry("slow"))
            .expect("registered")
            .is_async());
    }

    #[test]
    fn handler_errors_map_to_codes() {
        let info: ErrorInfo = HandlerError::InvalidArgs("x".into()).into();
        assert_eq!(info.code, ErrorCode::InvalidRequest);
        let info: ErrorInfo = HandlerError::msg("boom").into();
        assert_eq!(info.code, ErrorCode::Execution);
        assert_eq!(info.message, "boom");
    }
}
