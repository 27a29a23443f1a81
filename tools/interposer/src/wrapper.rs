//! Interception handles over call targets.
//!
//! A [`Target`] says once, at wrap time, what kind of thing is being wrapped.
//! A [`Proxy`] routes calls on functions, bound methods, and constructors
//! through the engine, and wraps wrappable members and constructed objects
//! again on the same channel so chains stay intercepted.

use crate::canonical::{Arguments, CallIdentity};
use crate::engine::Interposer;
use crate::errors::{CallError, InterposerError};
use crate::store::Mode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

pub trait Callable: Send + Sync {
    /// The name recorded as the call identity's method.
    fn name(&self) -> &str;
    fn call(&self, arguments: &Arguments) -> Result<Value, CallError>;
}

pub trait Object: Send + Sync {
    fn type_name(&self) -> &str;
    fn member(&self, name: &str) -> Option<Target>;

    /// State recorded when this object is constructed through a proxy.
    fn snapshot(&self) -> Value {
        Value::Null
    }

    /// Direct invocation. Forwarded without recording.
    fn invoke(&self, _arguments: &Arguments) -> Result<Value, CallError> {
        Err(CallError::new(
            "TypeError",
            format!("{} is not callable", self.type_name()),
        ))
    }
}

pub trait Constructor: Send + Sync {
    fn name(&self) -> &str;
    fn construct(&self, arguments: &Arguments) -> Result<Arc<dyn Object>, CallError>;

    /// Rebuild an instance from its recorded [`Object::snapshot`].
    fn restore(&self, state: &Value) -> Result<Arc<dyn Object>, CallError>;

    fn member(&self, _name: &str) -> Option<Target> {
        None
    }
}

#[derive(Clone)]
pub enum Target {
    /// Plain data; never wrapped.
    Value(Value),
    Function(Arc<dyn Callable>),
    BoundMethod(Arc<dyn Callable>),
    Constructor(Arc<dyn Constructor>),
    Namespace(Arc<dyn Object>),
    Opaque(Arc<dyn Object>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Value,
    Function,
    BoundMethod,
    Constructor,
    Namespace,
    Opaque,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Function => "function",
            Self::BoundMethod => "method",
            Self::Constructor => "constructor",
            Self::Namespace => "namespace",
            Self::Opaque => "object",
        }
    }
}

impl Target {
    pub fn function(callable: impl Callable + 'static) -> Self {
        Self::Function(Arc::new(callable))
    }

    pub fn method(callable: impl Callable + 'static) -> Self {
        Self::BoundMethod(Arc::new(callable))
    }

    pub fn constructor(constructor: impl Constructor + 'static) -> Self {
        Self::Constructor(Arc::new(constructor))
    }

    pub fn namespace(object: impl Object + 'static) -> Self {
        Self::Namespace(Arc::new(object))
    }

    pub fn object(object: impl Object + 'static) -> Self {
        Self::Opaque(Arc::new(object))
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Value(_) => TargetKind::Value,
            Self::Function(_) => TargetKind::Function,
            Self::BoundMethod(_) => TargetKind::BoundMethod,
            Self::Constructor(_) => TargetKind::Constructor,
            Self::Namespace(_) => TargetKind::Namespace,
            Self::Opaque(_) => TargetKind::Opaque,
        }
    }

    pub fn is_wrappable(&self) -> bool {
        !matches!(self, Self::Value(_))
    }

    pub fn name(&self) -> String {
        match self {
            Self::Value(value) => value.to_string(),
            Self::Function(callable) | Self::BoundMethod(callable) => callable.name().to_string(),
            Self::Constructor(constructor) => constructor.name().to_string(),
            Self::Namespace(object) | Self::Opaque(object) => object.type_name().to_string(),
        }
    }

    pub fn describe(&self) -> String {
        format!("{} `{}`", self.kind().as_str(), self.name())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<Value> for Target {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// What a proxied call or member access hands back.
#[derive(Debug)]
pub enum Reply {
    Value(Value),
    Proxy(Proxy),
}

impl Reply {
    pub fn is_interposed(&self) -> bool {
        matches!(self, Self::Proxy(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Proxy(_) => None,
        }
    }

    pub fn into_proxy(self) -> Result<Proxy, InterposerError> {
        match self {
            Self::Proxy(proxy) => Ok(proxy),
            Self::Value(value) => Err(InterposerError::NotCallable(format!("value {value}"))),
        }
    }
}

pub struct Proxy {
    target: Target,
    engine: Weak<Interposer>,
    channel: String,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("target", &self.target)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(target: Target, engine: Weak<Interposer>, channel: &str) -> Self {
        Self {
            target,
            engine,
            channel: channel.to_string(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn engine(&self) -> Result<Arc<Interposer>, InterposerError> {
        self.engine.upgrade().ok_or(InterposerError::Closed)
    }

    /// Call the wrapped target.
    ///
    /// Functions, bound methods, and constructors go through the engine; a
    /// constructor's instance comes back wrapped on this proxy's channel.
    /// Anything else is invoked directly.
    pub fn call(&self, arguments: &Arguments) -> Result<Reply, InterposerError> {
        match &self.target {
            Target::Function(callable) | Target::BoundMethod(callable) => {
                let engine = self.engine()?;
                let call = CallIdentity::new(callable.name(), arguments, self.channel.as_str());
                self.log_recorded_call(&engine);
                engine
                    .intercept(call, || callable.call(arguments))
                    .map(Reply::Value)
            }
            Target::Constructor(constructor) => {
                let engine = self.engine()?;
                let call = CallIdentity::new(constructor.name(), arguments, self.channel.as_str());
                self.log_recorded_call(&engine);
                let mut built = None;
                let state = engine.intercept(call, || {
                    let instance = constructor.construct(arguments)?;
                    let state = instance.snapshot();
                    built = Some(instance);
                    Ok(state)
                })?;
                let instance = match built {
                    Some(instance) => instance,
                    None => constructor.restore(&state)?,
                };
                engine
                    .wrap(Target::Opaque(instance), &self.channel)
                    .map(Reply::Proxy)
            }
            Target::Namespace(object) | Target::Opaque(object) => {
                // Forwarded as is; a dropped engine only means nothing is logged.
                if let Some(engine) = self.engine.upgrade() {
                    engine.log(
                        "wrappr",
                        "call",
                        format!("calling {} and ignoring result", self.target.describe()),
                        json!({ "target": self.target.describe(), "channel": self.channel }),
                    );
                }
                object.invoke(arguments).map(Reply::Value).map_err(Into::into)
            }
            Target::Value(value) => Err(InterposerError::NotCallable(format!("value {value}"))),
        }
    }

    /// Look up `name`, wrapping it on this channel when it is wrappable.
    pub fn member(&self, name: &str) -> Result<Reply, InterposerError> {
        let engine = self.engine()?;
        let member = match &self.target {
            Target::Constructor(constructor) => constructor.member(name),
            Target::Namespace(object) | Target::Opaque(object) => object.member(name),
            _ => None,
        }
        .ok_or_else(|| InterposerError::MissingMember {
            owner: self.target.describe(),
            name: name.to_string(),
        })?;

        match member {
            Target::Value(value) => {
                engine.log(
                    "wrappr",
                    "wrap",
                    format!("NOT wrapping {}.{name}", self.target.name()),
                    json!({ "owner": self.target.describe(), "member": name }),
                );
                Ok(Reply::Value(value))
            }
            wrappable => engine.wrap(wrappable, &self.channel).map(Reply::Proxy),
        }
    }

    pub fn call_method(&self, name: &str, arguments: &Arguments) -> Result<Reply, InterposerError> {
        self.member(name)?.into_proxy()?.call(arguments)
    }

    fn log_recorded_call(&self, engine: &Interposer) {
        let message = match engine.mode() {
            Mode::Recording => format!("calling {} and recording result", self.target.describe()),
            Mode::Playback => format!("playing back {}", self.target.describe()),
        };
        engine.log(
            "wrappr",
            "call",
            message,
            json!({ "target": self.target.describe(), "channel": self.channel }),
        );
    }
}

type CallFn = dyn Fn(&Arguments) -> Result<Value, CallError> + Send + Sync;

/// A [`Callable`] from a name and a closure.
pub struct FnCallable {
    name: String,
    call: Box<CallFn>,
}

impl FnCallable {
    pub fn new<F>(name: impl Into<String>, call: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call: Box::new(call),
        }
    }
}

impl Callable for FnCallable {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, arguments: &Arguments) -> Result<Value, CallError> {
        (self.call)(arguments)
    }
}

/// An [`Object`] assembled from named members.
pub struct FnObject {
    type_name: String,
    members: BTreeMap<String, Target>,
    state: Value,
}

impl FnObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            members: BTreeMap::new(),
            state: Value::Null,
        }
    }

    pub fn with_member(mut self, name: impl Into<String>, member: Target) -> Self {
        self.members.insert(name.into(), member);
        self
    }

    pub fn with_method<F>(self, name: &str, call: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.with_member(name, Target::method(FnCallable::new(name, call)))
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }
}

impl Object for FnObject {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn member(&self, name: &str) -> Option<Target> {
        self.members.get(name).cloned()
    }

    fn snapshot(&self) -> Value {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{FnCallable, FnObject, Object, Reply, Target, TargetKind};
    use crate::canonical::Arguments;
    use crate::engine::Interposer;
    use crate::errors::{CallError, InterposerError};
    use crate::store::Mode;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn plain_values_are_not_wrappable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Interposer::new(dir.path().join("w.db"), Mode::Recording);
        let value = Target::from(json!([1, 2]));
        assert!(!engine.wrappable(&value));
        let err = engine.wrap(value, "default").expect_err("rejected");
        assert!(matches!(err, InterposerError::Wrapping(msg) if msg.contains("[1,2]")));

        let function = Target::function(FnCallable::new("f", |_| Ok(json!(null))));
        assert_eq!(function.kind(), TargetKind::Function);
        assert!(engine.wrappable(&function));
    }

    #[test]
    fn namespace_members_wrap_on_the_same_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Interposer::new(dir.path().join("w.db"), Mode::Recording);
        let module = FnObject::new("api")
            .with_member("VERSION", Target::from(json!("1.2")))
            .with_method("ping", |_| Ok(json!("pong")));
        let proxy = engine.wrap(Target::namespace(module), "svc").expect("wrap");

        let version = proxy.member("VERSION").expect("member");
        assert!(!version.is_interposed());
        assert_eq!(version.into_value(), Some(json!("1.2")));

        let ping = proxy.member("ping").expect("member").into_proxy().expect("proxy");
        assert_eq!(ping.channel(), "svc");
        assert_eq!(ping.target().kind(), TargetKind::BoundMethod);

        let err = proxy.member("missing").expect_err("absent");
        assert!(matches!(err, InterposerError::MissingMember { name, .. } if name == "missing"));
    }

    #[test]
    fn unrecorded_targets_are_forwarded_directly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Interposer::new(dir.path().join("w.db"), Mode::Playback);
        let object = FnObject::new("thing");
        let proxy = engine.wrap(Target::object(object), "default").expect("wrap");
        // Never opened; the object's own invoke answers.
        let err = proxy.call(&Arguments::new()).expect_err("not callable");
        assert_eq!(
            err.as_call().map(|e| e.kind.as_str()),
            Some("TypeError")
        );
    }

    #[test]
    fn recorded_calls_run_the_live_function_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.db");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let function = Target::function(FnCallable::new("add", move |args: &Arguments| {
            counter.fetch_add(1, Ordering::SeqCst);
            let a = args.positional(0).and_then(|p| p.as_i64()).unwrap_or(0);
            let b = args.positional(1).and_then(|p| p.as_i64()).unwrap_or(0);
            Ok(json!(a + b))
        }));

        let recorder = Interposer::new(&path, Mode::Recording);
        recorder.open().expect("open");
        let add = recorder.wrap(function.clone(), "default").expect("wrap");
        let reply = add.call(&Arguments::new().arg(2).arg(3)).expect("call");
        assert!(matches!(reply, Reply::Value(ref v) if *v == json!(5)));
        recorder.close().expect("close");

        let player = Interposer::new(&path, Mode::Playback);
        player.open().expect("open");
        let add = player.wrap(function, "default").expect("wrap");
        let reply = add.call(&Arguments::new().arg(2).arg(3)).expect("replay");
        assert_eq!(reply.into_value(), Some(json!(5)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn proxies_outliving_their_engine_report_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Interposer::new(dir.path().join("w.db"), Mode::Recording);
        let proxy = engine
            .wrap(
                Target::function(FnCallable::new("f", |_| {
                    Err(CallError::new("Unreachable", "never runs"))
                })),
                "default",
            )
            .expect("wrap");
        drop(engine);
        assert!(matches!(proxy.call(&Arguments::new()), Err(InterposerError::Closed)));
    }

    struct Callee;

    impl Object for Callee {
        fn type_name(&self) -> &str {
            "callee"
        }

        fn member(&self, _name: &str) -> Option<Target> {
            None
        }

        fn invoke(&self, _arguments: &Arguments) -> Result<Value, CallError> {
            Ok(json!("direct"))
        }
    }

    #[test]
    fn forwarded_calls_outlive_their_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Interposer::new(dir.path().join("w.db"), Mode::Recording);
        let opaque = engine.wrap(Target::object(Callee), "default").expect("wrap");
        let namespace = engine.wrap(Target::namespace(Callee), "default").expect("wrap");
        drop(engine);

        let reply = opaque.call(&Arguments::new()).expect("forwarded");
        assert_eq!(reply.into_value(), Some(json!("direct")));
        let reply = namespace.call(&Arguments::new().arg(1)).expect("forwarded");
        assert_eq!(reply.into_value(), Some(json!("direct")));
    }
}
