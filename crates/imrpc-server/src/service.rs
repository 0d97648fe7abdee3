//! Service registration.
//!
//! A [`Service`] is a name plus a table of method name to handler closure.
//! Handlers are typed when registered and erased to a common signature that
//! takes and returns serialized bytes, so the dispatcher never needs to know
//! argument or result types.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use imrpc_common::{ImrpcError, Serializer};

/// Per-call information handed to every handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub service: String,
    pub method: String,
    pub peer: Option<SocketAddr>,
    /// Caller's deadline, if the request carried one
    pub deadline: Option<SystemTime>,
    pub oneway: bool,
    token: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(service: &str, method: &str, token: CancellationToken) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            peer: None,
            deadline: None,
            oneway: false,
            token,
        }
    }

    pub(crate) fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub(crate) fn with_deadline(mut self, deadline: Option<SystemTime>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) fn with_oneway(mut self, oneway: bool) -> Self {
        self.oneway = oneway;
        self
    }

    /// Time left before the caller's deadline. `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Completes when the call's deadline passes or the server shuts down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token that fires together with this call.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// A business error returned by a handler.
///
/// The message travels to the caller in the response's error field. A partial
/// `value` is encoded into the payload as well; without one the payload stays
/// empty.
///
/// # Example
///
/// ```
/// use imrpc_server::MethodError;
///
/// let plain: MethodError<u32> = "user not found".into();
/// assert!(plain.value.is_none());
///
/// let partial = MethodError::with_value("truncated", 10u32);
/// assert_eq!(partial.value, Some(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MethodError<T = ()> {
    pub message: String,
    pub value: Option<T>,
}

impl<T> MethodError<T> {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(message: impl Into<String>, value: T) -> Self {
        Self {
            message: message.into(),
            value: Some(value),
        }
    }
}

impl<T> fmt::Display for MethodError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<T> From<String> for MethodError<T> {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl<T> From<&str> for MethodError<T> {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl<T> From<ImrpcError> for MethodError<T> {
    fn from(err: ImrpcError) -> Self {
        Self::new(err.to_string())
    }
}

/// Result of running one handler: an optional error message and the encoded
/// (still uncompressed) return value.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct MethodOutcome {
    pub error: Option<String>,
    /// `None` when the method returned no value. Some formats encode a value
    /// as zero bytes, so `Some(vec![])` is a real value.
    pub data: Option<Vec<u8>>,
}

impl MethodOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            data: None,
        }
    }

    fn encode<T: Serialize>(
        serialization: &dyn Serializer,
        error: Option<String>,
        value: Option<&T>,
    ) -> Self {
        let Some(value) = value else {
            return Self { error, data: None };
        };
        match serialization.encode(value) {
            Ok(data) => Self {
                error,
                data: Some(data),
            },
            Err(e) => Self::failed(match error {
                Some(message) => format!("{} (result not encodable: {})", message, e),
                None => e.to_string(),
            }),
        }
    }
}

pub(crate) type Handler =
    Arc<dyn Fn(CallContext, Arc<dyn Serializer>, Vec<u8>) -> BoxFuture<'static, MethodOutcome> + Send + Sync>;

/// A named set of methods, built with [`ServiceBuilder`].
#[derive(Clone)]
pub struct Service {
    name: String,
    methods: HashMap<String, Handler>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn handler(&self, method: &str) -> Option<&Handler> {
        self.methods.get(method)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods())
            .finish()
    }
}

/// Builds a [`Service`] from typed handler closures.
///
/// # Example
///
/// ```
/// use imrpc_server::{CallContext, MethodError, ServiceBuilder};
///
/// let service = ServiceBuilder::new("Math")
///     .method("Add", |_ctx: CallContext, (a, b): (i64, i64)| async move {
///         Ok::<_, MethodError<i64>>(a + b)
///     })
///     .method("Div", |_ctx: CallContext, (a, b): (i64, i64)| async move {
///         if b == 0 {
///             return Err(MethodError::new("division by zero"));
///         }
///         Ok::<i64, MethodError<i64>>(a / b)
///     })
///     .build();
///
/// assert_eq!(service.methods(), vec!["Add", "Div"]);
/// ```
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Handler>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    ///
    /// # Arguments
    /// * `name` - Method name as it appears on the wire
    /// * `handler` - Called with the call context and the decoded argument
    pub fn method<Req, Resp, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, MethodError<Resp>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |ctx, serialization, payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let req: Req = match serialization.decode(&payload) {
                    Ok(req) => req,
                    Err(e) => return MethodOutcome::failed(format!("invalid arguments: {}", e)),
                };
                match handler(ctx, req).await {
                    Ok(value) => MethodOutcome::encode(&*serialization, None, Some(&value)),
                    Err(MethodError { message, value }) => {
                        MethodOutcome::encode(&*serialization, Some(message), value.as_ref())
                    }
                }
            })
        });
        self.methods.insert(name.into(), erased);
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}
