//! Interceptor chain
//!
//! A chain is an ordered list of interceptors composed right-to-left around a
//! terminal handler: the first interceptor sees the call first and decides
//! whether to pass it on through its `Next`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc;

use crate::middleware::method::Method;

/// One intercepted protocol call.
#[derive(Debug, Clone)]
pub struct ProtocolCall {
    pub method: Method,
    pub params: Value,
    /// Forwarded unchanged to the backend.
    pub token: CancellationToken,
}

impl ProtocolCall {
    pub fn new(method: Method, params: Value) -> Self {
        Self {
            method,
            params,
            token: CancellationToken::new(),
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }
}

/// `Ok(None)` is a notification or a suppressed call.
pub type CallResult = jsonrpc::Result<Option<Value>>;

pub type Handler = Arc<dyn Fn(ProtocolCall) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(ProtocolCall) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = CallResult> + Send + 'static,
{
    Arc::new(move |call: ProtocolCall| f(call).boxed())
}

/// The remainder of the chain after the current interceptor.
#[derive(Clone)]
pub struct Next {
    handler: Handler,
}

impl Next {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }

    pub async fn run(self, call: ProtocolCall) -> CallResult {
        (self.handler)(call).await
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Interceptors skip methods they do not handle.
    fn intercepts(&self, _method: Method) -> bool {
        true
    }

    async fn intercept(&self, call: ProtocolCall, next: Next) -> CallResult;
}

#[derive(Clone, Default)]
pub struct Chain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Folds the interceptors around `terminal`.
    pub fn compose(&self, terminal: Handler) -> Handler {
        self.interceptors
            .iter()
            .rev()
            .fold(terminal, |next, interceptor| {
                let interceptor = interceptor.clone();
                let link: Handler = Arc::new(move |call: ProtocolCall| {
                    let interceptor = interceptor.clone();
                    let next = Next::new(next.clone());
                    async move {
                        if interceptor.intercepts(call.method) {
                            interceptor.intercept(call, next).await
                        } else {
                            next.run(call).await
                        }
                    }
                    .boxed()
                });
                link
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        only: Option<Method>,
    }

    #[async_trait]
    impl Interceptor for Tag {
        fn intercepts(&self, method: Method) -> bool {
            self.only.is_none_or(|only| only == method)
        }

        async fn intercept(&self, call: ProtocolCall, next: Next) -> CallResult {
            self.log.lock().unwrap().push(self.name);
            next.run(call).await
        }
    }

    struct Swallow;

    #[async_trait]
    impl Interceptor for Swallow {
        async fn intercept(&self, _call: ProtocolCall, _next: Next) -> CallResult {
            Ok(Some(json!("swallowed")))
        }
    }

    fn echo(log: Arc<Mutex<Vec<&'static str>>>) -> Handler {
        handler(move |call: ProtocolCall| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("terminal");
                Ok(Some(call.params))
            }
        })
    }

    #[tokio::test]
    async fn interceptors_run_in_declaration_order_before_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(Arc::new(Tag {
                name: "first",
                log: log.clone(),
                only: None,
            }))
            .with(Arc::new(Tag {
                name: "second",
                log: log.clone(),
                only: None,
            }));

        let result = chain.compose(echo(log.clone()))(ProtocolCall::new(
            Method::Hover,
            json!({"x": 1}),
        ))
        .await
        .unwrap();

        assert_eq!(result, Some(json!({"x": 1})));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "terminal"]);
    }

    #[tokio::test]
    async fn interceptor_is_skipped_for_methods_it_does_not_handle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new().with(Arc::new(Tag {
            name: "hover-only",
            log: log.clone(),
            only: Some(Method::Hover),
        }));

        chain.compose(echo(log.clone()))(ProtocolCall::new(Method::Completion, Value::Null))
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["terminal"]);
    }

    #[tokio::test]
    async fn interceptor_can_answer_without_calling_next() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new().with(Arc::new(Swallow));

        let result = chain.compose(echo(log.clone()))(ProtocolCall::new(Method::Hover, Value::Null))
            .await
            .unwrap();

        assert_eq!(result, Some(json!("swallowed")));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_chain_is_the_terminal_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let result = Chain::new().compose(echo(log.clone()))(ProtocolCall::new(
            Method::Hover,
            json!(7),
        ))
        .await
        .unwrap();

        assert_eq!(result, Some(json!(7)));
    }
}
