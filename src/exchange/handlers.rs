//! Handler bindings an exchange invokes.
//!
//! Commands bind three handlers, one per dispatch mode. Events bind one.
//! Every handler gets the decoded [`Payload`] plus a [`CallContext`] and
//! returns a boxed future, so async business code plugs in directly:
//!
//! ```ignore
//! let handlers = CommandHandlers::new(
//!     |payload, ctx| async move { orders.place(payload, ctx).await },
//!     |payload, ctx| async move { orders.place(payload, ctx).await },
//!     |payload, ctx| async move { orders.place_with_total(payload, ctx).await },
//! );
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::codec::DispatchMode;
use crate::error::HandlerError;
use crate::identity::Identity;
use crate::message::Payload;

/// Boxed future returned by a handler.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send>>;

type UnitHandler = dyn Fn(Payload, CallContext) -> HandlerFuture<()> + Send + Sync;
type ValueHandler = dyn Fn(Payload, CallContext) -> HandlerFuture<Value> + Send + Sync;

/// What a handler knows about the message beyond its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Caller identity from the envelope, also installed as the ambient
    /// identity while the handler runs.
    pub identity: Option<Identity>,
    pub source_service: Option<String>,
    pub message_type: &'static str,
    pub topic: String,
    pub mode: DispatchMode,
}

impl CallContext {
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn wants_result(&self) -> bool {
        self.mode == DispatchMode::AwaitHandlerResult
    }
}

/// The three command bindings.
#[derive(Clone)]
pub struct CommandHandlers {
    fire_and_forget: Arc<UnitHandler>,
    await_completion: Arc<UnitHandler>,
    await_result: Arc<ValueHandler>,
}

impl CommandHandlers {
    pub fn new<F, FFut, A, AFut, R, RFut>(on_fire_and_forget: F, on_await: A, on_await_with_result: R) -> Self
    where
        F: Fn(Payload, CallContext) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        A: Fn(Payload, CallContext) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        R: Fn(Payload, CallContext) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self {
            fire_and_forget: Arc::new(move |p: Payload, c: CallContext| -> HandlerFuture<()> {
                Box::pin(on_fire_and_forget(p, c))
            }),
            await_completion: Arc::new(move |p: Payload, c: CallContext| -> HandlerFuture<()> {
                Box::pin(on_await(p, c))
            }),
            await_result: Arc::new(move |p: Payload, c: CallContext| -> HandlerFuture<Value> {
                Box::pin(on_await_with_result(p, c))
            }),
        }
    }

    /// Bind one handler for all three modes. Its value is discarded unless
    /// the caller asked for a result.
    pub fn from_fn<H, Fut>(handler: H) -> Self
    where
        H: Fn(Payload, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let (a, b) = (handler.clone(), handler.clone());
        Self::new(
            move |p, c| {
                let fut = a(p, c);
                async move { fut.await.map(|_| ()) }
            },
            move |p, c| {
                let fut = b(p, c);
                async move { fut.await.map(|_| ()) }
            },
            move |p, c| handler(p, c),
        )
    }

    async fn invoke(&self, payload: Payload, ctx: CallContext) -> Result<Option<Value>, HandlerError> {
        match ctx.mode {
            DispatchMode::FireAndForget => (self.fire_and_forget)(payload, ctx).await.map(|_| None),
            DispatchMode::AwaitHandlerCompletion => {
                (self.await_completion)(payload, ctx).await.map(|_| None)
            }
            DispatchMode::AwaitHandlerResult => (self.await_result)(payload, ctx).await.map(Some),
        }
    }
}

impl fmt::Debug for CommandHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommandHandlers")
    }
}

/// The event binding.
#[derive(Clone)]
pub struct EventHandler {
    handler: Arc<UnitHandler>,
}

impl EventHandler {
    pub fn new<H, Fut>(handler: H) -> Self
    where
        H: Fn(Payload, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |p: Payload, c: CallContext| -> HandlerFuture<()> {
                Box::pin(handler(p, c))
            }),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventHandler")
    }
}

/// Whatever an exchange calls for its message kind.
#[derive(Debug, Clone)]
pub enum ExchangeHandlers {
    Commands(CommandHandlers),
    Events(EventHandler),
}

impl ExchangeHandlers {
    /// Run the binding for `ctx.mode`. Only result-bearing dispatches yield a value.
    pub async fn invoke(&self, payload: Payload, ctx: CallContext) -> Result<Option<Value>, HandlerError> {
        match self {
            ExchangeHandlers::Commands(handlers) => handlers.invoke(payload, ctx).await,
            ExchangeHandlers::Events(handler) => (handler.handler)(payload, ctx).await.map(|_| None),
        }
    }
}

impl From<CommandHandlers> for ExchangeHandlers {
    fn from(handlers: CommandHandlers) -> Self {
        ExchangeHandlers::Commands(handlers)
    }
}

impl From<EventHandler> for ExchangeHandlers {
    fn from(handler: EventHandler) -> Self {
        ExchangeHandlers::Events(handler)
    }
}
