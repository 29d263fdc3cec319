//! Per-request execution context: the single coordination point binding a
//! request to its response channel, streaming writer, error state,
//! user-scratch slot, disconnect probe, and batcher completion signal.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;

use crate::converter::Converter;
use crate::error::ContextStateError;
use crate::inferer::Inferer;
use crate::message::GenericMessage;

/// The narrow capability set a streaming transport exposes to the context.
///
/// Both the bidirectional-RPC writer and the chunked-HTTP writer implement
/// this; the context never needs to know which one it holds.
pub trait StreamSink: Send + Sync {
    /// Write a raw byte chunk (used for binary payloads and customized HTTP
    /// streaming).
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), String>;
    /// Write a structured message (serialized to the transport's native
    /// framing — JSON for HTTP, the native message type for RPC).
    fn write_message(&self, msg: &GenericMessage) -> Result<(), String>;
    /// Close the stream from the server side.
    fn close(&self);
    /// Whether the peer has already disconnected.
    fn is_cancelled(&self) -> bool;
}

struct StreamingState {
    sink: Box<dyn StreamSink>,
    ended: bool,
    /// On HTTP transports, a placeholder that keeps the connection in
    /// "will respond once, as a whole" mode until the first progressive
    /// write tears it down.
    http_done_guard_armed: bool,
}

struct ErrorState {
    has_err: bool,
    msg: String,
}

struct UserData {
    value: Box<dyn Any + Send>,
}

/// Disconnect probe supplied by the transport adapter at context
/// construction time.
pub trait DisconnectProbe: Send + Sync {
    /// True if the peer has gone away.
    fn is_disconnected(&self) -> bool;
}

struct NeverDisconnected;
impl DisconnectProbe for NeverDisconnected {
    fn is_disconnected(&self) -> bool {
        false
    }
}

pub(crate) struct ContextInner {
    error: Mutex<ErrorState>,
    user_data: Mutex<Option<UserData>>,
    streaming: Option<Mutex<StreamingState>>,
    disconnect: Box<dyn DisconnectProbe>,
    completion_fired: AtomicBool,
    completion_tx: Mutex<Option<oneshot::Sender<()>>>,
    completion_rx: Mutex<Option<oneshot::Receiver<()>>>,
    converter: Mutex<Option<Weak<dyn Converter>>>,
    inferer: Mutex<Option<Weak<dyn Inferer>>>,
}

/// Per-request execution context. Cheaply cloneable; every clone shares the
/// same underlying state, matching the source's "shared between the
/// submitter and the batcher dispatcher" ownership model.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    /// Construct a new context. `sink` is `None` for a unary request.
    pub fn new(sink: Option<Box<dyn StreamSink>>, disconnect: Option<Box<dyn DisconnectProbe>>) -> Self {
        let (tx, rx) = oneshot::channel();
        let inner = ContextInner {
            error: Mutex::new(ErrorState {
                has_err: false,
                msg: String::new(),
            }),
            user_data: Mutex::new(None),
            streaming: sink.map(|sink| {
                Mutex::new(StreamingState {
                    sink,
                    ended: false,
                    http_done_guard_armed: true,
                })
            }),
            disconnect: disconnect.unwrap_or_else(|| Box::new(NeverDisconnected)),
            completion_fired: AtomicBool::new(false),
            completion_tx: Mutex::new(Some(tx)),
            completion_rx: Mutex::new(Some(rx)),
            converter: Mutex::new(None),
            inferer: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Wait for this context's single-use completion signal to fire.
    ///
    /// Only the first caller on a given context actually waits on the
    /// channel; a context used for at most one batcher submission (the
    /// common case) has exactly one caller. A second call observes the
    /// signal has already been consumed and returns immediately.
    pub async fn wait_completion(&self) {
        let rx = self.inner.completion_rx.lock().unwrap().take();
        match rx {
            Some(rx) => {
                let _ = rx.await;
            }
            None => {
                // Already awaited (or never armed because this context was
                // never submitted to a batcher) — fall back to spin-free
                // polling of the idempotent fired flag.
                while !self.inner.completion_fired.load(Ordering::SeqCst) {
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Attach the converter/inferer this request's stage will use. Called by
    /// the stage node before `Process` runs.
    pub fn bind_stage(&self, converter: Option<Weak<dyn Converter>>, inferer: Weak<dyn Inferer>) {
        *self.inner.converter.lock().unwrap() = converter;
        *self.inner.inferer.lock().unwrap() = Some(inferer);
    }

    /// The converter bound for this request's current stage, if any.
    pub fn converter(&self) -> Option<Arc<dyn Converter>> {
        self.inner.converter.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// The inferer bound for this request's current stage.
    pub fn inferer(&self) -> Option<Arc<dyn Inferer>> {
        self.inner.inferer.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// True iff a streaming writer was attached at construction.
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.is_some()
    }

    /// Store a single opaque value on this context, overwriting any prior
    /// value (last-write-wins). The value is dropped when the context is
    /// dropped.
    pub fn set_user_data<T: Send + 'static>(&self, value: T) {
        let mut slot = self.inner.user_data.lock().unwrap();
        *slot = Some(UserData {
            value: Box::new(value),
        });
    }

    /// Retrieve a previously-stored value of type `T`.
    ///
    /// # Errors
    /// Returns [`ContextStateError::UserDataUnset`] if nothing was stored,
    /// or if the stored value is not of type `T`.
    pub fn get_user_data<T: Clone + Send + 'static>(&self) -> Result<T, ContextStateError> {
        let slot = self.inner.user_data.lock().unwrap();
        slot.as_ref()
            .and_then(|d| d.value.downcast_ref::<T>())
            .cloned()
            .ok_or(ContextStateError::UserDataUnset)
    }

    /// Mark this context as errored. Sticky: once set, `has_error` never
    /// returns to false and the message is retained verbatim.
    pub fn set_error(&self, msg: impl Into<String>) {
        let mut err = self.inner.error.lock().unwrap();
        if !err.has_err {
            err.has_err = true;
            err.msg = msg.into();
        }
    }

    /// Whether this context has ever been marked errored.
    pub fn has_error(&self) -> bool {
        self.inner.error.lock().unwrap().has_err
    }

    /// The sticky error message, or an empty string if never set.
    pub fn error_msg(&self) -> String {
        self.inner.error.lock().unwrap().msg.clone()
    }

    /// Whether the underlying transport reports the peer has disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnect.is_disconnected()
    }

    /// Send one streaming message. Serialized per-context; a no-op once the
    /// stream has been marked final. If `final_msg` is true, marks the
    /// stream ended and fires the completion signal (idempotent).
    pub fn streaming_respond(&self, msg: &GenericMessage, final_msg: bool) -> Result<(), String> {
        let Some(streaming) = &self.inner.streaming else {
            return Err("context has no streaming writer attached".to_string());
        };
        let mut state = streaming.lock().unwrap();
        if state.ended {
            return Ok(());
        }
        let result = if msg.is_binary() {
            match msg {
                GenericMessage::Bin(bytes) => state.sink.write_bytes(bytes),
                _ => unreachable!(),
            }
        } else {
            state.sink.write_message(msg)
        };
        if final_msg {
            state.ended = true;
            drop(state);
            self.fire_completion();
        }
        result
    }

    /// Run the converter's post-process to turn `tensors` into a message,
    /// then delegate to [`Self::streaming_respond`].
    pub fn streaming_respond_with_post_process(
        &self,
        tensors: &[crate::message::GenericTensor],
        final_msg: bool,
    ) -> Result<(), String> {
        let converter = self
            .converter()
            .ok_or(ContextStateError::NoConverter)
            .map_err(|e| e.to_string())?;
        let msg = converter.post_process(tensors, self).map_err(|e| e.to_string())?;
        self.streaming_respond(&msg, final_msg)
    }

    /// Write a raw byte chunk directly, tearing down the HTTP "done guard"
    /// placeholder on first call so the transport switches to progressive
    /// mode.
    pub fn customized_http_streaming_respond(&self, bytes: &[u8], final_msg: bool) -> Result<(), String> {
        let Some(streaming) = &self.inner.streaming else {
            return Ok(());
        };
        let mut state = streaming.lock().unwrap();
        if state.ended {
            return Ok(());
        }
        if state.http_done_guard_armed {
            state.http_done_guard_armed = false;
        }
        let result = state.sink.write_bytes(bytes);
        if final_msg {
            state.ended = true;
            drop(state);
            self.fire_completion();
        }
        result
    }

    /// Fire the batcher-completion signal. Idempotent: only the first call
    /// actually sends.
    pub fn fire_completion(&self) {
        if self
            .inner
            .completion_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Some(tx) = self.inner.completion_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    }
}
