//! Engine context: the media API, the tokio runtime that drives it, and
//! the dispatcher that user callbacks are marshalled onto.
//!
//! Everything hangs off an `RtcContext` value; there is no process-global
//! state. Connections, channels, and media objects created from one
//! context share its runtime and its dispatcher.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime;
use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

struct ContextInner {
    dispatcher: Dispatcher,
    api: API,
    runtime: Mutex<Option<runtime::Runtime>>,
    handle: runtime::Handle,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.dispatcher.stop();
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
    }
}

/// Shared handle to the engine context.
#[derive(Clone)]
pub struct RtcContext {
    inner: Arc<ContextInner>,
}

impl RtcContext {
    /// Creates a context whose dispatcher owns a dedicated thread.
    pub fn new() -> Result<Self> {
        let dispatcher = Dispatcher::spawn("rtc-dispatch")?;
        Self::build(dispatcher)
    }

    /// Creates a context with a threadless dispatcher for embedders that
    /// own the event loop. Pump it with [`RtcContext::dispatch_events`],
    /// woken through the dispatcher's async callback registration.
    pub fn new_manual() -> Result<Self> {
        Self::build(Dispatcher::new("rtc-dispatch"))
    }

    fn build(dispatcher: Dispatcher) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::new(format!("Failed to register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::new(format!("Failed to register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rtc-engine")
            .enable_all()
            .build()
            .map_err(|e| Error::new(format!("Failed to start engine runtime: {e}")))?;
        let handle = rt.handle().clone();

        info!("rtc context initialized");
        Ok(Self {
            inner: Arc::new(ContextInner {
                dispatcher,
                api,
                runtime: Mutex::new(Some(rt)),
                handle,
            }),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Runs due dispatcher entries on the calling thread. Only meaningful
    /// for contexts built with [`RtcContext::new_manual`]. Returns whether
    /// entries remain queued.
    pub fn dispatch_events(&self, forever: bool) -> bool {
        self.inner.dispatcher.dispatch_events(forever)
    }

    /// Stops the dispatcher (running everything still queued) and releases
    /// the engine runtime. Close connections and dispose media objects
    /// before calling this.
    pub fn shutdown(&self) {
        info!("rtc context shutting down");
        self.inner.dispatcher.stop();
        if let Some(rt) = self.inner.runtime.lock().take() {
            rt.shutdown_background();
        }
    }

    pub(crate) fn runtime(&self) -> runtime::Handle {
        self.inner.handle.clone()
    }

    pub(crate) fn api(&self) -> &API {
        &self.inner.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_context_dispatcher_runs_callbacks() {
        let context = RtcContext::new().unwrap();
        let (tx, rx) = mpsc::channel();
        context.dispatcher().call(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        context.shutdown();
    }

    #[test]
    fn test_manual_context_needs_a_pump() {
        let context = RtcContext::new_manual().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        context.dispatcher().call(move || flag.store(true, Ordering::Release));
        assert!(!ran.load(Ordering::Acquire));
        context.dispatch_events(false);
        assert!(ran.load(Ordering::Acquire));
        context.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let context = RtcContext::new().unwrap();
        context.shutdown();
        context.shutdown();
    }
}
