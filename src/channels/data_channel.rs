//! Callback-style wrapper around the engine's SCTP data channel.
//!
//! Engine events arrive on runtime threads and are queued on the
//! dispatcher before user callbacks see them. Sends block the calling
//! thread on the engine; callers on the dispatcher thread should keep
//! payloads small or move bulk transfers elsewhere.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime;
use tracing::debug;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl From<RTCDataChannelState> for DataChannelState {
    fn from(state: RTCDataChannelState) -> Self {
        match state {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                DataChannelState::Connecting
            }
        }
    }
}

/// Creation options for a locally negotiated channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: String,
    pub negotiated: bool,
    pub id: u16,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: false,
            id: 0,
        }
    }
}

impl From<&DataChannelInit> for RTCDataChannelInit {
    fn from(init: &DataChannelInit) -> Self {
        RTCDataChannelInit {
            ordered: Some(init.ordered),
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            protocol: Some(init.protocol.clone()),
            negotiated: init.negotiated.then_some(init.id),
        }
    }
}

type EventFn = Arc<dyn Fn() + Send + Sync>;
type ErrorFn = Arc<dyn Fn(Error) + Send + Sync>;
type MessageFn = Arc<dyn Fn(Bytes, bool) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_open: Option<EventFn>,
    on_close: Option<EventFn>,
    on_error: Option<ErrorFn>,
    on_message: Option<MessageFn>,
    on_buffered_amount_low: Option<EventFn>,
}

/// One data channel, locally created or announced by the remote peer.
pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
    dispatcher: Dispatcher,
    runtime: runtime::Handle,
    handlers: Arc<Mutex<Handlers>>,
}

impl RtcDataChannel {
    pub(crate) fn wrap(
        inner: Arc<RTCDataChannel>,
        dispatcher: Dispatcher,
        runtime: runtime::Handle,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            inner,
            dispatcher,
            runtime,
            handlers: Arc::new(Mutex::new(Handlers::default())),
        });
        channel.install_engine_handlers();
        channel
    }

    fn install_engine_handlers(&self) {
        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.inner.on_open(Box::new(move || {
            let handler = handlers.lock().on_open.clone();
            if let Some(handler) = handler {
                dispatcher.call(move || handler());
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.inner.on_close(Box::new(move || {
            let handler = handlers.lock().on_close.clone();
            if let Some(handler) = handler {
                dispatcher.call(move || handler());
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.inner.on_error(Box::new(move |err| {
            let handler = handlers.lock().on_error.clone();
            if let Some(handler) = handler {
                let error = Error::new(format!("Data channel error: {err}"));
                dispatcher.call(move || handler(error));
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        self.inner.on_message(Box::new(move |message| {
            let handler = handlers.lock().on_message.clone();
            if let Some(handler) = handler {
                let binary = !message.is_string;
                let data = message.data.clone();
                dispatcher.call(move || handler(data, binary));
            }
            Box::pin(async {})
        }));

        let handlers = self.handlers.clone();
        let dispatcher = self.dispatcher.clone();
        let inner = self.inner.clone();
        // Registration goes through the SCTP stream, which is async-side.
        self.runtime.spawn(async move {
            inner
                .on_buffered_amount_low(Box::new(move || {
                    let handler = handlers.lock().on_buffered_amount_low.clone();
                    if let Some(handler) = handler {
                        dispatcher.call(move || handler());
                    }
                    Box::pin(async {})
                }))
                .await;
        });
    }

    pub fn label(&self) -> String {
        self.inner.label().to_string()
    }

    pub fn id(&self) -> u16 {
        self.inner.id()
    }

    pub fn protocol(&self) -> String {
        self.inner.protocol().to_string()
    }

    pub fn ordered(&self) -> bool {
        self.inner.ordered()
    }

    pub fn max_packet_lifetime(&self) -> u16 {
        self.inner.max_packet_lifetime().unwrap_or(0)
    }

    pub fn max_retransmits(&self) -> u16 {
        self.inner.max_retransmits().unwrap_or(0)
    }

    pub fn negotiated(&self) -> bool {
        self.inner.negotiated()
    }

    pub fn ready_state(&self) -> DataChannelState {
        self.inner.ready_state().into()
    }

    pub fn buffered_amount(&self) -> usize {
        let inner = self.inner.clone();
        self.runtime.block_on(async move { inner.buffered_amount().await })
    }

    pub fn buffered_amount_low_threshold(&self) -> usize {
        let inner = self.inner.clone();
        self.runtime
            .block_on(async move { inner.buffered_amount_low_threshold().await })
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        let inner = self.inner.clone();
        self.runtime
            .block_on(async move { inner.set_buffered_amount_low_threshold(threshold).await });
    }

    /// Sends a binary message. Fails unless the channel is open.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.ready_state() != DataChannelState::Open {
            return Err(Error::new("Data channel is not open."));
        }
        let payload = Bytes::copy_from_slice(data);
        let inner = self.inner.clone();
        debug!(label = %self.inner.label(), bytes = payload.len(), "sending");
        self.runtime
            .block_on(async move { inner.send(&payload).await })
            .map(|_| ())
            .map_err(|e| Error::new(format!("Failed to send: {e}")))
    }

    /// Sends a text message.
    pub fn send_text(&self, text: &str) -> Result<()> {
        if self.ready_state() != DataChannelState::Open {
            return Err(Error::new("Data channel is not open."));
        }
        let inner = self.inner.clone();
        let text = text.to_string();
        self.runtime
            .block_on(async move { inner.send_text(text).await })
            .map(|_| ())
            .map_err(|e| Error::new(format!("Failed to send: {e}")))
    }

    pub fn close(&self) {
        let inner = self.inner.clone();
        let label = self.label();
        self.runtime.spawn(async move {
            if let Err(e) = inner.close().await {
                debug!(label = %label, "close failed: {e}");
            }
        });
    }

    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().on_open = Some(Arc::new(callback));
    }

    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().on_close = Some(Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(Error) + Send + Sync + 'static) {
        self.handlers.lock().on_error = Some(Arc::new(callback));
    }

    /// Message payloads arrive with a flag telling binary from text.
    pub fn on_message(&self, callback: impl Fn(Bytes, bool) + Send + Sync + 'static) {
        self.handlers.lock().on_message = Some(Arc::new(callback));
    }

    pub fn on_buffered_amount_low(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().on_buffered_amount_low = Some(Arc::new(callback));
    }
}
