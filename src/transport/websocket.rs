//! Direct WebSocket carrier (wasm)
//!
//! TLS to the bridge, WebSocket upgrade with subprotocol "tor", binary
//! messages carrying cell bytes. Message boundaries mean nothing: the
//! cell codec upstream reassembles.
//!
//! Browser WebSocket events are callbacks; they only ever append to the
//! shared buffer and wake the pending future, so the circuit's owner task
//! remains the single mutator of protocol state.

use crate::error::{Result, TorError};
use crate::transport::{BridgeEndpoint, Carrier, CarrierConnector, CarrierKind};
use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{BinaryType, ErrorEvent, MessageEvent, WebSocket};

/// Subprotocol announced on the direct carrier.
const TOR_SUBPROTOCOL: &str = "tor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Open,
    Closed,
}

struct Shared {
    state: LinkState,
    inbound: VecDeque<Vec<u8>>,
    error: Option<String>,
    open_waker: Option<Waker>,
    recv_waker: Option<Waker>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: LinkState::Connecting,
            inbound: VecDeque::new(),
            error: None,
            open_waker: None,
            recv_waker: None,
        }
    }

    fn wake_all(&mut self) {
        if let Some(w) = self.open_waker.take() {
            w.wake();
        }
        if let Some(w) = self.recv_waker.take() {
            w.wake();
        }
    }
}

/// A WebSocket-backed carrier. Also the wire layer for WebTunnel, which
/// only differs in URL and subprotocol.
pub struct WsCarrier {
    ws: WebSocket,
    shared: Rc<RefCell<Shared>>,
    // Keep the closures alive for as long as events may fire.
    _on_open: Closure<dyn FnMut()>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_error: Closure<dyn FnMut(ErrorEvent)>,
    _on_close: Closure<dyn FnMut()>,
}

impl WsCarrier {
    /// Dial `url` with the given subprotocol and wait for the upgrade.
    pub async fn connect(url: &str, protocol: &str) -> Result<Self> {
        let ws = WebSocket::new_with_str(url, protocol)
            .map_err(|e| TorError::Transport(format!("WebSocket::new: {e:?}")))?;
        ws.set_binary_type(BinaryType::Arraybuffer);

        let shared = Rc::new(RefCell::new(Shared::new()));

        let s = shared.clone();
        let on_open = Closure::wrap(Box::new(move || {
            let mut shared = s.borrow_mut();
            shared.state = LinkState::Open;
            shared.wake_all();
        }) as Box<dyn FnMut()>);
        ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));

        let s = shared.clone();
        let on_message = Closure::wrap(Box::new(move |event: MessageEvent| {
            if let Ok(buf) = event.data().dyn_into::<js_sys::ArrayBuffer>() {
                let array = js_sys::Uint8Array::new(&buf);
                let mut shared = s.borrow_mut();
                shared.inbound.push_back(array.to_vec());
                if let Some(w) = shared.recv_waker.take() {
                    w.wake();
                }
            }
        }) as Box<dyn FnMut(MessageEvent)>);
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));

        let s = shared.clone();
        let on_error = Closure::wrap(Box::new(move |_event: ErrorEvent| {
            let mut shared = s.borrow_mut();
            shared.error = Some("websocket error".into());
            shared.state = LinkState::Closed;
            shared.wake_all();
        }) as Box<dyn FnMut(ErrorEvent)>);
        ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        let s = shared.clone();
        let on_close = Closure::wrap(Box::new(move || {
            let mut shared = s.borrow_mut();
            shared.state = LinkState::Closed;
            shared.wake_all();
        }) as Box<dyn FnMut()>);
        ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        let carrier = Self {
            ws,
            shared,
            _on_open: on_open,
            _on_message: on_message,
            _on_error: on_error,
            _on_close: on_close,
        };

        WaitOpen {
            shared: carrier.shared.clone(),
        }
        .await?;
        Ok(carrier)
    }
}

/// Resolves once the socket opens (or fails).
struct WaitOpen {
    shared: Rc<RefCell<Shared>>,
}

impl Future for WaitOpen {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        match shared.state {
            LinkState::Open => Poll::Ready(Ok(())),
            LinkState::Closed => Poll::Ready(Err(TorError::Transport(
                shared
                    .error
                    .clone()
                    .unwrap_or_else(|| "websocket refused".into()),
            ))),
            LinkState::Connecting => {
                shared.open_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Resolves with the next inbound message.
struct NextMessage {
    shared: Rc<RefCell<Shared>>,
}

impl Future for NextMessage {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        if let Some(chunk) = shared.inbound.pop_front() {
            return Poll::Ready(Ok(chunk));
        }
        match shared.state {
            LinkState::Closed => Poll::Ready(Err(TorError::Transport(
                shared
                    .error
                    .clone()
                    .unwrap_or_else(|| "websocket closed".into()),
            ))),
            _ => {
                shared.recv_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[async_trait(?Send)]
impl Carrier for WsCarrier {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.shared.borrow().state != LinkState::Open {
            return Err(TorError::Transport("websocket not open".into()));
        }
        self.ws
            .send_with_u8_array(bytes)
            .map_err(|e| TorError::Transport(format!("websocket send: {e:?}")))
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        NextMessage {
            shared: self.shared.clone(),
        }
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.ws.close();
        self.shared.borrow_mut().state = LinkState::Closed;
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.shared.borrow_mut().inbound.pop_front())
    }
}

impl Drop for WsCarrier {
    fn drop(&mut self) {
        if self.shared.borrow().state != LinkState::Closed {
            let _ = self.ws.close();
        }
    }
}

/// Connector for the direct carrier: `wss://bridge/?addr=host:port` with
/// subprotocol "tor". A blinding envelope, when configured, replaces the
/// clear address.
pub struct WsConnector;

#[async_trait(?Send)]
impl CarrierConnector for WsConnector {
    fn kind(&self) -> CarrierKind {
        CarrierKind::WebSocket
    }

    async fn connect(&self, endpoint: &BridgeEndpoint) -> Result<Box<dyn Carrier>> {
        let url = format!(
            "{}/?addr={}",
            endpoint.url.trim_end_matches('/'),
            endpoint.addr_param()
        );
        let carrier = WsCarrier::connect(&url, TOR_SUBPROTOCOL).await?;
        Ok(Box::new(carrier))
    }
}
