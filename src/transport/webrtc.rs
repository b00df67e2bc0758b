//! WebRTC data-channel carrier (wasm)
//!
//! For clients whose bridge IPs are blocked outright: signaling goes
//! through the broker, the volunteer proxy's browser answers, and cell
//! bytes then ride an ordered binary data channel named "tor-transport".
//! To DPI the flow resembles a video call.
//!
//! The channel MUST be ordered; the cell codec depends on an ordered byte
//! stream. Back-pressure is expressed through the channel's
//! buffered-amount threshold.

use crate::broker::{BrokerMessage, PartyMessage};
use crate::error::{Result, TorError};
use crate::transport::websocket::WsCarrier;
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
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    MessageEvent, RtcDataChannel, RtcDataChannelEvent, RtcDataChannelState, RtcPeerConnection,
    RtcSdpType, RtcSessionDescriptionInit,
};

/// Name the proxy gives the channel that carries cells.
const CHANNEL_NAME: &str = "tor-transport";

/// Pause sending above this many buffered bytes.
const BUFFERED_HIGH_WATER: u32 = 256 * 1024;

struct Shared {
    channel: Option<RtcDataChannel>,
    inbound: VecDeque<Vec<u8>>,
    closed: bool,
    error: Option<String>,
    recv_waker: Option<Waker>,
    open_waker: Option<Waker>,
    drain_waker: Option<Waker>,
}

impl Shared {
    fn new() -> Self {
        Self {
            channel: None,
            inbound: VecDeque::new(),
            closed: false,
            error: None,
            recv_waker: None,
            open_waker: None,
            drain_waker: None,
        }
    }
}

/// The carrier over an open data channel.
pub struct RtcCarrier {
    pc: RtcPeerConnection,
    shared: Rc<RefCell<Shared>>,
    _closures: Vec<Closure<dyn FnMut(JsValue)>>,
}

impl RtcCarrier {
    /// Full client-side signaling dance via the broker at `broker_url`.
    pub async fn connect(broker_url: &str) -> Result<Self> {
        // The broker speaks JSON over a plain WebSocket.
        let mut signaling = WsCarrier::connect(broker_url, "tor-signal").await?;

        send_json(&mut signaling, &PartyMessage::Request {}).await?;
        let matched = recv_json(&mut signaling).await?;
        let (proxy_id, sdp_offer) = match matched {
            BrokerMessage::Matched {
                proxy_id,
                sdp_offer,
                ..
            } => (proxy_id, sdp_offer),
            BrokerMessage::NoProxies {} => {
                return Err(TorError::Transport("no volunteer proxies available".into()));
            }
            other => {
                return Err(TorError::Protocol(format!(
                    "unexpected broker reply: {other:?}"
                )));
            }
        };

        let pc = RtcPeerConnection::new()
            .map_err(|e| TorError::Transport(format!("RTCPeerConnection: {e:?}")))?;
        let shared = Rc::new(RefCell::new(Shared::new()));
        let mut closures: Vec<Closure<dyn FnMut(JsValue)>> = Vec::new();

        // The proxy created the channel; we receive it on open.
        let s = shared.clone();
        let on_datachannel = Closure::wrap(Box::new(move |ev: JsValue| {
            let ev: RtcDataChannelEvent = ev.unchecked_into();
            let channel = ev.channel();
            if channel.label() != CHANNEL_NAME {
                log::warn!("ignoring unexpected data channel {:?}", channel.label());
                return;
            }
            channel.set_binary_type(web_sys::RtcDataChannelType::Arraybuffer);
            wire_channel(&channel, &s);
            let mut shared = s.borrow_mut();
            shared.channel = Some(channel);
            if let Some(w) = shared.open_waker.take() {
                w.wake();
            }
        }) as Box<dyn FnMut(JsValue)>);
        pc.set_ondatachannel(Some(on_datachannel.as_ref().unchecked_ref()));
        closures.push(on_datachannel);

        // Apply the proxy's offer, answer it.
        let offer = RtcSessionDescriptionInit::new(RtcSdpType::Offer);
        offer.set_sdp(&sdp_offer);
        JsFuture::from(pc.set_remote_description(&offer))
            .await
            .map_err(|e| TorError::Transport(format!("setRemoteDescription: {e:?}")))?;

        let answer = JsFuture::from(pc.create_answer())
            .await
            .map_err(|e| TorError::Transport(format!("createAnswer: {e:?}")))?;
        let answer: RtcSessionDescriptionInit = answer.unchecked_into();
        JsFuture::from(pc.set_local_description(&answer))
            .await
            .map_err(|e| TorError::Transport(format!("setLocalDescription: {e:?}")))?;
        let sdp_answer = pc
            .local_description()
            .map(|d| d.sdp())
            .ok_or_else(|| TorError::Transport("no local description".into()))?;

        send_json(
            &mut signaling,
            &PartyMessage::Answer {
                proxy_id,
                sdp_answer,
                ice_candidates: Vec::new(),
            },
        )
        .await?;
        match recv_json(&mut signaling).await? {
            BrokerMessage::AnswerSent {} => {}
            other => {
                return Err(TorError::Protocol(format!(
                    "unexpected broker reply: {other:?}"
                )));
            }
        }
        // The broker has forgotten us; signaling is done.
        let _ = signaling.close().await;

        let carrier = Self {
            pc,
            shared,
            _closures: closures,
        };
        ChannelOpen {
            shared: carrier.shared.clone(),
        }
        .await?;
        Ok(carrier)
    }
}

/// Attach message/close handlers to the (ordered) data channel.
fn wire_channel(channel: &RtcDataChannel, shared: &Rc<RefCell<Shared>>) {
    if !channel.ordered() {
        // The engine's ordering contract would be void; refuse the channel.
        shared.borrow_mut().error = Some("unordered data channel".into());
        shared.borrow_mut().closed = true;
        return;
    }
    channel.set_buffered_amount_low_threshold(BUFFERED_HIGH_WATER / 2);

    let s = shared.clone();
    let on_message = Closure::wrap(Box::new(move |ev: MessageEvent| {
        if let Ok(buf) = ev.data().dyn_into::<js_sys::ArrayBuffer>() {
            let array = js_sys::Uint8Array::new(&buf);
            let mut shared = s.borrow_mut();
            shared.inbound.push_back(array.to_vec());
            if let Some(w) = shared.recv_waker.take() {
                w.wake();
            }
        }
    }) as Box<dyn FnMut(MessageEvent)>);
    channel.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
    on_message.forget();

    let s = shared.clone();
    let on_close = Closure::wrap(Box::new(move || {
        let mut shared = s.borrow_mut();
        shared.closed = true;
        for waker in [
            shared.recv_waker.take(),
            shared.open_waker.take(),
            shared.drain_waker.take(),
        ]
        .into_iter()
        .flatten()
        {
            waker.wake();
        }
    }) as Box<dyn FnMut()>);
    channel.set_onclose(Some(on_close.as_ref().unchecked_ref()));
    on_close.forget();

    let s = shared.clone();
    let on_low = Closure::wrap(Box::new(move || {
        if let Some(w) = s.borrow_mut().drain_waker.take() {
            w.wake();
        }
    }) as Box<dyn FnMut()>);
    channel.set_onbufferedamountlow(Some(on_low.as_ref().unchecked_ref()));
    on_low.forget();
}

struct ChannelOpen {
    shared: Rc<RefCell<Shared>>,
}

impl Future for ChannelOpen {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Poll::Ready(Err(TorError::Transport(
                shared
                    .error
                    .clone()
                    .unwrap_or_else(|| "data channel closed".into()),
            )));
        }
        let open = shared
            .channel
            .as_ref()
            .map(|c| c.ready_state() == RtcDataChannelState::Open)
            .unwrap_or(false);
        if open {
            Poll::Ready(Ok(()))
        } else {
            shared.open_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct NextChunk {
    shared: Rc<RefCell<Shared>>,
}

impl Future for NextChunk {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        if let Some(chunk) = shared.inbound.pop_front() {
            return Poll::Ready(Ok(chunk));
        }
        if shared.closed {
            return Poll::Ready(Err(TorError::Transport("data channel closed".into())));
        }
        shared.recv_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Resolves when buffered-amount falls below the threshold.
struct Drained {
    shared: Rc<RefCell<Shared>>,
}

impl Future for Drained {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut shared = self.shared.borrow_mut();
        let above = shared
            .channel
            .as_ref()
            .map(|c| c.buffered_amount() > BUFFERED_HIGH_WATER)
            .unwrap_or(false);
        if above && !shared.closed {
            shared.drain_waker = Some(cx.waker().clone());
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

#[async_trait(?Send)]
impl Carrier for RtcCarrier {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        Drained {
            shared: self.shared.clone(),
        }
        .await;

        let shared = self.shared.borrow();
        if shared.closed {
            return Err(TorError::Transport("data channel closed".into()));
        }
        let channel = shared
            .channel
            .as_ref()
            .ok_or_else(|| TorError::Transport("data channel not open".into()))?;
        channel
            .send_with_u8_array(bytes)
            .map_err(|e| TorError::Transport(format!("data channel send: {e:?}")))
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        NextChunk {
            shared: self.shared.clone(),
        }
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.shared.borrow().channel.as_ref() {
            channel.close();
        }
        self.pc.close();
        self.shared.borrow_mut().closed = true;
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.shared.borrow_mut().inbound.pop_front())
    }
}

impl Drop for RtcCarrier {
    fn drop(&mut self) {
        self.pc.close();
    }
}

async fn send_json(ws: &mut WsCarrier, message: &PartyMessage) -> Result<()> {
    let text = serde_json::to_string(message)
        .map_err(|e| TorError::Protocol(format!("encode signaling: {e}")))?;
    ws.send(text.as_bytes()).await
}

async fn recv_json(ws: &mut WsCarrier) -> Result<BrokerMessage> {
    let bytes = ws.recv().await?;
    serde_json::from_slice(&bytes).map_err(|e| TorError::Protocol(format!("broker reply: {e}")))
}

/// Connector for the WebRTC carrier. `endpoint.url` is the broker URL in
/// this mode; the volunteer proxy carries bytes onward to the bridge.
pub struct RtcConnector;

#[async_trait(?Send)]
impl CarrierConnector for RtcConnector {
    fn kind(&self) -> CarrierKind {
        CarrierKind::WebRtc
    }

    async fn connect(&self, endpoint: &BridgeEndpoint) -> Result<Box<dyn Carrier>> {
        let carrier = RtcCarrier::connect(&endpoint.url).await?;
        Ok(Box::new(carrier))
    }
}
