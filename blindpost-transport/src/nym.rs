//! Nym native-client transport.
//!
//! Talks to a locally running Nym client over its websocket JSON API. The Nym
//! client owns all mixnet cryptography: packet construction, routing and
//! single-use reply blocks. We only see addresses and sender tags.
//!
//! # Frame Handling Invariants
//!
//! - One websocket text frame = one JSON request or response
//! - Payloads travel base64 encoded in the `message` field
//! - Unknown response types are skipped, never guessed at

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blindpost_core::{Address, Destination, ReplyHandle};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::adapter::{Inbound, Transport};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default local Nym client endpoint.
pub const DEFAULT_NYM_CLIENT_URL: &str = "ws://127.0.0.1:1977";

/// How long to wait for the client to report its own address.
const SELF_ADDRESS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum NymRequest<'a> {
    SelfAddress,
    Send {
        message: String,
        recipient: &'a str,
    },
    SendAnonymous {
        message: String,
        recipient: &'a str,
        #[serde(rename = "replySurbs")]
        reply_surbs: u32,
    },
    Reply {
        message: String,
        #[serde(rename = "senderTag")]
        sender_tag: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum NymResponse {
    SelfAddress {
        address: String,
    },
    Received {
        message: String,
        #[serde(rename = "senderTag", default)]
        sender_tag: Option<String>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Transport over a Nym native client websocket.
///
/// Does not implement `Clone` to prevent socket duplication.
pub struct NymClientTransport {
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    address: Address,
}

impl std::fmt::Debug for NymClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NymClientTransport")
            .field("address", &self.address)
            .finish()
    }
}

impl NymClientTransport {
    /// Connect to the Nym client at `url` and learn our own address.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (mut ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        send_json(&mut ws, &NymRequest::SelfAddress).await?;
        let address = tokio::time::timeout(SELF_ADDRESS_TIMEOUT, async {
            loop {
                if let NymResponse::SelfAddress { address } = next_response(&mut ws).await? {
                    return Ok::<_, TransportError>(address);
                }
            }
        })
        .await??;
        let address = Address::new(address)?;
        info!(%address, "connected to nym client");

        let (sink, stream) = ws.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            address,
        })
    }
}

#[async_trait]
impl Transport for NymClientTransport {
    async fn send(
        &self,
        payload: Vec<u8>,
        destination: Destination,
        reply_budget: u32,
    ) -> Result<(), TransportError> {
        let message = BASE64.encode(&payload);
        let request = match &destination {
            Destination::Address(to) if reply_budget > 0 => NymRequest::SendAnonymous {
                message,
                recipient: to.as_str(),
                reply_surbs: reply_budget,
            },
            Destination::Address(to) => NymRequest::Send {
                message,
                recipient: to.as_str(),
            },
            Destination::Reply(tag) => NymRequest::Reply {
                message,
                sender_tag: tag.as_str(),
            },
        };
        let mut sink = self.sink.lock().await;
        send_json(&mut *sink, &request).await
    }

    async fn receive(&self) -> Result<Inbound, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match next_response(&mut *stream).await? {
                NymResponse::Received {
                    message,
                    sender_tag,
                } => match BASE64.decode(message.as_bytes()) {
                    Ok(payload) => {
                        return Ok(Inbound {
                            payload,
                            reply: sender_tag.map(ReplyHandle::new),
                        })
                    }
                    Err(_) => debug!("dropping non-base64 payload"),
                },
                NymResponse::Error { message } => warn!(error = %message, "nym client error"),
                NymResponse::SelfAddress { .. } | NymResponse::Other => {}
            }
        }
    }

    fn address(&self) -> &Address {
        &self.address
    }
}

async fn send_json<S>(sink: &mut S, request: &NymRequest<'_>) -> Result<(), TransportError>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(request).map_err(|e| TransportError::WebSocket(e.to_string()))?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))
}

/// Next parseable JSON response. Non-text frames are skipped.
async fn next_response<S>(stream: &mut S) -> Result<NymResponse, TransportError>
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => match serde_json::from_str(&text) {
                Ok(response) => return Ok(response),
                Err(e) => debug!(error = %e, "skipping unparseable frame"),
            },
            Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => continue, // Ignore Ping, Pong, Binary
            Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
        }
    }
}
