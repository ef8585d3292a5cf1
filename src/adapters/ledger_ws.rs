//! WebSocket ledger query bridge.
//!
//! One connection per topic. After the subscribe frame the bridge answers
//! with the current value, then pushes every change as
//! `{"kind": ..., "value": ...}`. A `{"error": ...}` frame before the first
//! value is a setup failure.
//!
//! Submissions go over their own connection: the bridge holds the signing
//! keys, answers a `submit` frame with status frames
//! (`{"status": "pending"}`, `{"status": "failed", "reason": ...}`) and
//! closes after the terminal one.

use async_trait::async_trait;
use futures::stream::{self, SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::traits::{LedgerSource, LedgerSubmitter, RawLedgerStream};
use crate::config::LedgerConfig;
use crate::domain::{
    CallParam, CounterName, LedgerTopic, LoanId, OperationCall, RawLedgerValue, SubmissionStatus,
    TrustLevel,
};
use crate::error::{Result, SyncError};

/// Keep idle bridge connections alive
const PING_INTERVAL_SECS: u64 = 20;

/// Frames buffered between the socket task and the subscriber
const FORWARD_CAPACITY: usize = 64;

/// Characters of an unrecognized frame kept in the debug log
const FRAME_PREVIEW_CHARS: usize = 200;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    action: &'static str,
    topic: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<&'a [LoanId]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    counter: Option<CounterName>,
}

impl<'a> SubscribeMessage<'a> {
    fn for_topic(topic: &'a LedgerTopic) -> Self {
        let (name, ids, counter) = match topic {
            LedgerTopic::IdentifierList => ("identifier_list", None, None),
            LedgerTopic::NumericState(ids) => ("numeric_state", Some(ids.as_slice()), None),
            LedgerTopic::OracleRate => ("oracle_rate", None, None),
            LedgerTopic::Counter(name) => ("counter", None, Some(*name)),
        };
        Self {
            action: "subscribe",
            topic: name,
            ids,
            counter,
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitMessage<'a> {
    action: &'static str,
    module: &'a str,
    call: &'a str,
    params: &'a [CallParam],
    trust: TrustLevel,
}

impl<'a> SubmitMessage<'a> {
    fn for_call(call: &'a OperationCall) -> Self {
        Self {
            action: "submit",
            module: &call.module,
            call: &call.call,
            params: &call.params,
            trust: call.trust,
        }
    }
}

#[derive(Debug, PartialEq)]
enum BridgeFrame {
    Value(RawLedgerValue),
    Error(String),
}

/// Leading part of `text`, cut on a character boundary
fn frame_preview(text: &str) -> &str {
    match text.char_indices().nth(FRAME_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn parse_frame(text: &str) -> Option<BridgeFrame> {
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    if let Some(message) = json.get("error") {
        let message = message
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| message.to_string());
        return Some(BridgeFrame::Error(message));
    }
    serde_json::from_value(json).ok().map(BridgeFrame::Value)
}

pub struct LedgerWsSource {
    url: Url,
    connect_timeout: Duration,
}

impl LedgerWsSource {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let url = Url::parse(&config.ws_url)
            .map_err(|e| SyncError::InvalidConfig(format!("ledger.ws_url: {}", e)))?;
        Ok(Self {
            url,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        })
    }

    async fn handshake(&self, topic: &LedgerTopic) -> Result<(WsWrite, WsRead, RawLedgerValue)> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let payload = serde_json::to_string(&SubscribeMessage::for_topic(topic))?;
        write.send(Message::Text(payload)).await?;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Some(BridgeFrame::Value(value)) => return Ok((write, read, value)),
                    Some(BridgeFrame::Error(reason)) => return Err(SyncError::Internal(reason)),
                    None => debug!("ignoring unrecognized bridge frame during setup"),
                },
                Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SyncError::Internal(
                        "connection closed before the first value".into(),
                    ))
                }
                Some(Err(e)) => return Err(SyncError::WebSocket(e)),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl LedgerSource for LedgerWsSource {
    async fn open(&self, topic: &LedgerTopic) -> Result<RawLedgerStream> {
        let (write, read, first) = timeout(self.connect_timeout, self.handshake(topic))
            .await
            .map_err(|_| SyncError::subscription_setup(topic, "ledger bridge connection timeout"))?
            .map_err(|e| SyncError::subscription_setup(topic, e))?;

        info!(%topic, url = %self.url, "subscribed to ledger bridge");

        let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
        tokio::spawn(pump(topic.to_string(), write, read, tx));

        let rest = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) });
        Ok(stream::once(async move { first }).chain(rest).boxed())
    }
}

#[async_trait]
impl LedgerSubmitter for LedgerWsSource {
    async fn send(
        &self,
        call: &OperationCall,
        status_tx: mpsc::Sender<SubmissionStatus>,
    ) -> Result<()> {
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SyncError::SubmissionFailed("ledger bridge connection timeout".into()))??;
        let (mut write, mut read) = ws_stream.split();

        let payload = serde_json::to_string(&SubmitMessage::for_call(call))?;
        write.send(Message::Text(payload)).await?;
        debug!(%call, "submitted call to ledger bridge");

        while let Some(msg) = read.next().await {
            match msg? {
                Message::Text(text) => {
                    if let Some(BridgeFrame::Error(reason)) = parse_frame(&text) {
                        return Err(SyncError::SubmissionFailed(reason));
                    }
                    let Ok(status) = serde_json::from_str::<SubmissionStatus>(&text) else {
                        debug!("ignoring unrecognized submission frame");
                        continue;
                    };
                    let terminal = status.is_terminal();
                    if status_tx.send(status).await.is_err() || terminal {
                        break;
                    }
                }
                Message::Ping(data) => write.send(Message::Pong(data)).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }

        let _ = write.send(Message::Close(None)).await;
        Ok(())
    }
}

/// Forward frames until the socket closes or the subscriber goes away
async fn pump(topic: String, mut write: WsWrite, mut read: WsRead, tx: mpsc::Sender<RawLedgerValue>) {
    let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(%topic, "subscriber dropped, closing bridge connection");
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Some(BridgeFrame::Value(value)) => {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        Some(BridgeFrame::Error(reason)) => {
                            warn!(%topic, %reason, "ledger bridge reported an error");
                        }
                        None => debug!(
                            %topic,
                            "unrecognized bridge frame: {}",
                            frame_preview(&text)
                        ),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!(%topic, "failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(%topic, "ledger bridge sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%topic, "ledger bridge read error: {}", e);
                        break;
                    }
                    None => {
                        info!(%topic, "ledger bridge stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    error!(%topic, "failed to ping ledger bridge: {}", e);
                    break;
                }
            }
        }
    }
}
