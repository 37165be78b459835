use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::protocol::{self, HandshakeResponse, HubMessage, RecordBuffer};
use super::{HubError, HubEvent, HubTransport, InboundMessage, RECEIVE_MESSAGE, SEND_MESSAGE_TO_USER};
use crate::chat::timestamp;
use crate::credentials::Credential;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Completion = Result<Option<Value>, HubError>;

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub hub_url: Url,
    pub skip_negotiation: bool,
    pub keep_alive: Duration,
    pub server_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Wait before each reconnect attempt; retrying stops when the list runs out.
    pub reconnect_delays: Vec<Duration>,
}

impl HubOptions {
    pub fn new(hub_url: Url) -> Self {
        Self {
            hub_url,
            skip_negotiation: false,
            keep_alive: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            reconnect_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
        }
    }
}

/// SignalR client for the chat hub.
pub struct HubConnection {
    options: HubOptions,
    http: reqwest::Client,
    shared: Arc<Shared>,
    cancel: Option<CancellationToken>,
    driver: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Completion>>>,
    next_invocation: AtomicU64,
}

impl Shared {
    async fn attach(&self, sender: mpsc::UnboundedSender<String>) {
        *self.outgoing.lock().await = Some(sender);
    }

    /// Drop the writer and fail every call still waiting on a completion.
    async fn detach(&self, reason: &str) {
        self.outgoing.lock().await.take();
        for (_, waiter) in self.pending.lock().await.drain() {
            let _ = waiter.send(Err(HubError::ConnectionLost(reason.to_string())));
        }
    }

    async fn complete(&self, invocation_id: &str, outcome: Completion) {
        match self.pending.lock().await.remove(invocation_id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!("completion for unknown invocation {}", invocation_id),
        }
    }
}

/// Who we connect as; kept by the driver so it can reconnect on its own.
#[derive(Clone)]
struct Target {
    user_id: String,
    token: String,
}

/// A socket past the handshake, plus anything the server sent right behind it.
struct Socket {
    ws: WsStream,
    buffer: RecordBuffer,
    backlog: Vec<String>,
}

enum SocketEnd {
    Stopped,
    Closed { error: Option<String>, allow_reconnect: bool },
    Lost(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

impl HubConnection {
    pub fn new(options: HubOptions, http: reqwest::Client) -> Self {
        Self {
            options,
            http,
            shared: Arc::new(Shared::default()),
            cancel: None,
            driver: None,
        }
    }

    /// Call a hub method and wait for its completion, at most `server_timeout`.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Option<Value>, HubError> {
        let sender = self
            .shared
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or(HubError::NotConnected)?;

        let invocation_id = (self.shared.next_invocation.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(invocation_id.clone(), tx);

        if sender
            .send(protocol::invocation(&invocation_id, target, arguments))
            .is_err()
        {
            self.shared.pending.lock().await.remove(&invocation_id);
            return Err(HubError::NotConnected);
        }

        match timeout(self.options.server_timeout, rx).await {
            Ok(completion) => completion
                .map_err(|_| HubError::ConnectionLost("dropped before completion".to_string()))?,
            Err(_) => {
                self.shared.pending.lock().await.remove(&invocation_id);
                warn!("no completion for {} invocation {}", target, invocation_id);
                Err(HubError::Timeout("invocation"))
            }
        }
    }
}

#[async_trait]
impl HubTransport for HubConnection {
    async fn connect(
        &mut self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<mpsc::UnboundedReceiver<HubEvent>, HubError> {
        if self.driver.is_some() {
            self.disconnect().await;
        }

        let target = Target {
            user_id: user_id.to_string(),
            token: credential.token().to_string(),
        };
        info!("connecting to hub {} as {}", self.options.hub_url, user_id);
        let socket = open_socket(&self.options, &self.http, &target).await?;
        info!("hub connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.shared.attach(outgoing_tx).await;

        let cancel = CancellationToken::new();
        self.driver = Some(tokio::spawn(drive(
            socket,
            outgoing_rx,
            self.shared.clone(),
            self.options.clone(),
            self.http.clone(),
            target,
            events_tx,
            cancel.clone(),
        )));
        self.cancel = Some(cancel);

        Ok(events_rx)
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        sender_id: &str,
        content: &str,
        time_sent: &DateTime<Utc>,
    ) -> Result<(), HubError> {
        let arguments = vec![
            Value::from(recipient_id),
            Value::from(sender_id),
            Value::from(content),
            Value::from(timestamp::format(time_sent)),
        ];
        self.invoke(SEND_MESSAGE_TO_USER, arguments).await.map(|_| ())
    }

    async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(driver) = self.driver.take() {
            let abort = driver.abort_handle();
            if timeout(Duration::from_secs(5), driver).await.is_err() {
                warn!("hub driver did not stop in time, aborting");
                abort.abort();
            }
            info!("hub disconnected");
        }
        self.shared.detach("connection stopped").await;
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    mut socket: Socket,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
    options: HubOptions,
    http: reqwest::Client,
    target: Target,
    events: mpsc::UnboundedSender<HubEvent>,
    cancel: CancellationToken,
) {
    loop {
        let end = run_socket(socket, outgoing, &shared, &options, &events, &cancel).await;
        shared.detach("connection dropped").await;

        let reason = match end {
            SocketEnd::Stopped => {
                let _ = events.send(HubEvent::Closed(None));
                return;
            }
            SocketEnd::Closed {
                error,
                allow_reconnect: false,
            } => {
                info!("hub closed the connection: {:?}", error);
                let _ = events.send(HubEvent::Closed(Some(
                    error.unwrap_or_else(|| "server closed the connection".to_string()),
                )));
                return;
            }
            SocketEnd::Closed { error, .. } => {
                error.unwrap_or_else(|| "server closed the connection".to_string())
            }
            SocketEnd::Lost(reason) => reason,
        };

        warn!("hub connection lost: {}", reason);
        let _ = events.send(HubEvent::Reconnecting(reason));

        match reconnect(&shared, &options, &http, &target, &cancel).await {
            Some((next_socket, next_outgoing)) => {
                info!("hub reconnected");
                socket = next_socket;
                outgoing = next_outgoing;
                let _ = events.send(HubEvent::Reconnected);
            }
            None if cancel.is_cancelled() => {
                let _ = events.send(HubEvent::Closed(None));
                return;
            }
            None => {
                let _ = events.send(HubEvent::Closed(Some("gave up reconnecting".to_string())));
                return;
            }
        }
    }
}

async fn reconnect(
    shared: &Shared,
    options: &HubOptions,
    http: &reqwest::Client,
    target: &Target,
    cancel: &CancellationToken,
) -> Option<(Socket, mpsc::UnboundedReceiver<String>)> {
    for (attempt, delay) in options.reconnect_delays.iter().enumerate() {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(*delay) => {}
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            opened = open_socket(options, http, target) => opened,
        };

        match opened {
            Ok(socket) => {
                let (tx, rx) = mpsc::unbounded_channel();
                shared.attach(tx).await;
                return Some((socket, rx));
            }
            Err(e) => warn!("reconnect attempt {} failed: {}", attempt + 1, e),
        }
    }
    None
}

async fn run_socket(
    socket: Socket,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: &Shared,
    options: &HubOptions,
    events: &mpsc::UnboundedSender<HubEvent>,
    cancel: &CancellationToken,
) -> SocketEnd {
    let Socket {
        ws,
        mut buffer,
        backlog,
    } = socket;
    let (mut sink, mut stream) = ws.split();

    for record in backlog {
        if let Some(end) = dispatch(&record, shared, events).await {
            return end;
        }
    }

    let mut keep_alive = tokio::time::interval(options.keep_alive);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keep_alive.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Text(protocol::close())).await;
                let _ = sink.close().await;
                return SocketEnd::Stopped;
            }
            Some(text) = outgoing.recv() => {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    return SocketEnd::Lost(e.to_string());
                }
                keep_alive.reset();
            }
            _ = keep_alive.tick() => {
                if let Err(e) = sink.send(WsMessage::Text(protocol::ping())).await {
                    return SocketEnd::Lost(e.to_string());
                }
            }
            _ = sleep_until(last_seen + options.server_timeout) => {
                return SocketEnd::Lost("server timeout elapsed".to_string());
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    last_seen = Instant::now();
                    for record in buffer.push(&text) {
                        if let Some(end) = dispatch(&record, shared, events).await {
                            return end;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "socket closed".to_string());
                    return SocketEnd::Lost(reason);
                }
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => return SocketEnd::Lost(e.to_string()),
                None => return SocketEnd::Lost("socket closed".to_string()),
            },
        }
    }
}

async fn dispatch(
    record: &str,
    shared: &Shared,
    events: &mpsc::UnboundedSender<HubEvent>,
) -> Option<SocketEnd> {
    let message = match HubMessage::decode(record) {
        Ok(message) => message,
        Err(e) => {
            warn!("{}", e);
            return None;
        }
    };

    match message {
        HubMessage::Invocation {
            target, arguments, ..
        } => {
            if target.eq_ignore_ascii_case(RECEIVE_MESSAGE) {
                match parse_receive_message(&arguments) {
                    Ok(inbound) => {
                        let _ = events.send(HubEvent::Message(inbound));
                    }
                    Err(e) => warn!("{}", e),
                }
            } else {
                debug!("no handler for hub method {}", target);
            }
            None
        }
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => {
            let outcome = match error {
                Some(error) => Err(HubError::Invocation(error)),
                None => Ok(result),
            };
            shared.complete(&invocation_id, outcome).await;
            None
        }
        HubMessage::Ping => None,
        HubMessage::Close {
            error,
            allow_reconnect,
        } => Some(SocketEnd::Closed {
            error,
            allow_reconnect,
        }),
        HubMessage::Other(kind) => {
            debug!("ignoring hub message type {}", kind);
            None
        }
    }
}

/// `ReceiveMessage(senderId, message, timeSent)`
fn parse_receive_message(arguments: &[Value]) -> Result<InboundMessage, HubError> {
    let text = |index: usize| {
        arguments
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::Protocol(format!("{} argument {} is not a string", RECEIVE_MESSAGE, index)))
    };

    let sender_id = text(0)?.to_string();
    let content = text(1)?.to_string();
    let time_sent = match arguments.get(2).and_then(Value::as_str) {
        Some(raw) => timestamp::parse(raw).unwrap_or_else(|| {
            warn!("unparseable timeSent {:?}, using local clock", raw);
            Utc::now()
        }),
        None => Utc::now(),
    };

    Ok(InboundMessage {
        sender_id,
        content,
        time_sent,
    })
}

async fn open_socket(options: &HubOptions, http: &reqwest::Client, target: &Target) -> Result<Socket, HubError> {
    let mut hub_url = options.hub_url.clone();
    let mut token = target.token.clone();
    let mut connection_token = None;

    if !options.skip_negotiation {
        let mut negotiated = negotiate(http, &hub_url, &target.user_id, &token).await?;
        if let Some(redirect) = negotiated.url.take() {
            debug!("hub negotiation redirected to {}", redirect);
            hub_url = Url::parse(&redirect)?;
            if let Some(access_token) = negotiated.access_token.take() {
                token = access_token;
            }
            negotiated = negotiate(http, &hub_url, &target.user_id, &token).await?;
        }

        if !negotiated.available_transports.is_empty()
            && !negotiated
                .available_transports
                .iter()
                .any(|t| t.transport.eq_ignore_ascii_case("WebSockets"))
        {
            return Err(HubError::Negotiate("server does not offer WebSockets".to_string()));
        }
        connection_token = negotiated.connection_token.or(negotiated.connection_id);
    }

    let ws_url = websocket_url(&hub_url, &target.user_id, &token, connection_token.as_deref())?;
    let mut request = ws_url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| HubError::Protocol("token is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;
    let (buffer, backlog) = timeout(options.handshake_timeout, handshake(&mut ws))
        .await
        .map_err(|_| HubError::Timeout("handshake"))??;

    Ok(Socket { ws, buffer, backlog })
}

async fn negotiate(
    http: &reqwest::Client,
    hub_url: &Url,
    user_id: &str,
    token: &str,
) -> Result<NegotiateResponse, HubError> {
    let mut url = hub_url.clone();
    url.path_segments_mut()
        .map_err(|_| HubError::Negotiate(format!("cannot negotiate against {}", hub_url)))?
        .pop_if_empty()
        .push("negotiate");
    url.query_pairs_mut()
        .append_pair("negotiateVersion", "1")
        .append_pair("userId", user_id);

    let response = http.post(url).bearer_auth(token).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(HubError::Negotiate(format!("server answered {}", status)));
    }

    let negotiated: NegotiateResponse = response.json().await?;
    if let Some(error) = negotiated.error {
        return Err(HubError::Negotiate(error));
    }
    Ok(negotiated)
}

fn websocket_url(
    hub_url: &Url,
    user_id: &str,
    token: &str,
    connection_token: Option<&str>,
) -> Result<Url, HubError> {
    let mut url = hub_url.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(HubError::Protocol(format!("unsupported hub scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| HubError::Protocol(format!("cannot use {} for {}", scheme, hub_url)))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("userId", user_id);
        if let Some(id) = connection_token {
            query.append_pair("id", id);
        }
        query.append_pair("access_token", token);
    }
    Ok(url)
}

async fn handshake(ws: &mut WsStream) -> Result<(RecordBuffer, Vec<String>), HubError> {
    ws.send(WsMessage::Text(protocol::handshake_request())).await?;

    let mut buffer = RecordBuffer::default();
    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) => {
                let mut records = buffer.push(&text).into_iter();
                if let Some(first) = records.next() {
                    let response: HandshakeResponse = serde_json::from_str(&first)
                        .map_err(|e| HubError::Handshake(format!("bad handshake response: {}", e)))?;
                    if let Some(error) = response.error {
                        return Err(HubError::Handshake(error));
                    }
                    return Ok((buffer, records.collect()));
                }
            }
            WsMessage::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(HubError::Handshake(format!("socket closed during handshake {}", reason)));
            }
            _ => {}
        }
    }

    Err(HubError::ConnectionLost("socket ended during handshake".to_string()))
}
