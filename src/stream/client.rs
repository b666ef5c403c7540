//! Session client: handshake, websocket lifecycle, receive loop, and sends.
//!
//! `SessionClient` is a cloneable handle. Handlers receive a clone so they
//! can reply on the same stream while the receive loop keeps reading.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::api::{
    ApiClient, ApiClientOptions, ApiDefaults, HandshakeError, HandshakeResult, TeamInfo,
    API_BASE_URL,
};
use crate::stream::proto::Event;
use crate::stream::router::EventRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const CONNECT_TIMEOUT: Duration = ApiDefaults::CONNECT_TIMEOUT;
    pub const REQUEST_TIMEOUT: Duration = ApiDefaults::REQUEST_TIMEOUT;
}

/// Options for [`SessionClient::with_options`].
#[derive(Clone, Debug)]
pub struct SessionClientOptions {
    /// Base URL of the handshake API; `/rtm.start` is appended.
    pub api_base_url: String,
    /// TCP connect timeout for the handshake request.
    pub connect_timeout: Duration,
    /// Overall timeout for the handshake request.
    pub request_timeout: Duration,
    /// Maximum number of handler tasks in flight.
    ///
    /// `None` spawns one task per matched event with no cap. When set, the
    /// receive loop waits for a free slot before spawning the next handler.
    pub handler_concurrency: Option<usize>,
}

impl Default for SessionClientOptions {
    fn default() -> Self {
        Self {
            api_base_url: API_BASE_URL.to_string(),
            connect_timeout: SessionDefaults::CONNECT_TIMEOUT,
            request_timeout: SessionDefaults::REQUEST_TIMEOUT,
            handler_concurrency: None,
        }
    }
}

impl SessionClientOptions {
    pub fn with_api_base_url(mut self, api_base_url: impl Into<String>) -> Self {
        self.api_base_url = api_base_url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handler_concurrency(mut self, limit: usize) -> Self {
        self.handler_concurrency = Some(limit.max(1));
        self
    }
}

/// Session details retained after a successful handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Identifier of the local participant.
    pub self_id: String,
    pub self_name: String,
    pub team: Option<TeamInfo>,
    /// Stream endpoint the session connected to.
    pub url: String,
}

impl From<HandshakeResult> for SessionInfo {
    fn from(result: HandshakeResult) -> Self {
        Self {
            self_id: result.self_info.id,
            self_name: result.self_info.name,
            team: result.team,
            url: result.url,
        }
    }
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The stream endpoint could not be opened.
    #[error("stream connection failed: {0}")]
    Connection(#[source] WsError),

    /// A write on the established stream failed.
    #[error("stream write failed: {0}")]
    Transport(#[source] WsError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,
}

/// Why [`SessionClient::dispatch`] stopped reading.
#[derive(Debug, Error)]
pub enum ReceiveTerminated {
    #[error("session closed locally")]
    Closed,

    #[error("remote closed the stream (code {code:?}, reason {reason:?})")]
    RemoteClosed { code: Option<u16>, reason: String },

    #[error("stream ended")]
    EndOfStream,

    #[error("stream read failed: {0}")]
    Read(WsError),

    #[error("malformed event frame: {0}")]
    Malformed(serde_json::Error),

    /// No connection, or another receive loop already owns the read half.
    #[error("session is not connected")]
    NotConnected,
}

struct Reader {
    source: WsSource,
    stop: oneshot::Receiver<()>,
}

struct SessionInner {
    api: ApiClient,
    token: SecretString,
    router: Arc<EventRouter>,
    handler_permits: Option<Arc<Semaphore>>,
    counter: AtomicU64,
    connected: AtomicBool,
    session: RwLock<Option<SessionInfo>>,
    writer: Mutex<Option<WsSink>>,
    reader: StdMutex<Option<Reader>>,
    stop: StdMutex<Option<oneshot::Sender<()>>>,
}

/// Handle to one logical session with the realtime service.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

impl SessionClient {
    pub fn new(token: SecretString, router: Arc<EventRouter>) -> Result<Self, SessionError> {
        Self::with_options(token, router, SessionClientOptions::default())
    }

    pub fn with_options(
        token: SecretString,
        router: Arc<EventRouter>,
        options: SessionClientOptions,
    ) -> Result<Self, SessionError> {
        let api = ApiClient::with_options(ApiClientOptions {
            base_url: options.api_base_url,
            connect_timeout: options.connect_timeout,
            request_timeout: options.request_timeout,
        })?;
        let handler_permits = options
            .handler_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        Ok(Self {
            inner: Arc::new(SessionInner {
                api,
                token,
                router,
                handler_permits,
                counter: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                session: RwLock::new(None),
                writer: Mutex::new(None),
                reader: StdMutex::new(None),
                stop: StdMutex::new(None),
            }),
        })
    }

    /// Performs the handshake and opens the stream it points to.
    ///
    /// Session info and the connection are stored only when both steps
    /// succeed, so a failed call leaves the client ready for another
    /// attempt. A client whose receive loop has ended must be closed before
    /// it can connect again.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut writer = self.inner.writer.lock().await;
        if writer.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let handshake = self.inner.api.rtm_start(&self.inner.token).await?;
        let (socket, _) = connect_async(handshake.url.as_str())
            .await
            .map_err(SessionError::Connection)?;
        let (sink, source) = socket.split();
        let (stop_tx, stop_rx) = oneshot::channel();

        let info = SessionInfo::from(handshake);
        info!(
            event = "session_connected",
            self_id = %info.self_id,
            team_id = info.team.as_ref().map(|team| team.id.as_str()).unwrap_or(""),
        );

        *lock(&self.inner.reader) = Some(Reader {
            source,
            stop: stop_rx,
        });
        *lock(&self.inner.stop) = Some(stop_tx);
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(info);
        *writer = Some(sink);
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Runs the receive loop until the stream ends or the session is closed.
    ///
    /// Each decoded event is routed by type tag. A matched handler is
    /// spawned and the loop moves on to the next frame without waiting for
    /// it; unmatched events are logged and dropped. The write half stays
    /// open after the loop returns; call [`SessionClient::close`] to release
    /// the connection.
    pub async fn dispatch(&self) -> ReceiveTerminated {
        let reader = lock(&self.inner.reader).take();
        let Some(Reader {
            mut source,
            mut stop,
        }) = reader
        else {
            let terminated = ReceiveTerminated::NotConnected;
            info!(event = "receive_loop_terminated", reason = %terminated);
            return terminated;
        };

        let terminated = loop {
            let frame = tokio::select! {
                biased;
                _ = &mut stop => None,
                frame = source.next() => Some(frame),
            };
            let Some(frame) = frame else {
                break ReceiveTerminated::Closed;
            };

            let decoded = match frame {
                Some(Ok(Message::Text(text))) => Event::from_text(&text),
                Some(Ok(Message::Binary(bytes))) => Event::from_slice(&bytes),
                // tungstenite answers pings itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    break ReceiveTerminated::RemoteClosed {
                        code: frame.as_ref().map(|frame| u16::from(frame.code)),
                        reason: frame
                            .map(|frame| frame.reason.into_owned())
                            .unwrap_or_default(),
                    };
                }
                Some(Err(err)) => break ReceiveTerminated::Read(err),
                None => break ReceiveTerminated::EndOfStream,
            };

            match decoded {
                Ok(event) => self.route(event).await,
                Err(err) => break ReceiveTerminated::Malformed(err),
            }
        };

        info!(event = "receive_loop_terminated", reason = %terminated);
        terminated
    }

    async fn route(&self, event: Event) {
        let Some(handler) = self.inner.router.lookup(&event.event_type) else {
            info!(
                event = "unhandled_event",
                event_type = %event.event_type,
                channel = %event.channel,
                reply_to = event.reply_to,
            );
            return;
        };

        let permit = match &self.inner.handler_permits {
            Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
            None => None,
        };

        debug!(event = "handler_spawned", event_type = %event.event_type);
        let client = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handler.serve_event(Arc::new(event), client).await;
        });
    }

    /// Sends a normal-closure close frame and leaves the socket open for
    /// the peer to close.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(SessionError::NotConnected)?;
        sink.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
        .map_err(SessionError::Transport)?;
        debug!(event = "session_shutdown_sent");
        Ok(())
    }

    /// Tears down the connection without notifying the peer.
    ///
    /// Stops a running receive loop. Safe to call repeatedly, after
    /// [`SessionClient::shutdown`], or when never connected.
    pub async fn close(&self) {
        // The writer lock orders close against an in-flight connect.
        let mut writer_slot = self.inner.writer.lock().await;
        let stop = lock(&self.inner.stop).take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let reader = lock(&self.inner.reader).take();
        let writer = writer_slot.take();
        self.inner.connected.store(false, Ordering::SeqCst);
        drop(writer_slot);

        if reader.is_some() || writer.is_some() {
            info!(event = "session_closed");
        }
    }

    /// Assigns the next outbound id to `event` and writes it to the stream.
    ///
    /// Returns the assigned id. Ids are taken under the write lock, so wire
    /// order matches id order. An id is consumed even when the send fails.
    pub async fn send(&self, mut event: Event) -> Result<u64, SessionError> {
        let mut writer = self.inner.writer.lock().await;
        let id = self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
        event.id = id;

        let sink = writer.as_mut().ok_or(SessionError::NotConnected)?;
        let text = event.to_text()?;
        sink.send(Message::Text(text))
            .await
            .map_err(SessionError::Transport)?;
        Ok(id)
    }

    /// Sends a chat message to `channel`.
    pub async fn send_message(
        &self,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<u64, SessionError> {
        self.send(Event::message(channel, text)).await
    }

    /// Last outbound id handed out, `0` before the first send.
    pub fn last_id(&self) -> u64 {
        self.inner.counter.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Local participant id assigned by the last successful handshake.
    pub fn session_id(&self) -> Option<String> {
        self.session().map(|info| info.self_id)
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient")
            .field("api_base_url", &self.inner.api.base_url())
            .field("connected", &self.is_connected())
            .field("session", &self.session())
            .field("last_id", &self.last_id())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
