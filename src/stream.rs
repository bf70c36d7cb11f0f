//! Live subscription lifecycle: one transport per logical channel, torn down
//! before its replacement is created, never reconnected on its own.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::types::Channel;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a stream task reports back. Each event names the handle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened { handle: HandleId, channel: Channel },
    Message { handle: HandleId, channel: Channel, payload: String },
    /// Connect error, read error or close by the peer.
    Failed { handle: HandleId, channel: Channel, reason: String },
    /// Closed on request.
    Closed { handle: HandleId, channel: Channel },
}

impl StreamEvent {
    pub fn handle(&self) -> HandleId {
        match self {
            StreamEvent::Opened { handle, .. }
            | StreamEvent::Message { handle, .. }
            | StreamEvent::Failed { handle, .. }
            | StreamEvent::Closed { handle, .. } => *handle,
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Next text payload; `None` once the peer has closed.
    async fn next_text(&mut self) -> Option<ClientResult<String>>;
    /// Request close and wait for it to complete.
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport for `channel`, sending `hello` as the first frame when given.
    async fn open(&self, channel: Channel, hello: Option<String>) -> ClientResult<Box<dyn Transport>>;
}

// ---------- WebSocket transport ----------

pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, channel: Channel) -> String {
        format!("{}{}", self.base_url, channel.path())
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsTransport {
    channel: Channel,
    stream: WsStream,
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, channel: Channel, hello: Option<String>) -> ClientResult<Box<dyn Transport>> {
        let url = self.url(channel);
        let (mut stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::transport(channel, format!("connect {}: {}", url, e)))?;
        if let Some(h) = hello {
            stream
                .send(Message::Text(h.into()))
                .await
                .map_err(|e| ClientError::transport(channel, format!("subscribe frame: {}", e)))?;
        }
        Ok(Box::new(WsTransport { channel, stream }))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn next_text(&mut self) -> Option<ClientResult<String>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(ClientError::transport(self.channel, e))),
            };
            match msg {
                Message::Text(t) => return Some(Ok(t.to_string())),
                Message::Binary(b) => {
                    return Some(
                        String::from_utf8(b.to_vec())
                            .map_err(|e| ClientError::transport(self.channel, e)),
                    )
                }
                Message::Ping(p) => {
                    if let Err(e) = self.stream.send(Message::Pong(p)).await {
                        return Some(Err(ClientError::transport(self.channel, e)));
                    }
                }
                Message::Close(_) => return None,
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("{} close: {}", self.channel, e);
        }
    }
}

// ---------- Manager ----------

struct ChannelHandle {
    id: HandleId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct StreamManager<C: Connector> {
    connector: Arc<C>,
    tx: mpsc::UnboundedSender<StreamEvent>,
    active: HashMap<Channel, ChannelHandle>,
    next_id: u64,
    teardown_timeout: Duration,
}

impl<C: Connector> StreamManager<C> {
    pub fn new(
        connector: C,
        tx: mpsc::UnboundedSender<StreamEvent>,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            tx,
            active: HashMap::new(),
            next_id: 1,
            teardown_timeout,
        }
    }

    /// Replace whatever runs on `channel` with a fresh transport. The previous
    /// transport is fully released before the new one is spawned.
    pub async fn subscribe(&mut self, channel: Channel, hello: Option<String>) -> HandleId {
        self.teardown(channel).await;

        let id = HandleId(self.next_id);
        self.next_id += 1;
        let token = CancellationToken::new();
        let task = tokio::spawn(run_channel(
            Arc::clone(&self.connector),
            channel,
            hello,
            id,
            token.clone(),
            self.tx.clone(),
        ));
        info!("{} stream {} subscribing", channel, id);
        self.active.insert(channel, ChannelHandle { id, token, task });
        id
    }

    /// Tear down `handle` if it is still the active one for its channel.
    pub async fn unsubscribe(&mut self, handle: HandleId) -> bool {
        let channel = self
            .active
            .iter()
            .find(|(_, h)| h.id == handle)
            .map(|(c, _)| *c);
        match channel {
            Some(c) => self.teardown(c).await,
            None => false,
        }
    }

    pub fn current(&self, channel: Channel) -> Option<HandleId> {
        self.active.get(&channel).map(|h| h.id)
    }

    /// Events from any other handle are stale and must be dropped.
    pub fn is_current(&self, handle: HandleId) -> bool {
        self.active.values().any(|h| h.id == handle)
    }

    pub async fn shutdown(&mut self) {
        for c in Channel::ALL {
            self.teardown(c).await;
        }
    }

    async fn teardown(&mut self, channel: Channel) -> bool {
        let Some(h) = self.active.remove(&channel) else {
            return false;
        };
        h.token.cancel();
        let mut task = h.task;
        if timeout(self.teardown_timeout, &mut task).await.is_err() {
            warn!("{} stream {} did not close in time; aborting", channel, h.id);
            task.abort();
            // Wait for the aborted task to drop its transport.
            let _ = task.await;
        }
        debug!("{} stream {} released", channel, h.id);
        true
    }
}

async fn run_channel<C: Connector>(
    connector: Arc<C>,
    channel: Channel,
    hello: Option<String>,
    id: HandleId,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<StreamEvent>,
) {
    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        r = connector.open(channel, hello) => r,
    };
    let mut transport = match opened {
        Ok(t) => t,
        Err(e) => {
            let _ = tx.send(StreamEvent::Failed {
                handle: id,
                channel,
                reason: e.to_string(),
            });
            return;
        }
    };
    let _ = tx.send(StreamEvent::Opened { handle: id, channel });

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                transport.close().await;
                let _ = tx.send(StreamEvent::Closed { handle: id, channel });
                return;
            }
            next = transport.next_text() => match next {
                Some(Ok(payload)) => {
                    if tx.send(StreamEvent::Message { handle: id, channel, payload }).is_err() {
                        transport.close().await;
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(StreamEvent::Failed { handle: id, channel, reason: e.to_string() });
                    return;
                }
                None => {
                    let _ = tx.send(StreamEvent::Failed {
                        handle: id,
                        channel,
                        reason: "closed by peer".to_string(),
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transports for tests. Counts live transports per channel.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Shared {
        pub live: Mutex<HashMap<Channel, usize>>,
        pub opened: Mutex<Vec<(Channel, Option<String>)>>,
        pub feeds: Mutex<Vec<(Channel, mpsc::UnboundedSender<ClientResult<String>>)>>,
        pub refuse: Mutex<bool>,
        /// Transports opened from now on never finish closing.
        pub stuck_close: Mutex<bool>,
    }

    impl Shared {
        pub fn live(&self, c: Channel) -> usize {
            self.live.lock().unwrap().get(&c).copied().unwrap_or(0)
        }

        pub fn total_live(&self) -> usize {
            self.live.lock().unwrap().values().sum()
        }

        pub fn opens(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        /// Feed the most recently opened transport of `c`.
        pub fn feed(&self, c: Channel, item: ClientResult<String>) {
            let feeds = self.feeds.lock().unwrap();
            if let Some((_, tx)) = feeds.iter().rev().find(|(ch, _)| *ch == c) {
                let _ = tx.send(item);
            }
        }
    }

    #[derive(Clone, Default)]
    pub struct MockConnector {
        pub shared: Arc<Shared>,
    }

    struct MockTransport {
        channel: Channel,
        rx: mpsc::UnboundedReceiver<ClientResult<String>>,
        shared: Arc<Shared>,
        stuck_close: bool,
    }

    impl Drop for MockTransport {
        fn drop(&mut self) {
            if let Some(n) = self.shared.live.lock().unwrap().get_mut(&self.channel) {
                *n -= 1;
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(
            &self,
            channel: Channel,
            hello: Option<String>,
        ) -> ClientResult<Box<dyn Transport>> {
            if *self.shared.refuse.lock().unwrap() {
                return Err(ClientError::transport(channel, "connection refused"));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.shared.opened.lock().unwrap().push((channel, hello));
            self.shared.feeds.lock().unwrap().push((channel, tx));
            *self.shared.live.lock().unwrap().entry(channel).or_insert(0) += 1;
            Ok(Box::new(MockTransport {
                channel,
                rx,
                shared: Arc::clone(&self.shared),
                stuck_close: *self.shared.stuck_close.lock().unwrap(),
            }))
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn next_text(&mut self) -> Option<ClientResult<String>> {
            self.rx.recv().await
        }

        async fn close(&mut self) {
            if self.stuck_close {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;
    use crate::types::Leg;

    const PUT: Channel = Channel::Option(Leg::Put);
    const CALL: Channel = Channel::Option(Leg::Call);

    fn manager() -> (
        StreamManager<MockConnector>,
        MockConnector,
        mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = MockConnector::default();
        let m = StreamManager::new(conn.clone(), tx, Duration::from_millis(500));
        (m, conn, rx)
    }

    async fn next_opened(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> HandleId {
        loop {
            match rx.recv().await.unwrap() {
                StreamEvent::Opened { handle, .. } => return handle,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn resubscribing_keeps_one_live_transport_per_channel() {
        let (mut m, conn, mut rx) = manager();
        m.subscribe(Channel::Board, None).await;
        next_opened(&mut rx).await;

        for i in 0..5 {
            m.subscribe(PUT, Some(format!("TSLA{}P.US", i))).await;
            next_opened(&mut rx).await;
            m.subscribe(CALL, Some(format!("TSLA{}C.US", i))).await;
            next_opened(&mut rx).await;
            for c in Channel::ALL {
                assert!(conn.shared.live(c) <= 1, "{} has {} live", c, conn.shared.live(c));
            }
        }
        assert_eq!(conn.shared.total_live(), 3);
        assert_eq!(conn.shared.opens(), 11);

        m.shutdown().await;
        assert_eq!(conn.shared.total_live(), 0);
    }

    #[tokio::test]
    async fn hung_close_is_aborted_after_the_teardown_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = MockConnector::default();
        let limit = Duration::from_millis(100);
        let mut m = StreamManager::new(conn.clone(), tx, limit);

        *conn.shared.stuck_close.lock().unwrap() = true;
        let first = m.subscribe(PUT, Some("A".into())).await;
        next_opened(&mut rx).await;
        *conn.shared.stuck_close.lock().unwrap() = false;

        let started = std::time::Instant::now();
        let second = m.subscribe(PUT, Some("B".into())).await;
        let took = started.elapsed();
        assert!(took >= limit, "returned before the timeout: {:?}", took);
        assert!(took < Duration::from_secs(2), "teardown hung: {:?}", took);
        assert!(conn.shared.live(PUT) <= 1);
        assert!(!m.is_current(first));

        next_opened(&mut rx).await;
        assert_eq!(conn.shared.live(PUT), 1);
        assert_eq!(m.current(PUT), Some(second));

        m.shutdown().await;
        assert_eq!(conn.shared.live(PUT), 0);
    }

    #[tokio::test]
    async fn option_channel_sends_symbol_on_open() {
        let (mut m, conn, mut rx) = manager();
        m.subscribe(PUT, Some("AAPL250321P150000.US".into())).await;
        next_opened(&mut rx).await;
        assert_eq!(
            conn.shared.opened.lock().unwrap()[0],
            (PUT, Some("AAPL250321P150000.US".to_string()))
        );
    }

    #[tokio::test]
    async fn replaced_handle_is_stale_and_delivery_order_is_kept() {
        let (mut m, conn, mut rx) = manager();
        let first = m.subscribe(PUT, Some("A".into())).await;
        next_opened(&mut rx).await;
        let second = m.subscribe(PUT, Some("B".into())).await;
        assert!(!m.is_current(first));
        assert!(m.is_current(second));
        assert_eq!(m.current(PUT), Some(second));

        // Drain what the first handle reported on teardown.
        let opened = next_opened(&mut rx).await;
        assert_eq!(opened, second);

        for n in 1..=3 {
            conn.shared.feed(PUT, Ok(n.to_string()));
        }
        let mut got = Vec::new();
        while got.len() < 3 {
            if let StreamEvent::Message { handle, payload, .. } = rx.recv().await.unwrap() {
                assert_eq!(handle, second);
                got.push(payload);
            }
        }
        assert_eq!(got, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn transport_error_is_reported_and_not_retried() {
        let (mut m, conn, mut rx) = manager();
        let h = m.subscribe(Channel::Board, None).await;
        next_opened(&mut rx).await;
        conn.shared
            .feed(Channel::Board, Err(ClientError::transport(Channel::Board, "reset")));

        match rx.recv().await.unwrap() {
            StreamEvent::Failed { handle, channel, reason } => {
                assert_eq!(handle, h);
                assert_eq!(channel, Channel::Board);
                assert!(reason.contains("reset"));
            }
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.shared.opens(), 1);
        assert_eq!(conn.shared.live(Channel::Board), 0);
        assert!(m.is_current(h), "a failed handle stays current until replaced");
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (mut m, conn, mut rx) = manager();
        *conn.shared.refuse.lock().unwrap() = true;
        m.subscribe(CALL, Some("X".into())).await;
        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_by_handle_only_hits_current() {
        let (mut m, conn, mut rx) = manager();
        let old = m.subscribe(CALL, Some("X".into())).await;
        next_opened(&mut rx).await;
        let new = m.subscribe(CALL, Some("Y".into())).await;
        next_opened(&mut rx).await;
        assert!(!m.unsubscribe(old).await);
        assert_eq!(conn.shared.live(CALL), 1);
        assert!(m.unsubscribe(new).await);
        assert_eq!(conn.shared.live(CALL), 0);
        assert_eq!(m.current(CALL), None);
    }

    #[test]
    fn ws_urls() {
        let c = WsConnector::new("ws://localhost:8080/");
        assert_eq!(c.url(Channel::Board), "ws://localhost:8080/quote");
        assert_eq!(c.url(PUT), "ws://localhost:8080/quote-option");
    }
}
