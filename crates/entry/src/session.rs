//! Transport session management
//!
//! A [`SessionManager`] owns the multiplexed session to one exit. It is
//! either in dial mode, where a [`Connector`] can produce new connections
//! whenever the session dies, or in reverse mode, where the exit connected
//! to us once and a dead session cannot be replaced.
//!
//! Rebuilds are single-flight: they run behind an async lock and bump a
//! generation counter. A forced rebuild names the generation it found
//! broken and is skipped when another caller has already replaced it, so a
//! burst of failure reports against one session causes exactly one redial.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tollway_core::{Amount, ServiceMetadata};
use tollway_mux::{MuxConfig, Session, Stream, StreamTag};

use crate::{Connector, DatagramLink, EntryError, Result, ServerLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal
    Closed,
}

/// Who to pay for downstream traffic, and how much per MiB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTerms {
    pub receiver: String,
    pub price: Amount,
}

enum Mode {
    Dial {
        connector: Arc<dyn Connector>,
        max_price: Option<Amount>,
    },
    /// The link is consumed by the first connect
    Reverse { link: Mutex<Option<ServerLink>> },
}

#[derive(Default)]
struct Current {
    generation: u64,
    session: Option<Session>,
    metadata: Option<Arc<ServiceMetadata>>,
    price: Amount,
}

pub struct SessionManager {
    service_name: String,
    mode: Mode,
    mux_config: MuxConfig,

    rebuild: tokio::sync::Mutex<()>,
    current: RwLock<Current>,
    state: watch::Sender<SessionState>,
    datagrams: watch::Sender<Option<Arc<dyn DatagramLink>>>,

    /// Listener and socket tasks aborted on close
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    /// Manager that dials through `connector`, rejecting exits that charge
    /// more than `max_price`
    pub fn dial(
        service_name: impl Into<String>,
        connector: Arc<dyn Connector>,
        max_price: Option<Amount>,
    ) -> Arc<Self> {
        Self::with_mode(
            service_name.into(),
            Mode::Dial {
                connector,
                max_price,
            },
        )
    }

    /// Manager over a single link accepted from an exit
    pub fn reverse(service_name: impl Into<String>, link: ServerLink) -> Arc<Self> {
        Self::with_mode(
            service_name.into(),
            Mode::Reverse {
                link: Mutex::new(Some(link)),
            },
        )
    }

    fn with_mode(service_name: String, mode: Mode) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (datagrams, _) = watch::channel(None);
        Arc::new(Self {
            service_name,
            mode,
            mux_config: MuxConfig::default(),
            rebuild: tokio::sync::Mutex::new(()),
            current: RwLock::new(Current::default()),
            state,
            datagrams,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self.mode, Mode::Reverse { .. })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Incremented every time a new session is installed
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Metadata advertised by the exit of the current session
    pub fn metadata(&self) -> Option<Arc<ServiceMetadata>> {
        self.current.read().metadata.clone()
    }

    pub fn payment_terms(&self) -> Option<PaymentTerms> {
        let current = self.current.read();
        current.metadata.as_ref().map(|m| PaymentTerms {
            receiver: m.beneficiary_addr.clone(),
            price: current.price,
        })
    }

    pub fn datagram_link(&self) -> Option<Arc<dyn DatagramLink>> {
        self.datagrams.borrow().clone()
    }

    /// Follow datagram link changes across rebuilds
    pub fn subscribe_datagrams(&self) -> watch::Receiver<Option<Arc<dyn DatagramLink>>> {
        self.datagrams.subscribe()
    }

    /// Return the live session, establishing one if there is none.
    ///
    /// With `force`, the current session is replaced even if it looks
    /// alive; in reverse mode that is impossible and tears the manager down
    /// instead.
    pub async fn connect(&self, force: bool) -> Result<Session> {
        let seen = self.generation();
        self.session_for(force, seen).await.map(|(session, _)| session)
    }

    /// Replace session generation `seen`. A no-op when some other caller
    /// has already replaced it.
    pub async fn rebuild(&self, seen: u64) -> Result<Session> {
        self.session_for(true, seen).await.map(|(session, _)| session)
    }

    /// Open a stream on the current session, retrying once on a rebuilt
    /// session if the first attempt fails.
    pub async fn open_stream(&self, tag: Option<StreamTag>, force: bool) -> Result<Stream> {
        let seen = self.generation();
        let (session, generation) = self.session_for(force, seen).await?;
        match session.open_stream(tag).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!(
                    "Couldn't open stream on {} session {}: {}",
                    self.service_name, generation, e
                );
                let (session, _) = self.session_for(true, generation).await?;
                Ok(session.open_stream(tag).await?)
            }
        }
    }

    async fn session_for(&self, force: bool, seen: u64) -> Result<(Session, u64)> {
        self.ensure_open()?;
        if let Some(live) = self.live_session(force, seen) {
            return Ok(live);
        }

        let _rebuild = self.rebuild.lock().await;
        self.ensure_open()?;
        // Someone else may have rebuilt while we waited
        if let Some(live) = self.live_session(force, seen) {
            return Ok(live);
        }

        let link = match &self.mode {
            Mode::Reverse { link } => {
                let taken = link.lock().take();
                match taken {
                    Some(link) => link,
                    None => {
                        warn!("Reverse connection to {} is dead", self.service_name);
                        self.close();
                        return Err(EntryError::ReverseSessionDead);
                    }
                }
            }
            Mode::Dial { connector, .. } => {
                self.set_state(SessionState::Connecting);
                match connector.connect().await {
                    Ok(link) => link,
                    Err(e) => {
                        self.settle_state();
                        return Err(e);
                    }
                }
            }
        };

        self.install(link).map_err(|e| {
            self.settle_state();
            e
        })
    }

    /// The current session unless it is closed, or is generation `seen`
    /// and `force` asks for a replacement
    fn live_session(&self, force: bool, seen: u64) -> Option<(Session, u64)> {
        let current = self.current.read();
        let session = current.session.as_ref()?;
        let stale = force && current.generation == seen;
        if session.is_closed() || stale {
            return None;
        }
        Some((session.clone(), current.generation))
    }

    fn install(&self, link: ServerLink) -> Result<(Session, u64)> {
        let ServerLink {
            conn,
            metadata,
            datagrams,
        } = link;

        let price = metadata.price()?;
        if let Mode::Dial {
            max_price: Some(max_price),
            ..
        } = &self.mode
        {
            if price > *max_price {
                return Err(EntryError::PriceTooHigh {
                    price,
                    max_price: *max_price,
                });
            }
        }

        let session = Session::client(conn, self.mux_config.clone());
        let generation = {
            let mut current = self.current.write();
            if let Some(old) = current.session.replace(session.clone()) {
                old.close();
            }
            current.generation += 1;
            current.metadata = Some(Arc::new(metadata));
            current.price = price;
            current.generation
        };
        self.datagrams.send_replace(datagrams);

        // Lost a race with close()
        if self.is_closed() {
            session.close();
            return Err(EntryError::Closed);
        }

        self.set_state(SessionState::Connected);
        info!(
            "Connected to {} exit (session {}, price {})",
            self.service_name, generation, price
        );
        Ok((session, generation))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EntryError::Closed)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// After a failed rebuild: still connected if the old session lives on
    fn settle_state(&self) {
        let live = self
            .current
            .read()
            .session
            .as_ref()
            .map_or(false, |s| !s.is_closed());
        self.set_state(if live {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        });
    }

    /// Tie a listener or socket task to this manager's lifetime
    pub fn register_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        if self.is_closed() {
            task.abort();
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Tear down: abort every owned task (closing the listeners and sockets
    /// they own), close the session and move to `Closed`. Idempotent.
    pub fn close(&self) {
        if self.state.send_replace(SessionState::Closed) == SessionState::Closed {
            return;
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }

        let session = self.current.write().session.take();
        if let Some(session) = session {
            session.close();
        }
        self.datagrams.send_replace(None);
        info!("Closed {} entry ({} tasks stopped)", self.service_name, tasks.len());
    }

    /// Resolve once the manager is closed. Every waiter is woken.
    pub async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Probe the fresh session with one untagged stream, then drain
    /// inbound streams until the session dies. A dead session that has not
    /// been replaced tears the manager down.
    pub async fn run_liveness(self: Arc<Self>) {
        let mut session = match self.connect(false).await {
            Ok(session) => session,
            Err(e) => {
                debug!("Liveness check for {} skipped: {}", self.service_name, e);
                return;
            }
        };
        match session.open_stream(None).await {
            Ok(stream) => {
                let _ = stream.close().await;
            }
            Err(e) => {
                debug!("Liveness probe for {} failed: {}", self.service_name, e);
                return;
            }
        }

        loop {
            match session.accept_stream().await {
                Ok(stream) => drop(stream),
                Err(e) => {
                    let replacement = self
                        .current
                        .read()
                        .session
                        .clone()
                        .filter(|s| !s.is_closed());
                    match replacement {
                        Some(next) => session = next,
                        None => {
                            info!("Close connection to {}: {}", self.service_name, e);
                            self.close();
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(session) = self.current.get_mut().session.take() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Connector backed by a local listener whose accepted connections are
    /// wrapped in server sessions and kept alive
    struct LoopbackConnector {
        addr: std::net::SocketAddr,
        metadata: ServiceMetadata,
        dials: AtomicUsize,
    }

    impl LoopbackConnector {
        async fn start(metadata: ServiceMetadata) -> Arc<Self> {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                loop {
                    let (conn, _) = listener.accept().await.unwrap();
                    tokio::spawn(async move {
                        let session = Session::server(conn, MuxConfig::default());
                        while let Ok(mut stream) = session.accept_stream().await {
                            tokio::spawn(async move {
                                let mut buf = Vec::new();
                                let _ = stream.read_to_end(&mut buf).await;
                                let _ = stream.write_all(&buf).await;
                                let _ = stream.shutdown().await;
                            });
                        }
                    });
                }
            });
            Arc::new(Self {
                addr,
                metadata,
                dials: AtomicUsize::new(0),
            })
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self) -> Result<ServerLink> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            // Widen the race window for concurrent rebuilds
            tokio::time::sleep(Duration::from_millis(20)).await;
            let conn = TcpStream::connect(self.addr).await?;
            Ok(ServerLink {
                conn,
                metadata: self.metadata.clone(),
                datagrams: None,
            })
        }
    }

    /// Dials straight through once, then holds every later dial until the
    /// gate opens
    struct GatedConnector {
        inner: Arc<LoopbackConnector>,
        gate: tokio::sync::Semaphore,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self) -> Result<ServerLink> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
            }
            self.inner.connect().await
        }
    }

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self) -> Result<ServerLink> {
            Err(EntryError::NotConnected)
        }
    }

    fn metadata(price: &str) -> ServiceMetadata {
        ServiceMetadata {
            service_id: 1,
            service_tcp: vec![80],
            price: price.to_string(),
            beneficiary_addr: "receiver".to_string(),
            ..Default::default()
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    async fn wait_aborted(handle: &tokio::task::AbortHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connect_reuses_live_session() {
        let connector = LoopbackConnector::start(metadata("0.1")).await;
        let manager = SessionManager::dial("web", connector.clone(), None);
        assert_eq!(manager.state(), SessionState::Disconnected);

        manager.connect(false).await.unwrap();
        manager.connect(false).await.unwrap();
        assert_eq!(connector.dials(), 1);
        assert_eq!(manager.generation(), 1);
        assert_eq!(manager.state(), SessionState::Connected);

        let terms = manager.payment_terms().unwrap();
        assert_eq!(terms.receiver, "receiver");
        assert_eq!(terms.price, "0.1".parse().unwrap());
    }

    #[tokio::test]
    async fn test_forced_connect_redials() {
        let connector = LoopbackConnector::start(metadata("0")).await;
        let manager = SessionManager::dial("web", connector.clone(), None);

        let first = manager.connect(false).await.unwrap();
        manager.connect(true).await.unwrap();
        assert_eq!(connector.dials(), 2);
        assert_eq!(manager.generation(), 2);
        // Replaced session is closed
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_rebuilds_dial_once() {
        let connector = LoopbackConnector::start(metadata("0")).await;
        let manager = SessionManager::dial("web", connector.clone(), None);
        manager.connect(false).await.unwrap();
        let seen = manager.generation();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.rebuild(seen).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(connector.dials(), 2);
        assert_eq!(manager.generation(), seen + 1);
    }

    #[tokio::test]
    async fn test_streams_open_while_rebuild_dials() {
        let connector = Arc::new(GatedConnector {
            inner: LoopbackConnector::start(metadata("0")).await,
            gate: tokio::sync::Semaphore::new(0),
            attempts: AtomicUsize::new(0),
        });
        let manager = SessionManager::dial("web", connector.clone(), None);
        manager.connect(false).await.unwrap();
        let seen = manager.generation();

        // A rebuild stuck in its dial holds the rebuild lock
        let rebuilding = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.rebuild(seen).await })
        };
        while connector.attempts.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        let mut stream = tokio::time::timeout(
            Duration::from_secs(2),
            manager.open_stream(Some(StreamTag::new(1, 0)), false),
        )
        .await
        .unwrap()
        .unwrap();
        stream.write_all(b"still flowing").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"still flowing");
        assert_eq!(manager.generation(), seen);

        connector.gate.add_permits(1);
        rebuilding.await.unwrap().unwrap();
        assert_eq!(manager.generation(), seen + 1);
    }

    #[tokio::test]
    async fn test_price_above_max_rejected() {
        let connector = LoopbackConnector::start(metadata("0.5")).await;
        let manager = SessionManager::dial("web", connector, Some("0.1".parse().unwrap()));

        let err = manager.connect(false).await.unwrap_err();
        assert!(matches!(err, EntryError::PriceTooHigh { .. }));
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(manager.metadata().is_none());
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_disconnected() {
        let manager = SessionManager::dial("web", Arc::new(FailingConnector), None);
        assert!(manager.connect(false).await.is_err());
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_open_stream_round_trip() {
        let connector = LoopbackConnector::start(metadata("0")).await;
        let manager = SessionManager::dial("web", connector, None);

        let mut stream = manager
            .open_stream(Some(StreamTag::new(1, 0)), false)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");
    }

    #[tokio::test]
    async fn test_open_stream_rebuilds_dead_session_once() {
        let connector = LoopbackConnector::start(metadata("0")).await;
        let manager = SessionManager::dial("web", connector.clone(), None);

        let session = manager.connect(false).await.unwrap();
        session.close();

        manager.open_stream(None, false).await.unwrap();
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_reverse_forced_rebuild_tears_down() {
        let (conn, _exit_side) = tcp_pair().await;
        let link = ServerLink {
            conn,
            metadata: metadata("0"),
            datagrams: None,
        };
        let manager = SessionManager::reverse("reverse", link);

        manager.connect(false).await.unwrap();
        assert_eq!(manager.state(), SessionState::Connected);

        let err = manager.connect(true).await.unwrap_err();
        assert!(matches!(err, EntryError::ReverseSessionDead));
        assert_eq!(manager.state(), SessionState::Closed);
        assert!(matches!(
            manager.connect(false).await,
            Err(EntryError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_all_waiters() {
        let connector = LoopbackConnector::start(metadata("0")).await;
        let manager = SessionManager::dial("web", connector, None);
        let session = manager.connect(false).await.unwrap();

        let task = tokio::spawn(std::future::pending::<()>());
        let abort_probe = task.abort_handle();
        manager.register_task(task);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.wait_closed().await })
            })
            .collect();

        manager.close();
        manager.close();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(session.is_closed());
        assert!(manager.datagram_link().is_none());

        wait_aborted(&abort_probe).await;

        // Tasks registered after close are aborted immediately
        let late = tokio::spawn(std::future::pending::<()>());
        let late_probe = late.abort_handle();
        manager.register_task(late);
        wait_aborted(&late_probe).await;
    }

    #[tokio::test]
    async fn test_liveness_tears_down_when_session_dies() {
        let connector = LoopbackConnector::start(metadata("0")).await;
        let manager = SessionManager::dial("web", connector, None);
        let session = manager.connect(false).await.unwrap();

        let liveness = tokio::spawn(manager.clone().run_liveness());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), SessionState::Connected);

        session.close();
        tokio::time::timeout(Duration::from_secs(5), manager.wait_closed())
            .await
            .unwrap();
        liveness.await.unwrap();
    }
}
