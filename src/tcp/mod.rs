
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::endpoint::{endpoint_key, route_candidates, Endpoint};
use crate::error::{Error, Result};
use crate::subscriber::{deliver, Subscriber, SubscriberTable};

const KEEPALIVE_IDLE_SECS: u64 = 300;
const KEEPALIVE_PROBES: u32 = 3;

/// One established connection, dialed or accepted. Dialed links carry the
/// destination key they are pooled under; accepted links live only in the
/// by-peer index.
struct Link {
    peer: SocketAddr,
    local: SocketAddr,
    writer: AsyncMutex<OwnedWriteHalf>,
    dial_key: Option<String>,
}

/// Stream variant of the engine: listening sockets with one accept task
/// each, a registry of established connections, and one read task per
/// connection. Dispatch runs inline on the read task, so a connection's
/// bytes reach its subscriber in arrival order.
pub struct TcpEngine {
    config: Config,
    subscribers: Arc<SubscriberTable>,
    listeners: Mutex<HashMap<String, Arc<TcpListener>>>,
    /// Caller-initiated connections by destination key.
    dialed: Mutex<HashMap<String, Arc<Link>>>,
    /// Every established connection by peer address.
    active: Mutex<HashMap<SocketAddr, Arc<Link>>>,
    current_connections: AtomicUsize,
    source: Mutex<Endpoint>,
    /// Carries asynchronous sends; inbound delivery never goes through it.
    dispatcher: Option<Arc<Dispatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed_watch_tx: Mutex<Option<watch::Sender<()>>>,
    closed_watch_rx: watch::Receiver<()>,
}

impl TcpEngine {
    pub fn new(config: Config, dispatcher: Option<Arc<Dispatcher>>) -> Arc<Self> {
        let (closed_watch_tx, closed_watch_rx) = watch::channel(());
        let source = Endpoint::new(config.source_ip.clone(), config.source_port);

        Arc::new(TcpEngine {
            config,
            subscribers: Arc::new(SubscriberTable::new()),
            listeners: Mutex::default(),
            dialed: Mutex::default(),
            active: Mutex::default(),
            current_connections: AtomicUsize::new(0),
            source: Mutex::new(source),
            dispatcher,
            tasks: Mutex::default(),
            closed_watch_tx: Mutex::new(Some(closed_watch_tx)),
            closed_watch_rx,
        })
    }

    /// Binds every configured listener and dials every configured peer.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let listen_list = self.config.listen_list.clone();
        for entry in &listen_list {
            self.add_listen(&entry.ip, entry.port).await?;
        }

        let connect_list = self.config.connect_list.clone();
        for entry in &connect_list {
            self.dial(&entry.ip, entry.port).await.map_err(|err| {
                log::error!("Failed to dial {}:{}: {err}", entry.ip, entry.port);
                err
            })?;
        }

        log::info!(
            "TCP engine initialized ({} listeners, {} dialed peers)",
            self.listeners.lock().len(),
            self.dialed.lock().len()
        );
        Ok(())
    }

    /// Binds a listening socket for `ip:port` and starts its accept task.
    /// Re-adding an existing key is a benign no-op.
    pub async fn add_listen(self: &Arc<Self>, ip: &str, port: u16) -> Result<()> {
        let endpoint = Endpoint::new(ip, port);
        let key = endpoint.key();

        if self.listeners.lock().contains_key(&key) {
            log::warn!("The endpoint {key} is already being listened on");
            return Ok(());
        }

        let listener = Arc::new(
            bind_tcp_listener(endpoint.bind_addr()?, self.config.listen_backlog).map_err(
                |err| {
                    log::error!("Failed to bind listen socket for {key}: {err}");
                    Error::ErrBindFailed(key.clone())
                },
            )?,
        );

        {
            let mut listeners = self.listeners.lock();
            if listeners.contains_key(&key) {
                log::warn!("The endpoint {key} is already being listened on");
                return Ok(());
            }
            listeners.insert(key.clone(), Arc::clone(&listener));
        }

        log::info!("Listening on {key}");
        self.spawn_accept_loop(listener, key);
        Ok(())
    }

    /// Sends `data` to `ip:port` over the pooled connection, dialing first
    /// when none exists. The payload is written in chunks no larger than
    /// the configured send packet size; a short write aborts the send and
    /// closes the connection.
    pub async fn send(self: &Arc<Self>, ip: &str, port: u16, data: &[u8]) -> Result<()> {
        let key = endpoint_key(ip, port);

        let existing = self.dialed.lock().get(&key).cloned();
        let link = match existing {
            Some(link) => link,
            None => self.dial(ip, port).await?,
        };

        if let Err(err) = self.write_fragmented(&link, data).await {
            log::error!("Failed to send to {key}: {err}");
            self.close_link(&link);
            return Err(err);
        }
        log::trace!("Sent {} bytes to {key}", data.len());
        Ok(())
    }

    /// Establishes a connection to `ip:port` and installs it in both the
    /// by-key pool and the by-peer index. Refused once the connection cap
    /// is reached.
    async fn dial(self: &Arc<Self>, ip: &str, port: u16) -> Result<Arc<Link>> {
        let endpoint = Endpoint::new(ip, port);
        let dest = endpoint.remote_addr()?;
        let key = endpoint.key();

        if !self.try_reserve_slot() {
            log::warn!(
                "Refusing dial to {key}: connection limit of {} reached",
                self.config.max_connections
            );
            return Err(Error::ErrMaxConnections(self.config.max_connections));
        }

        match self.connect(dest, &key).await {
            Ok(stream) => {
                let link = self.install(stream, Some(key.clone()));
                log::info!("Connected to {key}");
                Ok(link)
            }
            Err(err) => {
                self.current_connections.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    pub fn add_subscribe(&self, ip: &str, port: u16, sub: Arc<dyn Subscriber>) {
        self.subscribers.register(endpoint_key(ip, port), sub);
    }

    /// Sets the source address preferred by future dials. Established
    /// connections are unaffected.
    pub fn set_default_source(&self, port: u16, ip: &str) {
        log::debug!("Setting default dial source to {ip}:{port}");
        *self.source.lock() = Endpoint::new(ip, port);
    }

    /// Stops the accept and read tasks, closes every socket and clears the
    /// tables. Safe to call more than once.
    pub async fn shutdown(&self) {
        let closed_tx = self.closed_watch_tx.lock().take();
        if closed_tx.is_none() {
            return;
        }
        drop(closed_tx);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.listeners.lock().clear();
        self.dialed.lock().clear();
        self.active.lock().clear();
        self.current_connections.store(0, Ordering::SeqCst);
        self.subscribers.clear();
        log::info!("TCP engine shut down");
    }

    pub fn subscribers(&self) -> &Arc<SubscriberTable> {
        &self.subscribers
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.current_connections.load(Ordering::SeqCst)
    }

    pub fn active_peer_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn dialed_peer_count(&self) -> usize {
        self.dialed.lock().len()
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .values()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_watch_tx.lock().is_none()
    }

    fn try_reserve_slot(&self) -> bool {
        let max = self.config.max_connections;
        self.current_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    async fn connect(&self, dest: SocketAddr, key: &str) -> Result<TcpStream> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;

        let source = self.source.lock().clone();
        if source.is_configured_source() {
            let bind_addr = source.bind_addr()?;
            socket.bind(bind_addr).map_err(|err| {
                log::error!("Failed to bind dial socket to {source}: {err}");
                Error::ErrBindFailed(source.key())
            })?;
        }

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match timeout(connect_timeout, socket.connect(dest)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                log::error!("Connect to {key} failed: {err}");
                return Err(Error::ErrConnectFailed(key.to_owned()));
            }
            Err(_) => {
                log::error!("Connect to {key} timed out");
                return Err(Error::ErrConnectFailed(key.to_owned()));
            }
        };

        self.apply_stream_options(&stream)?;
        Ok(stream)
    }

    fn apply_stream_options(&self, stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;

        if self.config.keepalive > 0 {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(KEEPALIVE_IDLE_SECS))
                .with_interval(Duration::from_secs(self.config.keepalive))
                .with_retries(KEEPALIVE_PROBES);
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }

    /// Splits the stream, records the link and starts its read task. The
    /// connection slot must already be reserved.
    fn install(self: &Arc<Self>, stream: TcpStream, dial_key: Option<String>) -> Arc<Link> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let local = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

        let (reader, writer) = stream.into_split();
        let link = Arc::new(Link {
            peer,
            local,
            writer: AsyncMutex::new(writer),
            dial_key: dial_key.clone(),
        });

        if let Some(key) = dial_key {
            self.dialed.lock().insert(key, Arc::clone(&link));
        }
        self.active.lock().insert(peer, Arc::clone(&link));

        self.spawn_read_loop(Arc::clone(&link), reader);
        link
    }

    /// Removes the link from both indices and releases its connection slot.
    fn close_link(&self, link: &Arc<Link>) {
        if self.active.lock().remove(&link.peer).is_none() {
            return;
        }
        if let Some(key) = &link.dial_key {
            self.dialed.lock().remove(key);
        }
        self.current_connections.fetch_sub(1, Ordering::SeqCst);
        log::info!("Connection with {} closed", link.peer);
    }

    async fn write_fragmented(&self, link: &Arc<Link>, data: &[u8]) -> Result<()> {
        let limit = self.config.send_packet_size();
        let send_timeout = Duration::from_millis(self.config.send_timeout_ms);

        let mut writer = link.writer.lock().await;
        for chunk in data.chunks(limit) {
            let sent = timeout(send_timeout, writer.write(chunk))
                .await
                .map_err(|_| Error::ErrSendTimeout(link.peer.to_string()))??;
            if sent != chunk.len() {
                return Err(Error::ErrSendShort {
                    sent,
                    requested: chunk.len(),
                });
            }
        }
        writer.flush().await?;
        Ok(())
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: Arc<TcpListener>, key: String) {
        let engine = Arc::clone(self);
        let mut closed_rx = self.closed_watch_rx.clone();

        let handle = tokio::spawn(async move {
            log::debug!("Accept task started for {key}");
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            if !engine.try_reserve_slot() {
                                // Over the cap: the accepted socket is closed
                                // without being installed.
                                log::warn!(
                                    "Dropping connection from {peer}: connection limit of {} reached",
                                    engine.config.max_connections
                                );
                                continue;
                            }
                            if let Err(err) = engine.apply_stream_options(&stream) {
                                log::error!("Failed to set options on {peer}: {err}");
                            }
                            log::info!("Accepted connection from {peer} on {key}");
                            engine.install(stream, None);
                        }
                        Err(err) => {
                            log::error!("Accept on {key} failed: {err}");
                        }
                    },
                    _ = closed_rx.changed() => break,
                }
            }
            log::debug!("Accept task for {key} exiting");
        });

        self.tasks.lock().push(handle);
    }

    fn spawn_read_loop(self: &Arc<Self>, link: Arc<Link>, mut reader: OwnedReadHalf) {
        let engine = Arc::clone(self);
        let mut closed_rx = self.closed_watch_rx.clone();
        let recv_size = self.config.max_receive_packet_size;

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; recv_size];
            let peer = link.peer;
            log::debug!("Read task started for {peer}");

            loop {
                tokio::select! {
                    res = reader.read(&mut buf) => match res {
                        Ok(0) => {
                            log::info!("Connection closed by {peer}");
                            engine.close_link(&link);
                            break;
                        }
                        Ok(n) => {
                            log::trace!("Received {n} bytes from {peer}");
                            let msg = Bytes::copy_from_slice(&buf[..n]);
                            let candidates = route_candidates(&peer, &link.local);
                            // Inline dispatch keeps a connection's payloads in
                            // arrival order.
                            deliver(Arc::clone(&engine.subscribers), candidates, msg).await;
                        }
                        Err(err) => {
                            log::error!("recv from {peer} failed: {err}");
                            engine.close_link(&link);
                            break;
                        }
                    },
                    _ = closed_rx.changed() => break,
                }
            }

            log::debug!("Read task for {peer} exiting");
        });

        self.tasks.lock().push(handle);
    }
}

fn bind_tcp_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
