
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::endpoint::{endpoint_key, route_candidates, Endpoint};
use crate::error::{Error, Result};
use crate::subscriber::{deliver, Subscriber, SubscriberTable};

/// Datagram variant of the engine: a set of bound receive sockets, a pool
/// of pre-created send sockets keyed by destination, and one receive task
/// per bound socket.
pub struct UdpEngine {
    config: Config,
    subscribers: Arc<SubscriberTable>,
    listeners: Mutex<HashMap<String, Arc<UdpSocket>>>,
    send_pool: Mutex<HashMap<String, Arc<UdpSocket>>>,
    /// Default source bound to newly created send sockets; `:0` leaves the
    /// choice to the OS.
    source: Mutex<Endpoint>,
    dispatcher: Option<Arc<Dispatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed_watch_tx: Mutex<Option<watch::Sender<()>>>,
    closed_watch_rx: watch::Receiver<()>,
}

impl UdpEngine {
    pub fn new(config: Config, dispatcher: Option<Arc<Dispatcher>>) -> Arc<Self> {
        let (closed_watch_tx, closed_watch_rx) = watch::channel(());
        let source = Endpoint::new(config.source_ip.clone(), config.source_port);

        Arc::new(UdpEngine {
            config,
            subscribers: Arc::new(SubscriberTable::new()),
            listeners: Mutex::default(),
            send_pool: Mutex::default(),
            source: Mutex::new(source),
            dispatcher,
            tasks: Mutex::default(),
            closed_watch_tx: Mutex::new(Some(closed_watch_tx)),
            closed_watch_rx,
        })
    }

    /// Binds every configured listener and pre-creates one send socket per
    /// configured peer.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let listen_list = self.config.listen_list.clone();
        for entry in &listen_list {
            self.add_listen(&entry.ip, entry.port).await?;
        }

        let send_list = self.config.send_list.clone();
        for entry in &send_list {
            self.add_send_socket(&entry.ip, entry.port)?;
        }

        log::info!(
            "UDP engine initialized ({} listeners, {} pooled peers)",
            self.listener_count(),
            self.pooled_peer_count()
        );
        Ok(())
    }

    /// Binds a fresh receive socket for `ip:port` and starts its receive
    /// task. Re-adding an existing key is a benign no-op.
    pub async fn add_listen(self: &Arc<Self>, ip: &str, port: u16) -> Result<()> {
        let endpoint = Endpoint::new(ip, port);
        let key = endpoint.key();

        if self.listeners.lock().contains_key(&key) {
            log::warn!("The endpoint {key} is already being listened on");
            return Ok(());
        }

        let socket = Arc::new(bind_udp_socket(endpoint.bind_addr()?).map_err(|err| {
            log::error!("Failed to bind listen socket for {key}: {err}");
            Error::ErrBindFailed(key.clone())
        })?);

        {
            let mut listeners = self.listeners.lock();
            if listeners.contains_key(&key) {
                log::warn!("The endpoint {key} is already being listened on");
                return Ok(());
            }
            listeners.insert(key.clone(), Arc::clone(&socket));
        }

        log::info!("Listening on {key}");
        self.spawn_recv_loop(socket, key);
        Ok(())
    }

    /// Sends `data` to `ip:port`, reusing a pooled socket when one exists
    /// and a transient socket otherwise. The payload is fragmented into
    /// chunks no larger than the configured send packet size; the first
    /// failed chunk aborts the send.
    pub async fn send(&self, ip: &str, port: u16, data: &[u8]) -> Result<()> {
        let endpoint = Endpoint::new(ip, port);
        let dest = endpoint.remote_addr()?;

        let pooled = self.send_pool.lock().get(&endpoint.key()).cloned();
        match pooled {
            Some(socket) => self.send_fragmented(&socket, dest, data).await,
            None => {
                let socket = self.create_send_socket()?;
                self.send_fragmented(&socket, dest, data).await
            }
        }
    }

    pub fn add_subscribe(&self, ip: &str, port: u16, sub: Arc<dyn Subscriber>) {
        self.subscribers.register(endpoint_key(ip, port), sub);
    }

    /// Sets the default source for future send sockets. Pooled sockets
    /// created earlier keep their binding.
    pub fn set_default_source(&self, port: u16, ip: &str) {
        log::debug!("Setting default send source to {ip}:{port}");
        *self.source.lock() = Endpoint::new(ip, port);
    }

    /// Stops the receive tasks, closes every socket and clears the tables.
    /// Safe to call more than once.
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
        self.send_pool.lock().clear();
        self.subscribers.clear();
        log::info!("UDP engine shut down");
    }

    pub fn subscribers(&self) -> &Arc<SubscriberTable> {
        &self.subscribers
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// The bound addresses of the current listeners.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .values()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    pub fn pooled_peer_count(&self) -> usize {
        self.send_pool.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_watch_tx.lock().is_none()
    }

    /// Pre-creates a pooled send socket for `ip:port`.
    fn add_send_socket(&self, ip: &str, port: u16) -> Result<()> {
        let key = endpoint_key(ip, port);

        if self.send_pool.lock().contains_key(&key) {
            log::warn!("The peer {key} is already in the send pool");
            return Ok(());
        }

        let socket = self.create_send_socket().map_err(|err| {
            log::error!("Failed to create send socket for {key}: {err}");
            err
        })?;
        self.send_pool.lock().insert(key.clone(), Arc::new(socket));
        log::info!("Pooled send socket for {key}");
        Ok(())
    }

    fn create_send_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;

        let source = self.source.lock().clone();
        if source.is_configured_source() {
            let bind_addr = source.bind_addr()?;
            socket.bind(&bind_addr.into()).map_err(|err| {
                log::error!("Failed to bind send socket to {source}: {err}");
                Error::ErrBindFailed(source.key())
            })?;
        }

        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn send_fragmented(
        &self,
        socket: &UdpSocket,
        dest: SocketAddr,
        data: &[u8],
    ) -> Result<()> {
        let limit = self.config.send_packet_size();
        let send_timeout = Duration::from_millis(self.config.send_timeout_ms);

        for chunk in data.chunks(limit) {
            let sent = timeout(send_timeout, socket.send_to(chunk, dest))
                .await
                .map_err(|_| Error::ErrSendTimeout(dest.to_string()))??;
            if sent != chunk.len() {
                log::error!(
                    "Failed to send complete chunk to {dest} (sent {sent} of {} bytes)",
                    chunk.len()
                );
                return Err(Error::ErrSendShort {
                    sent,
                    requested: chunk.len(),
                });
            }
        }

        log::trace!("Sent {} bytes to {dest}", data.len());
        Ok(())
    }

    fn spawn_recv_loop(self: &Arc<Self>, socket: Arc<UdpSocket>, key: String) {
        let subscribers = Arc::clone(&self.subscribers);
        let dispatcher = self.dispatcher.clone();
        let mut closed_rx = self.closed_watch_rx.clone();
        let recv_size = self.config.max_receive_packet_size;

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; recv_size];
            log::debug!("Receive task started for {key}");

            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => match res {
                        Ok((n, src)) => {
                            let local = match socket.local_addr() {
                                Ok(addr) => addr,
                                Err(err) => {
                                    log::error!("local_addr on {key} failed: {err}");
                                    continue;
                                }
                            };
                            log::trace!("Received {n} bytes from {src} on {local}");

                            let msg = Bytes::copy_from_slice(&buf[..n]);
                            let candidates = route_candidates(&src, &local);
                            let table = Arc::clone(&subscribers);
                            match &dispatcher {
                                Some(pool) => {
                                    pool.submit(deliver(table, candidates, msg)).await;
                                }
                                None => deliver(table, candidates, msg).await,
                            }
                        }
                        Err(err) => {
                            // Datagram receive errors are not fatal to the listener.
                            log::error!("recv on {key} failed: {err}");
                        }
                    },
                    _ = closed_rx.changed() => break,
                }
            }

            log::debug!("Receive task for {key} exiting");
        });

        self.tasks.lock().push(handle);
    }
}

fn bind_udp_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
