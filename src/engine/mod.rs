#[cfg(test)]
mod engine_test;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::config::{Config, Protocol};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::logging;
use crate::periodic::PeriodicScheduler;
use crate::subscriber::Subscriber;
use crate::tcp::TcpEngine;
use crate::udp::UdpEngine;

/// The closed set of transport variants behind one operation set.
pub enum Communicator {
    Udp(Arc<UdpEngine>),
    Tcp(Arc<TcpEngine>),
}

impl Communicator {
    pub async fn initialize(&self) -> Result<()> {
        match self {
            Communicator::Udp(engine) => engine.initialize().await,
            Communicator::Tcp(engine) => engine.initialize().await,
        }
    }

    pub async fn send(&self, ip: &str, port: u16, data: &[u8]) -> Result<()> {
        match self {
            Communicator::Udp(engine) => engine.send(ip, port, data).await,
            Communicator::Tcp(engine) => engine.send(ip, port, data).await,
        }
    }

    /// Queues a send and returns a future that resolves to the outcome,
    /// never to an error. The payload is copied; the caller's buffer is
    /// free to go away immediately.
    pub async fn send_async(self: &Arc<Self>, ip: &str, port: u16, data: &[u8]) -> SendFuture {
        let payload = Bytes::copy_from_slice(data);
        let (tx, rx) = oneshot::channel();

        let this = Arc::clone(self);
        let ip = ip.to_owned();
        let job = async move {
            let ok = this.send(&ip, port, &payload).await.is_ok();
            let _ = tx.send(ok);
        };

        match self.dispatcher() {
            // A refused submission drops `tx`, resolving the future to false.
            Some(pool) => {
                pool.submit(job).await;
            }
            None => {
                tokio::spawn(job);
            }
        }

        SendFuture { rx }
    }

    pub async fn add_listen(&self, ip: &str, port: u16) -> Result<()> {
        match self {
            Communicator::Udp(engine) => engine.add_listen(ip, port).await,
            Communicator::Tcp(engine) => engine.add_listen(ip, port).await,
        }
    }

    pub fn add_subscribe(&self, ip: &str, port: u16, sub: Arc<dyn Subscriber>) {
        match self {
            Communicator::Udp(engine) => engine.add_subscribe(ip, port, sub),
            Communicator::Tcp(engine) => engine.add_subscribe(ip, port, sub),
        }
    }

    /// Sets the default source for future sends (UDP) or dials (TCP).
    pub fn set_default_source(&self, port: u16, ip: &str) {
        match self {
            Communicator::Udp(engine) => engine.set_default_source(port, ip),
            Communicator::Tcp(engine) => engine.set_default_source(port, ip),
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Communicator::Udp(engine) => engine.shutdown().await,
            Communicator::Tcp(engine) => engine.shutdown().await,
        }
    }

    fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        match self {
            Communicator::Udp(engine) => engine.dispatcher(),
            Communicator::Tcp(engine) => engine.dispatcher(),
        }
    }
}

/// Outcome of an asynchronous send. Resolves to false on any failure,
/// including a rejected submission.
pub struct SendFuture {
    rx: oneshot::Receiver<bool>,
}

impl Future for SendFuture {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|res| res.unwrap_or(false))
    }
}

/// The process-wide engine: one communicator, its periodic scheduler and
/// the optional dispatch pool, torn down together.
pub struct Engine {
    config: Config,
    communicator: Arc<Communicator>,
    scheduler: PeriodicScheduler,
    dispatcher: Option<Arc<Dispatcher>>,
    closed: AtomicBool,
}

impl Engine {
    /// Loads the configuration document, configures logging and brings up
    /// the selected transport variant. On any failure nothing is left
    /// running and the error is returned.
    pub async fn initialize(config_path: Option<&str>) -> Result<Arc<Engine>> {
        let config = Config::load(config_path)?;
        logging::init(config.runtime_log_level, &config.log_save_path);

        #[cfg(feature = "dispatch-pool")]
        let dispatcher = Some(Dispatcher::new(config.thread_pool_size));
        #[cfg(not(feature = "dispatch-pool"))]
        let dispatcher: Option<Arc<Dispatcher>> = None;

        let communicator = Arc::new(match config.protocol {
            Protocol::Udp => {
                Communicator::Udp(UdpEngine::new(config.clone(), dispatcher.clone()))
            }
            Protocol::Tcp => {
                Communicator::Tcp(TcpEngine::new(config.clone(), dispatcher.clone()))
            }
        });

        if let Err(err) = communicator.initialize().await {
            communicator.shutdown().await;
            if let Some(pool) = &dispatcher {
                pool.close().await;
            }
            return Err(err);
        }

        let scheduler = PeriodicScheduler::new(Arc::clone(&communicator));
        log::info!("Engine initialized");

        Ok(Arc::new(Engine {
            config,
            communicator,
            scheduler,
            dispatcher,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    pub fn scheduler(&self) -> &PeriodicScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The configured peers a broadcast goes to: the pre-pooled send peers
    /// (UDP) or the dialed peers (TCP).
    pub fn broadcast_targets(&self) -> Vec<(String, u16)> {
        let list = match self.config.protocol {
            Protocol::Udp => &self.config.send_list,
            Protocol::Tcp => &self.config.connect_list,
        };
        list.iter().map(|entry| (entry.ip.clone(), entry.port)).collect()
    }

    /// Cancels the periodic tasks, stops the communicator and drains the
    /// dispatch pool. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.scheduler.shutdown().await;
        self.communicator.shutdown().await;
        if let Some(pool) = &self.dispatcher {
            pool.close().await;
        }

        log::info!("Engine shut down");
        log::logger().flush();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
