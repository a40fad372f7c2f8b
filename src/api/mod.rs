//! Thin boundary functions mapping the caller-visible operations onto the
//! engine. Every function looks the active engine up through a
//! module-scoped handle installed by [`initialize`] and fails fast with a
//! negative code when no engine is active.


use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::endpoint::LOCAL_WILDCARD_HOST;
use crate::engine::Engine;
use crate::subscriber::Subscriber;

lazy_static! {
    static ref ACTIVE_ENGINE: RwLock<Option<Arc<Engine>>> = RwLock::new(None);
    /// Serializes initialize/destroy so concurrent callers cannot build
    /// two engines.
    static ref LIFECYCLE_LOCK: AsyncMutex<()> = AsyncMutex::new(());
}

fn active() -> Option<Arc<Engine>> {
    ACTIVE_ENGINE.read().clone()
}

/// Brings the engine up from the configuration document at `config_path`
/// (or the built-in defaults when absent). Returns 0 on success; a second
/// call while an engine is active is a successful no-op.
pub async fn initialize(config_path: Option<&str>) -> i32 {
    let _guard = LIFECYCLE_LOCK.lock().await;
    if ACTIVE_ENGINE.read().is_some() {
        return 0;
    }

    match Engine::initialize(config_path).await {
        Ok(engine) => {
            *ACTIVE_ENGINE.write() = Some(engine);
            0
        }
        Err(err) => {
            log::error!("Engine initialization failed: {err}");
            -1
        }
    }
}

/// Tears the active engine down. Always returns 0; calling without an
/// active engine is a no-op.
pub async fn destroy() -> i32 {
    let _guard = LIFECYCLE_LOCK.lock().await;
    let engine = ACTIVE_ENGINE.write().take();
    if let Some(engine) = engine {
        engine.shutdown().await;
    }
    0
}

/// Sends `data` to `ip:port`. Returns 0 on success.
pub async fn send_message(ip: &str, port: u16, data: &[u8]) -> i32 {
    let Some(engine) = active() else {
        log::warn!("send_message called without an initialized engine");
        return -1;
    };
    match engine.communicator().send(ip, port, data).await {
        Ok(()) => 0,
        Err(err) => {
            log::error!("Failed to send to {ip}:{port}: {err}");
            -1
        }
    }
}

/// Sends `data` to every configured peer. Returns 0 when every send
/// succeeded.
pub async fn broadcast_message(data: &[u8]) -> i32 {
    let Some(engine) = active() else {
        log::warn!("broadcast_message called without an initialized engine");
        return -1;
    };

    let mut result = 0;
    for (ip, port) in engine.broadcast_targets() {
        if engine.communicator().send(&ip, port, data).await.is_err() {
            log::error!("Broadcast to {ip}:{port} failed");
            result = -1;
        }
    }
    result
}

/// Registers a rate-driven send task. Returns 0 on success or a negative
/// validation code.
pub async fn add_periodic_send_task(
    ip: &str,
    port: u16,
    data: &[u8],
    rate_hz: i32,
    task_id: i32,
) -> i32 {
    let Some(engine) = active() else {
        log::warn!("add_periodic_send_task called without an initialized engine");
        return -1;
    };
    match engine
        .scheduler()
        .add_send_task(ip, port, data, rate_hz, task_id)
    {
        Ok(_) => 0,
        Err(err) => {
            log::error!("Failed to add periodic task: {err}");
            err.code()
        }
    }
}

/// Cancels the periodic task registered under `task_id`. Returns 0 on
/// success, negative when the id is unknown.
pub async fn remove_periodic_send_task(task_id: i32) -> i32 {
    let Some(engine) = active() else {
        log::warn!("remove_periodic_send_task called without an initialized engine");
        return -1;
    };
    match engine.scheduler().remove_task(task_id).await {
        Ok(()) => 0,
        Err(err) => {
            log::error!("Failed to remove periodic task {task_id}: {err}");
            err.code()
        }
    }
}

/// Registers the catch-all handler receiving every message no more
/// specific subscription claims.
pub async fn subscribe(sub: Arc<dyn Subscriber>) -> i32 {
    let Some(engine) = active() else {
        log::warn!("subscribe called without an initialized engine");
        return -1;
    };
    engine.communicator().add_subscribe("", 0, sub);
    0
}

/// Registers a handler for messages from the sender `ip:port`.
pub async fn subscribe_remote(ip: &str, port: u16, sub: Arc<dyn Subscriber>) -> i32 {
    let Some(engine) = active() else {
        log::warn!("subscribe_remote called without an initialized engine");
        return -1;
    };
    engine.communicator().add_subscribe(ip, port, sub);
    0
}

/// Registers a handler for messages arriving on the local port, adding the
/// listener first when it is absent. `ip` only selects the interface the
/// listener binds; the subscription itself matches any sender on that
/// port.
pub async fn subscribe_local(ip: Option<&str>, port: u16, sub: Arc<dyn Subscriber>) -> i32 {
    let Some(engine) = active() else {
        log::warn!("subscribe_local called without an initialized engine");
        return -1;
    };

    let bind_ip = ip.unwrap_or("");
    if let Err(err) = engine.communicator().add_listen(bind_ip, port).await {
        log::error!("Failed to add listener for {bind_ip}:{port}: {err}");
        return -1;
    }
    engine
        .communicator()
        .add_subscribe(LOCAL_WILDCARD_HOST, port, sub);
    0
}

/// Binds an additional local listener.
pub async fn add_listener(ip: Option<&str>, port: u16) -> i32 {
    let Some(engine) = active() else {
        log::warn!("add_listener called without an initialized engine");
        return -1;
    };
    let bind_ip = ip.unwrap_or("");
    match engine.communicator().add_listen(bind_ip, port).await {
        Ok(()) => 0,
        Err(err) => {
            log::error!("Failed to add listener for {bind_ip}:{port}: {err}");
            -1
        }
    }
}

/// Sets the default source port used by future sends (UDP) or dials (TCP).
pub async fn set_send_port(port: u16) {
    let Some(engine) = active() else {
        log::warn!("set_send_port called without an initialized engine");
        return;
    };
    engine.communicator().set_default_source(port, "");
}
