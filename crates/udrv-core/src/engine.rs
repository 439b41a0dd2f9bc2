//! Message-driven front end of a [`Session`].
//!
//! [`Engine::run`] owns the session and serialises everything that touches
//! it: device notifications sent through an [`EngineHandle`] and the
//! asynchronous verbs events the bound device reports. While a handshake is
//! blocked on the side channel the loop is not reading its queue, so removal
//! and shutdown are additionally broadcast on a watch channel that the
//! handshake races against.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use udrv_verbs::{VerbsDevice, VerbsEvent};

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineStopped};
use crate::session::{Session, SessionStatus};
use crate::stats::{SessionStats, StatsSnapshot};

pub enum EngineEvent {
    /// `serial` is the interrupt serial current when the device was added;
    /// only later interrupts abort its handshake.
    DeviceAdded {
        device: Arc<dyn VerbsDevice>,
        serial: u64,
    },
    DeviceRemoved(String),
    Shutdown,
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::DeviceAdded { device, serial } => f
                .debug_struct("DeviceAdded")
                .field("device", &device.name())
                .field("serial", serial)
                .finish(),
            EngineEvent::DeviceRemoved(name) => f.debug_tuple("DeviceRemoved").field(name).finish(),
            EngineEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Notices that abort an in-progress handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interrupt {
    /// Bumped by every notice.
    pub serial: u64,
    /// Serial of the latest removal of each device name.
    pub removals: HashMap<String, u64>,
    pub shutdown: bool,
}

impl Interrupt {
    /// Whether a notice issued after `serial` concerns `device`.
    pub fn aborts(&self, device: &str, serial: u64) -> bool {
        self.shutdown || self.removals.get(device).is_some_and(|s| *s > serial)
    }
}

/// Resolves once `device`'s handshake must stop, or when every handle is gone.
async fn interrupted(mut notices: watch::Receiver<Interrupt>, device: String, serial: u64) {
    loop {
        if notices.borrow_and_update().aborts(&device, serial) {
            tracing::info!(device = %device, "handshake interrupted");
            return;
        }
        if notices.changed().await.is_err() {
            return;
        }
    }
}

pub struct Engine {
    session: Session,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    verbs_events: mpsc::UnboundedReceiver<VerbsEvent>,
    notices: watch::Receiver<Interrupt>,
}

/// Cloneable producer side of an [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::UnboundedSender<EngineEvent>,
    notices: Arc<watch::Sender<Interrupt>>,
    status: watch::Receiver<SessionStatus>,
    stats: Arc<SessionStats>,
}

impl Engine {
    /// Fails if `config` does not validate.
    pub fn new(config: EngineConfig) -> Result<(Engine, EngineHandle), ConfigError> {
        config.validate()?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let (verbs_tx, verbs_events) = mpsc::unbounded_channel();
        let (notices_tx, notices) = watch::channel(Interrupt::default());

        let session = Session::new(config, verbs_tx);
        let handle = EngineHandle {
            events: events_tx,
            notices: Arc::new(notices_tx),
            status: session.subscribe(),
            stats: Arc::clone(session.stats()),
        };
        let engine = Engine {
            session,
            events,
            verbs_events,
            notices,
        };
        Ok((engine, handle))
    }

    /// Process events until shutdown or until every handle is dropped, then
    /// release the bound device.
    pub async fn run(mut self) {
        tracing::info!(role = %self.session.config().role(), "engine started");
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(EngineEvent::DeviceAdded { device, serial }) => {
                        let cancel = interrupted(
                            self.notices.clone(),
                            device.name().to_string(),
                            serial,
                        );
                        // Failures are recorded in the session status.
                        let _ = self.session.device_added(device, cancel).await;
                    }
                    Some(EngineEvent::DeviceRemoved(name)) => {
                        self.session.device_removed(&name).await;
                    }
                    Some(EngineEvent::Shutdown) | None => break,
                },
                Some(event) = self.verbs_events.recv() => {
                    self.session.handle_verbs_event(event);
                }
            }
        }
        self.session.shutdown().await;
        tracing::info!("engine stopped");
    }
}

impl EngineHandle {
    pub fn add_device(&self, device: Arc<dyn VerbsDevice>) -> Result<(), EngineStopped> {
        let serial = self.notices.borrow().serial;
        self.events
            .send(EngineEvent::DeviceAdded { device, serial })
            .map_err(|_| EngineStopped)
    }

    pub fn remove_device(&self, name: &str) -> Result<(), EngineStopped> {
        self.notices.send_modify(|n| {
            n.serial += 1;
            n.removals.insert(name.to_string(), n.serial);
        });
        self.events
            .send(EngineEvent::DeviceRemoved(name.to_string()))
            .map_err(|_| EngineStopped)
    }

    pub fn shutdown(&self) -> Result<(), EngineStopped> {
        self.notices.send_modify(|n| {
            n.serial += 1;
            n.shutdown = true;
        });
        self.events
            .send(EngineEvent::Shutdown)
            .map_err(|_| EngineStopped)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the published status satisfies `f`.
    pub async fn wait_for<F>(&self, f: F) -> Result<SessionStatus, EngineStopped>
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let mut status = self.status.clone();
        let matched = status.wait_for(f).await.map_err(|_| EngineStopped)?;
        Ok(matched.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use udrv_verbs::sim::{PathMode, SimDevice, SimFabric};
    use udrv_verbs::QpState;

    use crate::session::SessionState;

    const WAIT: Duration = Duration::from_secs(5);

    fn start(config: EngineConfig) -> (EngineHandle, JoinHandle<()>) {
        let (engine, handle) = Engine::new(config).unwrap();
        (handle, tokio::spawn(engine.run()))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = EngineConfig {
            peer_addr: Some(Ipv4Addr::LOCALHOST),
            side_channel_port: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(config),
            Err(ConfigError::Invalid {
                field: "side_channel_port",
                ..
            })
        ));
        let config = EngineConfig {
            payload_size: 0,
            ..listener_config()
        };
        assert!(Engine::new(config).is_err());
    }

    async fn wait(handle: &EngineHandle, f: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
        tokio::time::timeout(WAIT, handle.wait_for(f))
            .await
            .expect("timed out waiting for status")
            .unwrap()
    }

    fn listener_config() -> EngineConfig {
        EngineConfig {
            side_channel_port: 0,
            send_period_ms: 20,
            ..EngineConfig::default()
        }
    }

    fn connector_config(port: u16) -> EngineConfig {
        EngineConfig {
            peer_addr: Some(Ipv4Addr::LOCALHOST),
            side_channel_port: port,
            send_period_ms: 20,
            ..EngineConfig::default()
        }
    }

    /// Start a listener engine on `dev` and return the port it listens on.
    async fn listening(dev: &Arc<SimDevice>) -> (EngineHandle, JoinHandle<()>, u16) {
        let (handle, task) = start(listener_config());
        handle.add_device(dev.clone()).unwrap();
        let status = wait(&handle, |s| s.awaiting_peer).await;
        let port = status.listen_addr.unwrap().port();
        (handle, task, port)
    }

    #[test]
    fn test_interrupt_aborts() {
        let mut notice = Interrupt::default();
        assert!(!notice.aborts("sim0", 0));

        notice.serial = 3;
        notice.removals.insert("sim0".to_string(), 3);
        assert!(notice.aborts("sim0", 2));
        assert!(!notice.aborts("sim0", 3));
        assert!(!notice.aborts("sim1", 0));

        notice.shutdown = true;
        assert!(notice.aborts("sim1", 5));
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let fabric = SimFabric::new();
        let dev_a = fabric.add_device("sim0", 1);
        let dev_b = fabric.add_device("sim1", 2);

        let (a, a_task, port) = listening(&dev_a).await;
        let (b, b_task) = start(connector_config(port));
        b.add_device(dev_b.clone()).unwrap();

        let sa = wait(&a, |s| s.state == SessionState::Active).await;
        let sb = wait(&b, |s| s.state == SessionState::Active).await;
        assert!(sa.has_reached(SessionState::InfoExchanged));
        assert_eq!(sa.remote, sb.local);
        assert_eq!(sb.remote, sa.local);

        // Both sides send and receive once their schedules run.
        tokio::time::timeout(WAIT, async {
            while dev_a.posted_sends().len() < 3 || b.stats().recv_completions < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let ids: Vec<u64> = dev_a.posted_sends().iter().map(|wr| wr.wr_id).collect();
        assert_eq!(ids[..3], [1, 2, 3]);
        let first = dev_a.posted_sends()[0];
        assert_eq!(first.ud.remote_qpn, sa.remote.unwrap().qp_num);
        assert_eq!(first.sge.length, 1024);

        let stats = b.stats();
        assert_eq!(stats.idle_ticks, 0);
        assert!(stats.recv_reposts >= 2);
        assert_eq!(stats.recv_errors, 0);

        a.remove_device("sim0").unwrap();
        b.remove_device("sim1").unwrap();
        wait(&a, |s| s.state == SessionState::NoDevice).await;
        wait(&b, |s| s.state == SessionState::NoDevice).await;
        assert!(dev_a.live_objects().is_empty());
        assert!(dev_b.live_objects().is_empty());
        assert_eq!(a.stats().teardowns, 1);

        // No tick runs after teardown.
        let sends = dev_a.posted_sends().len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dev_a.posted_sends().len(), sends);

        a.shutdown().unwrap();
        b.shutdown().unwrap();
        a_task.await.unwrap();
        b_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_removal_interrupts_accept() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        let (handle, task, _) = listening(&dev).await;

        handle.remove_device("sim0").unwrap();
        let status = wait(&handle, |s| s.state == SessionState::NoDevice).await;
        assert_eq!(status.reached.last(), Some(&SessionState::TornDown));
        assert!(!status.has_reached(SessionState::InfoExchanged));
        assert!(status.last_failure.is_some());
        assert!(dev.live_objects().is_empty());

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_accept() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        let (handle, task, _) = listening(&dev).await;

        handle.shutdown().unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert!(dev.live_objects().is_empty());
        assert!(handle.add_device(dev.clone()).is_err());
    }

    #[tokio::test]
    async fn test_stale_removal_does_not_abort_readd() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        let (handle, task, _) = listening(&dev).await;

        handle.remove_device("sim0").unwrap();
        wait(&handle, |s| s.state == SessionState::NoDevice).await;

        handle.add_device(dev.clone()).unwrap();
        let status = wait(&handle, |s| s.awaiting_peer).await;
        assert_eq!(status.state, SessionState::QpReady);
        assert!(status.last_failure.is_none());

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (handle, task) = start(connector_config(port));
        handle.add_device(dev.clone()).unwrap();

        let status = wait(&handle, |s| s.last_failure.is_some()).await;
        assert_eq!(status.state, SessionState::QpReady);
        assert!(status.remote.is_none());
        assert!(status.path.is_none());
        assert_eq!(dev.live_objects().qps, 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(dev.live_objects().is_empty());
    }

    #[tokio::test]
    async fn test_path_timeout_then_readd() {
        let fabric = SimFabric::new();
        fabric.set_path_mode(PathMode::Timeout);
        let dev_a = fabric.add_device("sim0", 1);
        let dev_b = fabric.add_device("sim1", 2);

        let (a, a_task, port) = listening(&dev_a).await;
        let (b, b_task) = start(connector_config(port));
        b.add_device(dev_b.clone()).unwrap();

        let sb = wait(&b, |s| s.last_failure.is_some()).await;
        assert_eq!(sb.state, SessionState::PathPending);
        assert!(sb.path.is_none());
        assert!(!sb.has_reached(SessionState::Active));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(b.stats().ticks, 0);
        assert!(dev_b.posted_sends().is_empty());

        // Retry from scratch on both sides.
        fabric.set_path_mode(PathMode::Auto);
        for (handle, name) in [(&a, "sim0"), (&b, "sim1")] {
            handle.remove_device(name).unwrap();
            wait(handle, |s| s.state == SessionState::NoDevice).await;
        }
        assert!(dev_a.live_objects().is_empty());
        assert!(dev_b.live_objects().is_empty());

        a.add_device(dev_a.clone()).unwrap();
        let port = wait(&a, |s| s.awaiting_peer)
            .await
            .listen_addr
            .unwrap()
            .port();
        b.shutdown().unwrap();
        b_task.await.unwrap();

        let (b, b_task) = start(connector_config(port));
        b.add_device(dev_b.clone()).unwrap();
        wait(&a, |s| s.state == SessionState::Active).await;
        let sb = wait(&b, |s| s.state == SessionState::Active).await;
        assert!(sb.last_failure.is_none());
        assert_eq!(
            dev_b.qp_modifications().last().map(|(s, _)| *s),
            Some(QpState::ReadyToSend)
        );

        a.shutdown().unwrap();
        b.shutdown().unwrap();
        a_task.await.unwrap();
        b_task.await.unwrap();
        assert!(dev_a.live_objects().is_empty());
        assert!(dev_b.live_objects().is_empty());
    }
}
