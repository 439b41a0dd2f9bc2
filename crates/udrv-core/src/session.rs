//! The single device binding.
//!
//! A [`Session`] binds at most one device at a time and walks it through the
//! handshake:
//!
//! ```text
//! NO-DEVICE -> DEVICE-BOUND -> RESOURCES-READY -> QP-READY
//!           -> INFO-EXCHANGED -> PATH-PENDING -> ACTIVE
//! ```
//!
//! Removal tears the binding down from whichever state it reached and
//! returns the session to NO-DEVICE. A handshake that fails leaves the
//! device bound but inactive; nothing is retried until the device is
//! removed and added again.

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use udrv_sidechannel::{self as sidechannel, AddressingInfo, Role, SideChannelListener};
use udrv_verbs::{EventSink, PathRecord, QueryId, VerbsDevice, VerbsEvent};

use crate::config::EngineConfig;
use crate::error::{PathError, ResourceKind, SetupError};
use crate::path::{PathResolver, ResolvedPath};
use crate::qp::{self, QpParams};
use crate::resources::{ResourceParams, ResourceSet};
use crate::scheduler::{Datapath, Scheduler, SchedulerTask};
use crate::stats::SessionStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SessionState {
    #[default]
    NoDevice,
    DeviceBound,
    ResourcesReady,
    QpReady,
    InfoExchanged,
    PathPending,
    /// Scheduler armed.
    Active,
    /// Entered on removal, immediately followed by `NoDevice`.
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NoDevice => "NO-DEVICE",
            SessionState::DeviceBound => "DEVICE-BOUND",
            SessionState::ResourcesReady => "RESOURCES-READY",
            SessionState::QpReady => "QP-READY",
            SessionState::InfoExchanged => "INFO-EXCHANGED",
            SessionState::PathPending => "PATH-PENDING",
            SessionState::Active => "ACTIVE",
            SessionState::TornDown => "TORN-DOWN",
        };
        f.write_str(name)
    }
}

/// Observable state of a session, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub device: Option<String>,
    pub role: Option<String>,
    /// The listener is bound and waiting for its peer.
    pub awaiting_peer: bool,
    pub listen_addr: Option<SocketAddr>,
    pub local: Option<AddressingInfo>,
    pub remote: Option<AddressingInfo>,
    pub path: Option<ResolvedPath>,
    /// States entered since the current device was bound, in order.
    pub reached: Vec<SessionState>,
    pub last_failure: Option<String>,
}

impl SessionStatus {
    pub fn has_reached(&self, state: SessionState) -> bool {
        self.reached.contains(&state)
    }
}

struct Binding {
    device: Arc<dyn VerbsDevice>,
    resources: ResourceSet,
    resolver: PathResolver,
    /// Built during the handshake, moved into `task` once routed.
    scheduler: Option<Scheduler>,
    task: Option<SchedulerTask>,
}

pub struct Session {
    config: EngineConfig,
    events: EventSink,
    stats: Arc<SessionStats>,
    status: watch::Sender<SessionStatus>,
    binding: Option<Binding>,
}

impl Session {
    /// `events` is handed to every device object that reports asynchronously;
    /// the owner feeds what arrives back through [`Session::handle_verbs_event`].
    pub fn new(config: EngineConfig, events: EventSink) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            events,
            stats: Arc::new(SessionStats::default()),
            status,
            binding: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn bound_device(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.device.name())
    }

    /// Bind `device` and run the handshake up to the path query.
    ///
    /// Blocks for the side-channel exchange. `cancel` aborts the exchange
    /// when it resolves. Returns `Ok` without doing anything if a device is
    /// already bound.
    pub async fn device_added<F>(
        &mut self,
        device: Arc<dyn VerbsDevice>,
        cancel: F,
    ) -> Result<(), SetupError>
    where
        F: Future<Output = ()>,
    {
        if let Some(bound) = self.bound_device() {
            tracing::info!(
                device = device.name(),
                bound,
                "already bound to a device, ignoring"
            );
            return Ok(());
        }

        let name = device.name().to_string();
        tracing::info!(device = %name, "binding device");
        let mut binding = Binding {
            device: Arc::clone(&device),
            resources: ResourceSet::new(device),
            resolver: PathResolver::new(self.config.port_num, self.config.path_query_timeout()),
            scheduler: None,
            task: None,
        };
        self.status.send_modify(|s| {
            *s = SessionStatus {
                device: Some(name.clone()),
                ..SessionStatus::default()
            }
        });
        self.enter(SessionState::DeviceBound);

        let result = self.handshake(&mut binding, cancel).await;
        if let Err(e) = &result {
            tracing::error!(device = %name, error = %e, "handshake failed, device left inactive");
            if matches!(
                e,
                SetupError::Allocation { .. }
                    | SetupError::Incomplete(_)
                    | SetupError::PayloadTooLarge { .. }
            ) {
                let failures = binding.resources.teardown();
                self.stats.teardown_failures.add(failures as u64);
            }
            self.status.send_modify(|s| {
                s.awaiting_peer = false;
                s.last_failure = Some(e.to_string());
            });
        }
        self.binding = Some(binding);
        result
    }

    async fn handshake<F>(&self, binding: &mut Binding, cancel: F) -> Result<(), SetupError>
    where
        F: Future<Output = ()>,
    {
        let device = Arc::clone(&binding.device);
        let port = self.config.port_num;

        let attr = device.query_device().map_err(SetupError::Query)?;
        let port_attr = device.query_port(port).map_err(SetupError::Query)?;
        tracing::info!(
            device = device.name(),
            max_qp = attr.max_qp,
            max_cqe = attr.max_cqe,
            max_mcast_grp = attr.max_mcast_grp,
            max_pkeys = attr.max_pkeys,
            "device capabilities"
        );
        tracing::info!(
            port,
            lid = port_attr.lid,
            sm_lid = port_attr.sm_lid,
            max_msg_sz = port_attr.max_msg_sz,
            state = %port_attr.state,
            link_layer = %port_attr.link_layer,
            "port attributes"
        );
        if !port_attr.is_active() {
            tracing::warn!(port, state = %port_attr.state, "port is not active");
        }
        if self.config.payload_size > port_attr.max_msg_sz as usize {
            return Err(SetupError::PayloadTooLarge {
                len: self.config.payload_size,
                max: port_attr.max_msg_sz,
            });
        }

        binding
            .resources
            .allocate(ResourceParams::from(&self.config), &self.events)?;
        self.enter(SessionState::ResourcesReady);

        let qp = binding
            .resources
            .qp()
            .ok_or(SetupError::Incomplete(ResourceKind::QueuePair))?;
        let local = qp::bring_up(&*device, qp, &QpParams::from(&self.config))?;
        self.status.send_modify(|s| s.local = Some(local));
        self.enter(SessionState::QpReady);

        let pkey = device
            .query_pkey(port, self.config.pkey_index)
            .map_err(SetupError::Query)?;
        let datapath = Datapath::from_resources(&binding.resources, self.config.payload_size)?;
        let mut scheduler = Scheduler::new(
            Arc::clone(&device),
            datapath,
            port,
            Arc::clone(&self.stats),
        );

        let role = self.config.role();
        self.status.send_modify(|s| s.role = Some(role.to_string()));
        let remote = self.exchange(role, &local, cancel).await?;
        tracing::info!(%remote, "peer addressing info received");
        self.status.send_modify(|s| s.remote = Some(remote));
        self.enter(SessionState::InfoExchanged);

        scheduler.set_remote(remote);
        binding
            .resolver
            .start(&*device, &local, &remote, pkey, self.events.clone())?;
        self.enter(SessionState::PathPending);

        match scheduler.post_recv() {
            Ok(wr_id) => tracing::debug!(wr_id, "initial receive posted"),
            Err(e) => {
                self.stats.steady_state_failures.increment();
                tracing::warn!(error = %e, "posting initial receive failed");
            }
        }
        binding.scheduler = Some(scheduler);
        Ok(())
    }

    async fn exchange<F>(
        &self,
        role: Role,
        local: &AddressingInfo,
        cancel: F,
    ) -> Result<AddressingInfo, SetupError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        match role {
            Role::Listener { port } => {
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
                let listener = SideChannelListener::bind(addr).await?;
                let bound = listener.local_addr();
                self.status.send_modify(|s| {
                    s.awaiting_peer = true;
                    s.listen_addr = Some(bound);
                });
                let result = tokio::select! {
                    r = listener.exchange(local) => r.map_err(SetupError::from),
                    _ = &mut cancel => Err(SetupError::Cancelled),
                };
                self.status.send_modify(|s| s.awaiting_peer = false);
                result
            }
            Role::Connector { peer } => tokio::select! {
                r = sidechannel::connect_exchange(peer, local) => r.map_err(SetupError::from),
                _ = &mut cancel => Err(SetupError::Cancelled),
            },
        }
    }

    /// Dispatch an asynchronous device notification.
    pub fn handle_verbs_event(&mut self, event: VerbsEvent) {
        match event {
            VerbsEvent::PathRecordComplete {
                query,
                status,
                record,
            } => self.path_complete(query, status, record),
            VerbsEvent::CompletionNotify { cq } => {
                self.stats.notifications.increment();
                tracing::debug!(cq = cq.0, "receive completion notification");
            }
            VerbsEvent::QpAsync { qp_num, event } => {
                tracing::error!(qpn = format_args!("{:#x}", qp_num), ?event, "QP event");
            }
        }
    }

    fn path_complete(&mut self, query: QueryId, status: i32, record: Option<PathRecord>) {
        let Some(binding) = self.binding.as_mut() else {
            tracing::debug!(query = query.0, "path completion with no device bound");
            return;
        };
        let Some(pd) = binding.resources.pd() else {
            tracing::debug!(query = query.0, "path completion after resources were released");
            return;
        };

        let device = Arc::clone(&binding.device);
        match binding.resolver.complete(&*device, pd, query, status, record) {
            Ok(path) => {
                binding.resources.set_ah(path.ah);
                let Some(mut scheduler) = binding.scheduler.take() else {
                    tracing::warn!(query = query.0, "path resolved but no scheduler to arm");
                    return;
                };
                scheduler.set_route(path.ah);
                self.status.send_modify(|s| s.path = Some(path));
                binding.task = Some(SchedulerTask::spawn(scheduler, self.config.send_period()));
                tracing::info!(
                    dlid = path.ah_attr.dlid,
                    period_ms = self.config.send_period_ms,
                    "scheduler armed"
                );
                self.enter(SessionState::Active);
            }
            Err(PathError::UnknownQuery(query)) => {
                tracing::debug!(query = query.0, "ignoring completion of unknown path query");
            }
            Err(e) => {
                tracing::error!(error = %e, "path resolution failed, device left inactive");
                self.status.send_modify(|s| s.last_failure = Some(e.to_string()));
            }
        }
    }

    /// Tear down the binding if `name` is the bound device.
    pub async fn device_removed(&mut self, name: &str) -> bool {
        if self.bound_device() != Some(name) {
            tracing::debug!(device = name, "removal of unbound device ignored");
            return false;
        }
        match self.binding.take() {
            Some(binding) => {
                self.release(binding).await;
                true
            }
            None => false,
        }
    }

    /// Tear down whatever is bound.
    pub async fn shutdown(&mut self) {
        if let Some(binding) = self.binding.take() {
            self.release(binding).await;
        }
    }

    async fn release(&mut self, mut binding: Binding) {
        let name = binding.device.name().to_string();
        if let Some(task) = binding.task.take() {
            task.cancel().await;
        }
        binding.resolver.cancel(&*binding.device);
        binding.scheduler = None;

        let failures = binding.resources.teardown();
        self.stats.teardowns.increment();
        self.stats.teardown_failures.add(failures as u64);
        self.enter(SessionState::TornDown);
        tracing::info!(device = %name, failures, "device released");

        self.status.send_modify(|s| {
            s.state = SessionState::NoDevice;
            s.device = None;
            s.role = None;
            s.awaiting_peer = false;
            s.listen_addr = None;
            s.local = None;
            s.remote = None;
            s.path = None;
        });
    }

    fn enter(&self, state: SessionState) {
        tracing::info!(%state, "session state");
        self.status.send_modify(|s| {
            s.state = state;
            s.reached.push(state);
        });
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.bound_device())
            .field("state", &self.state())
            .finish()
    }
}
