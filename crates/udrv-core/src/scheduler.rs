//! Steady-state heartbeat.
//!
//! Once the path is resolved, every period the scheduler posts one datagram
//! to the peer, re-arms the receive CQ notification, reaps at most one
//! receive completion (reposting the receive buffer whenever one was
//! consumed) and reaps at most one send completion. Individual failures are
//! logged and counted; only cancellation stops the schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use udrv_sidechannel::AddressingInfo;
use udrv_verbs::{
    AhHandle, CqHandle, DmaAddr, QueuePair, RecvWr, SendWr, Sge, UdDest, VerbsDevice, VerbsError,
    WorkCompletion,
};

use crate::error::{ResourceKind, SetupError};
use crate::resources::ResourceSet;
use crate::stats::SessionStats;

/// The handles the datapath touches, copied out of a [`ResourceSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datapath {
    pub qp: QueuePair,
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub lkey: u32,
    pub send_addr: DmaAddr,
    pub send_len: u32,
    pub recv_addr: DmaAddr,
    pub recv_len: u32,
}

impl Datapath {
    /// Fails with the first datapath resource that does not exist, or when
    /// a length does not fit a scatter/gather entry.
    ///
    /// Sends carry `payload_size` bytes; receives offer the whole buffer,
    /// since the device writes the route header ahead of the payload.
    pub fn from_resources(set: &ResourceSet, payload_size: usize) -> Result<Self, SetupError> {
        let missing = SetupError::Incomplete;
        let send = set.send_buf().ok_or(missing(ResourceKind::SendBuffer))?;
        let recv = set.recv_buf().ok_or(missing(ResourceKind::RecvBuffer))?;
        Ok(Self {
            qp: set.qp().ok_or(missing(ResourceKind::QueuePair))?,
            send_cq: set.send_cq().ok_or(missing(ResourceKind::SendCq))?,
            recv_cq: set.recv_cq().ok_or(missing(ResourceKind::RecvCq))?,
            lkey: set.mr().ok_or(missing(ResourceKind::MemoryRegion))?.lkey,
            send_addr: send.addr,
            send_len: sge_len(payload_size.min(send.len()))?,
            recv_addr: recv.addr,
            recv_len: sge_len(recv.len())?,
        })
    }
}

fn sge_len(len: usize) -> Result<u32, SetupError> {
    u32::try_from(len).map_err(|_| SetupError::PayloadTooLarge {
        len,
        max: u32::MAX,
    })
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// No route yet; nothing was posted or polled.
    pub idle: bool,
    /// Id of the send posted this tick.
    pub sent: Option<u64>,
    pub received: Option<WorkCompletion>,
    /// Id of the receive reposted after a receive completion.
    pub reposted: Option<u64>,
    pub send_completion: Option<WorkCompletion>,
}

pub struct Scheduler {
    device: Arc<dyn VerbsDevice>,
    path: Datapath,
    port_num: u8,
    remote: Option<AddressingInfo>,
    ah: Option<AhHandle>,
    next_send_id: u64,
    next_recv_id: u64,
    stats: Arc<SessionStats>,
}

impl Scheduler {
    pub fn new(
        device: Arc<dyn VerbsDevice>,
        path: Datapath,
        port_num: u8,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            device,
            path,
            port_num,
            remote: None,
            ah: None,
            next_send_id: 1,
            next_recv_id: 1,
            stats,
        }
    }

    pub fn set_remote(&mut self, remote: AddressingInfo) {
        self.remote = Some(remote);
    }

    pub fn set_route(&mut self, ah: AhHandle) {
        self.ah = Some(ah);
    }

    pub fn is_routable(&self) -> bool {
        self.remote.is_some() && self.ah.is_some()
    }

    /// Identifier the next send will carry.
    pub fn next_send_id(&self) -> u64 {
        self.next_send_id
    }

    /// Post the receive buffer. Returns the work request id.
    pub fn post_recv(&mut self) -> Result<u64, VerbsError> {
        let wr = RecvWr {
            wr_id: self.next_recv_id,
            sge: Sge {
                addr: self.path.recv_addr,
                length: self.path.recv_len,
                lkey: self.path.lkey,
            },
        };
        self.device.post_recv(self.path.qp.handle, &wr)?;
        self.next_recv_id += 1;
        Ok(wr.wr_id)
    }

    /// Run one heartbeat.
    pub fn tick(&mut self) -> TickReport {
        self.stats.ticks.increment();
        let (Some(remote), Some(ah)) = (self.remote, self.ah) else {
            self.stats.idle_ticks.increment();
            tracing::trace!("no route to peer yet, tick skipped");
            return TickReport {
                idle: true,
                ..TickReport::default()
            };
        };

        let mut report = TickReport::default();
        let dev = Arc::clone(&self.device);

        let wr = SendWr {
            wr_id: self.next_send_id,
            sge: Sge {
                addr: self.path.send_addr,
                length: self.path.send_len,
                lkey: self.path.lkey,
            },
            ud: UdDest {
                ah,
                remote_qpn: remote.qp_num,
                remote_qkey: remote.qkey,
                port_num: self.port_num,
            },
        };
        self.next_send_id += 1;
        match dev.post_send(self.path.qp.handle, &wr) {
            Ok(()) => {
                self.stats.sends_posted.increment();
                tracing::debug!(wr_id = wr.wr_id, "send posted");
                report.sent = Some(wr.wr_id);
            }
            Err(e) => {
                self.stats.send_failures.increment();
                tracing::warn!(wr_id = wr.wr_id, error = %e, "post_send failed");
            }
        }

        if let Err(e) = dev.req_notify_cq(self.path.recv_cq) {
            self.stats.steady_state_failures.increment();
            tracing::warn!(error = %e, "re-arming receive CQ failed");
        }

        match dev.poll_cq(self.path.recv_cq, 1) {
            Ok(wcs) => {
                if let Some(wc) = wcs.into_iter().next() {
                    self.stats.recv_completions.increment();
                    if !wc.status.is_success() {
                        self.stats.recv_errors.increment();
                    }
                    tracing::debug!(
                        wr_id = wc.wr_id,
                        status = ?wc.status,
                        opcode = ?wc.opcode,
                        len = wc.byte_len,
                        src_qp = wc.src_qp,
                        "receive completion"
                    );
                    report.received = Some(wc);
                    match self.post_recv() {
                        Ok(id) => {
                            self.stats.recv_reposts.increment();
                            report.reposted = Some(id);
                        }
                        Err(e) => {
                            self.stats.steady_state_failures.increment();
                            tracing::warn!(error = %e, "reposting receive failed");
                        }
                    }
                }
            }
            Err(e) => {
                self.stats.steady_state_failures.increment();
                tracing::warn!(error = %e, "polling receive CQ failed");
            }
        }

        match dev.poll_cq(self.path.send_cq, 1) {
            Ok(wcs) => {
                if let Some(wc) = wcs.into_iter().next() {
                    self.stats.send_completions.increment();
                    tracing::trace!(wr_id = wc.wr_id, status = ?wc.status, "send completion");
                    report.send_completion = Some(wc);
                }
            }
            Err(e) => {
                self.stats.steady_state_failures.increment();
                tracing::warn!(error = %e, "polling send CQ failed");
            }
        }

        report
    }
}

/// A running scheduler, ticking on a fixed period until cancelled.
pub struct SchedulerTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Scheduler>,
}

impl SchedulerTask {
    /// Spawn the periodic task. The first tick fires one period from now.
    pub fn spawn(mut scheduler: Scheduler, period: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        scheduler.tick();
                    }
                }
            }
            tracing::debug!("scheduler stopped");
            scheduler
        });
        Self { stop, handle }
    }

    /// Stop the task and wait for it. No tick runs after this returns.
    pub async fn cancel(self) -> Option<Scheduler> {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
                None
            }
        }
    }
}
