//! Path resolution to the peer.
//!
//! A single path-record query is issued with the peer's LID as destination.
//! Its completion arrives as a [`udrv_verbs::VerbsEvent::PathRecordComplete`]
//! and is handed to [`PathResolver::complete`], which turns a successful
//! record into an address handle. A failed query is dropped, never retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use udrv_sidechannel::AddressingInfo;
use udrv_verbs::{
    AhAttr, AhHandle, EventSink, PathQuery, PathRecord, PdHandle, QueryId, VerbsDevice,
};

use crate::error::PathError;

/// The route to the peer and the address handle derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPath {
    pub record: PathRecord,
    pub ah_attr: AhAttr,
    pub ah: AhHandle,
}

#[derive(Debug)]
pub struct PathResolver {
    port_num: u8,
    timeout: Duration,
    in_flight: Option<QueryId>,
}

impl PathResolver {
    pub fn new(port_num: u8, timeout: Duration) -> Self {
        Self {
            port_num,
            timeout,
            in_flight: None,
        }
    }

    pub fn in_flight(&self) -> Option<QueryId> {
        self.in_flight
    }

    /// Issue the path query. Only one query may be outstanding.
    pub fn start(
        &mut self,
        device: &dyn VerbsDevice,
        local: &AddressingInfo,
        remote: &AddressingInfo,
        pkey: u16,
        sink: EventSink,
    ) -> Result<QueryId, PathError> {
        if self.in_flight.is_some() {
            return Err(PathError::AlreadyInFlight);
        }
        let query = PathQuery {
            dlid: remote.lid,
            slid: local.lid,
            pkey,
            num_paths: 1,
        };
        let id = device
            .query_path(self.port_num, &query, self.timeout, sink)
            .map_err(PathError::Submit)?;
        tracing::info!(
            query = id.0,
            dlid = query.dlid,
            slid = query.slid,
            pkey = format_args!("{:#06x}", pkey),
            "path query started"
        );
        self.in_flight = Some(id);
        Ok(id)
    }

    /// Handle the completion of `query` and create the address handle.
    ///
    /// A completion for any query other than the outstanding one is
    /// rejected without disturbing the outstanding query.
    pub fn complete(
        &mut self,
        device: &dyn VerbsDevice,
        pd: PdHandle,
        query: QueryId,
        status: i32,
        record: Option<PathRecord>,
    ) -> Result<ResolvedPath, PathError> {
        if self.in_flight != Some(query) {
            return Err(PathError::UnknownQuery(query));
        }
        self.in_flight = None;

        tracing::info!(query = query.0, status, "path query completed");
        let record = match (status, record) {
            (0, Some(record)) => record,
            (status, _) => return Err(PathError::Failed { status }),
        };

        let ah_attr = device
            .init_ah_from_path(self.port_num, &record)
            .map_err(PathError::AddressHandle)?;
        tracing::info!(
            dlid = ah_attr.dlid,
            sl = ah_attr.sl,
            port = ah_attr.port_num,
            global = ah_attr.grh.is_some(),
            "address handle attributes"
        );
        let ah = device
            .create_ah(pd, &ah_attr)
            .map_err(PathError::AddressHandle)?;

        Ok(ResolvedPath {
            record,
            ah_attr,
            ah,
        })
    }

    /// Abandon the outstanding query, if any.
    pub fn cancel(&mut self, device: &dyn VerbsDevice) {
        if let Some(id) = self.in_flight.take() {
            tracing::debug!(query = id.0, "cancelling path query");
            device.cancel_path_query(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use udrv_verbs::error::libc_errno::{EINVAL, ETIMEDOUT};
    use udrv_verbs::sim::{PathMode, SimDevice, SimFabric, SimOp};
    use udrv_verbs::{Gid, VerbsEvent};

    struct Fixture {
        fabric: SimFabric,
        dev: Arc<SimDevice>,
        pd: PdHandle,
        local: AddressingInfo,
        remote: AddressingInfo,
    }

    fn fixture() -> Fixture {
        let fabric = SimFabric::new();
        let dev = fabric.add_device("sim0", 1);
        let peer = fabric.add_device("sim1", 2);
        let pd = dev.alloc_pd().unwrap();
        let info = |d: &SimDevice| AddressingInfo {
            gid: d.gid(),
            qp_num: 0x48,
            lid: d.lid(),
            qkey: 0,
        };
        Fixture {
            local: info(&*dev),
            remote: info(&*peer),
            fabric,
            dev,
            pd,
        }
    }

    fn resolver() -> PathResolver {
        PathResolver::new(1, Duration::from_millis(10_000))
    }

    fn completion(rx: &mut mpsc::UnboundedReceiver<VerbsEvent>) -> (QueryId, i32, Option<PathRecord>) {
        match rx.try_recv().unwrap() {
            VerbsEvent::PathRecordComplete {
                query,
                status,
                record,
            } => (query, status, record),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_resolve_creates_address_handle() {
        let f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        let id = resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx)
            .unwrap();
        assert_eq!(resolver.in_flight(), Some(id));

        let (query, status, record) = completion(&mut rx);
        let path = resolver
            .complete(&*f.dev, f.pd, query, status, record)
            .unwrap();
        assert_eq!(path.record.dlid, 2);
        assert_eq!(path.record.slid, 1);
        assert_eq!(path.record.dgid, f.remote.gid);
        assert_eq!(path.ah_attr.dlid, 2);
        assert_eq!(f.dev.live_objects().ahs, 1);
        assert!(resolver.in_flight().is_none());
    }

    #[test]
    fn test_second_start_rejected() {
        let f = fixture();
        f.fabric.set_path_mode(PathMode::Manual);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx.clone())
            .unwrap();
        let err = resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx)
            .unwrap_err();
        assert_eq!(err, PathError::AlreadyInFlight);
        assert_eq!(f.dev.count(SimOp::QueryPath), 1);
    }

    #[test]
    fn test_timeout_drops_query() {
        let f = fixture();
        f.fabric.set_path_mode(PathMode::Timeout);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx)
            .unwrap();
        let (query, status, record) = completion(&mut rx);
        let err = resolver
            .complete(&*f.dev, f.pd, query, status, record)
            .unwrap_err();
        assert_eq!(err, PathError::Failed { status: -ETIMEDOUT });
        assert_eq!(f.dev.count(SimOp::CreateAh), 0);
        assert!(resolver.in_flight().is_none());
    }

    #[test]
    fn test_stale_completion_ignored() {
        let f = fixture();
        f.fabric.set_path_mode(PathMode::Manual);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        let id = resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx)
            .unwrap();
        let stale = QueryId(id.0 + 100);
        let err = resolver
            .complete(&*f.dev, f.pd, stale, 0, None)
            .unwrap_err();
        assert_eq!(err, PathError::UnknownQuery(stale));
        assert_eq!(resolver.in_flight(), Some(id));
    }

    #[test]
    fn test_cancel_outstanding() {
        let f = fixture();
        f.fabric.set_path_mode(PathMode::Manual);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        let id = resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx)
            .unwrap();
        resolver.cancel(&*f.dev);
        assert!(resolver.in_flight().is_none());
        assert_eq!(f.fabric.pending_path_queries(), 0);

        // The cancellation completion no longer matches anything.
        let (query, status, record) = completion(&mut rx);
        assert_eq!(query, id);
        assert!(resolver
            .complete(&*f.dev, f.pd, query, status, record)
            .is_err());
    }

    #[test]
    fn test_submit_failure() {
        let f = fixture();
        f.dev.fail_next(SimOp::QueryPath, EINVAL);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        let err = resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx)
            .unwrap_err();
        assert!(matches!(err, PathError::Submit(_)));
        assert!(resolver.in_flight().is_none());
    }

    #[test]
    fn test_address_handle_failure() {
        let f = fixture();
        f.dev.fail_next(SimOp::CreateAh, EINVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        resolver
            .start(&*f.dev, &f.local, &f.remote, 0xffff, tx)
            .unwrap();
        let (query, status, record) = completion(&mut rx);
        let err = resolver
            .complete(&*f.dev, f.pd, query, status, record)
            .unwrap_err();
        assert!(matches!(err, PathError::AddressHandle(_)));
        assert_eq!(f.dev.live_objects().ahs, 0);
    }

    #[test]
    fn test_unknown_destination_fails() {
        let f = fixture();
        let remote = AddressingInfo {
            gid: Gid::default(),
            lid: 99,
            ..f.remote
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut resolver = resolver();
        resolver
            .start(&*f.dev, &f.local, &remote, 0xffff, tx)
            .unwrap();
        let (query, status, record) = completion(&mut rx);
        assert!(matches!(
            resolver.complete(&*f.dev, f.pd, query, status, record),
            Err(PathError::Failed { .. })
        ));
    }
}
