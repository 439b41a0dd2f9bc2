//! Queue-pair bring-up: RESET -> INIT -> RTR -> RTS.
//!
//! Each step sets only the attributes legal for that transition. The port
//! is programmed once, on the way into INIT. There are no retries: the
//! first rejected transition ends the handshake.

use udrv_sidechannel::AddressingInfo;
use udrv_verbs::{QpAttr, QpAttrMask, QpState, QueuePair, VerbsDevice};

use crate::config::EngineConfig;
use crate::error::SetupError;

/// Attributes programmed during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpParams {
    pub port_num: u8,
    pub pkey_index: u16,
    pub qkey: u32,
    pub gid_index: u32,
}

impl From<&EngineConfig> for QpParams {
    fn from(config: &EngineConfig) -> Self {
        Self {
            port_num: config.port_num,
            pkey_index: config.pkey_index,
            qkey: config.qkey,
            gid_index: config.gid_index,
        }
    }
}

/// Masks applied by each bring-up step, in order.
pub fn bring_up_steps() -> [(QpState, QpAttrMask); 3] {
    use QpAttrMask as M;
    [
        (QpState::Init, M::STATE | M::PKEY_INDEX | M::PORT | M::QKEY),
        (QpState::ReadyToReceive, M::STATE | M::PKEY_INDEX | M::QKEY),
        (QpState::ReadyToSend, M::STATE | M::QKEY | M::SQ_PSN),
    ]
}

/// Drive `qp` to ready-to-send and return the local addressing info.
///
/// The Q_Key is read back from the queue pair after the last transition, so
/// the record carries what the device actually applied.
pub fn bring_up(
    device: &dyn VerbsDevice,
    qp: QueuePair,
    params: &QpParams,
) -> Result<AddressingInfo, SetupError> {
    let attr = QpAttr {
        qp_state: QpState::Reset,
        pkey_index: params.pkey_index,
        port_num: params.port_num,
        qkey: params.qkey,
        sq_psn: 0,
    };

    for (target, mask) in bring_up_steps() {
        let step = QpAttr {
            qp_state: target,
            ..attr
        };
        device
            .modify_qp(qp.handle, &step, mask)
            .map_err(SetupError::transition(target))?;
        tracing::debug!(qpn = qp.qp_num, state = %target, "QP transitioned");
    }

    let applied = device
        .query_qp(qp.handle, QpAttrMask::QKEY)
        .map_err(SetupError::Query)?;
    let gid = device
        .query_gid(params.port_num, params.gid_index)
        .map_err(SetupError::Query)?;
    let port = device
        .query_port(params.port_num)
        .map_err(SetupError::Query)?;

    let local = AddressingInfo {
        gid,
        qp_num: qp.qp_num,
        lid: port.lid,
        qkey: applied.qkey,
    };
    tracing::info!(%local, "QP ready to send");
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use udrv_verbs::error::libc_errno::EINVAL;
    use udrv_verbs::sim::{SimDevice, SimFabric, SimOp};

    use crate::resources::{ResourceParams, ResourceSet};

    fn setup() -> (Arc<SimDevice>, ResourceSet) {
        let dev = SimFabric::new().add_device("sim0", 5);
        let (tx, _rx) = mpsc::unbounded_channel();
        let set = ResourceSet::setup(
            dev.clone(),
            ResourceParams::from(&EngineConfig::default()),
            &tx,
        )
        .unwrap();
        (dev, set)
    }

    #[test]
    fn test_bring_up() {
        let (dev, set) = setup();
        let qp = set.qp().unwrap();
        let params = QpParams {
            qkey: 0x1111_1111,
            ..QpParams::from(&EngineConfig::default())
        };
        let local = bring_up(&*dev, qp, &params).unwrap();

        assert_eq!(local.qp_num, qp.qp_num);
        assert_eq!(local.lid, 5);
        assert_eq!(local.gid, dev.gid());
        assert_eq!(local.qkey, 0x1111_1111);

        let states: Vec<QpState> = dev.qp_modifications().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![QpState::Init, QpState::ReadyToReceive, QpState::ReadyToSend]
        );
    }

    #[test]
    fn test_port_only_set_entering_init() {
        let (dev, set) = setup();
        bring_up(
            &*dev,
            set.qp().unwrap(),
            &QpParams::from(&EngineConfig::default()),
        )
        .unwrap();

        let mods = dev.qp_modifications();
        assert!(mods[0].1.contains(QpAttrMask::PORT));
        assert!(mods[1..]
            .iter()
            .all(|(_, mask)| !mask.contains(QpAttrMask::PORT)));
        assert!(mods[2].1.contains(QpAttrMask::SQ_PSN));
    }

    #[test]
    fn test_steps_are_legal_ud_transitions() {
        let mut from = QpState::Reset;
        for (to, mask) in bring_up_steps() {
            let (required, allowed) = QpState::ud_transition_masks(from, to).unwrap();
            assert!(mask.contains(required), "{from} -> {to}");
            assert!(allowed.contains(mask), "{from} -> {to}");
            from = to;
        }
    }

    #[test]
    fn test_rejected_transition_is_terminal() {
        let (dev, set) = setup();
        let ops_before = dev.count(SimOp::ModifyQp);
        dev.fail_next(SimOp::ModifyQp, EINVAL);
        let err = bring_up(
            &*dev,
            set.qp().unwrap(),
            &QpParams::from(&EngineConfig::default()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SetupError::Transition {
                target: QpState::Init,
                ..
            }
        ));
        assert_eq!(dev.count(SimOp::ModifyQp), ops_before + 1);
        assert_eq!(dev.count(SimOp::QueryQp), 0);
    }

    #[test]
    fn test_bad_port_rejected() {
        let (dev, set) = setup();
        let params = QpParams {
            port_num: 2,
            ..QpParams::from(&EngineConfig::default())
        };
        let err = bring_up(&*dev, set.qp().unwrap(), &params).unwrap_err();
        assert!(matches!(
            err,
            SetupError::Transition {
                target: QpState::Init,
                ..
            }
        ));
        assert!(dev.qp_modifications().is_empty());
    }
}
