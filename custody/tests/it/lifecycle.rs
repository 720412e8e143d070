use alloy::primitives::U256;
use custody::{
    CustodyEvent,
    chain::CustodyCall,
    error::CustodyError,
    state::{ChannelStatus, StateIntent},
};

use crate::{CONSENSUS, Harness};

#[test]
fn open_resize_and_close_cooperatively() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);
    assert_eq!(
        harness.chain.channel(channel_id).unwrap().status,
        ChannelStatus::Active
    );
    assert_eq!(harness.available(&harness.creator), U256::from(400));

    let resize = harness.sign(channel_id, harness.resize_state(1, [150, 0], 50, -50), &[0, 1]);
    let broker = harness.broker.clone();
    let receipt = harness
        .call(
            &broker,
            CustodyCall::Resize {
                channel_id,
                candidate: resize,
                proofs: vec![],
            },
        )
        .unwrap();
    assert!(matches!(
        receipt.logs[0].event,
        CustodyEvent::Resized { .. }
    ));
    assert_eq!(harness.available(&harness.creator), U256::from(350));

    let finalize = harness.sign(
        channel_id,
        harness.state(StateIntent::Finalize, 2, [150, 0]),
        &[0, 1],
    );
    let creator = harness.creator.clone();
    harness
        .call(
            &creator,
            CustodyCall::Close {
                channel_id,
                candidate: finalize,
            },
        )
        .unwrap();

    // The whole channel amount of 150 is paid out to the creator.
    assert_eq!(harness.available(&harness.creator), U256::from(500));
    assert_eq!(harness.available(&harness.broker), U256::from(500));
    assert!(harness.chain.channel(channel_id).is_none());
}

#[test]
fn events_follow_the_lifecycle() {
    let mut harness = Harness::new();
    let start = harness.chain.head().number + 1;
    let channel_id = harness.open(CONSENSUS, [100, 0]);

    let events: Vec<_> = harness
        .chain
        .logs(start, harness.chain.head().number)
        .into_iter()
        .map(|log| log.event)
        .collect();
    assert!(matches!(events[0], CustodyEvent::Created { .. }));
    assert_eq!(
        events[1..],
        [
            CustodyEvent::Joined {
                channel_id,
                index: 1
            },
            CustodyEvent::Opened { channel_id },
        ]
    );
}

#[test]
fn reverted_transition_leaves_no_trace() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);
    let before = harness.chain.channel(channel_id).unwrap();
    let head = harness.chain.head();

    // Signed by the creator only.
    let resize = harness.sign(channel_id, harness.resize_state(1, [150, 0], 50, -50), &[0]);
    let creator = harness.creator.clone();
    let error = harness
        .call(
            &creator,
            CustodyCall::Resize {
                channel_id,
                candidate: resize,
                proofs: vec![],
            },
        )
        .unwrap_err();
    assert_eq!(error, CustodyError::InvalidSignature(1));
    assert_eq!(harness.chain.channel(channel_id).unwrap(), before);
    assert_eq!(harness.chain.head(), head);
    assert_eq!(harness.available(&harness.creator), U256::from(400));
}

#[test]
fn resize_releases_funds_to_the_creator() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);
    let resize = harness.sign(channel_id, harness.resize_state(1, [40, 0], -60, 60), &[0, 1]);
    let creator = harness.creator.clone();
    harness
        .call(
            &creator,
            CustodyCall::Resize {
                channel_id,
                candidate: resize,
                proofs: vec![],
            },
        )
        .unwrap();
    assert_eq!(harness.available(&harness.creator), U256::from(460));
    assert_eq!(
        harness.chain.channel(channel_id).unwrap().locked[&crate::TOKEN],
        U256::from(40)
    );
}

#[test]
fn channel_ids_cannot_be_reused_while_open() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [10, 0]);
    let initial = harness.sign(
        channel_id,
        harness.state(StateIntent::Initialize, 0, [10, 0]),
        &[0],
    );
    let creator = harness.creator.clone();
    let channel = harness.channel(CONSENSUS);
    assert_eq!(
        harness.call(&creator, CustodyCall::Create { channel, initial }),
        Err(CustodyError::ChannelExists(channel_id))
    );
}
