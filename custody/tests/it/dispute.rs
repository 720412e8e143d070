use alloy::primitives::U256;
use custody::{
    CustodyEvent,
    chain::CustodyCall,
    error::CustodyError,
    state::{ChannelStatus, StateIntent},
};

use crate::{CONSENSUS, Harness, REMITTANCE};

#[test]
fn checkpoint_resolves_a_dispute() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);

    let v3 = harness.sign(channel_id, harness.state(StateIntent::Operate, 3, [80, 20]), &[0, 1]);
    let creator = harness.creator.clone();
    let challenger_signature = creator.sign_hash(v3.challenge_hash(channel_id));
    let receipt = harness
        .call(
            &creator,
            CustodyCall::Challenge {
                channel_id,
                candidate: v3,
                proofs: vec![],
                challenger_signature,
            },
        )
        .unwrap();
    let now = harness.chain.head().timestamp;
    let CustodyEvent::Challenged { expiration, .. } = receipt.logs[0].event else {
        panic!("expected a challenge event");
    };
    assert_eq!(expiration, now + 3_600);
    let record = harness.chain.channel(channel_id).unwrap();
    assert_eq!(record.status, ChannelStatus::Dispute);
    assert_eq!(record.challenge_expiry, expiration);

    harness.chain.advance_time(1_800);
    let v4 = harness.sign(channel_id, harness.state(StateIntent::Operate, 4, [70, 30]), &[0, 1]);
    let broker = harness.broker.clone();
    harness
        .call(
            &broker,
            CustodyCall::Checkpoint {
                channel_id,
                candidate: v4,
                proofs: vec![],
            },
        )
        .unwrap();
    let record = harness.chain.channel(channel_id).unwrap();
    assert_eq!(record.status, ChannelStatus::Active);
    assert_eq!(record.challenge_expiry, 0);
    assert_eq!(record.version(), 4);
}

#[test]
fn unresponsive_counterparty_cannot_block_settlement() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);
    let v2 = harness.sign(channel_id, harness.state(StateIntent::Operate, 2, [90, 10]), &[0, 1]);
    let broker = harness.broker.clone();
    let challenger_signature = broker.sign_hash(v2.challenge_hash(channel_id));
    harness
        .call(
            &broker,
            CustodyCall::Challenge {
                channel_id,
                candidate: v2.clone(),
                proofs: vec![],
                challenger_signature,
            },
        )
        .unwrap();

    harness.chain.advance_time(3_599);
    assert_eq!(
        harness.call(
            &broker,
            CustodyCall::Close {
                channel_id,
                candidate: v2.clone(),
            }
        ),
        Err(CustodyError::ChallengeNotExpired)
    );

    harness.chain.advance_time(1);
    harness
        .call(
            &broker,
            CustodyCall::Close {
                channel_id,
                candidate: v2,
            },
        )
        .unwrap();
    assert_eq!(harness.available(&harness.creator), U256::from(490));
    assert_eq!(harness.available(&harness.broker), U256::from(510));
}

#[test]
fn versions_strictly_increase() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);
    let broker = harness.broker.clone();
    for (version, expected) in [
        (2, Ok(())),
        (2, Err(CustodyError::StaleState)),
        (1, Err(CustodyError::StaleState)),
        (3, Ok(())),
    ] {
        let state = harness.sign(
            channel_id,
            harness.state(StateIntent::Operate, version, [50, 50]),
            &[0, 1],
        );
        let result = harness
            .call(
                &broker,
                CustodyCall::Checkpoint {
                    channel_id,
                    candidate: state,
                    proofs: vec![],
                },
            )
            .map(|_| ());
        assert_eq!(result, expected, "version {version}");
    }
}

#[test]
fn operate_transitions_conserve_totals() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);
    let broker = harness.broker.clone();
    for amounts in [[100, 1], [99, 0], [0, 0]] {
        let state = harness.sign(
            channel_id,
            harness.state(StateIntent::Operate, 1, amounts),
            &[0, 1],
        );
        assert_eq!(
            harness.call(
                &broker,
                CustodyCall::Checkpoint {
                    channel_id,
                    candidate: state,
                    proofs: vec![],
                },
            ),
            Err(CustodyError::InvalidState),
            "{amounts:?}"
        );
    }
}

#[test]
fn remittance_accepts_payer_signed_payments() {
    let mut harness = Harness::new();
    let channel_id = harness.open(REMITTANCE, [100, 0]);
    let first = harness.sign(channel_id, harness.state(StateIntent::Operate, 1, [90, 10]), &[0]);
    let second = harness.sign(channel_id, harness.state(StateIntent::Operate, 2, [75, 25]), &[0]);

    let broker = harness.broker.clone();
    let challenger_signature = broker.sign_hash(second.challenge_hash(channel_id));
    let stored = harness.chain.channel(channel_id).unwrap().last_valid_state;
    harness
        .call(
            &broker,
            CustodyCall::Challenge {
                channel_id,
                candidate: second,
                proofs: vec![stored, first],
                challenger_signature,
            },
        )
        .unwrap();
    harness.chain.advance_time(3_600);
    let last = harness.chain.channel(channel_id).unwrap().last_valid_state;
    harness
        .call(
            &broker,
            CustodyCall::Close {
                channel_id,
                candidate: last,
            },
        )
        .unwrap();
    assert_eq!(harness.available(&harness.broker), U256::from(525));
}

#[test]
fn stored_state_is_enough_to_exit() {
    let mut harness = Harness::new();
    let channel_id = harness.open(CONSENSUS, [100, 0]);
    let creator = harness.creator.clone();

    // The broker never signs anything after joining.
    let stored = harness.chain.channel(channel_id).unwrap().last_valid_state;
    let challenger_signature = creator.sign_hash(stored.challenge_hash(channel_id));
    harness
        .call(
            &creator,
            CustodyCall::Challenge {
                channel_id,
                candidate: stored.clone(),
                proofs: vec![],
                challenger_signature,
            },
        )
        .unwrap();
    assert_eq!(
        harness.chain.channel(channel_id).unwrap().status,
        ChannelStatus::Dispute
    );

    harness.chain.advance_time(3_600);
    harness
        .call(
            &creator,
            CustodyCall::Close {
                channel_id,
                candidate: stored,
            },
        )
        .unwrap();
    assert!(harness.chain.channel(channel_id).is_none());
    assert_eq!(harness.available(&harness.creator), U256::from(500));
    assert_eq!(harness.available(&harness.broker), U256::from(500));
}
