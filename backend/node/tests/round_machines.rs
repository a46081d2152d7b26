//! Protocol state-machine scenarios driven by a synchronous message pump:
//! misbehaving parties, committee rotation, and delivery idempotence.

use curv::arithmetic::{ Converter, Modulo };
use curv::elliptic::curves::{ Point, Scalar, Secp256k1 };
use curv::BigInt;
use sha3::{ Digest, Keccak256 };
use shared::key_info::NodeId;
use smpc_node::crypto::primes::SafePrimePool;
use smpc_node::error::{ AbortReason, FaultKind, MpcError };
use smpc_node::keygen::ecdsa::messages::KeygenMessage;
use smpc_node::keygen::ecdsa::{ EcdsaKeygenRound, KeygenContext, KeygenSaveData };
use smpc_node::party::{ lagrange_coeff, uid_from_node_id, KeyType };
use smpc_node::protocol::dnode::DNode;
use smpc_node::protocol::message::{ Incoming, Outgoing, Recipients };
use smpc_node::protocol::round::{ MpcRound, RoundBase };
use smpc_node::reshare::{ ReshareContext, ReshareRound };
use smpc_node::signing::ecdsa::messages::SignMessage;
use smpc_node::signing::ecdsa::{ EcdsaSignRound, SignContext, SignOutput };
use std::collections::BTreeMap;
use std::sync::{ Arc, OnceLock };
use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver };

const TEST_PAILLIER_BITS: usize = 1024;
const TEST_NTILDE_BITS: usize = 512;

struct Party<R: MpcRound> {
    uid: BigInt,
    node: DNode<R>,
    out_rx: UnboundedReceiver<Outgoing<R::Msg>>,
}

/// Drive a set of parties to completion, routing every outbound message.
/// `tamper` may rewrite a message in flight (return false to drop it);
/// `duplicate` delivers everything twice to exercise idempotence.
fn run_protocol<R, F>(
    mut parties: Vec<Party<R>>,
    mut tamper: F,
    duplicate: bool
) -> Result<Vec<R::Output>, (BigInt, MpcError)>
where
    R: MpcRound,
    F: FnMut(&BigInt, &mut Outgoing<R::Msg>) -> bool,
{
    for party in parties.iter_mut() {
        let uid = party.uid.clone();
        party.node.start().map_err(|e| (uid, e))?;
    }

    loop {
        let mut traffic = Vec::new();
        for (i, party) in parties.iter_mut().enumerate() {
            while let Ok(out) = party.out_rx.try_recv() {
                traffic.push((i, out));
            }
        }
        if traffic.is_empty() {
            break;
        }

        for (sender, mut out) in traffic {
            let sender_uid = parties[sender].uid.clone();
            if !tamper(&sender_uid, &mut out) {
                continue;
            }
            let targets: Vec<usize> = match &out.to {
                Recipients::Broadcast => (0..parties.len()).filter(|j| *j != sender).collect(),
                Recipients::Peers(peers) => parties
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| peers.contains(&p.uid))
                    .map(|(j, _)| j)
                    .collect(),
            };
            for target in targets {
                let incoming = Incoming {
                    from_uid: sender_uid.clone(),
                    from_index: out.from_index,
                    is_broadcast: matches!(out.to, Recipients::Broadcast),
                    round: out.round,
                    payload: out.payload.clone(),
                };
                let deliveries = if duplicate { 2 } else { 1 };
                for _ in 0..deliveries {
                    let uid = parties[target].uid.clone();
                    parties[target].node
                        .deliver(incoming.clone())
                        .map_err(|e| (uid, e))?;
                }
            }
        }
    }

    let mut outputs = Vec::new();
    for party in parties.iter_mut() {
        outputs.push(party.node.take_output().expect("protocol stalled without output"));
    }
    Ok(outputs)
}

fn shared_pool() -> Arc<SafePrimePool> {
    static POOL: OnceLock<Arc<SafePrimePool>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(SafePrimePool::new(3, 8))).clone()
}

fn node_ids(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|n| NodeId::new(n.to_string())).collect()
}

fn sorted_uids(nodes: &[NodeId]) -> Vec<BigInt> {
    let mut uids: Vec<BigInt> = nodes
        .iter()
        .map(|n| uid_from_node_id(n, KeyType::Ec256k1))
        .collect();
    uids.sort();
    uids
}

fn uid_map(nodes: &[NodeId]) -> BTreeMap<String, NodeId> {
    nodes
        .iter()
        .map(|n| (uid_from_node_id(n, KeyType::Ec256k1).to_str_radix(10), n.clone()))
        .collect()
}

fn keygen_parties(
    nodes: &[NodeId],
    threshold: usize,
    paillier_bits: usize
) -> Vec<Party<EcdsaKeygenRound>> {
    let ids = sorted_uids(nodes);
    let map = uid_map(nodes);
    ids.iter()
        .map(|uid| {
            let (out_tx, out_rx) = unbounded_channel();
            let (end_tx, end_rx) = unbounded_channel();
            let base = RoundBase::new(
                "kg-session".to_string(),
                uid.clone(),
                ids.len(),
                threshold,
                paillier_bits,
                TEST_NTILDE_BITS,
                false,
                out_tx,
                end_tx
            );
            let ctx = Arc::new(KeygenContext {
                ids: ids.clone(),
                uid_to_node: map.clone(),
                pool: shared_pool(),
            });
            Party {
                uid: uid.clone(),
                node: DNode::new("kg-session".into(), EcdsaKeygenRound::new(base, ctx), end_rx),
                out_rx,
            }
        })
        .collect()
}

/// Keygen output shared by the signing and reshare scenarios; generated once
/// per test binary because the Paillier material is expensive.
fn keygen_saves() -> &'static Vec<KeygenSaveData> {
    static SAVES: OnceLock<Vec<KeygenSaveData>> = OnceLock::new();
    SAVES.get_or_init(|| {
        let nodes = node_ids(&["party-a", "party-b", "party-c"]);
        let parties = keygen_parties(&nodes, 1, TEST_PAILLIER_BITS);
        run_protocol(parties, |_, _| true, false).expect("keygen must succeed")
    })
}

fn assert_shares_interpolate(saves: &[KeygenSaveData], subset: &[usize]) {
    let order = Scalar::<Secp256k1>::group_order().clone();
    let ids: Vec<BigInt> = subset.iter().map(|i| saves[*i].ids[saves[*i].cur_index].clone()).collect();
    let mut acc = Point::<Secp256k1>::zero();
    for i in subset {
        let save = &saves[*i];
        let uid = &save.ids[save.cur_index];
        let lambda = lagrange_coeff(&ids, uid, &order).unwrap();
        acc = acc + Point::generator() * (Scalar::from_bigint(&lambda) * &save.sk_u);
    }
    assert_eq!(acc, saves[0].pk, "lagrange-weighted shares must reassemble the key");
}

fn sign_parties(
    saves: &[KeygenSaveData],
    signer_positions: &[usize],
    msg_hash: Option<BigInt>
) -> Vec<Party<EcdsaSignRound>> {
    let sign_ids: Vec<BigInt> = {
        let mut ids: Vec<BigInt> = signer_positions
            .iter()
            .map(|i| saves[*i].ids[saves[*i].cur_index].clone())
            .collect();
        ids.sort();
        ids
    };

    signer_positions
        .iter()
        .map(|i| {
            let save = saves[*i].clone();
            let uid = save.ids[save.cur_index].clone();
            let own_index = sign_ids.iter().position(|id| *id == uid).unwrap();
            let (out_tx, out_rx) = unbounded_channel();
            let (end_tx, end_rx) = unbounded_channel();
            let mut base = RoundBase::new(
                "sign-session".to_string(),
                uid.clone(),
                sign_ids.len(),
                save.threshold,
                TEST_PAILLIER_BITS,
                TEST_NTILDE_BITS,
                false,
                out_tx,
                end_tx
            );
            base.index = own_index as i32;
            let ctx = Arc::new(SignContext {
                save,
                sign_ids: sign_ids.clone(),
                msg_hash: msg_hash.clone(),
            });
            Party {
                uid,
                node: DNode::new(
                    "sign-session".into(),
                    EcdsaSignRound::new(base, ctx).unwrap(),
                    end_rx
                ),
                out_rx,
            }
        })
        .collect()
}

fn keccak_hash(data: &[u8]) -> BigInt {
    BigInt::from_bytes(&Keccak256::digest(data))
}

#[test]
fn any_quorum_of_shares_reassembles_the_key() {
    let saves = keygen_saves();
    assert_eq!(saves.len(), 3);
    for subset in [[0usize, 1], [0, 2], [1, 2]] {
        assert_shares_interpolate(saves, &subset);
    }
    // All three public keys agree bit for bit.
    let pk_bytes = saves[0].pk.to_bytes(false).to_vec();
    for save in saves.iter() {
        assert_eq!(save.pk.to_bytes(false).to_vec(), pk_bytes);
    }
}

#[test]
fn two_of_three_sign_and_recover() {
    let saves = keygen_saves();
    let msg = keccak_hash(b"hello");
    let outputs = run_protocol(
        sign_parties(saves, &[0, 1], Some(msg.clone())),
        |_, _| true,
        false
    ).expect("signing must succeed");

    let sig = match &outputs[0] {
        SignOutput::Signature(sig) => sig.clone(),
        SignOutput::PreSign(_) => panic!("expected a signature"),
    };
    for output in &outputs {
        match output {
            SignOutput::Signature(other) => assert_eq!(*other, sig),
            SignOutput::PreSign(_) => panic!("expected a signature"),
        }
    }

    // A different pair produces an equally valid signature for the same key.
    let outputs = run_protocol(sign_parties(saves, &[1, 2], Some(msg)), |_, _| true, false)
        .expect("signing must succeed");
    assert!(matches!(outputs[0], SignOutput::Signature(_)));
}

#[test]
fn duplicated_deliveries_leave_state_unchanged() {
    // Every message is delivered twice; the run must still converge to the
    // same kind of result.
    let nodes = node_ids(&["dup-a", "dup-b", "dup-c"]);
    let parties = keygen_parties(&nodes, 1, 512);
    let saves = run_protocol(parties, |_, _| true, true).expect("keygen must succeed");
    let pk = saves[0].pk.clone();
    for save in &saves {
        assert_eq!(save.pk, pk);
    }
}

#[test]
fn faulty_decommitment_aborts_before_round_four_state() {
    let nodes = node_ids(&["bad-a", "bad-b", "bad-c"]);
    let ids = sorted_uids(&nodes);
    let offender = ids[2].clone();

    let parties = keygen_parties(&nodes, 1, 512);
    let result = run_protocol(
        parties,
        |sender, out| {
            if *sender == offender {
                if let KeygenMessage::R3(body) = &mut out.payload {
                    // Flip a byte of the opening so the hash no longer
                    // matches the round-1 commitment.
                    body.decommit.0[0] ^= 0xff;
                }
            }
            true
        },
        false
    );

    let (victim, err) = result.expect_err("tampered decommitment must abort the session");
    assert_ne!(victim, offender);
    match err {
        MpcError::ProtocolAborted { round, reason, offender: blamed } => {
            assert_eq!(round, 3);
            assert_eq!(reason, AbortReason::CommitMismatch);
            assert_eq!(blamed.as_deref(), Some(offender.to_str_radix(16).as_str()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn bad_mta_ciphertext_is_attributed_and_no_share_leaks() {
    let saves = keygen_saves();
    let sign_ids: Vec<BigInt> = {
        let mut ids: Vec<BigInt> = [0usize, 1]
            .iter()
            .map(|i| saves[*i].ids[saves[*i].cur_index].clone())
            .collect();
        ids.sort();
        ids
    };
    let offender = sign_ids[0].clone();
    let mut saw_share_reveal = false;

    let msg = keccak_hash(b"hello");
    let result = run_protocol(
        sign_parties(saves, &[0, 1], Some(msg)),
        |sender, out| {
            if let SignMessage::R7(_) = &out.payload {
                saw_share_reveal = true;
            }
            if *sender == offender {
                if let SignMessage::R2(body) = &mut out.payload {
                    // Replace the MtA response with a ciphertext unrelated to
                    // the proven statement.
                    body.mb_gamma.c = BigInt::mod_mul(
                        &body.mb_gamma.c,
                        &body.mb_gamma.c,
                        &BigInt::from(u64::MAX)
                    );
                }
            }
            true
        },
        false
    );

    let (victim, err) = result.expect_err("bad MtA ciphertext must abort the session");
    assert_ne!(victim, offender);
    match err {
        MpcError::PeerFaulted { uid, kind } => {
            assert_eq!(kind, FaultKind::RangeProofBad);
            assert_eq!(uid, offender.to_str_radix(16));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!saw_share_reveal, "no signature share may be revealed after the fault");
}

#[test]
fn reshare_preserves_the_key_and_new_quorum_signs() {
    let saves = keygen_saves();
    let old_pk = saves[0].pk.clone();

    // Two of the three original holders donate; the new committee is five
    // nodes (one of them is also a donor) with a 3-of-5 quorum.
    let donors = [0usize, 1];
    let old_nodes: Vec<NodeId> = donors
        .iter()
        .map(|i| {
            let save = &saves[*i];
            save.node_for_uid(&save.ids[save.cur_index]).unwrap().clone()
        })
        .collect();
    let mut new_nodes = node_ids(&["fresh-1", "fresh-2", "fresh-3", "fresh-4"]);
    new_nodes.push(old_nodes[0].clone());
    let new_threshold = 2;

    let old_ids = sorted_uids(&old_nodes);
    let new_ids = sorted_uids(&new_nodes);
    let mut union_ids = old_ids.clone();
    for uid in &new_ids {
        if !union_ids.contains(uid) {
            union_ids.push(uid.clone());
        }
    }
    union_ids.sort();

    let mut all_nodes = old_nodes.clone();
    all_nodes.extend(new_nodes.iter().cloned());
    let map = uid_map(&all_nodes);

    let parties: Vec<Party<ReshareRound>> = union_ids
        .iter()
        .map(|uid| {
            let old_save = saves
                .iter()
                .find(|s| s.ids[s.cur_index] == *uid && old_ids.contains(uid))
                .cloned();
            let (out_tx, out_rx) = unbounded_channel();
            let (end_tx, end_rx) = unbounded_channel();
            let base = RoundBase::new(
                "reshare-session".to_string(),
                uid.clone(),
                union_ids.len(),
                new_threshold,
                TEST_PAILLIER_BITS,
                TEST_NTILDE_BITS,
                old_save.is_some(),
                out_tx,
                end_tx
            );
            let ctx = Arc::new(ReshareContext {
                old_save,
                old_ids: old_ids.clone(),
                new_ids: new_ids.clone(),
                union_ids: union_ids.clone(),
                new_threshold,
                expected_pk: old_pk.clone(),
                uid_to_node: map.clone(),
                pool: shared_pool(),
            });
            Party {
                uid: uid.clone(),
                node: DNode::new("reshare-session".into(), ReshareRound::new(base, ctx), end_rx),
                out_rx,
            }
        })
        .collect();

    let outputs = run_protocol(parties, |_, _| true, false).expect("reshare must succeed");

    let new_saves: Vec<KeygenSaveData> = outputs.into_iter().flatten().collect();
    assert_eq!(new_saves.len(), new_ids.len(), "every new member gets a share");
    for save in &new_saves {
        assert_eq!(
            save.pk.to_bytes(false).to_vec(),
            old_pk.to_bytes(false).to_vec(),
            "public key is preserved"
        );
        assert_eq!(save.threshold, new_threshold);
    }

    // Any three of the five fresh holders can sign for the same address.
    let msg = keccak_hash(b"hello");
    let outputs = run_protocol(
        sign_parties(&new_saves, &[0, 2, 4], Some(msg)),
        |_, _| true,
        false
    ).expect("post-reshare signing must succeed");
    assert!(matches!(outputs[0], SignOutput::Signature(_)));
}

/// A presign tuple generated without a message finalizes into a valid
/// signature with a single exchange.
#[test]
fn presign_then_finalize() {
    let saves = keygen_saves();
    let outputs = run_protocol(sign_parties(saves, &[0, 1], None), |_, _| true, false)
        .expect("presigning must succeed");

    let presigns: Vec<_> = outputs
        .into_iter()
        .map(|o| match o {
            SignOutput::PreSign(p) => p,
            SignOutput::Signature(_) => panic!("expected presign output"),
        })
        .collect();

    let msg = keccak_hash(b"deferred message");
    let sign_ids = presigns[0].sign_ids.clone();

    let parties: Vec<Party<EcdsaSignRound>> = presigns
        .into_iter()
        .enumerate()
        .map(|(slot, presign)| {
            let save = saves[slot].clone();
            let uid = sign_ids[presign.own_index].clone();
            let (out_tx, out_rx) = unbounded_channel();
            let (end_tx, end_rx) = unbounded_channel();
            let mut base = RoundBase::new(
                "finalize-session".to_string(),
                uid.clone(),
                sign_ids.len(),
                save.threshold,
                TEST_PAILLIER_BITS,
                TEST_NTILDE_BITS,
                false,
                out_tx,
                end_tx
            );
            base.index = presign.own_index as i32;
            let ctx = Arc::new(SignContext {
                save,
                sign_ids: sign_ids.clone(),
                msg_hash: Some(msg.clone()),
            });
            Party {
                uid,
                node: DNode::new(
                    "finalize-session".into(),
                    EcdsaSignRound::new_finalize(base, ctx, presign).unwrap(),
                    end_rx
                ),
                out_rx,
            }
        })
        .collect();

    let outputs = run_protocol(parties, |_, _| true, false).expect("finalize must succeed");
    assert!(matches!(outputs[0], SignOutput::Signature(_)));
}
