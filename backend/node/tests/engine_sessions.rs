//! End-to-end engine sessions over an in-memory bus: framing, worker
//! routing, acceptance records, timeouts and the retry policy.

use curv::arithmetic::Converter;
use curv::BigInt;
use sha3::{ Digest, Keccak256 };
use shared::accept::{ AcceptReqAddrData, Mode, Status };
use shared::key_info::NodeId;
use smpc_node::communication::bus::LocalBus;
use smpc_node::config::Config;
use smpc_node::engine::{ EdSignRequest, Engine, KeygenRequest, SignRequest };
use smpc_node::error::MpcError;
use smpc_node::party::{ Group, KeyType };
use smpc_node::signing::ecdsa::scalar_to_32_bytes;
use smpc_node::storage::{ load_record, request_key, MemoryStore, Table };
use std::sync::Arc;
use std::time::Duration;

struct TestNode {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    node_id: NodeId,
}

fn spawn_network(names: &[&str], cfg: Config) -> (Arc<LocalBus>, Vec<TestNode>) {
    let bus = Arc::new(LocalBus::new());
    let mut nodes = Vec::new();
    for name in names {
        let node_id = NodeId::new(name.to_string());
        let mut rx = bus.register(node_id.clone());
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(node_id.clone(), cfg.clone(), bus.clone(), store.clone());
        let pump_engine = engine.clone();
        tokio::spawn(async move {
            while let Some((session_id, bytes)) = rx.recv().await {
                let _ = pump_engine.deliver_message(&session_id, &bytes);
            }
        });
        nodes.push(TestNode { engine, store, node_id });
    }
    (bus, nodes)
}

fn group_of(nodes: &[TestNode], threshold: usize) -> Group {
    Group::new(
        "test-group".to_string(),
        nodes.iter().map(|n| n.node_id.clone()).collect(),
        threshold
    ).unwrap()
}

fn keygen_request(nodes: &[TestNode], threshold: usize, key_id: &str, key_type: KeyType) -> KeygenRequest {
    KeygenRequest {
        key_id: key_id.to_string(),
        group: group_of(nodes, threshold),
        key_type,
        initiator: nodes[0].node_id.clone(),
        mode: Mode::SelfApprove,
    }
}

fn fast_config() -> Config {
    Config {
        paillier_bits: 1024,
        ntilde_bits: 512,
        prime_workers: 2,
        ..Config::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ecdsa_keygen_sign_and_presign_over_the_bus() {
    let (_bus, nodes) = spawn_network(&["alpha", "beta", "gamma"], fast_config());
    let request = keygen_request(&nodes, 1, "wallet-1", KeyType::Ec256k1);

    let (a, b, c) = tokio::join!(
        nodes[0].engine.start_keygen(request.clone()),
        nodes[1].engine.start_keygen(request.clone()),
        nodes[2].engine.start_keygen(request.clone())
    );
    let save_a = a.unwrap();
    let save_b = b.unwrap();
    let save_c = c.unwrap();
    assert_eq!(save_a.pk, save_b.pk);
    assert_eq!(save_b.pk, save_c.pk);

    // The acceptance record reached its terminal state on every node.
    let canonical = format!("REQADDR:EC256K1:wallet-1:{}:{}", request.group.gid, 1);
    let record: AcceptReqAddrData = load_record(
        nodes[0].store.as_ref(),
        Table::ReqAddrInfo,
        &request_key(&canonical)
    ).unwrap().expect("record must exist");
    assert_eq!(record.status, Status::Success);
    assert!(record.pub_key.is_some());

    // Sign with two of the three; the third node stays idle.
    let msg_hash = Keccak256::digest(b"hello").to_vec();
    let sign_request = SignRequest {
        key_id: "wallet-1".to_string(),
        signers: vec![nodes[0].node_id.clone(), nodes[1].node_id.clone()],
        msg_hash: msg_hash.clone(),
        initiator: nodes[0].node_id.clone(),
        mode: Mode::SelfApprove,
        use_presign: false,
    };
    let (sig_a, sig_b) = tokio::join!(
        nodes[0].engine.start_sign(sign_request.clone()),
        nodes[1].engine.start_sign(sign_request.clone())
    );
    let sig_a = sig_a.unwrap();
    assert_eq!(sig_a, sig_b.unwrap());

    // The signature recovers to the generated key.
    use secp256k1::recovery::{ RecoverableSignature, RecoveryId };
    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&scalar_to_32_bytes(&sig_a.r));
    compact[32..].copy_from_slice(&scalar_to_32_bytes(&sig_a.s));
    let rec_sig = RecoverableSignature::from_compact(
        &compact,
        RecoveryId::from_i32(i32::from(sig_a.recid)).unwrap()
    ).unwrap();
    let message = secp256k1::Message::from_slice(&msg_hash).unwrap();
    let recovered = secp256k1::Secp256k1::new().recover(&message, &rec_sig).unwrap();
    let mut expected = save_a.pk.to_bytes(false).to_vec();
    if expected.len() == 64 {
        expected.insert(0, 4u8);
    }
    assert_eq!(recovered.serialize_uncompressed().to_vec(), expected);

    // Presign, then consume the cached tuple with a one-round finalize.
    let signers = vec![nodes[0].node_id.clone(), nodes[1].node_id.clone()];
    let (pa, pb) = tokio::join!(
        nodes[0].engine.start_presign("wallet-1", signers.clone()),
        nodes[1].engine.start_presign("wallet-1", signers.clone())
    );
    pa.unwrap();
    pb.unwrap();
    assert_eq!(nodes[0].engine.cached_presigns("wallet-1"), 1);

    let fast_sign = SignRequest {
        msg_hash: Keccak256::digest(b"second message").to_vec(),
        use_presign: true,
        ..sign_request
    };
    let (fa, fb) = tokio::join!(
        nodes[0].engine.start_sign(fast_sign.clone()),
        nodes[1].engine.start_sign(fast_sign.clone())
    );
    let fa = fa.unwrap();
    assert_eq!(fa, fb.unwrap());
    assert_eq!(nodes[0].engine.cached_presigns("wallet-1"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn eddsa_two_of_three_sign_verifies_under_dalek() {
    let (_bus, nodes) = spawn_network(&["ed-a", "ed-b", "ed-c"], Config::default());
    let request = keygen_request(&nodes, 1, "ed-wallet", KeyType::Ed25519);

    let (a, b, c) = tokio::join!(
        nodes[0].engine.start_keygen_ed(request.clone()),
        nodes[1].engine.start_keygen_ed(request.clone()),
        nodes[2].engine.start_keygen_ed(request.clone())
    );
    let save_a = a.unwrap();
    let save_b = b.unwrap();
    c.unwrap();
    assert_eq!(save_a.pk, save_b.pk);

    let message = b"hello over the edwards curve".to_vec();
    let sign_request = EdSignRequest {
        key_id: "ed-wallet".to_string(),
        signers: vec![nodes[1].node_id.clone(), nodes[2].node_id.clone()],
        message: message.clone(),
        initiator: nodes[1].node_id.clone(),
        mode: Mode::SelfApprove,
    };
    let (sb, sc) = tokio::join!(
        nodes[1].engine.start_sign_ed(sign_request.clone()),
        nodes[2].engine.start_sign_ed(sign_request.clone())
    );
    let sig = sb.unwrap();
    assert_eq!(sig, sc.unwrap());

    let dalek_pk = ed25519_dalek::PublicKey::from_bytes(&save_a.pk.to_bytes(true)).unwrap();
    let dalek_sig = ed25519_dalek::Signature::from_bytes(&sig.to_bytes()).unwrap();
    use ed25519_dalek::Verifier;
    assert!(dalek_pk.verify(&message, &dalek_sig).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn late_party_times_out_first_attempt_then_retry_succeeds() {
    let cfg = Config {
        wait_agree: Duration::from_secs(6),
        wait_msg: Duration::from_secs(3),
        try_times: 2,
        paillier_bits: 256,
        ntilde_bits: 256,
        prime_workers: 2,
        ..Config::default()
    };
    let (_bus, nodes) = spawn_network(&["slow-a", "slow-b", "slow-c"], cfg);
    let request = keygen_request(&nodes, 1, "slow-wallet", KeyType::Ec256k1);

    let late_engine = nodes[2].engine.clone();
    let late_request = request.clone();
    let (a, b, c) = tokio::join!(
        nodes[0].engine.start_keygen(request.clone()),
        nodes[1].engine.start_keygen(request.clone()),
        async move {
            // Misses the whole first attempt; everyone converges on the
            // retry session derived from the same request key.
            tokio::time::sleep(Duration::from_secs(7)).await;
            late_engine.start_keygen(late_request).await
        }
    );
    let save_a = a.unwrap();
    assert_eq!(save_a.pk, b.unwrap().pk);
    assert_eq!(save_a.pk, c.unwrap().pk);
}

#[tokio::test(flavor = "multi_thread")]
async fn signing_an_unknown_key_is_bad_input() {
    let (_bus, nodes) = spawn_network(&["lone"], Config::default());
    let err = nodes[0].engine
        .start_sign(SignRequest {
            key_id: "no-such-key".to_string(),
            signers: vec![nodes[0].node_id.clone()],
            msg_hash: vec![1u8; 32],
            initiator: nodes[0].node_id.clone(),
            mode: Mode::SelfApprove,
            use_presign: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MpcError::BadInput(_)));
}

#[test]
fn uid_derivation_is_deterministic_across_nodes() {
    // Both engines must agree on the interpolation ordering for a group,
    // whatever order the request lists the nodes in.
    let nodes: Vec<NodeId> = ["n1", "n2", "n3"].iter().map(|n| NodeId::new(n.to_string())).collect();
    let group_fwd = Group::new("g".into(), nodes.clone(), 1).unwrap();
    let group_rev = Group::new("g".into(), nodes.iter().rev().cloned().collect(), 1).unwrap();
    assert_eq!(
        group_fwd.sorted_uids(KeyType::Ec256k1).unwrap(),
        group_rev.sorted_uids(KeyType::Ec256k1).unwrap()
    );
    let uids = group_fwd.sorted_uids(KeyType::Ec256k1).unwrap();
    let strings: Vec<String> = uids.iter().map(|u| u.to_str_radix(10)).collect();
    assert_eq!(strings.len(), 3);
    let _ = BigInt::from_str_radix(&strings[0], 10).unwrap();
}
