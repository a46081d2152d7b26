use crate::communication::bus::MessageBus;
use crate::communication::framing;
use crate::config::Config;
use crate::crypto::primes::SafePrimePool;
use crate::error::{ MpcError, MpcResult, Phase };
use crate::keygen::ecdsa::{ EcdsaKeygenRound, KeygenContext, KeygenSaveData };
use crate::keygen::eddsa::{ EdKeygenContext, EdKeygenRound, EdKeygenSaveData };
use crate::party::{ uid_from_node_id, Group, KeyType };
use crate::protocol::dnode::DNode;
use crate::protocol::message::{ Envelope, Incoming, Outgoing, Recipients };
use crate::protocol::round::{ MpcRound, RoundBase };
use crate::reshare::{ ReshareContext, ReshareRound };
use crate::signing::ecdsa::{
    EcdsaSignRound,
    PreSignData,
    SignContext,
    SignOutput,
    SignatureRecid,
};
use crate::signing::eddsa::{ EdSignContext, EdSignRound, EdSignature };
use crate::storage::{ load_record, request_key, store_record, KvStore, Table };
use anyhow::Result;
use curv::arithmetic::Converter;
use curv::elliptic::curves::{ Point, Secp256k1 };
use curv::BigInt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha3::{ Digest, Keccak256 };
use shared::accept::{
    AcceptReShareData,
    AcceptReqAddrData,
    AcceptSignData,
    Mode,
    NodeReply,
    Status,
};
use shared::key_info::{ NodeId, PubKeyCoords };
use std::collections::{ BTreeMap, HashMap, VecDeque };
use std::sync::{ Arc, Mutex };
use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver, UnboundedSender };
use tracing::{ error, info, instrument, warn };

const PENDING_BUFFER_LIMIT: usize = 1024;
const PRIME_POOL_CAPACITY: usize = 8;

/// Request to generate a fresh threshold key.
#[derive(Clone, Debug)]
pub struct KeygenRequest {
    pub key_id: String,
    pub group: Group,
    pub key_type: KeyType,
    pub initiator: NodeId,
    pub mode: Mode,
}

/// Request to sign a 32-byte digest (ECDSA) with a chosen quorum.
#[derive(Clone, Debug)]
pub struct SignRequest {
    pub key_id: String,
    pub signers: Vec<NodeId>,
    pub msg_hash: Vec<u8>,
    pub initiator: NodeId,
    pub mode: Mode,
    /// All quorum members must agree on this; a finalize session only works
    /// when each of them holds a matching cached tuple.
    pub use_presign: bool,
}

/// Request to sign raw message bytes with an Ed25519 key.
#[derive(Clone, Debug)]
pub struct EdSignRequest {
    pub key_id: String,
    pub signers: Vec<NodeId>,
    pub message: Vec<u8>,
    pub initiator: NodeId,
    pub mode: Mode,
}

/// Request to rotate the shareholder set of an existing ECDSA key.
#[derive(Clone, Debug)]
pub struct ReshareRequest {
    pub key_id: String,
    /// The old-committee quorum (`t_old + 1` members) donating shares.
    pub old_nodes: Vec<NodeId>,
    pub new_group: Group,
    /// The public key being reshared, for parties that hold no old share.
    pub pub_key: PubKeyCoords,
    pub initiator: NodeId,
    pub mode: Mode,
}

struct Worker {
    inbound: UnboundedSender<Envelope>,
}

/// Session routing state. One lock covers both maps so a message can never
/// slip between the worker check and the pre-session buffer.
#[derive(Default)]
struct Router {
    workers: HashMap<String, Worker>,
    pending: HashMap<String, Vec<Envelope>>,
}

/// The per-node protocol engine: owns the session table, the store handle,
/// the safe-prime pool and the presign cache. Sessions are tokio tasks that
/// suspend only on their inbound channel and the prime pool; `deliver_message`
/// is the single entry point the transport layer feeds.
pub struct Engine {
    node_id: NodeId,
    cfg: Config,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn KvStore>,
    pool: Arc<SafePrimePool>,
    router: Mutex<Router>,
    presigns: Mutex<HashMap<String, VecDeque<PreSignData>>>,
}

impl Engine {
    pub fn new(
        node_id: NodeId,
        cfg: Config,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn KvStore>
    ) -> Arc<Self> {
        let pool = Arc::new(SafePrimePool::new(cfg.prime_workers, PRIME_POOL_CAPACITY));
        Arc::new(Engine {
            node_id,
            cfg,
            bus,
            store,
            pool,
            router: Mutex::new(Router::default()),
            presigns: Mutex::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Start producing safe primes before the first keygen needs them.
    pub fn warm_up_primes(&self) {
        self.pool.warm_up(self.cfg.paillier_bits / 2);
        self.pool.warm_up(self.cfg.ntilde_bits / 2);
    }

    /// Feed one framed message from the transport. Messages for sessions
    /// that have not registered yet are buffered and replayed on
    /// registration; the bus gives no ordering guarantees.
    pub fn deliver_message(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        let envelope = framing::decode(bytes)?;
        let mut router = self.router.lock().expect("router poisoned");
        if let Some(worker) = router.workers.get(session_id) {
            let _ = worker.inbound.send(envelope);
            return Ok(());
        }
        let queue = router.pending.entry(session_id.to_string()).or_default();
        if queue.len() < PENDING_BUFFER_LIMIT {
            queue.push(envelope);
        } else {
            warn!(session = session_id, "dropping message, pre-session buffer full");
        }
        Ok(())
    }

    /// Cancel a running session; its task observes the closed channel at the
    /// next suspension point.
    pub fn cancel_session(&self, session_id: &str) {
        self.router.lock().expect("router poisoned").workers.remove(session_id);
    }

    /// Drop cached presign tuples for a key. Resharing does NOT call this
    /// implicitly; the request layer decides when old tuples become invalid.
    pub fn clear_presigns(&self, key_id: &str) {
        self.presigns.lock().expect("presign cache poisoned").remove(key_id);
    }

    pub fn cached_presigns(&self, key_id: &str) -> usize {
        self.presigns
            .lock()
            .expect("presign cache poisoned")
            .get(key_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    // ---- keygen ------------------------------------------------------

    #[instrument(skip_all, fields(key_id = %request.key_id))]
    pub async fn start_keygen(&self, request: KeygenRequest) -> MpcResult<KeygenSaveData> {
        if request.key_type != KeyType::Ec256k1 {
            return Err(MpcError::BadInput("use start_keygen_ed for ED25519 keys".into()));
        }
        let canonical = format!(
            "REQADDR:EC256K1:{}:{}:{}",
            request.key_id,
            request.group.gid,
            request.group.threshold
        );
        let record_key = request_key(&canonical);
        let mut record = self.open_reqaddr_record(&record_key, &request)?;

        let result = self
            .retry_loop(&record_key, |session_id| self.keygen_attempt(session_id, &request))
            .await;

        match &result {
            Ok(save) => {
                record.resolve(Status::Success);
                record.pub_key = Some(hex::encode(&*save.pk.to_bytes(false)));
                for reply in &mut record.all_reply {
                    reply.resolve(Status::Success);
                }
                self.persist_ecdsa_save(&request.key_id, save)?;
            }
            Err(err) => self.mark_failed(&mut record.status, &mut record.all_reply, err),
        }
        self.write_record(Table::ReqAddrInfo, &record_key, &record)?;
        result
    }

    async fn keygen_attempt(
        &self,
        session_id: String,
        request: &KeygenRequest
    ) -> MpcResult<KeygenSaveData> {
        let own_uid = uid_from_node_id(&self.node_id, KeyType::Ec256k1);
        let ids = request.group.sorted_uids(KeyType::Ec256k1)?;
        let uid_to_node = uid_node_map(&request.group.nodes, KeyType::Ec256k1);

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, end_rx) = unbounded_channel();
        let base = RoundBase::new(
            session_id.clone(),
            own_uid.clone(),
            ids.len(),
            request.group.threshold,
            self.cfg.paillier_bits,
            self.cfg.ntilde_bits,
            false,
            out_tx,
            end_tx
        );
        let ctx = Arc::new(KeygenContext {
            ids,
            uid_to_node: uid_to_node.clone(),
            pool: self.pool.clone(),
        });
        let node = DNode::new(session_id.clone(), EcdsaKeygenRound::new(base, ctx), end_rx);

        self.run_session(&session_id, node, out_rx, &uid_to_node, &own_uid).await
    }

    #[instrument(skip_all, fields(key_id = %request.key_id))]
    pub async fn start_keygen_ed(&self, request: KeygenRequest) -> MpcResult<EdKeygenSaveData> {
        if request.key_type != KeyType::Ed25519 {
            return Err(MpcError::BadInput("use start_keygen for EC256K1 keys".into()));
        }
        let canonical = format!(
            "REQADDR:ED25519:{}:{}:{}",
            request.key_id,
            request.group.gid,
            request.group.threshold
        );
        let record_key = request_key(&canonical);
        let mut record = self.open_reqaddr_record(&record_key, &request)?;

        let result = self
            .retry_loop(&record_key, |session_id| self.keygen_ed_attempt(session_id, &request))
            .await;

        match &result {
            Ok(save) => {
                record.resolve(Status::Success);
                record.pub_key = Some(hex::encode(&*save.pk.to_bytes(true)));
                for reply in &mut record.all_reply {
                    reply.resolve(Status::Success);
                }
                self.write_record(
                    Table::PubKeyData,
                    &pubkey_record_key(&request.key_id, KeyType::Ed25519),
                    save
                )?;
            }
            Err(err) => self.mark_failed(&mut record.status, &mut record.all_reply, err),
        }
        self.write_record(Table::ReqAddrInfo, &record_key, &record)?;
        result
    }

    async fn keygen_ed_attempt(
        &self,
        session_id: String,
        request: &KeygenRequest
    ) -> MpcResult<EdKeygenSaveData> {
        let own_uid = uid_from_node_id(&self.node_id, KeyType::Ed25519);
        let ids = request.group.sorted_uids(KeyType::Ed25519)?;
        let uid_to_node = uid_node_map(&request.group.nodes, KeyType::Ed25519);

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, end_rx) = unbounded_channel();
        let base = RoundBase::new(
            session_id.clone(),
            own_uid.clone(),
            ids.len(),
            request.group.threshold,
            self.cfg.paillier_bits,
            self.cfg.ntilde_bits,
            false,
            out_tx,
            end_tx
        );
        let ctx = Arc::new(EdKeygenContext { ids, uid_to_node: uid_to_node.clone() });
        let node = DNode::new(session_id.clone(), EdKeygenRound::new(base, ctx), end_rx);

        self.run_session(&session_id, node, out_rx, &uid_to_node, &own_uid).await
    }

    // ---- signing -----------------------------------------------------

    #[instrument(skip_all, fields(key_id = %request.key_id))]
    pub async fn start_sign(&self, request: SignRequest) -> MpcResult<SignatureRecid> {
        if request.msg_hash.is_empty() || request.msg_hash.len() > 32 {
            return Err(MpcError::BadInput("message hash must be 1..=32 bytes".into()));
        }

        let canonical = format!(
            "SIGN:{}:{}:{}",
            request.key_id,
            hex::encode(&request.msg_hash),
            join_nodes(&request.signers)
        );
        let record_key = request_key(&canonical);
        let mut record = self.open_sign_record(&record_key, &request)?;

        let result = self
            .retry_loop(&record_key, |session_id| self.sign_attempt(session_id, &request))
            .await;

        match &result {
            Ok(sig) => {
                record.resolve(Status::Success);
                record.rsv = Some(format!(
                    "{}{}{:02x}",
                    hex::encode(crate::signing::ecdsa::scalar_to_32_bytes(&sig.r)),
                    hex::encode(crate::signing::ecdsa::scalar_to_32_bytes(&sig.s)),
                    sig.recid
                ));
                for reply in &mut record.all_reply {
                    reply.resolve(Status::Success);
                }
            }
            Err(err) => self.mark_failed(&mut record.status, &mut record.all_reply, err),
        }
        self.write_record(Table::SignInfo, &record_key, &record)?;
        result
    }

    async fn sign_attempt(
        &self,
        session_id: String,
        request: &SignRequest
    ) -> MpcResult<SignatureRecid> {
        let save = self.load_ecdsa_save(&request.key_id)?;
        let own_uid = uid_from_node_id(&self.node_id, KeyType::Ec256k1);
        let sign_ids = sorted_sign_uids(&request.signers, KeyType::Ec256k1)?;
        let own_index = crate::party::index_of(&sign_ids, &own_uid).ok_or_else(|| {
            MpcError::BadInput("this node is not in the signing set".into())
        })?;
        let uid_to_node = save.uid_to_node.clone();
        let msg_hash = BigInt::from_bytes(&request.msg_hash);

        let presign = if request.use_presign {
            Some(
                self.take_presign(&request.key_id, &sign_ids).ok_or_else(|| {
                    MpcError::BadInput("no cached presign tuple for this signing set".into())
                })?
            )
        } else {
            None
        };

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, end_rx) = unbounded_channel();
        let mut base = RoundBase::new(
            session_id.clone(),
            own_uid.clone(),
            sign_ids.len(),
            save.threshold,
            self.cfg.paillier_bits,
            self.cfg.ntilde_bits,
            false,
            out_tx,
            end_tx
        );
        base.index = own_index as i32;
        let ctx = Arc::new(SignContext { save, sign_ids, msg_hash: Some(msg_hash) });

        let round = match presign {
            Some(presign) => EcdsaSignRound::new_finalize(base, ctx, presign)?,
            None => EcdsaSignRound::new(base, ctx)?,
        };
        let node = DNode::new(session_id.clone(), round, end_rx);

        match self.run_session(&session_id, node, out_rx, &uid_to_node, &own_uid).await? {
            SignOutput::Signature(sig) => Ok(sig),
            SignOutput::PreSign(_) => Err(
                MpcError::InternalInvariantViolated("signing session produced a presign".into())
            ),
        }
    }

    /// Generate one message-independent presign tuple and cache it. At most
    /// `presign_num` tuples are kept per key; the request layer drives the
    /// additional `bip32_pre` generation budget for derived child keys.
    #[instrument(skip_all, fields(key_id = %key_id))]
    pub async fn start_presign(&self, key_id: &str, signers: Vec<NodeId>) -> MpcResult<()> {
        let save = self.load_ecdsa_save(key_id)?;
        let own_uid = uid_from_node_id(&self.node_id, KeyType::Ec256k1);
        let sign_ids = sorted_sign_uids(&signers, KeyType::Ec256k1)?;
        let own_index = crate::party::index_of(&sign_ids, &own_uid).ok_or_else(|| {
            MpcError::BadInput("this node is not in the signing set".into())
        })?;
        let uid_to_node = save.uid_to_node.clone();

        {
            let cache = self.presigns.lock().expect("presign cache poisoned");
            if cache.get(key_id).map(|q| q.len()).unwrap_or(0) >= self.cfg.presign_num {
                return Ok(());
            }
        }

        let canonical = format!(
            "PRESIGN:{}:{}:{}",
            key_id,
            join_nodes(&signers),
            self.cached_presigns(key_id)
        );
        let record_key = request_key(&canonical);

        let result = self
            .retry_loop(&record_key, |session_id| {
                self.presign_attempt(session_id, &save, &sign_ids, own_index, &uid_to_node, &own_uid)
            })
            .await?;

        match result {
            SignOutput::PreSign(presign) => {
                let mut cache = self.presigns.lock().expect("presign cache poisoned");
                let queue = cache.entry(key_id.to_string()).or_default();
                if queue.len() < self.cfg.presign_num {
                    queue.push_back(presign);
                }
                Ok(())
            }
            SignOutput::Signature(_) => Err(
                MpcError::InternalInvariantViolated("presign session produced a signature".into())
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn presign_attempt(
        &self,
        session_id: String,
        save: &KeygenSaveData,
        sign_ids: &[BigInt],
        own_index: usize,
        uid_to_node: &BTreeMap<String, NodeId>,
        own_uid: &BigInt
    ) -> MpcResult<SignOutput> {
        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, end_rx) = unbounded_channel();
        let mut base = RoundBase::new(
            session_id.clone(),
            own_uid.clone(),
            sign_ids.len(),
            save.threshold,
            self.cfg.paillier_bits,
            self.cfg.ntilde_bits,
            false,
            out_tx,
            end_tx
        );
        base.index = own_index as i32;
        let ctx = Arc::new(SignContext {
            save: save.clone(),
            sign_ids: sign_ids.to_vec(),
            msg_hash: None,
        });
        let round = EcdsaSignRound::new(base, ctx)?;
        let node = DNode::new(session_id.clone(), round, end_rx);
        self.run_session(&session_id, node, out_rx, uid_to_node, own_uid).await
    }

    fn take_presign(&self, key_id: &str, sign_ids: &[BigInt]) -> Option<PreSignData> {
        let mut cache = self.presigns.lock().expect("presign cache poisoned");
        let queue = cache.get_mut(key_id)?;
        let pos = queue.iter().position(|p| p.sign_ids == sign_ids)?;
        queue.remove(pos)
    }

    #[instrument(skip_all, fields(key_id = %request.key_id))]
    pub async fn start_sign_ed(&self, request: EdSignRequest) -> MpcResult<EdSignature> {
        let canonical = format!(
            "SIGN:ED25519:{}:{}:{}",
            request.key_id,
            hex::encode(&request.message),
            join_nodes(&request.signers)
        );
        let record_key = request_key(&canonical);
        let mut record = self.open_ed_sign_record(&record_key, &request)?;

        let result = self
            .retry_loop(&record_key, |session_id| self.sign_ed_attempt(session_id, &request))
            .await;

        match &result {
            Ok(sig) => {
                record.resolve(Status::Success);
                record.rsv = Some(hex::encode(sig.to_bytes()));
                for reply in &mut record.all_reply {
                    reply.resolve(Status::Success);
                }
            }
            Err(err) => self.mark_failed(&mut record.status, &mut record.all_reply, err),
        }
        self.write_record(Table::SignInfo, &record_key, &record)?;
        result
    }

    async fn sign_ed_attempt(
        &self,
        session_id: String,
        request: &EdSignRequest
    ) -> MpcResult<EdSignature> {
        let save: EdKeygenSaveData = self
            .read_record(Table::PubKeyData, &pubkey_record_key(&request.key_id, KeyType::Ed25519))?
            .ok_or_else(|| MpcError::BadInput(format!("no key share for {}", request.key_id)))?;
        let own_uid = uid_from_node_id(&self.node_id, KeyType::Ed25519);
        let sign_ids = sorted_sign_uids(&request.signers, KeyType::Ed25519)?;
        let own_index = crate::party::index_of(&sign_ids, &own_uid).ok_or_else(|| {
            MpcError::BadInput("this node is not in the signing set".into())
        })?;
        let uid_to_node = save.uid_to_node.clone();

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, end_rx) = unbounded_channel();
        let mut base = RoundBase::new(
            session_id.clone(),
            own_uid.clone(),
            sign_ids.len(),
            save.threshold,
            self.cfg.paillier_bits,
            self.cfg.ntilde_bits,
            false,
            out_tx,
            end_tx
        );
        base.index = own_index as i32;
        let ctx = Arc::new(EdSignContext { save, sign_ids, message: request.message.clone() });
        let node = DNode::new(session_id.clone(), EdSignRound::new(base, ctx)?, end_rx);

        self.run_session(&session_id, node, out_rx, &uid_to_node, &own_uid).await
    }

    // ---- reshare -----------------------------------------------------

    #[instrument(skip_all, fields(key_id = %request.key_id))]
    pub async fn start_reshare(
        &self,
        request: ReshareRequest
    ) -> MpcResult<Option<KeygenSaveData>> {
        let canonical = format!(
            "RESHARE:{}:{}:{}",
            request.key_id,
            request.new_group.gid,
            request.new_group.threshold
        );
        let record_key = request_key(&canonical);
        let mut record = self.open_reshare_record(&record_key, &request)?;

        let result = self
            .retry_loop(&record_key, |session_id| self.reshare_attempt(session_id, &request))
            .await;

        match &result {
            Ok(save) => {
                record.resolve(Status::Success);
                for reply in &mut record.all_reply {
                    reply.resolve(Status::Success);
                }
                if let Some(save) = save {
                    self.persist_ecdsa_save(&request.key_id, save)?;
                }
            }
            Err(err) => self.mark_failed(&mut record.status, &mut record.all_reply, err),
        }
        self.write_record(Table::ReshareInfo, &record_key, &record)?;
        result
    }

    async fn reshare_attempt(
        &self,
        session_id: String,
        request: &ReshareRequest
    ) -> MpcResult<Option<KeygenSaveData>> {
        let own_uid = uid_from_node_id(&self.node_id, KeyType::Ec256k1);

        let old_ids = sorted_sign_uids(&request.old_nodes, KeyType::Ec256k1)?;
        let new_ids = request.new_group.sorted_uids(KeyType::Ec256k1)?;
        let mut union_ids = old_ids.clone();
        for uid in &new_ids {
            if !union_ids.contains(uid) {
                union_ids.push(uid.clone());
            }
        }
        union_ids.sort();

        let old_save = if old_ids.contains(&own_uid) {
            Some(self.load_ecdsa_save(&request.key_id)?)
        } else {
            None
        };

        let expected_pk = parse_pub_key(&request.pub_key)?;
        if let Some(save) = &old_save {
            if save.pk != expected_pk {
                return Err(MpcError::BadInput("stored key does not match the reshare request".into()));
            }
        }

        let mut uid_to_node = uid_node_map(&request.new_group.nodes, KeyType::Ec256k1);
        for node in &request.old_nodes {
            let uid = uid_from_node_id(node, KeyType::Ec256k1);
            uid_to_node.insert(uid.to_str_radix(10), node.clone());
        }

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, end_rx) = unbounded_channel();
        let base = RoundBase::new(
            session_id.clone(),
            own_uid.clone(),
            union_ids.len(),
            request.new_group.threshold,
            self.cfg.paillier_bits,
            self.cfg.ntilde_bits,
            old_save.is_some(),
            out_tx,
            end_tx
        );
        let ctx = Arc::new(ReshareContext {
            old_save,
            old_ids,
            new_ids,
            union_ids,
            new_threshold: request.new_group.threshold,
            expected_pk,
            uid_to_node: uid_to_node.clone(),
            pool: self.pool.clone(),
        });
        let node = DNode::new(session_id.clone(), ReshareRound::new(base, ctx), end_rx);

        self.run_session(&session_id, node, out_rx, &uid_to_node, &own_uid).await
    }

    // ---- session plumbing -------------------------------------------

    async fn run_session<R>(
        &self,
        session_id: &str,
        mut node: DNode<R>,
        mut out_rx: UnboundedReceiver<Outgoing<R::Msg>>,
        uid_to_node: &BTreeMap<String, NodeId>,
        own_uid: &BigInt
    ) -> MpcResult<R::Output>
    where
        R: MpcRound,
        R::Msg: Serialize + DeserializeOwned,
    {
        let mut inbound = self.register_worker(session_id);
        let result = self
            .session_loop(session_id, &mut node, &mut out_rx, &mut inbound, uid_to_node, own_uid)
            .await;
        self.cancel_session(session_id);
        if let Err(err) = &result {
            error!(session = session_id, error = %err, "session failed");
        }
        result
    }

    async fn session_loop<R>(
        &self,
        session_id: &str,
        node: &mut DNode<R>,
        out_rx: &mut UnboundedReceiver<Outgoing<R::Msg>>,
        inbound: &mut UnboundedReceiver<Envelope>,
        uid_to_node: &BTreeMap<String, NodeId>,
        own_uid: &BigInt
    ) -> MpcResult<R::Output>
    where
        R: MpcRound,
        R::Msg: Serialize + DeserializeOwned,
    {
        node.start()?;
        self.flush_outbound(session_id, out_rx, uid_to_node, own_uid)?;

        loop {
            if let Some(output) = node.take_output() {
                self.flush_outbound(session_id, out_rx, uid_to_node, own_uid)?;
                return Ok(output);
            }

            let round = node.current_round();
            let (phase, wait) = if round == 0 {
                (Phase::Agree, self.cfg.wait_agree)
            } else {
                (Phase::Round, self.cfg.wait_msg)
            };

            let envelope = match tokio::time::timeout(wait, inbound.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    // Channel closed: the session was cancelled from outside.
                    return Err(MpcError::Timeout { phase, round });
                }
                Err(_) => {
                    warn!(
                        session = session_id,
                        round,
                        waiting_for = ?node.waiting_for(),
                        "inbound idle timeout"
                    );
                    return Err(MpcError::Timeout { phase, round });
                }
            };

            match decode_incoming::<R::Msg>(&envelope) {
                Some(incoming) => node.deliver(incoming)?,
                None => {
                    warn!(session = session_id, "discarding undecodable payload");
                    continue;
                }
            }
            self.flush_outbound(session_id, out_rx, uid_to_node, own_uid)?;
        }
    }

    fn flush_outbound<M: Serialize>(
        &self,
        session_id: &str,
        out_rx: &mut UnboundedReceiver<Outgoing<M>>,
        uid_to_node: &BTreeMap<String, NodeId>,
        own_uid: &BigInt
    ) -> MpcResult<()> {
        while let Ok(outgoing) = out_rx.try_recv() {
            let payload = serde_json::to_vec(&outgoing.payload).map_err(|e| {
                MpcError::InternalInvariantViolated(format!("payload serialization failed: {e}"))
            })?;
            let (is_broadcast, to) = match &outgoing.to {
                Recipients::Broadcast => (true, Vec::new()),
                Recipients::Peers(peers) => {
                    (false, peers.iter().map(|uid| uid.to_str_radix(10)).collect())
                }
            };
            let envelope = Envelope {
                from_uid: own_uid.to_str_radix(10),
                from_index: outgoing.from_index,
                is_broadcast,
                to,
                round: outgoing.round,
                payload,
            };
            let bytes = framing::encode(&envelope);

            let sent = match &outgoing.to {
                Recipients::Broadcast => {
                    self.bus.send_to_group(session_id, &self.node_id, bytes)
                }
                Recipients::Peers(peers) => {
                    let mut result = Ok(());
                    for uid in peers {
                        let dec = uid.to_str_radix(10);
                        match uid_to_node.get(&dec) {
                            Some(node) => {
                                result = result.and(
                                    self.bus.send_to_peer(session_id, node, bytes.clone())
                                );
                            }
                            None => {
                                result = Err(anyhow::anyhow!("no transport identity for {dec}"));
                            }
                        }
                    }
                    result
                }
            };
            sent.map_err(|e| {
                MpcError::InternalInvariantViolated(format!("bus send failed: {e}"))
            })?;
        }
        Ok(())
    }

    fn register_worker(&self, session_id: &str) -> UnboundedReceiver<Envelope> {
        let (tx, rx) = unbounded_channel();
        let mut router = self.router.lock().expect("router poisoned");
        for envelope in router.pending.remove(session_id).unwrap_or_default() {
            let _ = tx.send(envelope);
        }
        router.workers.insert(session_id.to_string(), Worker { inbound: tx });
        rx
    }

    async fn retry_loop<T, F, Fut>(&self, request_key: &str, attempt_fn: F) -> MpcResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = MpcResult<T>>,
    {
        let attempts = self.cfg.try_times.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let session_id = session_id_for(request_key, attempt);
            info!(session = %session_id, attempt, "starting session attempt");
            match attempt_fn(session_id).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %err, "attempt failed, retrying with fresh session");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            MpcError::InternalInvariantViolated("retry loop finished without result".into())
        }))
    }

    // ---- records -----------------------------------------------------

    fn open_reqaddr_record(
        &self,
        record_key: &str,
        request: &KeygenRequest
    ) -> MpcResult<AcceptReqAddrData> {
        let record = AcceptReqAddrData {
            initiator: request.initiator.clone(),
            group_id: request.group.gid.clone(),
            threshold: request.group.threshold,
            mode: request.mode,
            status: Status::Pending,
            pub_key: None,
            time_stamp: chrono::Utc::now().to_rfc3339(),
            all_reply: pending_replies(&request.group.nodes, &request.initiator, request.key_type),
        };
        self.write_record(Table::ReqAddrInfo, record_key, &record)?;
        Ok(record)
    }

    fn open_sign_record(
        &self,
        record_key: &str,
        request: &SignRequest
    ) -> MpcResult<AcceptSignData> {
        let record = AcceptSignData {
            initiator: request.initiator.clone(),
            group_id: join_nodes(&request.signers),
            threshold: request.signers.len().saturating_sub(1),
            mode: request.mode,
            status: Status::Pending,
            key_id: request.key_id.clone(),
            msg_hash: hex::encode(&request.msg_hash),
            rsv: None,
            time_stamp: chrono::Utc::now().to_rfc3339(),
            all_reply: pending_replies(&request.signers, &request.initiator, KeyType::Ec256k1),
        };
        self.write_record(Table::SignInfo, record_key, &record)?;
        Ok(record)
    }

    fn open_ed_sign_record(
        &self,
        record_key: &str,
        request: &EdSignRequest
    ) -> MpcResult<AcceptSignData> {
        let record = AcceptSignData {
            initiator: request.initiator.clone(),
            group_id: join_nodes(&request.signers),
            threshold: request.signers.len().saturating_sub(1),
            mode: request.mode,
            status: Status::Pending,
            key_id: request.key_id.clone(),
            msg_hash: hex::encode(&request.message),
            rsv: None,
            time_stamp: chrono::Utc::now().to_rfc3339(),
            all_reply: pending_replies(&request.signers, &request.initiator, KeyType::Ed25519),
        };
        self.write_record(Table::SignInfo, record_key, &record)?;
        Ok(record)
    }

    fn open_reshare_record(
        &self,
        record_key: &str,
        request: &ReshareRequest
    ) -> MpcResult<AcceptReShareData> {
        let record = AcceptReShareData {
            initiator: request.initiator.clone(),
            group_id: join_nodes(&request.old_nodes),
            new_group_id: request.new_group.gid.clone(),
            threshold: request.new_group.threshold,
            mode: request.mode,
            status: Status::Pending,
            key_id: request.key_id.clone(),
            pub_key: format!("{}{}", request.pub_key.x, request.pub_key.y),
            time_stamp: chrono::Utc::now().to_rfc3339(),
            all_reply: pending_replies(
                &request.new_group.nodes,
                &request.initiator,
                KeyType::Ec256k1
            ),
        };
        self.write_record(Table::ReshareInfo, record_key, &record)?;
        Ok(record)
    }

    fn mark_failed(&self, status: &mut Status, replies: &mut [NodeReply], err: &MpcError) {
        *status = match err {
            MpcError::Timeout { .. } => Status::Timeout,
            _ => Status::Failure,
        };
        if let Some(offender) = err.offender() {
            for reply in replies.iter_mut() {
                if reply.uid == offender {
                    reply.resolve(Status::Failure);
                }
            }
        }
    }

    fn write_record<T: Serialize>(&self, table: Table, key: &str, record: &T) -> MpcResult<()> {
        store_record(self.store.as_ref(), table, key, record).map_err(|e| {
            MpcError::StorageFailed(e.to_string())
        })
    }

    fn read_record<T: DeserializeOwned>(&self, table: Table, key: &str) -> MpcResult<Option<T>> {
        load_record(self.store.as_ref(), table, key).map_err(|e| {
            MpcError::StorageFailed(e.to_string())
        })
    }

    fn persist_ecdsa_save(&self, key_id: &str, save: &KeygenSaveData) -> MpcResult<()> {
        self.write_record(Table::PubKeyData, &pubkey_record_key(key_id, KeyType::Ec256k1), save)
    }

    pub fn load_ecdsa_save(&self, key_id: &str) -> MpcResult<KeygenSaveData> {
        self.read_record(Table::PubKeyData, &pubkey_record_key(key_id, KeyType::Ec256k1))?
            .ok_or_else(|| MpcError::BadInput(format!("no key share for {key_id}")))
    }
}

fn decode_incoming<M: DeserializeOwned>(envelope: &Envelope) -> Option<Incoming<M>> {
    let from_uid = envelope.sender_uid()?;
    let payload = serde_json::from_slice(&envelope.payload).ok()?;
    Some(Incoming {
        from_uid,
        from_index: envelope.from_index,
        is_broadcast: envelope.is_broadcast,
        round: envelope.round,
        payload,
    })
}

fn uid_node_map(nodes: &[NodeId], key_type: KeyType) -> BTreeMap<String, NodeId> {
    nodes
        .iter()
        .map(|node| {
            (uid_from_node_id(node, key_type).to_str_radix(10), node.clone())
        })
        .collect()
}

fn sorted_sign_uids(nodes: &[NodeId], key_type: KeyType) -> MpcResult<Vec<BigInt>> {
    if nodes.is_empty() {
        return Err(MpcError::BadInput("empty signer set".into()));
    }
    let mut uids: Vec<BigInt> = nodes
        .iter()
        .map(|node| uid_from_node_id(node, key_type))
        .collect();
    uids.sort();
    for pair in uids.windows(2) {
        if pair[0] == pair[1] {
            return Err(MpcError::BadInput("duplicate signer".into()));
        }
    }
    Ok(uids)
}

fn pending_replies(nodes: &[NodeId], initiator: &NodeId, key_type: KeyType) -> Vec<NodeReply> {
    nodes
        .iter()
        .map(|node| {
            NodeReply::pending(
                uid_from_node_id(node, key_type).to_str_radix(16),
                node == initiator
            )
        })
        .collect()
}

fn join_nodes(nodes: &[NodeId]) -> String {
    use itertools::Itertools;
    let mut sorted: Vec<&NodeId> = nodes.iter().collect();
    sorted.sort();
    sorted.iter().map(|n| n.as_str()).join(",")
}

/// Deterministic per-attempt session id: every participant derives the same
/// id for the same request and attempt number.
pub fn session_id_for(request_key: &str, attempt: u32) -> String {
    let digest = Keccak256::new()
        .chain(request_key.as_bytes())
        .chain(attempt.to_be_bytes())
        .finalize();
    hex::encode(digest)
}

fn pubkey_record_key(key_id: &str, key_type: KeyType) -> String {
    let tag = match key_type {
        KeyType::Ec256k1 => "EC256K1",
        KeyType::Ed25519 => "ED25519",
    };
    request_key(&format!("PUBKEY:{tag}:{key_id}"))
}

fn parse_pub_key(coords: &PubKeyCoords) -> MpcResult<Point<Secp256k1>> {
    let x = BigInt::from_hex(&coords.x).map_err(|_| {
        MpcError::BadInput("public key x is not hex".into())
    })?;
    let y = BigInt::from_hex(&coords.y).map_err(|_| {
        MpcError::BadInput("public key y is not hex".into())
    })?;
    Point::from_coords(&x, &y).map_err(|_| {
        MpcError::BadInput("public key is not on the curve".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_deterministic_and_attempt_bound() {
        let a1 = session_id_for("req", 1);
        let a1_again = session_id_for("req", 1);
        let a2 = session_id_for("req", 2);
        assert_eq!(a1, a1_again);
        assert_ne!(a1, a2);
        assert_eq!(a1.len(), 64);
    }
}
