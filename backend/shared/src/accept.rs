use crate::key_info::NodeId;
use chrono::Utc;
use derive_more::Display;
use serde::{ Deserialize, Serialize };

/// Lifecycle of an accepted request as the RPC layer observes it.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Display, PartialEq, Eq)]
pub enum Status {
    Pending,
    Success,
    Failure,
    Timeout,
}

/// Whether a request needs explicit per-node approval or is pre-approved by
/// the initiating account.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Display, PartialEq, Eq)]
pub enum Mode {
    Managed,
    SelfApprove,
}

/// One entry of the `AllReply` vector: how a single party answered.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct NodeReply {
    pub uid: String,
    pub status: Status,
    pub time_stamp: String,
    pub initiator: bool,
}

impl NodeReply {
    pub fn pending(uid: String, initiator: bool) -> Self {
        NodeReply {
            uid,
            status: Status::Pending,
            time_stamp: Utc::now().to_rfc3339(),
            initiator,
        }
    }

    pub fn resolve(&mut self, status: Status) {
        self.status = status;
        self.time_stamp = Utc::now().to_rfc3339();
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct AcceptReqAddrData {
    pub initiator: NodeId,
    pub group_id: String,
    pub threshold: usize,
    pub mode: Mode,
    pub status: Status,
    pub pub_key: Option<String>,
    pub time_stamp: String,
    pub all_reply: Vec<NodeReply>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct AcceptSignData {
    pub initiator: NodeId,
    pub group_id: String,
    pub threshold: usize,
    pub mode: Mode,
    pub status: Status,
    pub key_id: String,
    pub msg_hash: String,
    pub rsv: Option<String>,
    pub time_stamp: String,
    pub all_reply: Vec<NodeReply>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct AcceptReShareData {
    pub initiator: NodeId,
    pub group_id: String,
    pub new_group_id: String,
    pub threshold: usize,
    pub mode: Mode,
    pub status: Status,
    pub key_id: String,
    pub pub_key: String,
    pub time_stamp: String,
    pub all_reply: Vec<NodeReply>,
}

impl AcceptReqAddrData {
    pub fn resolve(&mut self, status: Status) {
        self.status = status;
        self.time_stamp = Utc::now().to_rfc3339();
    }
}

impl AcceptSignData {
    pub fn resolve(&mut self, status: Status) {
        self.status = status;
        self.time_stamp = Utc::now().to_rfc3339();
    }
}

impl AcceptReShareData {
    pub fn resolve(&mut self, status: Status) {
        self.status = status;
        self.time_stamp = Utc::now().to_rfc3339();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_resolution_updates_timestamp() {
        let mut reply = NodeReply::pending("1234".into(), true);
        assert_eq!(reply.status, Status::Pending);
        let first_stamp = reply.time_stamp.clone();
        reply.resolve(Status::Success);
        assert_eq!(reply.status, Status::Success);
        assert!(reply.time_stamp >= first_stamp);
    }
}
