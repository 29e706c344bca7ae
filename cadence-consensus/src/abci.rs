//! ABCI request/response types and the application trait
//!
//! These mirror the ABCI 2.0 call sequence. [`crate::server`] translates the
//! engine's wire messages into these types and drives an [`Application`] one
//! block at a time: `Info`, `InitChain`, then `CheckTx*`, `PrepareProposal`,
//! `ProcessProposal`, `FinalizeBlock` and `Commit` for every height. State
//! sync and vote extensions are not used and are answered by the server.

use crate::ConsensusResult;
use async_trait::async_trait;
use cadence_core::Height;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transaction accepted or applied
pub const CODE_OK: u32 = 0;
/// Bytes do not decode into a signed transaction
pub const CODE_DECODE_FAILED: u32 = 1;
/// Handler rejected the transaction during finalization
pub const CODE_FINALIZE_FAILED: u32 = 2;
/// Same bytes already finalized, earlier in this block or in a committed one
pub const CODE_ALREADY_FINALIZED: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub version: String,
    pub block_version: u64,
    pub p2p_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub data: String,
    pub version: String,
    pub app_version: u64,
    pub last_block_height: Height,
    pub last_block_app_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInitChain {
    pub chain_id: String,
    pub initial_height: Height,
    pub time: DateTime<Utc>,
    pub validators: Vec<ValidatorUpdate>,
    pub app_state_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInitChain {
    pub validators: Vec<ValidatorUpdate>,
    pub app_hash: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestQuery {
    pub path: String,
    pub data: Vec<u8>,
    pub height: Height,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseQuery {
    pub code: u32,
    pub log: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub height: Height,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckTxKind {
    #[default]
    New,
    Recheck,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCheckTx {
    pub tx: Vec<u8>,
    pub kind: CheckTxKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCheckTx {
    pub code: u32,
    pub log: String,
}

impl ResponseCheckTx {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPrepareProposal {
    pub max_tx_bytes: i64,
    /// Transactions offered by the engine's own mempool
    pub txs: Vec<Vec<u8>>,
    pub misbehavior: Vec<Misbehavior>,
    pub height: Height,
    pub time: DateTime<Utc>,
    pub proposer_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePrepareProposal {
    pub txs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestProcessProposal {
    pub txs: Vec<Vec<u8>>,
    pub misbehavior: Vec<Misbehavior>,
    pub hash: Vec<u8>,
    pub height: Height,
    pub time: DateTime<Utc>,
    pub proposer_address: String,
}

/// Verdict on a proposed block
///
/// `Unknown` tells the engine the application could not decide. CometBFT
/// treats it as an application failure, so it is only returned when the
/// local store itself cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Unknown,
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseProcessProposal {
    pub status: ProposalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisbehaviorKind {
    Unknown,
    DuplicateVote,
    LightClientAttack,
}

/// Evidence of validator misbehavior supplied by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misbehavior {
    pub kind: MisbehaviorKind,
    /// Consensus address of the offender
    pub validator_address: String,
    pub validator_power: i64,
    pub height: Height,
    pub time: DateTime<Utc>,
    pub total_voting_power: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFinalizeBlock {
    pub txs: Vec<Vec<u8>>,
    pub misbehavior: Vec<Misbehavior>,
    pub hash: Vec<u8>,
    pub height: Height,
    pub time: DateTime<Utc>,
    pub proposer_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTxResult {
    pub code: u32,
    pub log: String,
}

impl ExecTxResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(code: u32, log: impl Into<String>) -> Self {
        Self {
            code,
            log: log.into(),
        }
    }
}

/// Voting power change for one ed25519 consensus key; power 0 removes the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub pub_key: Vec<u8>,
    pub power: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFinalizeBlock {
    pub tx_results: Vec<ExecTxResult>,
    pub validator_updates: Vec<ValidatorUpdate>,
    pub app_hash: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCommit {
    pub retain_height: Height,
}

/// The state machine a consensus engine drives
///
/// Calls for one block never overlap calls for another; implementations may
/// rely on `finalize_block` being followed by exactly one `commit`.
#[async_trait]
pub trait Application: Send + Sync {
    async fn info(&self, request: RequestInfo) -> ConsensusResult<ResponseInfo>;

    async fn init_chain(&self, request: RequestInitChain) -> ConsensusResult<ResponseInitChain>;

    async fn query(&self, request: RequestQuery) -> ConsensusResult<ResponseQuery>;

    async fn check_tx(&self, request: RequestCheckTx) -> ConsensusResult<ResponseCheckTx>;

    async fn prepare_proposal(
        &self,
        request: RequestPrepareProposal,
    ) -> ConsensusResult<ResponsePrepareProposal>;

    async fn process_proposal(
        &self,
        request: RequestProcessProposal,
    ) -> ConsensusResult<ResponseProcessProposal>;

    async fn finalize_block(
        &self,
        request: RequestFinalizeBlock,
    ) -> ConsensusResult<ResponseFinalizeBlock>;

    async fn commit(&self) -> ConsensusResult<ResponseCommit>;
}
