//! ABCI socket server
//!
//! CometBFT connects to the application over four ABCI connections. The
//! requests are split per connection with `tower-abci`, translated into the
//! types of [`crate::abci`] and handed to the [`Application`]. State sync and
//! vote extensions are answered here without reaching the application.
//!
//! An application error becomes an ABCI exception, which halts the engine
//! instead of letting this node drift from the rest of the network.

use crate::abci::{self, Application};
use crate::{ConsensusError, ConsensusResult};
use bytes::Bytes;
use cadence_core::Height;
use chrono::{DateTime, TimeZone, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tendermint::abci::types::{Misbehavior, MisbehaviorKind};
use tendermint::abci::{response, Code};
use tendermint::v0_38::abci::{Request, Response};
use tendermint::{account, block, validator, vote, AppHash, PublicKey, Time};
use tower_abci::v038::{split, Server};
use tower_abci::BoxError;

/// Default ABCI listen address, CometBFT's `proxy_app` default
pub const DEFAULT_ABCI_LISTEN: &str = "127.0.0.1:26658";

/// Requests buffered per ABCI connection
const CONNECTION_BUFFER: usize = 1;

/// Serve `app` to a consensus engine until the listener fails
pub async fn serve_abci<A>(app: Arc<A>, addr: SocketAddr) -> ConsensusResult<()>
where
    A: Application + 'static,
{
    let service = tower::service_fn(move |request: Request| {
        let app = app.clone();
        async move { dispatch(app.as_ref(), request).await }
    });
    let (consensus, mempool, snapshot, info) = split::service(service, CONNECTION_BUFFER);

    let server = Server::builder()
        .consensus(consensus)
        .snapshot(snapshot)
        .mempool(mempool)
        .info(info)
        .finish()
        .ok_or_else(|| ConsensusError::Abci("incomplete ABCI service set".to_string()))?;

    tracing::info!(%addr, "Serving ABCI");
    server
        .listen_tcp(addr)
        .await
        .map_err(|e| ConsensusError::Abci(e.to_string()))
}

/// Answer one engine request
pub async fn dispatch<A>(app: &A, request: Request) -> Result<Response, BoxError>
where
    A: Application + ?Sized,
{
    let response = match request {
        Request::Echo(echo) => Response::Echo(response::Echo {
            message: echo.message,
        }),
        Request::Flush => Response::Flush,
        Request::Info(info) => {
            let reply = app
                .info(abci::RequestInfo {
                    version: info.version,
                    block_version: info.block_version,
                    p2p_version: info.p2p_version,
                })
                .await?;
            Response::Info(response::Info {
                data: reply.data,
                version: reply.version,
                app_version: reply.app_version,
                last_block_height: to_block_height(reply.last_block_height)?,
                last_block_app_hash: to_app_hash(reply.last_block_app_hash)?,
            })
        }
        Request::InitChain(init) => {
            let validators = init
                .validators
                .iter()
                .map(from_validator_update)
                .collect::<ConsensusResult<Vec<_>>>()?;
            let reply = app
                .init_chain(abci::RequestInitChain {
                    chain_id: init.chain_id,
                    initial_height: from_block_height(init.initial_height)?,
                    time: to_chrono(init.time)?,
                    validators,
                    app_state_bytes: init.app_state_bytes.to_vec(),
                })
                .await?;
            // an empty set keeps the genesis validators
            Response::InitChain(response::InitChain {
                consensus_params: None,
                validators: reply
                    .validators
                    .iter()
                    .map(to_validator_update)
                    .collect::<ConsensusResult<Vec<_>>>()?,
                app_hash: to_app_hash(reply.app_hash)?,
            })
        }
        Request::Query(query) => {
            let reply = app
                .query(abci::RequestQuery {
                    path: query.path,
                    data: query.data.to_vec(),
                    height: from_block_height(query.height)?,
                })
                .await?;
            Response::Query(response::Query {
                code: Code::from(reply.code),
                log: reply.log,
                key: Bytes::from(reply.key),
                value: Bytes::from(reply.value),
                height: to_block_height(reply.height)?,
                ..Default::default()
            })
        }
        Request::CheckTx(check) => {
            let kind = match check.kind {
                tendermint::abci::request::CheckTxKind::New => abci::CheckTxKind::New,
                tendermint::abci::request::CheckTxKind::Recheck => abci::CheckTxKind::Recheck,
            };
            let reply = app
                .check_tx(abci::RequestCheckTx {
                    tx: check.tx.to_vec(),
                    kind,
                })
                .await?;
            Response::CheckTx(response::CheckTx {
                code: Code::from(reply.code),
                log: reply.log,
                ..Default::default()
            })
        }
        Request::PrepareProposal(prepare) => {
            let reply = app
                .prepare_proposal(abci::RequestPrepareProposal {
                    max_tx_bytes: prepare.max_tx_bytes,
                    txs: prepare.txs.iter().map(|tx| tx.to_vec()).collect(),
                    misbehavior: from_misbehavior(&prepare.misbehavior)?,
                    height: from_block_height(prepare.height)?,
                    time: to_chrono(prepare.time)?,
                    proposer_address: from_account(&prepare.proposer_address),
                })
                .await?;
            Response::PrepareProposal(response::PrepareProposal {
                txs: reply.txs.into_iter().map(Bytes::from).collect(),
            })
        }
        Request::ProcessProposal(process) => {
            let reply = app
                .process_proposal(abci::RequestProcessProposal {
                    txs: process.txs.iter().map(|tx| tx.to_vec()).collect(),
                    misbehavior: from_misbehavior(&process.misbehavior)?,
                    hash: process.hash.as_bytes().to_vec(),
                    height: from_block_height(process.height)?,
                    time: to_chrono(process.time)?,
                    proposer_address: from_account(&process.proposer_address),
                })
                .await?;
            Response::ProcessProposal(match reply.status {
                abci::ProposalStatus::Accept => response::ProcessProposal::Accept,
                abci::ProposalStatus::Reject => response::ProcessProposal::Reject,
                abci::ProposalStatus::Unknown => response::ProcessProposal::Unknown,
            })
        }
        Request::FinalizeBlock(block) => {
            let reply = app
                .finalize_block(abci::RequestFinalizeBlock {
                    txs: block.txs.iter().map(|tx| tx.to_vec()).collect(),
                    misbehavior: from_misbehavior(&block.misbehavior)?,
                    hash: block.hash.as_bytes().to_vec(),
                    height: from_block_height(block.height)?,
                    time: to_chrono(block.time)?,
                    proposer_address: from_account(&block.proposer_address),
                })
                .await?;
            Response::FinalizeBlock(response::FinalizeBlock {
                events: Vec::new(),
                tx_results: reply
                    .tx_results
                    .into_iter()
                    .map(|result| tendermint::abci::types::ExecTxResult {
                        code: Code::from(result.code),
                        log: result.log,
                        ..Default::default()
                    })
                    .collect(),
                validator_updates: reply
                    .validator_updates
                    .iter()
                    .map(to_validator_update)
                    .collect::<ConsensusResult<Vec<_>>>()?,
                consensus_param_updates: None,
                app_hash: to_app_hash(reply.app_hash)?,
            })
        }
        Request::Commit => {
            let reply = app.commit().await?;
            Response::Commit(response::Commit {
                retain_height: to_block_height(reply.retain_height)?,
                ..Default::default()
            })
        }
        Request::ListSnapshots => Response::ListSnapshots(response::ListSnapshots::default()),
        Request::OfferSnapshot(_) => Response::OfferSnapshot(response::OfferSnapshot::Reject),
        Request::LoadSnapshotChunk(_) => {
            Response::LoadSnapshotChunk(response::LoadSnapshotChunk::default())
        }
        Request::ApplySnapshotChunk(_) => Response::ApplySnapshotChunk(response::ApplySnapshotChunk {
            result: response::ApplySnapshotChunkResult::Abort,
            refetch_chunks: Vec::new(),
            reject_senders: Vec::new(),
        }),
        Request::ExtendVote(_) => Response::ExtendVote(response::ExtendVote {
            vote_extension: Bytes::new(),
        }),
        Request::VerifyVoteExtension(_) => {
            Response::VerifyVoteExtension(response::VerifyVoteExtension::Accept)
        }
    };
    Ok(response)
}

fn invalid(message: String) -> ConsensusError {
    ConsensusError::Abci(message)
}

fn from_block_height(height: block::Height) -> ConsensusResult<Height> {
    Height::try_from(height.value()).map_err(|_| invalid(format!("height {height} out of range")))
}

fn to_block_height(height: Height) -> ConsensusResult<block::Height> {
    block::Height::try_from(height).map_err(|e| invalid(format!("height {height}: {e}")))
}

fn to_app_hash(hash: Vec<u8>) -> ConsensusResult<AppHash> {
    AppHash::try_from(hash).map_err(|e| invalid(format!("app hash: {e}")))
}

fn to_chrono(time: Time) -> ConsensusResult<DateTime<Utc>> {
    let nanos = i64::try_from(time.unix_timestamp_nanos())
        .map_err(|_| invalid(format!("block time {time} out of range")))?;
    Ok(Utc.timestamp_nanos(nanos))
}

/// Consensus addresses are upper-case hex everywhere in the store
fn from_account(id: &account::Id) -> String {
    hex::encode_upper(id.as_bytes())
}

fn from_power(power: vote::Power) -> ConsensusResult<i64> {
    i64::try_from(power.value()).map_err(|_| invalid(format!("voting power {power} out of range")))
}

fn from_misbehavior(evidence: &[Misbehavior]) -> ConsensusResult<Vec<abci::Misbehavior>> {
    evidence
        .iter()
        .map(|item| {
            Ok(abci::Misbehavior {
                kind: match item.kind {
                    MisbehaviorKind::DuplicateVote => abci::MisbehaviorKind::DuplicateVote,
                    MisbehaviorKind::LightClientAttack => abci::MisbehaviorKind::LightClientAttack,
                    MisbehaviorKind::Unknown => abci::MisbehaviorKind::Unknown,
                },
                validator_address: hex::encode_upper(item.validator.address),
                validator_power: from_power(item.validator.power)?,
                height: from_block_height(item.height)?,
                time: to_chrono(item.time)?,
                total_voting_power: from_power(item.total_voting_power)?,
            })
        })
        .collect()
}

fn from_validator_update(update: &validator::Update) -> ConsensusResult<abci::ValidatorUpdate> {
    Ok(abci::ValidatorUpdate {
        pub_key: update.pub_key.to_bytes(),
        power: from_power(update.power)?,
    })
}

fn to_validator_update(update: &abci::ValidatorUpdate) -> ConsensusResult<validator::Update> {
    let pub_key = PublicKey::from_raw_ed25519(&update.pub_key)
        .ok_or_else(|| invalid(format!("validator key of {} bytes is not ed25519", update.pub_key.len())))?;
    let power = vote::Power::try_from(update.power)
        .map_err(|e| invalid(format!("voting power {}: {e}", update.power)))?;
    Ok(validator::Update { pub_key, power })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppConfig, CoreApplication};
    use crate::mempool::Mempool;
    use crate::store::{MemoryStore, Store};
    use cadence_core::{NodeIdentity, SignedTransaction, TrackPlay, TrackPlays, Transaction, TxHash};
    use cadence_registry::StaticServiceRegistry;
    use tendermint::abci::request;
    use tendermint::abci::types::CommitInfo;
    use tendermint::Hash;

    const KEY: &str = "8b3a350cf5c34c9194ca85829a2df0ec3153be0318b5e2d3348e872092edffba";

    fn application() -> (CoreApplication, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let app = CoreApplication::new(
            store.clone(),
            Arc::new(Mempool::new(16)),
            Arc::new(StaticServiceRegistry::default()),
            AppConfig::default(),
        );
        (app, store)
    }

    fn plays() -> Vec<u8> {
        SignedTransaction::unsigned(
            "plays-1",
            Transaction::Plays(TrackPlays {
                plays: vec![TrackPlay {
                    user_id: "user-1".to_string(),
                    track_id: "track-1".to_string(),
                    timestamp: 1_700_000_000,
                    signature: "sig".to_string(),
                    city: "Porto".to_string(),
                    region: "Porto".to_string(),
                    country: "PT".to_string(),
                }],
            }),
        )
        .to_bytes()
        .unwrap()
    }

    fn finalize(txs: Vec<Vec<u8>>, proposer: [u8; 20]) -> Request {
        Request::FinalizeBlock(request::FinalizeBlock {
            txs: txs.into_iter().map(Bytes::from).collect(),
            decided_last_commit: CommitInfo {
                round: block::Round::default(),
                votes: vec![],
            },
            misbehavior: vec![],
            hash: Hash::None,
            height: block::Height::from(1u32),
            time: Time::from_unix_timestamp(1_700_000_000, 0).unwrap(),
            next_validators_hash: Hash::None,
            proposer_address: account::Id::new(proposer),
        })
    }

    #[tokio::test]
    async fn test_echo_and_info() {
        let (app, _) = application();
        match dispatch(&app, Request::Echo(request::Echo { message: "hi".to_string() })).await.unwrap() {
            Response::Echo(echo) => assert_eq!(echo.message, "hi"),
            other => panic!("unexpected {other:?}"),
        }

        let info = request::Info {
            version: "0.38.12".to_string(),
            block_version: 11,
            p2p_version: 8,
            abci_version: "2.0.0".to_string(),
        };
        match dispatch(&app, Request::Info(info)).await.unwrap() {
            Response::Info(info) => {
                assert_eq!(info.data, "cadence");
                assert_eq!(info.last_block_height.value(), 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_tx_codes() {
        let (app, _) = application();
        let check = |tx: Vec<u8>| {
            Request::CheckTx(request::CheckTx {
                tx: Bytes::from(tx),
                kind: request::CheckTxKind::New,
            })
        };
        match dispatch(&app, check(plays())).await.unwrap() {
            Response::CheckTx(reply) => assert!(reply.code.is_ok()),
            other => panic!("unexpected {other:?}"),
        }
        match dispatch(&app, check(vec![0xff, 0x00])).await.unwrap() {
            Response::CheckTx(reply) => assert_eq!(reply.code.value(), abci::CODE_DECODE_FAILED),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_block_through_engine_types() {
        let (app, store) = application();
        let identity = NodeIdentity::from_hex(KEY).unwrap();
        let mut proposer = [0u8; 20];
        proposer.copy_from_slice(&hex::decode(identity.comet_address()).unwrap());

        let tx = plays();
        let app_hash = match dispatch(&app, finalize(vec![tx.clone()], proposer)).await.unwrap() {
            Response::FinalizeBlock(reply) => {
                assert_eq!(reply.tx_results.len(), 1);
                assert!(reply.tx_results[0].code.is_ok());
                assert!(reply.validator_updates.is_empty());
                reply.app_hash
            }
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(dispatch(&app, Request::Commit).await.unwrap(), Response::Commit(_)));

        let state = store.app_state().await.unwrap().unwrap();
        assert_eq!(state.block_height, 1);
        assert_eq!(app_hash.as_bytes(), state.app_hash.as_slice());
        // proposer counted under the same address registrations use
        let counters = store.sla_counters().await.unwrap();
        assert_eq!(counters[0].address, identity.comet_address());

        let query = Request::Query(request::Query {
            data: Bytes::new(),
            path: format!("/tx/{}", TxHash::of_bytes(&tx)),
            height: block::Height::from(0u32),
            prove: false,
        });
        match dispatch(&app, query).await.unwrap() {
            Response::Query(reply) => {
                assert!(reply.code.is_ok());
                assert_eq!(reply.value.as_ref(), tx.as_slice());
                assert_eq!(reply.height.value(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_commit_without_block_is_an_error() {
        let (app, _) = application();
        assert!(dispatch(&app, Request::Commit).await.is_err());
    }

    #[tokio::test]
    async fn test_state_sync_is_declined() {
        let (app, _) = application();
        match dispatch(&app, Request::ListSnapshots).await.unwrap() {
            Response::ListSnapshots(reply) => assert!(reply.snapshots.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validator_update_conversion() {
        let identity = NodeIdentity::from_hex(KEY).unwrap();
        let update = abci::ValidatorUpdate {
            pub_key: identity.consensus_public_key().to_vec(),
            power: 10,
        };
        let converted = to_validator_update(&update).unwrap();
        assert_eq!(converted.power.value(), 10);
        assert_eq!(from_validator_update(&converted).unwrap(), update);

        let short = abci::ValidatorUpdate {
            pub_key: vec![1; 31],
            power: 10,
        };
        assert!(to_validator_update(&short).is_err());
        assert!(to_validator_update(&abci::ValidatorUpdate { power: -1, ..update }).is_err());
    }

    #[test]
    fn test_block_time_keeps_nanoseconds() {
        let time = Time::from_unix_timestamp(1_700_000_000, 5).unwrap();
        let converted = to_chrono(time).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 5);
    }
}
