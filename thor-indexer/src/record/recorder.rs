//! Event recorder
//!
//! Turns each typed event into rows and applies its effect on the running
//! totals. The rows go first: every row of the event is validated, then
//! all of them are handed to the inserter as one group. When any is
//! refused the event leaves no rows behind and its depth change is
//! abandoned too.

use tracing::warn;

use super::running_totals::{PoolDepths, RunningTotals};
use crate::core::{pool_of, AssetClassifier, IndexerError, InsertError, Metadata};
use crate::database::schema::validate_row;
use crate::database::{Inserter, Row, SqlValue};
use crate::demux::events::*;
use crate::demux::SwapDirection;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub recorded: u64,
    pub rejected: u64,
}

pub struct EventRecorder {
    classifier: AssetClassifier,
    /// Below this height the coin sent to initiate a withdraw stays in the pool
    withdraw_coin_kept_height: Option<i64>,
    stats: RecordStats,
}

impl EventRecorder {
    pub fn new(classifier: AssetClassifier, withdraw_coin_kept_height: Option<i64>) -> Self {
        Self {
            classifier,
            withdraw_coin_kept_height,
            stats: RecordStats::default(),
        }
    }

    /// Counters since the last call
    pub fn take_stats(&mut self) -> RecordStats {
        std::mem::take(&mut self.stats)
    }

    /// Records one event. Refused rows only cost the event itself; storage
    /// failures are returned.
    pub async fn record(
        &mut self,
        event: &TypedEvent,
        meta: &Metadata,
        totals: &mut RunningTotals,
        inserter: &mut dyn Inserter,
    ) -> Result<(), IndexerError> {
        let result = match self.rows(event, meta) {
            Ok(rows) => inserter.insert_rows(rows).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                self.apply_depths(event, meta, totals);
                self.stats.recorded += 1;
                Ok(())
            }
            Err(e) if e.is_row_refusal() => {
                warn!(
                    height = meta.block_height,
                    event_id = %meta.event_id,
                    kind = event.kind(),
                    error = %e,
                    "Row refused, depth change abandoned"
                );
                self.stats.rejected += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Every row of `event`, validated
    fn rows(&self, event: &TypedEvent, meta: &Metadata) -> Result<Vec<Row>, InsertError> {
        let build = |table: &str, columns: &[&str], mut values: Vec<SqlValue>| {
            let mut all: Vec<&str> = columns.to_vec();
            all.push("event_id");
            all.push("block_timestamp");
            values.push(meta.event_id.as_i64().into());
            values.push(meta.block_timestamp.into());
            validate_row(table, &all, values)
        };
        let row = |table: &str, columns: &[&str], values: Vec<SqlValue>| {
            build(table, columns, values).map(|row| vec![row])
        };

        match event {
            TypedEvent::Add(e) => row(
                "add_events",
                &["tx", "chain", "from_addr", "to_addr", "asset", "asset_e8", "rune_e8", "memo", "pool"],
                vec![
                    (&e.tx).into(), (&e.chain).into(), (&e.from_addr).into(), (&e.to_addr).into(),
                    (&e.asset).into(), e.asset_e8.into(), e.rune_e8.into(), (&e.memo).into(),
                    (&e.pool).into(),
                ],
            ),
            TypedEvent::AddLiquidity(e) => row(
                "add_liquidity_events",
                &[
                    "pool", "asset_tx", "asset_chain", "asset_addr", "asset_e8", "stake_units",
                    "rune_tx", "rune_addr", "rune_e8",
                ],
                vec![
                    (&e.pool).into(), (&e.asset_tx).into(), (&e.asset_chain).into(),
                    (&e.asset_addr).into(), e.asset_e8.into(), e.stake_units.into(),
                    (&e.rune_tx).into(), (&e.rune_addr).into(), e.rune_e8.into(),
                ],
            ),
            TypedEvent::PendingLiquidity(e) => row(
                "pending_liquidity_events",
                &[
                    "pool", "asset_tx", "asset_chain", "asset_addr", "asset_e8", "rune_tx",
                    "rune_addr", "rune_e8", "pending_type",
                ],
                vec![
                    (&e.pool).into(), (&e.asset_tx).into(), (&e.asset_chain).into(),
                    (&e.asset_addr).into(), e.asset_e8.into(), (&e.rune_tx).into(),
                    (&e.rune_addr).into(), e.rune_e8.into(), (&e.pending_type).into(),
                ],
            ),
            TypedEvent::Withdraw(e) => row(
                "withdraw_events",
                &[
                    "tx", "chain", "from_addr", "to_addr", "asset", "asset_e8", "emit_asset_e8",
                    "emit_rune_e8", "memo", "pool", "stake_units", "basis_points", "asymmetry",
                    "imp_loss_protection_e8",
                ],
                vec![
                    (&e.tx).into(), (&e.chain).into(), (&e.from_addr).into(), (&e.to_addr).into(),
                    (&e.asset).into(), e.asset_e8.into(), e.emit_asset_e8.into(),
                    e.emit_rune_e8.into(), (&e.memo).into(), (&e.pool).into(),
                    e.stake_units.into(), e.basis_points.into(), (&e.asymmetry).into(),
                    e.imp_loss_protection_e8.into(),
                ],
            ),
            TypedEvent::Swap(e) => {
                let direction = SwapDirection::of(e, &self.classifier).ok_or(InsertError::Protocol(
                    "swap without exactly one native side",
                ))?;
                row(
                    "swap_events",
                    &[
                        "tx", "chain", "from_addr", "to_addr", "from_asset", "from_e8", "to_asset",
                        "to_e8", "memo", "pool", "to_e8_min", "swap_slip_bp", "liq_fee_e8",
                        "liq_fee_in_rune_e8", "_direction",
                    ],
                    vec![
                        (&e.tx).into(), (&e.chain).into(), (&e.from_addr).into(),
                        (&e.to_addr).into(), (&e.from_asset).into(), e.from_e8.into(),
                        (&e.to_asset).into(), e.to_e8.into(), (&e.memo).into(),
                        self.swap_pool(e).into(), e.to_e8_min.into(), e.swap_slip_bp.into(),
                        e.liq_fee_e8.into(), e.liq_fee_in_rune_e8.into(),
                        (direction as i64).into(),
                    ],
                )
            }
            TypedEvent::Fee(e) => row(
                "fee_events",
                &["tx", "asset", "asset_e8", "pool_deduct"],
                vec![(&e.tx).into(), (&e.asset).into(), e.asset_e8.into(), e.pool_deduct.into()],
            ),
            TypedEvent::Gas(e) => row(
                "gas_events",
                &["asset", "asset_e8", "rune_e8", "tx_count"],
                vec![(&e.asset).into(), e.asset_e8.into(), e.rune_e8.into(), e.tx_count.into()],
            ),
            TypedEvent::Refund(e) => row(
                "refund_events",
                &[
                    "tx", "chain", "from_addr", "to_addr", "asset", "asset_e8", "asset_2nd",
                    "asset_2nd_e8", "memo", "code", "reason",
                ],
                vec![
                    (&e.tx).into(), (&e.chain).into(), (&e.from_addr).into(), (&e.to_addr).into(),
                    (&e.asset).into(), e.asset_e8.into(), (&e.asset_2nd).into(),
                    e.asset_2nd_e8.into(), (&e.memo).into(), e.code.into(), (&e.reason).into(),
                ],
            ),
            TypedEvent::Outbound(e) => row(
                "outbound_events",
                &["tx", "chain", "from_addr", "to_addr", "asset", "asset_e8", "memo", "in_tx"],
                vec![
                    (&e.tx).into(), (&e.chain).into(), (&e.from_addr).into(), (&e.to_addr).into(),
                    (&e.asset).into(), e.asset_e8.into(), (&e.memo).into(), (&e.in_tx).into(),
                ],
            ),
            TypedEvent::Errata(e) => row(
                "errata_events",
                &["in_tx", "asset", "asset_e8", "rune_e8"],
                vec![(&e.in_tx).into(), (&e.asset).into(), e.asset_e8.into(), e.rune_e8.into()],
            ),
            TypedEvent::PoolBalanceChange(e) => row(
                "pool_balance_change_events",
                &["asset", "rune_e8", "asset_e8", "reason"],
                vec![(&e.asset).into(), e.rune_e8.into(), e.asset_e8.into(), (&e.reason).into()],
            ),
            TypedEvent::Pool(e) => row(
                "pool_events",
                &["asset", "status"],
                vec![(&e.asset).into(), (&e.status).into()],
            ),
            TypedEvent::Rewards(e) => {
                let mut rows = vec![build("rewards_events", &["bond_e8"], vec![e.bond_e8.into()])?];
                for entry in &e.per_pool {
                    rows.push(build(
                        "rewards_event_entries",
                        &["pool", "rune_e8"],
                        vec![(&entry.pool).into(), entry.e8.into()],
                    )?);
                }
                Ok(rows)
            }
            TypedEvent::Slash(e) => e
                .amounts
                .iter()
                .map(|amount| {
                    build(
                        "slash_events",
                        &["pool", "asset", "asset_e8"],
                        vec![(&e.pool).into(), (&amount.asset).into(), amount.e8.into()],
                    )
                })
                .collect(),
            TypedEvent::Reserve(e) => row(
                "reserve_events",
                &["tx", "chain", "from_addr", "to_addr", "asset", "asset_e8", "memo", "addr", "e8"],
                vec![
                    (&e.tx).into(), (&e.chain).into(), (&e.from_addr).into(), (&e.to_addr).into(),
                    (&e.asset).into(), e.asset_e8.into(), (&e.memo).into(), (&e.addr).into(),
                    e.e8.into(),
                ],
            ),
            TypedEvent::Bond(e) => row(
                "bond_events",
                &["tx", "chain", "from_addr", "to_addr", "asset", "asset_e8", "memo", "bond_type", "e8"],
                vec![
                    (&e.tx).into(), (&e.chain).into(), (&e.from_addr).into(), (&e.to_addr).into(),
                    (&e.asset).into(), e.asset_e8.into(), (&e.memo).into(), (&e.bond_type).into(),
                    e.e8.into(),
                ],
            ),
            TypedEvent::NewNode(e) => row("new_node_events", &["node_addr"], vec![(&e.node_addr).into()]),
            TypedEvent::UpdateNodeAccountStatus(e) => row(
                "update_node_account_status_events",
                &["node_addr", "former", "current"],
                vec![(&e.node_addr).into(), (&e.former).into(), (&e.current).into()],
            ),
            TypedEvent::SetNodeKeys(e) => row(
                "set_node_keys_events",
                &["node_addr", "secp256k1", "ed25519", "validator_consensus"],
                vec![
                    (&e.node_addr).into(), (&e.secp256k1).into(), (&e.ed25519).into(),
                    (&e.validator_consensus).into(),
                ],
            ),
            TypedEvent::SetVersion(e) => row(
                "set_version_events",
                &["node_addr", "version"],
                vec![(&e.node_addr).into(), (&e.version).into()],
            ),
            TypedEvent::ValidatorRequestLeave(e) => row(
                "validator_request_leave_events",
                &["tx", "from_addr", "node_addr"],
                vec![(&e.tx).into(), (&e.from_addr).into(), (&e.node_addr).into()],
            ),
            TypedEvent::Transfer(e) => row(
                "transfer_events",
                &["from_addr", "to_addr", "asset", "amount_e8"],
                vec![(&e.from_addr).into(), (&e.to_addr).into(), (&e.asset).into(), e.amount_e8.into()],
            ),
            TypedEvent::Switch(e) => row(
                "switch_events",
                &["tx", "from_addr", "to_addr", "burn_asset", "burn_e8", "mint_e8"],
                vec![
                    (&e.tx).into(), (&e.from_addr).into(), (&e.to_addr).into(),
                    (&e.burn_asset).into(), e.burn_e8.into(), e.mint_e8.into(),
                ],
            ),
            TypedEvent::LoanOpen(e) => row(
                "loan_open_events",
                &[
                    "owner", "collateral_asset", "collateral_deposited_e8", "debt_issued_tor_e8",
                    "collateralization_ratio", "target_asset",
                ],
                vec![
                    (&e.owner).into(), (&e.collateral_asset).into(),
                    e.collateral_deposited_e8.into(), e.debt_issued_tor_e8.into(),
                    e.collateralization_ratio.into(), (&e.target_asset).into(),
                ],
            ),
            TypedEvent::LoanRepayment(e) => row(
                "loan_repayment_events",
                &["owner", "collateral_asset", "collateral_withdrawn_e8", "debt_repaid_tor_e8"],
                vec![
                    (&e.owner).into(), (&e.collateral_asset).into(),
                    e.collateral_withdrawn_e8.into(), e.debt_repaid_tor_e8.into(),
                ],
            ),
            TypedEvent::MintBurn(e) => row(
                "mint_burn_events",
                &["supply", "denom", "amount_e8", "reason"],
                vec![(&e.supply).into(), (&e.denom).into(), e.amount_e8.into(), (&e.reason).into()],
            ),
            TypedEvent::SetMimir(e) => row(
                "set_mimir_events",
                &["key", "value"],
                vec![(&e.key).into(), (&e.value).into()],
            ),
            TypedEvent::DepthOverride(e) => row(
                "depth_override_events",
                &["pool", "asset_e8", "rune_e8", "synth_e8", "reason", "_synthetic"],
                vec![
                    (&e.pool).into(), e.asset_e8.into(), e.rune_e8.into(), e.synth_e8.into(),
                    (&e.reason).into(), true.into(),
                ],
            ),
        }
    }

    fn swap_pool(&self, swap: &Swap) -> String {
        if swap.pool.is_empty() {
            crate::demux::swap_pool(swap, &self.classifier)
        } else {
            swap.pool.clone()
        }
    }

    fn apply_depths(&self, event: &TypedEvent, meta: &Metadata, totals: &mut RunningTotals) {
        match event {
            TypedEvent::Add(e) => {
                totals.add_asset(&e.pool, e.asset_e8);
                totals.add_rune(&e.pool, e.rune_e8);
            }
            TypedEvent::AddLiquidity(e) => {
                totals.add_asset(&e.pool, e.asset_e8);
                totals.add_rune(&e.pool, e.rune_e8);
            }
            TypedEvent::Swap(e) => {
                let pool = self.swap_pool(e);
                match SwapDirection::of(e, &self.classifier) {
                    Some(SwapDirection::RuneToAsset) => {
                        totals.add_rune(&pool, e.from_e8);
                        totals.add_asset(&pool, -e.to_e8);
                    }
                    Some(SwapDirection::AssetToRune) => {
                        totals.add_asset(&pool, e.from_e8);
                        totals.add_rune(&pool, -e.to_e8);
                    }
                    Some(SwapDirection::RuneToSynth) => {
                        totals.add_rune(&pool, e.from_e8);
                        totals.add_synth(&pool, e.to_e8);
                    }
                    Some(SwapDirection::SynthToRune) => {
                        totals.add_synth(&pool, -e.from_e8);
                        totals.add_rune(&pool, -e.to_e8);
                    }
                    None => {}
                }
            }
            TypedEvent::Withdraw(e) => {
                totals.add_asset(&e.pool, -e.emit_asset_e8);
                totals.add_rune(&e.pool, -e.emit_rune_e8);
                totals.add_rune(&e.pool, e.imp_loss_protection_e8);
                let coin_kept = self
                    .withdraw_coin_kept_height
                    .map_or(false, |cutover| meta.block_height < cutover);
                if coin_kept {
                    if self.classifier.is_native(&e.asset) {
                        totals.add_rune(&e.pool, e.asset_e8);
                    } else if e.asset == e.pool {
                        totals.add_asset(&e.pool, e.asset_e8);
                    }
                }
            }
            TypedEvent::Pool(e) if e.is_suspended() => {
                totals.set(&e.asset, PoolDepths::default());
            }
            TypedEvent::Fee(e) if !self.classifier.is_native(&e.asset) => {
                let pool = pool_of(&e.asset);
                totals.add_asset(&pool, e.asset_e8);
                totals.add_rune(&pool, -e.pool_deduct);
            }
            TypedEvent::Gas(e) => {
                totals.add_asset(&e.asset, -e.asset_e8);
                totals.add_rune(&e.asset, e.rune_e8);
            }
            TypedEvent::Errata(e) => {
                totals.add_asset(&e.asset, e.asset_e8);
                totals.add_rune(&e.asset, e.rune_e8);
            }
            TypedEvent::PoolBalanceChange(e) => {
                totals.add_asset(&e.asset, e.asset_e8);
                totals.add_rune(&e.asset, e.rune_e8);
            }
            TypedEvent::Rewards(e) => {
                for entry in &e.per_pool {
                    totals.add_rune(&entry.pool, entry.e8);
                }
            }
            TypedEvent::Slash(e) => {
                for amount in &e.amounts {
                    if self.classifier.is_native(&amount.asset) {
                        totals.add_rune(&e.pool, amount.e8);
                    } else {
                        totals.add_asset(&e.pool, amount.e8);
                    }
                }
            }
            TypedEvent::DepthOverride(e) => {
                totals.set(
                    &e.pool,
                    PoolDepths {
                        asset_e8: e.asset_e8,
                        rune_e8: e.rune_e8,
                        synth_e8: e.synth_e8,
                    },
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Phase;
    use crate::database::{BatchInserter, MemoryStore, TolerantInserter};
    use std::sync::Arc;

    fn meta(height: i64) -> Metadata {
        Metadata::new(height, height * 1_000, Phase::Tx, 0)
    }

    fn swap(from: &str, from_e8: i64, to: &str, to_e8: i64) -> TypedEvent {
        TypedEvent::Swap(Swap {
            tx: "T".into(),
            chain: "BTC".into(),
            from_addr: "a".into(),
            to_addr: "b".into(),
            from_asset: from.into(),
            from_e8,
            to_asset: to.into(),
            to_e8,
            memo: String::new(),
            pool: "BTC.BTC".into(),
            to_e8_min: 0,
            swap_slip_bp: 0,
            liq_fee_e8: 0,
            liq_fee_in_rune_e8: 0,
        })
    }

    #[tokio::test]
    async fn synth_swaps_never_touch_the_asset_ledger() {
        let store = Arc::new(MemoryStore::new());
        let mut inserter = BatchInserter::new(store);
        let mut totals = RunningTotals::new();
        let mut recorder = EventRecorder::new(AssetClassifier::default(), None);

        inserter.start_block().unwrap();
        recorder
            .record(&swap("THOR.RUNE", 50, "BTC/BTC", 5), &meta(1), &mut totals, &mut inserter)
            .await
            .unwrap();
        recorder
            .record(&swap("BTC/BTC", 2, "THOR.RUNE", 19), &meta(1), &mut totals, &mut inserter)
            .await
            .unwrap();
        inserter.end_block().unwrap();

        let depths = totals.get("BTC.BTC");
        assert_eq!(depths.asset_e8, 0);
        assert_eq!(depths.rune_e8, 31);
        assert_eq!(depths.synth_e8, 3);
        assert_eq!(recorder.take_stats().recorded, 2);
    }

    #[tokio::test]
    async fn withdraw_coin_cutover() {
        let withdraw = |asset: &str| {
            TypedEvent::Withdraw(Withdraw {
                tx: "W".into(),
                chain: "THOR".into(),
                from_addr: "a".into(),
                to_addr: "b".into(),
                asset: asset.into(),
                asset_e8: 1,
                emit_asset_e8: 10,
                emit_rune_e8: 20,
                memo: String::new(),
                pool: "BTC.BTC".into(),
                stake_units: 5,
                basis_points: 10000,
                asymmetry: "0".into(),
                imp_loss_protection_e8: 3,
            })
        };
        let store = Arc::new(MemoryStore::new());
        let mut inserter = BatchInserter::new(store);
        let mut recorder = EventRecorder::new(AssetClassifier::default(), Some(100));

        let mut before = RunningTotals::new();
        inserter.start_block().unwrap();
        recorder.record(&withdraw("THOR.RUNE"), &meta(99), &mut before, &mut inserter).await.unwrap();
        assert_eq!(before.get("BTC.BTC").rune_e8, -20 + 3 + 1);
        assert_eq!(before.get("BTC.BTC").asset_e8, -10);

        let mut after = RunningTotals::new();
        recorder.record(&withdraw("THOR.RUNE"), &meta(100), &mut after, &mut inserter).await.unwrap();
        assert_eq!(after.get("BTC.BTC").rune_e8, -20 + 3);

        let mut asset_coin = RunningTotals::new();
        recorder.record(&withdraw("BTC.BTC"), &meta(99), &mut asset_coin, &mut inserter).await.unwrap();
        assert_eq!(asset_coin.get("BTC.BTC").asset_e8, -10 + 1);
    }

    #[tokio::test]
    async fn refused_row_abandons_depth_change() {
        let store = Arc::new(MemoryStore::new());
        let mut inserter = BatchInserter::new(store);
        let mut totals = RunningTotals::new();
        let mut recorder = EventRecorder::new(AssetClassifier::default(), None);

        // No open block, so the inserter refuses every row
        let event = TypedEvent::Gas(Gas {
            asset: "BTC.BTC".into(),
            asset_e8: 5,
            rune_e8: 7,
            tx_count: 1,
        });
        recorder.record(&event, &meta(3), &mut totals, &mut inserter).await.unwrap();
        assert!(totals.is_empty());
        assert_eq!(recorder.take_stats().rejected, 1);
    }

    #[tokio::test]
    async fn database_rejection_abandons_depth_change() {
        let store = Arc::new(MemoryStore::new());
        store.reject_table("add_events").await;
        let mut inserter = TolerantInserter::new(store.clone());
        let mut totals = RunningTotals::new();
        let mut recorder = EventRecorder::new(AssetClassifier::default(), None);

        let add = TypedEvent::Add(Add {
            tx: "A".into(),
            chain: "BTC".into(),
            from_addr: "a".into(),
            to_addr: "b".into(),
            asset: "BTC.BTC".into(),
            asset_e8: 10,
            rune_e8: 0,
            memo: "donate".into(),
            pool: "BTC.BTC".into(),
        });
        inserter.start_block().unwrap();
        recorder.record(&add, &meta(4), &mut totals, &mut inserter).await.unwrap();
        inserter.end_block().unwrap();
        inserter.flush().await.unwrap();

        assert_eq!(totals.get("BTC.BTC").asset_e8, 0);
        assert!(store.rows("add_events").await.is_empty());
        assert_eq!(recorder.take_stats(), RecordStats { recorded: 0, rejected: 1 });
    }

    #[tokio::test]
    async fn multi_row_event_is_kept_or_dropped_whole() {
        let store = Arc::new(MemoryStore::new());
        store.reject_table("rewards_event_entries").await;
        let mut inserter = TolerantInserter::new(store.clone());
        let mut totals = RunningTotals::new();
        let mut recorder = EventRecorder::new(AssetClassifier::default(), None);

        let rewards = TypedEvent::Rewards(Rewards {
            bond_e8: 100,
            per_pool: vec![
                PoolAmount { pool: "BTC.BTC".into(), e8: 7 },
                PoolAmount { pool: "ETH.ETH".into(), e8: 9 },
            ],
        });
        inserter.start_block().unwrap();
        recorder.record(&rewards, &meta(5), &mut totals, &mut inserter).await.unwrap();
        inserter.end_block().unwrap();
        inserter.flush().await.unwrap();

        assert!(store.rows("rewards_events").await.is_empty());
        assert!(store.rows("rewards_event_entries").await.is_empty());
        assert!(totals.is_empty());
    }

    #[tokio::test]
    async fn storage_outage_is_not_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true).await;
        let mut inserter = TolerantInserter::new(store);
        let mut totals = RunningTotals::new();
        let mut recorder = EventRecorder::new(AssetClassifier::default(), None);

        let event = TypedEvent::NewNode(NewNode { node_addr: "thor1node".into() });
        inserter.start_block().unwrap();
        let err = recorder.record(&event, &meta(6), &mut totals, &mut inserter).await.unwrap_err();
        assert!(!err.is_row_refusal());
    }
}
