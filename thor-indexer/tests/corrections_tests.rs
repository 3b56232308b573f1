//! Correction tables loaded from configuration, applied through the demux

use anyhow::Result;
use chrono::DateTime;

use thor_indexer::config::CorrectionsConfig;
use thor_indexer::core::{AssetClassifier, Block, EventId, Metadata, Phase, RawEvent, TxResult};
use thor_indexer::demux::corrections::{CorrectionTable, InjectedEvent, InjectedKind, WithdrawOverride};
use thor_indexer::demux::{Demux, EventSink, TypedEvent};

#[derive(Default)]
struct Collect(Vec<(TypedEvent, EventId)>);

impl EventSink for Collect {
    fn on_event(&mut self, event: &TypedEvent, meta: &Metadata) {
        self.0.push((event.clone(), meta.event_id));
    }
}

fn withdraw(pool: &str) -> RawEvent {
    RawEvent::new("withdraw")
        .with("id", "WTX")
        .with("chain", "THOR")
        .with("from", "thor1lp")
        .with("to", "thor1vault")
        .with("coin", "0 THOR.RUNE")
        .with("memo", "-:BTC.BTC")
        .with("pool", pool)
        .with("liquidity_provider_units", "500")
        .with("emit_asset", "10")
        .with("emit_rune", "20")
}

fn block(height: i64, events: Vec<RawEvent>) -> Block {
    Block {
        height,
        timestamp: DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
        hash: vec![1],
        begin_events: vec![],
        txs: vec![TxResult { code: 0, events }],
        end_events: vec![RawEvent::new("pool").with("pool", "BTC.BTC").with("pool_status", "Available")],
    }
}

fn config() -> CorrectionsConfig {
    CorrectionsConfig {
        withdraw_overrides: vec![
            WithdrawOverride {
                height: 7,
                chain_id: Some("mainnet".to_string()),
                pool: "BTC.BTC".to_string(),
                from_addr: None,
                emit_asset_e8: Some(11),
                emit_rune_e8: None,
                stake_units: None,
            },
            WithdrawOverride {
                height: 7,
                chain_id: None,
                pool: "BTC.BTC".to_string(),
                from_addr: Some("thor1lp".to_string()),
                emit_asset_e8: Some(12),
                emit_rune_e8: Some(25),
                stake_units: None,
            },
        ],
        injected: vec![InjectedEvent {
            height: 7,
            chain_id: Some("mainnet".to_string()),
            kind: InjectedKind::DepthOverride,
            pool: "ETH.ETH".to_string(),
            asset_e8: 1,
            rune_e8: 2,
            synth_e8: 0,
            reason: "reconcile".to_string(),
        }],
        ..CorrectionsConfig::default()
    }
}

fn demux(chain_id: &str) -> Demux {
    let classifier = AssetClassifier::default();
    let table = CorrectionTable::load(&config(), chain_id, classifier.clone(), None);
    Demux::new(classifier, table, false, Vec::<String>::new())
}

#[test]
fn overrides_compose_in_order_on_matching_chain() -> Result<()> {
    let mut sink = Collect::default();
    let stats = demux("mainnet").process_block(&block(7, vec![withdraw("BTC.BTC")]), &mut sink);
    assert_eq!(stats.injected, 1);

    let TypedEvent::Withdraw(w) = &sink.0[0].0 else {
        panic!("expected a withdraw, got {:?}", sink.0[0].0);
    };
    // the second override ran last and wins
    assert_eq!((w.emit_asset_e8, w.emit_rune_e8), (12, 25));

    let (injected, id) = sink.0.last().unwrap();
    assert!(matches!(injected, TypedEvent::DepthOverride(d) if d.pool == "ETH.ETH"));
    // after the single ordinary end event
    assert_eq!(*id, EventId::new(7, Phase::End, 1));
    Ok(())
}

#[test]
fn other_chains_only_see_unscoped_entries() -> Result<()> {
    let mut sink = Collect::default();
    let stats = demux("stagenet").process_block(&block(7, vec![withdraw("BTC.BTC")]), &mut sink);
    assert_eq!(stats.injected, 0);
    let TypedEvent::Withdraw(w) = &sink.0[0].0 else {
        panic!("expected a withdraw");
    };
    assert_eq!((w.emit_asset_e8, w.emit_rune_e8), (12, 25));
    assert_eq!(sink.0.len(), 2);
    Ok(())
}

#[test]
fn other_heights_are_untouched() -> Result<()> {
    let mut sink = Collect::default();
    demux("mainnet").process_block(&block(8, vec![withdraw("BTC.BTC")]), &mut sink);
    let TypedEvent::Withdraw(w) = &sink.0[0].0 else {
        panic!("expected a withdraw");
    };
    assert_eq!((w.emit_asset_e8, w.emit_rune_e8), (10, 20));
    Ok(())
}
