//! Height-keyed historical corrections
//!
//! Corrections are registered once at startup for the active chain. A
//! mutation may rewrite or discard an event about to be recorded; an
//! injection adds synthetic events after the block's ordinary events.
//! Nothing here touches persisted rows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::events::{Add, DepthOverride, Errata, TypedEvent};
use super::loader::SwapDirection;
use crate::config::CorrectionsConfig;
use crate::core::AssetClassifier;

/// Outcome of running the corrections for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Discard(String),
}

type Patch = Arc<dyn Fn(&mut TypedEvent) -> Verdict + Send + Sync>;

#[derive(Clone)]
struct Mutation {
    name: String,
    patch: Patch,
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation").field("name", &self.name).finish()
    }
}

/// Emit amounts replacing what the chain reported for one withdraw
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawOverride {
    pub height: i64,
    #[serde(default)]
    pub chain_id: Option<String>,
    pub pool: String,
    /// Only withdraws from this address are patched when set
    #[serde(default)]
    pub from_addr: Option<String>,
    #[serde(default)]
    pub emit_asset_e8: Option<i64>,
    #[serde(default)]
    pub emit_rune_e8: Option<i64>,
    #[serde(default)]
    pub stake_units: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InjectedKind {
    Add,
    Errata,
    DepthOverride,
}

/// Synthetic event added at the end of a block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectedEvent {
    pub height: i64,
    #[serde(default)]
    pub chain_id: Option<String>,
    pub kind: InjectedKind,
    pub pool: String,
    #[serde(default)]
    pub asset_e8: i64,
    #[serde(default)]
    pub rune_e8: i64,
    #[serde(default)]
    pub synth_e8: i64,
    #[serde(default)]
    pub reason: String,
}

impl InjectedEvent {
    pub fn to_event(&self) -> TypedEvent {
        match self.kind {
            InjectedKind::Add => TypedEvent::Add(synthetic_add(
                &self.pool,
                self.asset_e8,
                self.rune_e8,
                &self.reason,
            )),
            InjectedKind::Errata => TypedEvent::Errata(Errata {
                in_tx: String::new(),
                asset: self.pool.clone(),
                asset_e8: self.asset_e8,
                rune_e8: self.rune_e8,
            }),
            InjectedKind::DepthOverride => TypedEvent::DepthOverride(DepthOverride {
                pool: self.pool.clone(),
                asset_e8: self.asset_e8,
                rune_e8: self.rune_e8,
                synth_e8: self.synth_e8,
                reason: self.reason.clone(),
            }),
        }
    }
}

/// Pool state replayed as a donation at the genesis height
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenesisPool {
    pub pool: String,
    pub asset_e8: i64,
    pub rune_e8: i64,
}

fn synthetic_add(pool: &str, asset_e8: i64, rune_e8: i64, memo: &str) -> Add {
    Add {
        tx: String::new(),
        chain: String::new(),
        from_addr: String::new(),
        to_addr: String::new(),
        asset: pool.to_string(),
        asset_e8,
        rune_e8,
        memo: memo.to_string(),
        pool: pool.to_string(),
    }
}

/// Immutable correction set for one chain
#[derive(Debug, Clone)]
pub struct CorrectionTable {
    chain_id: String,
    classifier: AssetClassifier,
    withdraw_pending_cutoff_height: Option<i64>,
    mutations: HashMap<i64, Vec<Mutation>>,
    injections: HashMap<i64, Vec<TypedEvent>>,
}

impl CorrectionTable {
    pub fn builder(chain_id: impl Into<String>, classifier: AssetClassifier) -> CorrectionBuilder {
        CorrectionBuilder {
            table: CorrectionTable {
                chain_id: chain_id.into(),
                classifier,
                withdraw_pending_cutoff_height: None,
                mutations: HashMap::new(),
                injections: HashMap::new(),
            },
        }
    }

    /// Builds the table for `chain_id` from the deployment configuration
    pub fn load(
        config: &CorrectionsConfig,
        chain_id: &str,
        classifier: AssetClassifier,
        genesis_height: Option<i64>,
    ) -> Self {
        let mut builder = Self::builder(chain_id, classifier)
            .withdraw_pending_cutoff(config.withdraw_pending_cutoff_height);

        for over in &config.withdraw_overrides {
            let over_name = format!("withdraw override {} {}", over.height, over.pool);
            let patch = over.clone();
            builder = builder.mutate(over.height, over.chain_id.as_deref(), over_name, move |event| {
                if let TypedEvent::Withdraw(withdraw) = event {
                    let address_matches = patch
                        .from_addr
                        .as_deref()
                        .map_or(true, |addr| addr == withdraw.from_addr);
                    if withdraw.pool == patch.pool && address_matches {
                        if let Some(e8) = patch.emit_asset_e8 {
                            withdraw.emit_asset_e8 = e8;
                        }
                        if let Some(e8) = patch.emit_rune_e8 {
                            withdraw.emit_rune_e8 = e8;
                        }
                        if let Some(units) = patch.stake_units {
                            withdraw.stake_units = units;
                        }
                    }
                }
                Verdict::Keep
            });
        }

        if let Some(height) = genesis_height {
            for pool in &config.genesis_pools {
                builder = builder.inject(
                    height,
                    None,
                    TypedEvent::Add(synthetic_add(&pool.pool, pool.asset_e8, pool.rune_e8, "genesis")),
                );
            }
        }

        for injected in &config.injected {
            builder = builder.inject(injected.height, injected.chain_id.as_deref(), injected.to_event());
        }

        builder.build()
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Runs the always-on rules and then every mutation registered at
    /// `height`, in registration order. The first discard wins.
    pub fn apply(&self, height: i64, event: &mut TypedEvent) -> Verdict {
        if let Verdict::Discard(reason) = self.always_on(height, event) {
            return Verdict::Discard(reason);
        }
        if let Some(mutations) = self.mutations.get(&height) {
            for mutation in mutations {
                if let Verdict::Discard(reason) = (mutation.patch)(event) {
                    return Verdict::Discard(format!("{}: {}", mutation.name, reason));
                }
            }
        }
        Verdict::Keep
    }

    /// Synthetic events for `height`, in registration order
    pub fn injected(&self, height: i64) -> &[TypedEvent] {
        self.injections.get(&height).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_corrections(&self, height: i64) -> bool {
        self.mutations.contains_key(&height) || self.injections.contains_key(&height)
    }

    fn always_on(&self, height: i64, event: &TypedEvent) -> Verdict {
        match event {
            TypedEvent::Swap(swap) if SwapDirection::of(swap, &self.classifier).is_none() => {
                Verdict::Discard(format!(
                    "swap {} -> {} does not have exactly one native side",
                    swap.from_asset, swap.to_asset
                ))
            }
            TypedEvent::Withdraw(withdraw)
                if withdraw.stake_units == 0
                    && self
                        .withdraw_pending_cutoff_height
                        .map_or(false, |cutoff| height < cutoff) =>
            {
                Verdict::Discard("pending withdraw with zero units".to_string())
            }
            _ => Verdict::Keep,
        }
    }
}

pub struct CorrectionBuilder {
    table: CorrectionTable,
}

impl CorrectionBuilder {
    pub fn withdraw_pending_cutoff(mut self, height: Option<i64>) -> Self {
        self.table.withdraw_pending_cutoff_height = height;
        self
    }

    /// Registers a mutation; entries scoped to another chain are ignored
    pub fn mutate<F>(mut self, height: i64, chain_id: Option<&str>, name: impl Into<String>, patch: F) -> Self
    where
        F: Fn(&mut TypedEvent) -> Verdict + Send + Sync + 'static,
    {
        if self.in_scope(chain_id) {
            self.table.mutations.entry(height).or_default().push(Mutation {
                name: name.into(),
                patch: Arc::new(patch),
            });
        }
        self
    }

    pub fn inject(mut self, height: i64, chain_id: Option<&str>, event: TypedEvent) -> Self {
        if self.in_scope(chain_id) {
            self.table.injections.entry(height).or_default().push(event);
        }
        self
    }

    pub fn build(self) -> CorrectionTable {
        self.table
    }

    fn in_scope(&self, chain_id: Option<&str>) -> bool {
        chain_id.map_or(true, |id| id == self.table.chain_id)
    }
}
