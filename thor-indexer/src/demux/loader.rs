//! Attribute loaders, one per event kind
//!
//! Every loader reads a fixed attribute set. A missing or malformed
//! attribute fails the single event, never the block.

use super::attributes::{Attributes, Coin};
use super::events::*;
use crate::core::{pool_of, AssetClass, AssetClassifier, ParseError};

/// Attributes shared by every event that describes an inbound transaction
struct TxFields {
    tx: String,
    chain: String,
    from_addr: String,
    to_addr: String,
    coins: Vec<Coin>,
    memo: String,
}

impl TxFields {
    fn load(attrs: &Attributes) -> Result<Self, ParseError> {
        Ok(Self {
            tx: attrs.string_or_empty("id"),
            chain: attrs.string_or_empty("chain"),
            from_addr: attrs.string_or_empty("from"),
            to_addr: attrs.string_or_empty("to"),
            coins: match attrs.opt_str("coin") {
                Some(_) => attrs.coins("coin")?,
                None => Vec::new(),
            },
            memo: attrs.string_or_empty("memo"),
        })
    }

    fn first_coin(&self) -> Coin {
        self.coins
            .first()
            .cloned()
            .unwrap_or_else(|| Coin::new("", 0))
    }
}

impl TypedEvent {
    /// Builds the typed event for `attrs`. Unrecognized kinds yield `None`.
    pub fn load(
        attrs: &Attributes,
        classifier: &AssetClassifier,
    ) -> Result<Option<TypedEvent>, ParseError> {
        let event = match attrs.kind() {
            "add" => TypedEvent::Add(load_add(attrs, classifier)?),
            "add_liquidity" => TypedEvent::AddLiquidity(load_add_liquidity(attrs)?),
            "pending_liquidity" => TypedEvent::PendingLiquidity(load_pending_liquidity(attrs)?),
            "withdraw" => TypedEvent::Withdraw(load_withdraw(attrs)?),
            "swap" => TypedEvent::Swap(load_swap(attrs)?),
            "fee" => TypedEvent::Fee(load_fee(attrs)?),
            "gas" => TypedEvent::Gas(Gas {
                asset: attrs.string("asset")?,
                asset_e8: attrs.int("asset_amt")?,
                rune_e8: attrs.int("rune_amt")?,
                tx_count: attrs.int_or_zero("transaction_count")?,
            }),
            "refund" => TypedEvent::Refund(load_refund(attrs)?),
            "outbound" => TypedEvent::Outbound(load_outbound(attrs)?),
            "errata" => TypedEvent::Errata(Errata {
                in_tx: attrs.string_or_empty("in_tx_id"),
                asset: attrs.string("asset")?,
                asset_e8: signed(attrs, "asset_amt", "asset_add")?,
                rune_e8: signed(attrs, "rune_amt", "rune_add")?,
            }),
            "pool_balance_change" => TypedEvent::PoolBalanceChange(PoolBalanceChange {
                asset: attrs.string("asset")?,
                rune_e8: signed(attrs, "rune_amt", "rune_add")?,
                asset_e8: signed(attrs, "asset_amt", "asset_add")?,
                reason: attrs.string_or_empty("reason"),
            }),
            "pool" => TypedEvent::Pool(Pool {
                asset: attrs.string("pool")?,
                status: attrs.string("pool_status")?,
            }),
            "rewards" => TypedEvent::Rewards(load_rewards(attrs)?),
            "slash" => TypedEvent::Slash(load_slash(attrs)?),
            "reserve" => TypedEvent::Reserve(load_reserve(attrs)?),
            "bond" => TypedEvent::Bond(load_bond(attrs)?),
            "new_node" => TypedEvent::NewNode(NewNode {
                node_addr: attrs.string("address")?,
            }),
            "update_node_account_status" | "UpdateNodeAccountStatus" => {
                TypedEvent::UpdateNodeAccountStatus(UpdateNodeAccountStatus {
                    node_addr: first_of(attrs, &["Address", "address"])?,
                    former: first_of(attrs, &["Former", "former"])?,
                    current: first_of(attrs, &["Current", "current"])?,
                })
            }
            "set_node_keys" => TypedEvent::SetNodeKeys(SetNodeKeys {
                node_addr: attrs.string("node_address")?,
                secp256k1: attrs.string_or_empty("node_secp256k1_pubkey"),
                ed25519: attrs.string_or_empty("node_ed25519_pubkey"),
                validator_consensus: attrs.string_or_empty("validator_consensus_pub_key"),
            }),
            "set_version" => TypedEvent::SetVersion(SetVersion {
                node_addr: attrs.string("node_address")?,
                version: attrs.string("version")?,
            }),
            "validator_request_leave" => TypedEvent::ValidatorRequestLeave(ValidatorRequestLeave {
                tx: attrs.string_or_empty("tx"),
                from_addr: attrs.string_or_empty("signer bnb address"),
                node_addr: attrs.string("node address")?,
            }),
            "transfer" => TypedEvent::Transfer(load_transfer(attrs, classifier)?),
            "switch" => TypedEvent::Switch(load_switch(attrs)?),
            "loan_open" => TypedEvent::LoanOpen(LoanOpen {
                owner: attrs.string("owner")?,
                collateral_asset: attrs.string("collateral_asset")?,
                collateral_deposited_e8: attrs.int("collateral_deposited")?,
                debt_issued_tor_e8: attrs.int("debt_issued")?,
                collateralization_ratio: attrs.int_or_zero("collateralization_ratio")?,
                target_asset: attrs.string_or_empty("target_asset"),
            }),
            "loan_repayment" => TypedEvent::LoanRepayment(LoanRepayment {
                owner: attrs.string("owner")?,
                collateral_asset: attrs.string("collateral_asset")?,
                collateral_withdrawn_e8: attrs.int("collateral_withdrawn")?,
                debt_repaid_tor_e8: attrs.int("debt_repaid")?,
            }),
            "mint_burn" => TypedEvent::MintBurn(MintBurn {
                supply: attrs.string("supply")?,
                denom: attrs.string("denom")?,
                amount_e8: attrs.int("amount")?,
                reason: attrs.string_or_empty("reason"),
            }),
            "set_mimir" => TypedEvent::SetMimir(SetMimir {
                key: attrs.string("key")?,
                value: attrs.string("value")?,
            }),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn load_add(attrs: &Attributes, classifier: &AssetClassifier) -> Result<Add, ParseError> {
    let tx = TxFields::load(attrs)?;
    let pool = attrs.string("pool")?;
    let mut asset = String::new();
    let mut asset_e8 = 0;
    let mut rune_e8 = 0;
    for coin in &tx.coins {
        if classifier.is_native(&coin.asset) {
            rune_e8 += coin.e8;
        } else {
            asset_e8 += coin.e8;
            asset = coin.asset.clone();
        }
    }
    Ok(Add {
        tx: tx.tx,
        chain: tx.chain,
        from_addr: tx.from_addr,
        to_addr: tx.to_addr,
        asset,
        asset_e8,
        rune_e8,
        memo: tx.memo,
        pool,
    })
}

/// Transaction ids arrive as `<CHAIN>_txid`; the `THOR` chain id names the
/// rune side, any other chain the asset side.
fn liquidity_txids(attrs: &Attributes) -> (String, String, String) {
    let mut rune_tx = String::new();
    let mut asset_tx = String::new();
    let mut asset_chain = String::new();
    for (key, value) in attrs.iter() {
        if let Some(chain) = key.strip_suffix("_txid") {
            if chain.eq_ignore_ascii_case("THOR") {
                rune_tx = value.to_string();
            } else {
                asset_tx = value.to_string();
                asset_chain = chain.to_string();
            }
        }
    }
    (rune_tx, asset_tx, asset_chain)
}

fn load_add_liquidity(attrs: &Attributes) -> Result<AddLiquidity, ParseError> {
    let (rune_tx, asset_tx, asset_chain) = liquidity_txids(attrs);
    Ok(AddLiquidity {
        pool: attrs.string("pool")?,
        asset_tx,
        asset_chain,
        asset_addr: attrs.string_or_empty("asset_address"),
        asset_e8: attrs.int_or_zero("asset_amount")?,
        rune_tx,
        rune_addr: attrs.string_or_empty("rune_address"),
        rune_e8: attrs.int_or_zero("rune_amount")?,
        stake_units: attrs.int("liquidity_provider_units")?,
    })
}

fn load_pending_liquidity(attrs: &Attributes) -> Result<PendingLiquidity, ParseError> {
    let (rune_tx, asset_tx, asset_chain) = liquidity_txids(attrs);
    Ok(PendingLiquidity {
        pool: attrs.string("pool")?,
        asset_tx,
        asset_chain,
        asset_addr: attrs.string_or_empty("asset_address"),
        asset_e8: attrs.int_or_zero("asset_amount")?,
        rune_tx,
        rune_addr: attrs.string_or_empty("rune_address"),
        rune_e8: attrs.int_or_zero("rune_amount")?,
        pending_type: attrs.string_or_empty("type"),
    })
}

fn load_withdraw(attrs: &Attributes) -> Result<Withdraw, ParseError> {
    let tx = TxFields::load(attrs)?;
    let coin = tx.first_coin();
    Ok(Withdraw {
        asset: coin.asset,
        asset_e8: coin.e8,
        emit_asset_e8: attrs.int_or_zero("emit_asset")?,
        emit_rune_e8: attrs.int_or_zero("emit_rune")?,
        pool: attrs.string("pool")?,
        stake_units: attrs.int("liquidity_provider_units")?,
        basis_points: attrs.int_or_zero("basis_points")?,
        asymmetry: attrs.string_or_empty("asymmetry"),
        imp_loss_protection_e8: attrs.int_or_zero("imp_loss_protection")?,
        tx: tx.tx,
        chain: tx.chain,
        from_addr: tx.from_addr,
        to_addr: tx.to_addr,
        memo: tx.memo,
    })
}

fn load_swap(attrs: &Attributes) -> Result<Swap, ParseError> {
    let tx = TxFields::load(attrs)?;
    let from = tx
        .coins
        .first()
        .cloned()
        .ok_or_else(|| attrs.invalid("swap without an input coin"))?;
    let to = attrs.coin("emit_asset")?;
    Ok(Swap {
        tx: tx.tx,
        chain: tx.chain,
        from_addr: tx.from_addr,
        to_addr: tx.to_addr,
        from_asset: from.asset,
        from_e8: from.e8,
        to_asset: to.asset,
        to_e8: to.e8,
        memo: tx.memo,
        pool: attrs.string("pool")?,
        to_e8_min: attrs.int_or_zero("swap_target")?,
        swap_slip_bp: attrs.int_or_zero("swap_slip")?,
        liq_fee_e8: attrs.int_or_zero("liquidity_fee")?,
        liq_fee_in_rune_e8: attrs.int_or_zero("liquidity_fee_in_rune")?,
    })
}

fn load_fee(attrs: &Attributes) -> Result<Fee, ParseError> {
    let coin = attrs
        .coins("coins")?
        .into_iter()
        .next()
        .ok_or_else(|| attrs.invalid("fee without a coin"))?;
    Ok(Fee {
        tx: attrs.string_or_empty("tx_id"),
        asset: coin.asset,
        asset_e8: coin.e8,
        pool_deduct: attrs.int_or_zero("pool_deduct")?,
    })
}

fn load_refund(attrs: &Attributes) -> Result<Refund, ParseError> {
    let tx = TxFields::load(attrs)?;
    let first = tx.first_coin();
    let second = tx.coins.get(1).cloned().unwrap_or_else(|| Coin::new("", 0));
    Ok(Refund {
        tx: tx.tx,
        chain: tx.chain,
        from_addr: tx.from_addr,
        to_addr: tx.to_addr,
        asset: first.asset,
        asset_e8: first.e8,
        asset_2nd: second.asset,
        asset_2nd_e8: second.e8,
        memo: tx.memo,
        code: attrs.int_or_zero("code")?,
        reason: attrs.string_or_empty("reason"),
    })
}

fn load_outbound(attrs: &Attributes) -> Result<Outbound, ParseError> {
    let tx = TxFields::load(attrs)?;
    let coin = tx.first_coin();
    Ok(Outbound {
        in_tx: attrs.string("in_tx_id")?,
        tx: tx.tx,
        chain: tx.chain,
        from_addr: tx.from_addr,
        to_addr: tx.to_addr,
        asset: coin.asset,
        asset_e8: coin.e8,
        memo: tx.memo,
    })
}

fn load_rewards(attrs: &Attributes) -> Result<Rewards, ParseError> {
    let mut per_pool = Vec::new();
    for (key, value) in attrs.iter() {
        if key == "bond_reward" {
            continue;
        }
        per_pool.push(PoolAmount {
            pool: key.to_string(),
            e8: attrs.parse_int(key, value)?,
        });
    }
    Ok(Rewards {
        bond_e8: attrs.int_or_zero("bond_reward")?,
        per_pool,
    })
}

fn load_slash(attrs: &Attributes) -> Result<Slash, ParseError> {
    let mut amounts = Vec::new();
    for (key, value) in attrs.iter() {
        if key == "pool" {
            continue;
        }
        amounts.push(SignedCoin {
            asset: key.to_string(),
            e8: attrs.parse_int(key, value)?,
        });
    }
    Ok(Slash {
        pool: attrs.string("pool")?,
        amounts,
    })
}

fn load_reserve(attrs: &Attributes) -> Result<Reserve, ParseError> {
    let tx = TxFields::load(attrs)?;
    let coin = tx.first_coin();
    Ok(Reserve {
        addr: attrs.string("contributor_address")?,
        e8: attrs.int("amount")?,
        tx: tx.tx,
        chain: tx.chain,
        from_addr: tx.from_addr,
        to_addr: tx.to_addr,
        asset: coin.asset,
        asset_e8: coin.e8,
        memo: tx.memo,
    })
}

fn load_bond(attrs: &Attributes) -> Result<Bond, ParseError> {
    let tx = TxFields::load(attrs)?;
    let coin = tx.first_coin();
    Ok(Bond {
        bond_type: attrs.string("bond_type")?,
        e8: attrs.int("amount")?,
        tx: tx.tx,
        chain: tx.chain,
        from_addr: tx.from_addr,
        to_addr: tx.to_addr,
        asset: coin.asset,
        asset_e8: coin.e8,
        memo: tx.memo,
    })
}

fn load_transfer(attrs: &Attributes, classifier: &AssetClassifier) -> Result<Transfer, ParseError> {
    let amount = attrs.str("amount")?;
    let (amount_e8, denom) =
        Coin::parse_denom(amount).ok_or_else(|| ParseError::InvalidCoin {
            kind: attrs.kind().to_string(),
            key: "amount".to_string(),
            value: amount.to_string(),
        })?;
    Ok(Transfer {
        from_addr: attrs.string("sender")?,
        to_addr: attrs.string("recipient")?,
        asset: classifier.asset_from_denom(&denom),
        amount_e8,
    })
}

fn load_switch(attrs: &Attributes) -> Result<Switch, ParseError> {
    let burn = attrs.coin("burn")?;
    Ok(Switch {
        tx: attrs.string_or_empty("txid"),
        from_addr: attrs.string("from")?,
        to_addr: attrs.string("to")?,
        burn_asset: burn.asset,
        burn_e8: burn.e8,
        mint_e8: burn.e8,
    })
}

/// Unsigned amount plus a direction flag, as used by errata and balance
/// change events
fn signed(attrs: &Attributes, amount_key: &str, add_key: &str) -> Result<i64, ParseError> {
    let amount = attrs.int_or_zero(amount_key)?;
    if attrs.opt_str(add_key).is_none() {
        return Ok(amount);
    }
    Ok(if attrs.bool(add_key)? { amount } else { -amount })
}

fn first_of(attrs: &Attributes, keys: &[&str]) -> Result<String, ParseError> {
    for key in keys {
        if let Some(value) = attrs.opt_str(key) {
            return Ok(value.to_string());
        }
    }
    attrs.string(keys[0])
}

/// Direction of a swap relative to its pool, stored in `swap_events._direction`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    RuneToAsset = 0,
    AssetToRune = 1,
    RuneToSynth = 2,
    SynthToRune = 3,
}

impl SwapDirection {
    /// Classifies a swap; exactly one side must be native
    pub fn of(swap: &Swap, classifier: &AssetClassifier) -> Option<Self> {
        match (
            classifier.classify(&swap.from_asset),
            classifier.classify(&swap.to_asset),
        ) {
            (AssetClass::Native, AssetClass::Layer1) => Some(SwapDirection::RuneToAsset),
            (AssetClass::Layer1, AssetClass::Native) => Some(SwapDirection::AssetToRune),
            (AssetClass::Native, AssetClass::Synth) => Some(SwapDirection::RuneToSynth),
            (AssetClass::Synth, AssetClass::Native) => Some(SwapDirection::SynthToRune),
            _ => None,
        }
    }
}

/// Pool a swap settles against, derived from its non-native side
pub fn swap_pool(swap: &Swap, classifier: &AssetClassifier) -> String {
    if classifier.is_native(&swap.from_asset) {
        pool_of(&swap.to_asset)
    } else {
        pool_of(&swap.from_asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RawEvent;

    fn load(raw: RawEvent) -> Result<Option<TypedEvent>, ParseError> {
        let attrs = Attributes::decode(&raw, false)?;
        TypedEvent::load(&attrs, &AssetClassifier::default())
    }

    #[test]
    fn swap_fields() {
        let raw = RawEvent::new("swap")
            .with("id", "ABC")
            .with("chain", "BTC")
            .with("from", "bc1q")
            .with("to", "thor1")
            .with("coin", "100 BTC.BTC")
            .with("memo", "=:THOR.RUNE:thor1")
            .with("pool", "BTC.BTC")
            .with("swap_target", "190")
            .with("swap_slip", "5")
            .with("liquidity_fee", "3")
            .with("liquidity_fee_in_rune", "6")
            .with("emit_asset", "200 THOR.RUNE");
        let Some(TypedEvent::Swap(swap)) = load(raw).unwrap() else {
            panic!("expected a swap");
        };
        assert_eq!(swap.from_asset, "BTC.BTC");
        assert_eq!(swap.from_e8, 100);
        assert_eq!(swap.to_asset, "THOR.RUNE");
        assert_eq!(swap.to_e8, 200);
        assert_eq!(swap.to_e8_min, 190);
        assert_eq!(swap.liq_fee_in_rune_e8, 6);
        assert_eq!(
            SwapDirection::of(&swap, &AssetClassifier::default()),
            Some(SwapDirection::AssetToRune)
        );
    }

    #[test]
    fn add_liquidity_txids_split_by_chain() {
        let raw = RawEvent::new("add_liquidity")
            .with("pool", "ETH.ETH")
            .with("liquidity_provider_units", "55")
            .with("rune_address", "thor1")
            .with("rune_amount", "10")
            .with("asset_amount", "20")
            .with("asset_address", "0xabc")
            .with("ETH_txid", "E1")
            .with("THOR_txid", "T1");
        let Some(TypedEvent::AddLiquidity(add)) = load(raw).unwrap() else {
            panic!("expected add_liquidity");
        };
        assert_eq!(add.rune_tx, "T1");
        assert_eq!(add.asset_tx, "E1");
        assert_eq!(add.asset_chain, "ETH");
        assert_eq!(add.stake_units, 55);
    }

    #[test]
    fn errata_direction_flags() {
        let raw = RawEvent::new("errata")
            .with("in_tx_id", "X")
            .with("asset", "BNB.BNB")
            .with("asset_amt", "30")
            .with("asset_add", "false")
            .with("rune_amt", "40")
            .with("rune_add", "true");
        let Some(TypedEvent::Errata(errata)) = load(raw).unwrap() else {
            panic!("expected errata");
        };
        assert_eq!(errata.asset_e8, -30);
        assert_eq!(errata.rune_e8, 40);
    }

    #[test]
    fn rewards_and_transfer() {
        let raw = RawEvent::new("rewards")
            .with("bond_reward", "9")
            .with("BTC.BTC", "4")
            .with("ETH.ETH", "-1");
        let Some(TypedEvent::Rewards(rewards)) = load(raw).unwrap() else {
            panic!("expected rewards");
        };
        assert_eq!(rewards.bond_e8, 9);
        assert_eq!(rewards.per_pool.len(), 2);
        assert_eq!(rewards.per_pool[1].e8, -1);

        let raw = RawEvent::new("transfer")
            .with("sender", "a")
            .with("recipient", "b")
            .with("amount", "1500rune");
        let Some(TypedEvent::Transfer(transfer)) = load(raw).unwrap() else {
            panic!("expected transfer");
        };
        assert_eq!(transfer.asset, "THOR.RUNE");
        assert_eq!(transfer.amount_e8, 1500);
    }

    #[test]
    fn unknown_kind_and_missing_attribute() {
        assert_eq!(load(RawEvent::new("tss_pool")).unwrap(), None);
        let err = load(RawEvent::new("pool").with("pool", "BTC.BTC")).unwrap_err();
        assert!(matches!(err, ParseError::MissingAttribute { .. }));
    }

    #[test]
    fn node_status_accepts_both_spellings() {
        let raw = RawEvent::new("UpdateNodeAccountStatus")
            .with("Address", "thor1node")
            .with("Former", "Standby")
            .with("Current", "Active");
        let event = load(raw).unwrap().unwrap();
        assert_eq!(event.kind(), "update_node_account_status");
    }
}
