//! Typed chain events
//!
//! Each variant owns exactly the fields needed to write its row and to
//! compute its effect on pool depths. Amounts are E8 fixed-point integers.

/// Liquidity donated to a pool without minting units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Add {
    pub tx: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    pub asset: String,
    pub asset_e8: i64,
    pub rune_e8: i64,
    pub memo: String,
    pub pool: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddLiquidity {
    pub pool: String,
    pub asset_tx: String,
    pub asset_chain: String,
    pub asset_addr: String,
    pub asset_e8: i64,
    pub rune_tx: String,
    pub rune_addr: String,
    pub rune_e8: i64,
    pub stake_units: i64,
}

/// One side of an asymmetric add waiting for its counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLiquidity {
    pub pool: String,
    pub asset_tx: String,
    pub asset_chain: String,
    pub asset_addr: String,
    pub asset_e8: i64,
    pub rune_tx: String,
    pub rune_addr: String,
    pub rune_e8: i64,
    pub pending_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdraw {
    pub tx: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    /// Coin sent to initiate the withdraw
    pub asset: String,
    pub asset_e8: i64,
    pub emit_asset_e8: i64,
    pub emit_rune_e8: i64,
    pub memo: String,
    pub pool: String,
    pub stake_units: i64,
    pub basis_points: i64,
    pub asymmetry: String,
    pub imp_loss_protection_e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swap {
    pub tx: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    pub from_asset: String,
    pub from_e8: i64,
    pub to_asset: String,
    pub to_e8: i64,
    pub memo: String,
    pub pool: String,
    pub to_e8_min: i64,
    pub swap_slip_bp: i64,
    pub liq_fee_e8: i64,
    pub liq_fee_in_rune_e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fee {
    pub tx: String,
    pub asset: String,
    pub asset_e8: i64,
    pub pool_deduct: i64,
}

/// Gas reimbursed to a pool from the reserve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gas {
    pub asset: String,
    pub asset_e8: i64,
    pub rune_e8: i64,
    pub tx_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub tx: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    pub asset: String,
    pub asset_e8: i64,
    pub asset_2nd: String,
    pub asset_2nd_e8: i64,
    pub memo: String,
    pub code: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub tx: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    pub asset: String,
    pub asset_e8: i64,
    pub memo: String,
    pub in_tx: String,
}

/// Chain-issued depth correction for an inbound transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Errata {
    pub in_tx: String,
    pub asset: String,
    pub asset_e8: i64,
    pub rune_e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolBalanceChange {
    pub asset: String,
    pub rune_e8: i64,
    pub asset_e8: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub asset: String,
    pub status: String,
}

impl Pool {
    pub fn is_suspended(&self) -> bool {
        self.status.eq_ignore_ascii_case("suspended")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewards {
    pub bond_e8: i64,
    pub per_pool: Vec<PoolAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAmount {
    pub pool: String,
    pub e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slash {
    pub pool: String,
    pub amounts: Vec<SignedCoin>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCoin {
    pub asset: String,
    pub e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserve {
    pub tx: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    pub asset: String,
    pub asset_e8: i64,
    pub memo: String,
    pub addr: String,
    pub e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bond {
    pub tx: String,
    pub chain: String,
    pub from_addr: String,
    pub to_addr: String,
    pub asset: String,
    pub asset_e8: i64,
    pub memo: String,
    pub bond_type: String,
    pub e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub node_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNodeAccountStatus {
    pub node_addr: String,
    pub former: String,
    pub current: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNodeKeys {
    pub node_addr: String,
    pub secp256k1: String,
    pub ed25519: String,
    pub validator_consensus: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetVersion {
    pub node_addr: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRequestLeave {
    pub tx: String,
    pub from_addr: String,
    pub node_addr: String,
}

/// Native bank transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from_addr: String,
    pub to_addr: String,
    pub asset: String,
    pub amount_e8: i64,
}

/// Upgrade of a non-native rune representation to native rune
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switch {
    pub tx: String,
    pub from_addr: String,
    pub to_addr: String,
    pub burn_asset: String,
    pub burn_e8: i64,
    pub mint_e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanOpen {
    pub owner: String,
    pub collateral_asset: String,
    pub collateral_deposited_e8: i64,
    pub debt_issued_tor_e8: i64,
    pub collateralization_ratio: i64,
    pub target_asset: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanRepayment {
    pub owner: String,
    pub collateral_asset: String,
    pub collateral_withdrawn_e8: i64,
    pub debt_repaid_tor_e8: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintBurn {
    pub supply: String,
    pub denom: String,
    pub amount_e8: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetMimir {
    pub key: String,
    pub value: String,
}

/// Synthetic authoritative depth reset, only produced by corrections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthOverride {
    pub pool: String,
    pub asset_e8: i64,
    pub rune_e8: i64,
    pub synth_e8: i64,
    pub reason: String,
}

/// One variant per chain event kind the indexer records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedEvent {
    Add(Add),
    AddLiquidity(AddLiquidity),
    PendingLiquidity(PendingLiquidity),
    Withdraw(Withdraw),
    Swap(Swap),
    Fee(Fee),
    Gas(Gas),
    Refund(Refund),
    Outbound(Outbound),
    Errata(Errata),
    PoolBalanceChange(PoolBalanceChange),
    Pool(Pool),
    Rewards(Rewards),
    Slash(Slash),
    Reserve(Reserve),
    Bond(Bond),
    NewNode(NewNode),
    UpdateNodeAccountStatus(UpdateNodeAccountStatus),
    SetNodeKeys(SetNodeKeys),
    SetVersion(SetVersion),
    ValidatorRequestLeave(ValidatorRequestLeave),
    Transfer(Transfer),
    Switch(Switch),
    LoanOpen(LoanOpen),
    LoanRepayment(LoanRepayment),
    MintBurn(MintBurn),
    SetMimir(SetMimir),
    DepthOverride(DepthOverride),
}

impl TypedEvent {
    /// Chain event kind name
    pub fn kind(&self) -> &'static str {
        match self {
            TypedEvent::Add(_) => "add",
            TypedEvent::AddLiquidity(_) => "add_liquidity",
            TypedEvent::PendingLiquidity(_) => "pending_liquidity",
            TypedEvent::Withdraw(_) => "withdraw",
            TypedEvent::Swap(_) => "swap",
            TypedEvent::Fee(_) => "fee",
            TypedEvent::Gas(_) => "gas",
            TypedEvent::Refund(_) => "refund",
            TypedEvent::Outbound(_) => "outbound",
            TypedEvent::Errata(_) => "errata",
            TypedEvent::PoolBalanceChange(_) => "pool_balance_change",
            TypedEvent::Pool(_) => "pool",
            TypedEvent::Rewards(_) => "rewards",
            TypedEvent::Slash(_) => "slash",
            TypedEvent::Reserve(_) => "reserve",
            TypedEvent::Bond(_) => "bond",
            TypedEvent::NewNode(_) => "new_node",
            TypedEvent::UpdateNodeAccountStatus(_) => "update_node_account_status",
            TypedEvent::SetNodeKeys(_) => "set_node_keys",
            TypedEvent::SetVersion(_) => "set_version",
            TypedEvent::ValidatorRequestLeave(_) => "validator_request_leave",
            TypedEvent::Transfer(_) => "transfer",
            TypedEvent::Switch(_) => "switch",
            TypedEvent::LoanOpen(_) => "loan_open",
            TypedEvent::LoanRepayment(_) => "loan_repayment",
            TypedEvent::MintBurn(_) => "mint_burn",
            TypedEvent::SetMimir(_) => "set_mimir",
            TypedEvent::DepthOverride(_) => "depth_override",
        }
    }

    /// Pool the event belongs to, for kinds that touch a single pool
    pub fn pool(&self) -> Option<&str> {
        match self {
            TypedEvent::Add(e) => Some(&e.pool),
            TypedEvent::AddLiquidity(e) => Some(&e.pool),
            TypedEvent::PendingLiquidity(e) => Some(&e.pool),
            TypedEvent::Withdraw(e) => Some(&e.pool),
            TypedEvent::Swap(e) => Some(&e.pool),
            TypedEvent::Errata(e) => Some(&e.asset),
            TypedEvent::PoolBalanceChange(e) => Some(&e.asset),
            TypedEvent::Pool(e) => Some(&e.asset),
            TypedEvent::Slash(e) => Some(&e.pool),
            TypedEvent::Gas(e) => Some(&e.asset),
            TypedEvent::DepthOverride(e) => Some(&e.pool),
            _ => None,
        }
    }
}
