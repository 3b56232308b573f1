//! Schema registry
//!
//! The registry is the single source of truth for every table the
//! inserters may write. The DDL and the schema hash stored in the
//! constants table are both generated from it.

use sha2::{Digest, Sha256};

use super::row::{Row, SqlType, SqlValue};
use crate::aggregates::views;
use crate::core::InsertError;

use super::row::SqlType::{BigInt, Bool, Bytea, Text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: SqlType,
    pub nullable: bool,
}

const fn col(name: &'static str, ty: SqlType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: false,
    }
}

const fn nullable(name: &'static str, ty: SqlType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub primary_key: Option<&'static str>,
    /// Event tables carry `event_id` and `block_timestamp` and are indexed
    /// on both
    pub is_event_table: bool,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn ddl(&self) -> String {
        let mut lines: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "    {} {}{}",
                    c.name,
                    c.ty.ddl(),
                    if c.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();
        if let Some(pk) = self.primary_key {
            lines.push(format!("    PRIMARY KEY ({})", pk));
        }
        let mut out = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
            self.name,
            lines.join(",\n")
        );
        if self.is_event_table {
            out.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS {t}_event_id_idx ON {t} (event_id);\n\
                 CREATE INDEX IF NOT EXISTS {t}_block_timestamp_idx ON {t} (block_timestamp);\n",
                t = self.name
            ));
        }
        out
    }
}

macro_rules! event_table {
    ($name:expr, [$($column:expr),* $(,)?]) => {
        TableDef {
            name: $name,
            columns: &[$($column,)* col("event_id", BigInt), col("block_timestamp", BigInt)],
            primary_key: None,
            is_event_table: true,
        }
    };
}

pub static TABLES: &[TableDef] = &[
    TableDef {
        name: "block_log",
        columns: &[
            col("height", BigInt),
            col("timestamp", BigInt),
            col("hash", Bytea),
            nullable("agg_state", Bytea),
        ],
        primary_key: Some("height"),
        is_event_table: false,
    },
    TableDef {
        name: "block_pool_depths",
        columns: &[
            col("pool", Text),
            col("asset_e8", BigInt),
            col("rune_e8", BigInt),
            col("synth_e8", BigInt),
            col("block_timestamp", BigInt),
        ],
        primary_key: None,
        is_event_table: false,
    },
    event_table!("add_events", [
        col("tx", Text), col("chain", Text), col("from_addr", Text), col("to_addr", Text),
        col("asset", Text), col("asset_e8", BigInt), col("rune_e8", BigInt), col("memo", Text),
        col("pool", Text),
    ]),
    event_table!("add_liquidity_events", [
        col("pool", Text), col("asset_tx", Text), col("asset_chain", Text), col("asset_addr", Text),
        col("asset_e8", BigInt), col("stake_units", BigInt), col("rune_tx", Text),
        col("rune_addr", Text), col("rune_e8", BigInt),
    ]),
    event_table!("pending_liquidity_events", [
        col("pool", Text), col("asset_tx", Text), col("asset_chain", Text), col("asset_addr", Text),
        col("asset_e8", BigInt), col("rune_tx", Text), col("rune_addr", Text),
        col("rune_e8", BigInt), col("pending_type", Text),
    ]),
    event_table!("withdraw_events", [
        col("tx", Text), col("chain", Text), col("from_addr", Text), col("to_addr", Text),
        col("asset", Text), col("asset_e8", BigInt), col("emit_asset_e8", BigInt),
        col("emit_rune_e8", BigInt), col("memo", Text), col("pool", Text),
        col("stake_units", BigInt), col("basis_points", BigInt), col("asymmetry", Text),
        col("imp_loss_protection_e8", BigInt),
    ]),
    event_table!("swap_events", [
        col("tx", Text), col("chain", Text), col("from_addr", Text), col("to_addr", Text),
        col("from_asset", Text), col("from_e8", BigInt), col("to_asset", Text), col("to_e8", BigInt),
        col("memo", Text), col("pool", Text), col("to_e8_min", BigInt), col("swap_slip_bp", BigInt),
        col("liq_fee_e8", BigInt), col("liq_fee_in_rune_e8", BigInt), col("_direction", BigInt),
    ]),
    event_table!("fee_events", [
        col("tx", Text), col("asset", Text), col("asset_e8", BigInt), col("pool_deduct", BigInt),
    ]),
    event_table!("gas_events", [
        col("asset", Text), col("asset_e8", BigInt), col("rune_e8", BigInt), col("tx_count", BigInt),
    ]),
    event_table!("refund_events", [
        col("tx", Text), col("chain", Text), col("from_addr", Text), col("to_addr", Text),
        col("asset", Text), col("asset_e8", BigInt), col("asset_2nd", Text),
        col("asset_2nd_e8", BigInt), col("memo", Text), col("code", BigInt), col("reason", Text),
    ]),
    event_table!("outbound_events", [
        col("tx", Text), col("chain", Text), col("from_addr", Text), col("to_addr", Text),
        col("asset", Text), col("asset_e8", BigInt), col("memo", Text), col("in_tx", Text),
    ]),
    event_table!("errata_events", [
        col("in_tx", Text), col("asset", Text), col("asset_e8", BigInt), col("rune_e8", BigInt),
    ]),
    event_table!("pool_balance_change_events", [
        col("asset", Text), col("rune_e8", BigInt), col("asset_e8", BigInt), col("reason", Text),
    ]),
    event_table!("pool_events", [col("asset", Text), col("status", Text)]),
    event_table!("rewards_events", [col("bond_e8", BigInt)]),
    event_table!("rewards_event_entries", [col("pool", Text), col("rune_e8", BigInt)]),
    event_table!("slash_events", [col("pool", Text), col("asset", Text), col("asset_e8", BigInt)]),
    event_table!("reserve_events", [
        col("tx", Text), col("chain", Text), col("from_addr", Text), col("to_addr", Text),
        col("asset", Text), col("asset_e8", BigInt), col("memo", Text), col("addr", Text),
        col("e8", BigInt),
    ]),
    event_table!("bond_events", [
        col("tx", Text), col("chain", Text), col("from_addr", Text), col("to_addr", Text),
        col("asset", Text), col("asset_e8", BigInt), col("memo", Text), col("bond_type", Text),
        col("e8", BigInt),
    ]),
    event_table!("new_node_events", [col("node_addr", Text)]),
    event_table!("update_node_account_status_events", [
        col("node_addr", Text), col("former", Text), col("current", Text),
    ]),
    event_table!("set_node_keys_events", [
        col("node_addr", Text), col("secp256k1", Text), col("ed25519", Text),
        col("validator_consensus", Text),
    ]),
    event_table!("set_version_events", [col("node_addr", Text), col("version", Text)]),
    event_table!("validator_request_leave_events", [
        col("tx", Text), col("from_addr", Text), col("node_addr", Text),
    ]),
    event_table!("transfer_events", [
        col("from_addr", Text), col("to_addr", Text), col("asset", Text), col("amount_e8", BigInt),
    ]),
    event_table!("switch_events", [
        col("tx", Text), col("from_addr", Text), col("to_addr", Text), col("burn_asset", Text),
        col("burn_e8", BigInt), col("mint_e8", BigInt),
    ]),
    event_table!("loan_open_events", [
        col("owner", Text), col("collateral_asset", Text), col("collateral_deposited_e8", BigInt),
        col("debt_issued_tor_e8", BigInt), col("collateralization_ratio", BigInt),
        col("target_asset", Text),
    ]),
    event_table!("loan_repayment_events", [
        col("owner", Text), col("collateral_asset", Text), col("collateral_withdrawn_e8", BigInt),
        col("debt_repaid_tor_e8", BigInt),
    ]),
    event_table!("mint_burn_events", [
        col("supply", Text), col("denom", Text), col("amount_e8", BigInt), col("reason", Text),
    ]),
    event_table!("set_mimir_events", [col("key", Text), col("value", Text)]),
    event_table!("depth_override_events", [
        col("pool", Text), col("asset_e8", BigInt), col("rune_e8", BigInt), col("synth_e8", BigInt),
        col("reason", Text), col("_synthetic", Bool),
    ]),
];

/// Key under which the schema hash is stored in `constants`
pub const SCHEMA_HASH_KEY: &str = "schema_hash";

pub fn table(name: &str) -> Option<&'static TableDef> {
    TABLES.iter().find(|t| t.name == name)
}

/// Complete DDL: constants, registry tables and rollups
pub fn ddl() -> String {
    let mut out = String::from(
        "CREATE TABLE IF NOT EXISTS constants (\n    key TEXT PRIMARY KEY,\n    value TEXT NOT NULL\n);\n",
    );
    for table in TABLES {
        out.push_str(&table.ddl());
    }
    out.push_str(&views::ddl());
    out
}

/// Hex SHA-256 of the DDL, compared against the stored hash at startup
pub fn schema_hash() -> String {
    hex::encode(Sha256::digest(ddl().as_bytes()))
}

/// Tables dropped by a schema rebuild
pub fn all_table_names() -> Vec<String> {
    let mut names: Vec<String> = TABLES.iter().map(|t| t.name.to_string()).collect();
    names.push("aggregate_watermarks".to_string());
    names.extend(crate::aggregates::views::AggregateView::all().iter().map(|v| v.table()));
    names
}

/// Checks a row against the registry and returns it with the registry's
/// column names
pub fn validate_row(
    table_name: &str,
    columns: &[&str],
    values: Vec<SqlValue>,
) -> Result<Row, InsertError> {
    let table = table(table_name).ok_or_else(|| InsertError::UnknownTable(table_name.to_string()))?;
    if columns.len() != values.len() {
        return Err(InsertError::ValueCount {
            table: table_name.to_string(),
            columns: columns.len(),
            values: values.len(),
        });
    }
    let mut resolved = Vec::with_capacity(columns.len());
    for (name, value) in columns.iter().zip(&values) {
        let column = table.column(name).ok_or_else(|| InsertError::UnknownColumn {
            table: table_name.to_string(),
            column: name.to_string(),
        })?;
        if !value.fits(column.ty, column.nullable) {
            return Err(InsertError::TypeMismatch {
                table: table_name.to_string(),
                column: name.to_string(),
                expected: column.ty.to_string(),
            });
        }
        resolved.push(column.name);
    }
    for column in table.columns.iter().filter(|c| !c.nullable) {
        if !resolved.contains(&column.name) {
            return Err(InsertError::MissingColumn {
                table: table_name.to_string(),
                column: column.name.to_string(),
            });
        }
    }
    Ok(Row {
        table: table.name,
        columns: resolved,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_kind_has_a_table() {
        for kind in [
            "add", "add_liquidity", "pending_liquidity", "withdraw", "swap", "fee", "gas",
            "refund", "outbound", "errata", "pool_balance_change", "pool", "rewards", "slash",
            "reserve", "bond", "new_node", "update_node_account_status", "set_node_keys",
            "set_version", "validator_request_leave", "transfer", "switch", "loan_open",
            "loan_repayment", "mint_burn", "set_mimir", "depth_override",
        ] {
            assert!(table(&format!("{}_events", kind)).is_some(), "{}", kind);
        }
    }

    #[test]
    fn validation_rules() {
        let ok = validate_row(
            "pool_events",
            &["asset", "status", "event_id", "block_timestamp"],
            vec!["BTC.BTC".into(), "Available".into(), 1i64.into(), 2i64.into()],
        )
        .unwrap();
        assert_eq!(ok.get("status"), Some(&SqlValue::Text("Available".into())));

        assert_eq!(
            validate_row("nope", &[], vec![]),
            Err(InsertError::UnknownTable("nope".into()))
        );
        assert!(matches!(
            validate_row("pool_events", &["asset"], vec![]),
            Err(InsertError::ValueCount { .. })
        ));
        assert!(matches!(
            validate_row(
                "pool_events",
                &["asset", "status", "event_id", "block_timestamp"],
                vec!["BTC.BTC".into(), 5i64.into(), 1i64.into(), 2i64.into()],
            ),
            Err(InsertError::TypeMismatch { .. })
        ));
        assert!(matches!(
            validate_row("pool_events", &["asset", "colour"], vec!["a".into(), "b".into()]),
            Err(InsertError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn schema_hash_is_stable() {
        assert_eq!(schema_hash(), schema_hash());
        assert_eq!(schema_hash().len(), 64);
        assert!(ddl().contains("CREATE TABLE IF NOT EXISTS block_log"));
    }
}
