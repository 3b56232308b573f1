//! Rollup views maintained by the refresher
//!
//! Every metric is materialized at three granularities. The five-minute
//! view reads the event tables; the hour and day views roll up the
//! five-minute view, so they are always refreshed after it.

use std::fmt;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    FiveMin,
    Hour,
    Day,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::FiveMin, Bucket::Hour, Bucket::Day];

    pub fn nanos(&self) -> i64 {
        match self {
            Bucket::FiveMin => 300 * NANOS_PER_SECOND,
            Bucket::Hour => 3600 * NANOS_PER_SECOND,
            Bucket::Day => 86400 * NANOS_PER_SECOND,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Bucket::FiveMin => "5min",
            Bucket::Hour => "hour",
            Bucket::Day => "day",
        }
    }

    /// Start of the bucket containing `ts`
    pub fn floor(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.nanos())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Last depths of each pool within the bucket
    Depths,
    /// Swap counts, volumes and fees
    Swaps,
    /// Liquidity additions and withdrawals
    Liquidity,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Depths, Metric::Swaps, Metric::Liquidity];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Depths => "depths",
            Metric::Swaps => "swaps",
            Metric::Liquidity => "liquidity",
        }
    }

    fn value_columns(&self) -> &'static [&'static str] {
        match self {
            Metric::Depths => &["asset_e8", "rune_e8", "synth_e8"],
            Metric::Swaps => &[
                "swap_count",
                "rune_in_volume_e8",
                "rune_out_volume_e8",
                "liq_fee_in_rune_e8",
            ],
            Metric::Liquidity => &[
                "add_count",
                "add_asset_e8",
                "add_rune_e8",
                "withdraw_count",
                "withdraw_asset_e8",
                "withdraw_rune_e8",
            ],
        }
    }
}

/// One materialized rollup table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateView {
    pub metric: Metric,
    pub bucket: Bucket,
}

impl AggregateView {
    pub fn new(metric: Metric, bucket: Bucket) -> Self {
        Self { metric, bucket }
    }

    /// Every view, ordered so that each view's source is refreshed first
    pub fn all() -> Vec<AggregateView> {
        Bucket::ALL
            .iter()
            .flat_map(|bucket| Metric::ALL.iter().map(move |metric| AggregateView::new(*metric, *bucket)))
            .collect()
    }

    /// Watermark key and table suffix, e.g. `swaps_hour`
    pub fn name(&self) -> String {
        format!("{}_{}", self.metric.name(), self.bucket.suffix())
    }

    pub fn table(&self) -> String {
        format!("agg_{}", self.name())
    }

    /// View this one rolls up, `None` for views read from event tables
    pub fn source(&self) -> Option<AggregateView> {
        match self.bucket {
            Bucket::FiveMin => None,
            Bucket::Hour | Bucket::Day => Some(AggregateView::new(self.metric, Bucket::FiveMin)),
        }
    }

    pub fn ddl(&self) -> String {
        let values: Vec<String> = self
            .metric
            .value_columns()
            .iter()
            .map(|c| format!("    {} BIGINT NOT NULL", c))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    bucket_start BIGINT NOT NULL,\n    pool TEXT NOT NULL,\n{values},\n    PRIMARY KEY (bucket_start, pool)\n);\n",
            table = self.table(),
            values = values.join(",\n"),
        )
    }

    /// Upsert of every bucket in `[$1, $2)`; `$3` is the bucket width in
    /// nanoseconds
    pub fn refresh_sql(&self) -> String {
        let columns = self.metric.value_columns();
        let updates: Vec<String> = columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}", c = c))
            .collect();
        format!(
            "INSERT INTO {table} (bucket_start, pool, {columns})\n{select}\nON CONFLICT (bucket_start, pool) DO UPDATE SET {updates}",
            table = self.table(),
            columns = columns.join(", "),
            select = self.select_sql(),
            updates = updates.join(", "),
        )
    }

    fn select_sql(&self) -> String {
        match (self.metric, self.source()) {
            (Metric::Depths, None) => depth_select("block_pool_depths", "block_timestamp"),
            (Metric::Depths, Some(source)) => depth_select(&source.table(), "bucket_start"),
            (Metric::Swaps, None) => "SELECT b, pool, COUNT(*)::BIGINT,\n\
                 COALESCE(SUM(CASE WHEN _direction IN (0, 2) THEN from_e8 ELSE 0 END), 0)::BIGINT,\n\
                 COALESCE(SUM(CASE WHEN _direction IN (1, 3) THEN to_e8 ELSE 0 END), 0)::BIGINT,\n\
                 COALESCE(SUM(liq_fee_in_rune_e8), 0)::BIGINT\n\
                 FROM (SELECT block_timestamp - block_timestamp % $3 AS b, pool, _direction, from_e8, to_e8, liq_fee_in_rune_e8\n\
                 FROM swap_events WHERE block_timestamp >= $1 AND block_timestamp < $2) s\n\
                 GROUP BY b, pool"
                .to_string(),
            (Metric::Liquidity, None) => "SELECT b, pool, SUM(ac)::BIGINT, SUM(aa)::BIGINT, SUM(ar)::BIGINT,\n\
                 SUM(wc)::BIGINT, SUM(wa)::BIGINT, SUM(wr)::BIGINT\n\
                 FROM (\n\
                 SELECT block_timestamp - block_timestamp % $3 AS b, pool,\n\
                 1::BIGINT AS ac, asset_e8 AS aa, rune_e8 AS ar, 0::BIGINT AS wc, 0::BIGINT AS wa, 0::BIGINT AS wr\n\
                 FROM add_liquidity_events WHERE block_timestamp >= $1 AND block_timestamp < $2\n\
                 UNION ALL\n\
                 SELECT block_timestamp - block_timestamp % $3, pool,\n\
                 0, 0, 0, 1, emit_asset_e8, emit_rune_e8\n\
                 FROM withdraw_events WHERE block_timestamp >= $1 AND block_timestamp < $2\n\
                 ) s\n\
                 GROUP BY b, pool"
                .to_string(),
            (metric, Some(source)) => {
                let sums: Vec<String> = metric
                    .value_columns()
                    .iter()
                    .map(|c| format!("SUM({})::BIGINT", c))
                    .collect();
                format!(
                    "SELECT bucket_start - bucket_start % $3 AS b, pool, {sums}\n\
                     FROM {source} WHERE bucket_start >= $1 AND bucket_start < $2\n\
                     GROUP BY b, pool",
                    sums = sums.join(", "),
                    source = source.table(),
                )
            }
        }
    }
}

fn depth_select(source: &str, ts: &str) -> String {
    format!(
        "SELECT DISTINCT ON (b, pool) b, pool, asset_e8, rune_e8, synth_e8\n\
         FROM (SELECT {ts} - {ts} % $3 AS b, {ts} AS ts, pool, asset_e8, rune_e8, synth_e8\n\
         FROM {source} WHERE {ts} >= $1 AND {ts} < $2) s\n\
         ORDER BY b, pool, ts DESC",
        ts = ts,
        source = source,
    )
}

impl fmt::Display for AggregateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// DDL for every rollup table plus the watermark table
pub fn ddl() -> String {
    let mut out = String::from(
        "CREATE TABLE IF NOT EXISTS aggregate_watermarks (\n    view TEXT PRIMARY KEY,\n    watermark BIGINT NOT NULL\n);\n",
    );
    for view in AggregateView::all() {
        out.push_str(&view.ddl());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_aligns_to_bucket() {
        let hour = Bucket::Hour.nanos();
        assert_eq!(Bucket::Hour.floor(hour * 3 + 17), hour * 3);
        assert_eq!(Bucket::Hour.floor(hour * 3), hour * 3);
        assert_eq!(Bucket::FiveMin.floor(299 * NANOS_PER_SECOND), 0);
    }

    #[test]
    fn sources_precede_derived_views() {
        let views = AggregateView::all();
        assert_eq!(views.len(), 9);
        for (i, view) in views.iter().enumerate() {
            if let Some(source) = view.source() {
                let pos = views.iter().position(|v| *v == source).unwrap();
                assert!(pos < i, "{} refreshed before its source", view);
            }
        }
    }

    #[test]
    fn refresh_sql_targets_the_view_table() {
        let view = AggregateView::new(Metric::Swaps, Bucket::Day);
        let sql = view.refresh_sql();
        assert!(sql.starts_with("INSERT INTO agg_swaps_day"));
        assert!(sql.contains("FROM agg_swaps_5min"));
        assert!(sql.contains("ON CONFLICT (bucket_start, pool)"));
    }
}
