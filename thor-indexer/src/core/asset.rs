//! Asset naming rules shared by the demultiplexer and the recorder

use std::fmt;

/// How an asset relates to a pool's ledgers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    /// The chain's own unit, the rune side of every pool
    Native,
    /// A layer-1 asset held by a pool, `CHAIN.SYMBOL`
    Layer1,
    /// A synthetic asset minted against a pool, `CHAIN/SYMBOL`
    Synth,
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetClass::Native => write!(f, "native"),
            AssetClass::Layer1 => write!(f, "layer1"),
            AssetClass::Synth => write!(f, "synth"),
        }
    }
}

/// Classifies asset strings against the configured native identifiers
#[derive(Debug, Clone)]
pub struct AssetClassifier {
    native: Vec<String>,
}

impl AssetClassifier {
    pub fn new<I, S>(native: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            native: native.into_iter().map(Into::into).collect(),
        }
    }

    pub fn classify(&self, asset: &str) -> AssetClass {
        if self.is_native(asset) {
            AssetClass::Native
        } else if asset.contains('/') {
            AssetClass::Synth
        } else {
            AssetClass::Layer1
        }
    }

    pub fn is_native(&self, asset: &str) -> bool {
        self.native.iter().any(|n| n.eq_ignore_ascii_case(asset))
    }

    /// Canonical native asset, used when the chain reports a bare denom
    pub fn native_asset(&self) -> &str {
        self.native.first().map(String::as_str).unwrap_or("THOR.RUNE")
    }

    /// Maps a cosmos bank denom (`rune`, `btc/btc`) to an asset name
    pub fn asset_from_denom(&self, denom: &str) -> String {
        if denom.eq_ignore_ascii_case("rune") {
            self.native_asset().to_string()
        } else {
            denom.to_ascii_uppercase()
        }
    }
}

impl Default for AssetClassifier {
    fn default() -> Self {
        Self::new(["THOR.RUNE"])
    }
}

/// Pool backing an asset: synths map `BTC/BTC` to `BTC.BTC`, layer-1
/// assets are their own pool
pub fn pool_of(asset: &str) -> String {
    asset.replacen('/', ".", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let classifier = AssetClassifier::new(["THOR.RUNE", "BNB.RUNE-B1A"]);
        assert_eq!(classifier.classify("THOR.RUNE"), AssetClass::Native);
        assert_eq!(classifier.classify("bnb.rune-b1a"), AssetClass::Native);
        assert_eq!(classifier.classify("BTC.BTC"), AssetClass::Layer1);
        assert_eq!(classifier.classify("BTC/BTC"), AssetClass::Synth);
        assert_eq!(pool_of("ETH/USDC-0XA0B8"), "ETH.USDC-0XA0B8");
        assert_eq!(pool_of("ETH.ETH"), "ETH.ETH");
    }

    #[test]
    fn denoms() {
        let classifier = AssetClassifier::default();
        assert_eq!(classifier.asset_from_denom("rune"), "THOR.RUNE");
        assert_eq!(classifier.asset_from_denom("btc/btc"), "BTC/BTC");
    }
}
