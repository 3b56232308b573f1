//! Typed access to the key/value attributes of one chain event

use base64::Engine;

use crate::core::{ParseError, RawEvent};

/// `"<amount> <asset>"` as found in coin attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub asset: String,
    pub e8: i64,
}

impl Coin {
    pub fn new(asset: impl Into<String>, e8: i64) -> Self {
        Self {
            asset: asset.into(),
            e8,
        }
    }

    /// Parses `"100 BTC.BTC"`
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let amount = parts.next()?.parse::<i64>().ok()?;
        let asset = parts.next()?;
        if parts.next().is_some() || amount < 0 {
            return None;
        }
        Some(Self::new(asset, amount))
    }

    /// Parses the cosmos bank form `"100rune"`
    pub fn parse_denom(text: &str) -> Option<(i64, String)> {
        let split = text.find(|c: char| !c.is_ascii_digit())?;
        if split == 0 {
            return None;
        }
        let (amount, denom) = text.split_at(split);
        Some((amount.parse().ok()?, denom.to_string()))
    }
}

/// Decoded attributes of one event, in emission order
#[derive(Debug, Clone)]
pub struct Attributes {
    kind: String,
    pairs: Vec<(String, String)>,
}

impl Attributes {
    /// Copies the attributes out of a raw event, base64-decoding them when
    /// the chain encodes attributes that way
    pub fn decode(raw: &RawEvent, base64: bool) -> Result<Self, ParseError> {
        let mut pairs = Vec::with_capacity(raw.attributes.len());
        for attribute in &raw.attributes {
            if base64 {
                let key = decode_base64(&raw.kind, &attribute.key, &attribute.key)?;
                let value = decode_base64(&raw.kind, &key, &attribute.value)?;
                pairs.push((key, value));
            } else {
                pairs.push((attribute.key.clone(), attribute.value.clone()));
            }
        }
        Ok(Self {
            kind: raw.kind.clone(),
            pairs,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn str(&self, key: &str) -> Result<&str, ParseError> {
        self.opt_str(key).ok_or_else(|| self.missing(key))
    }

    pub fn string(&self, key: &str) -> Result<String, ParseError> {
        self.str(key).map(str::to_string)
    }

    /// Missing keys read as the empty string
    pub fn string_or_empty(&self, key: &str) -> String {
        self.opt_str(key).unwrap_or_default().to_string()
    }

    pub fn int(&self, key: &str) -> Result<i64, ParseError> {
        let value = self.str(key)?;
        self.parse_int(key, value)
    }

    /// Absent or empty values read as zero
    pub fn int_or_zero(&self, key: &str) -> Result<i64, ParseError> {
        match self.opt_str(key) {
            None | Some("") => Ok(0),
            Some(value) => self.parse_int(key, value),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool, ParseError> {
        match self.str(key)? {
            "true" | "True" | "1" => Ok(true),
            "false" | "False" | "0" => Ok(false),
            other => Err(ParseError::Invalid {
                kind: self.kind.clone(),
                reason: format!("attribute {}={:?} is not a boolean", key, other),
            }),
        }
    }

    pub fn coin(&self, key: &str) -> Result<Coin, ParseError> {
        let value = self.str(key)?;
        Coin::parse(value).ok_or_else(|| self.invalid_coin(key, value))
    }

    /// Comma-separated coin list; an empty value is an empty list
    pub fn coins(&self, key: &str) -> Result<Vec<Coin>, ParseError> {
        let value = self.str(key)?;
        value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Coin::parse(part).ok_or_else(|| self.invalid_coin(key, value)))
            .collect()
    }

    pub fn invalid(&self, reason: impl Into<String>) -> ParseError {
        ParseError::Invalid {
            kind: self.kind.clone(),
            reason: reason.into(),
        }
    }

    pub fn parse_int(&self, key: &str, value: &str) -> Result<i64, ParseError> {
        value
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidInteger {
                kind: self.kind.clone(),
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    fn missing(&self, key: &str) -> ParseError {
        ParseError::MissingAttribute {
            kind: self.kind.clone(),
            key: key.to_string(),
        }
    }

    fn invalid_coin(&self, key: &str, value: &str) -> ParseError {
        ParseError::InvalidCoin {
            kind: self.kind.clone(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

fn decode_base64(kind: &str, key: &str, text: &str) -> Result<String, ParseError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| ParseError::Encoding {
            kind: kind.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    String::from_utf8(bytes).map_err(|e| ParseError::Encoding {
        kind: kind.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_forms() {
        assert_eq!(Coin::parse("100 BTC.BTC"), Some(Coin::new("BTC.BTC", 100)));
        assert_eq!(Coin::parse(" 7  THOR.RUNE "), Some(Coin::new("THOR.RUNE", 7)));
        assert_eq!(Coin::parse("BTC.BTC"), None);
        assert_eq!(Coin::parse("-5 BTC.BTC"), None);
        assert_eq!(Coin::parse("5 BTC.BTC extra"), None);
        assert_eq!(Coin::parse_denom("1500rune"), Some((1500, "rune".to_string())));
        assert_eq!(Coin::parse_denom("rune"), None);
    }

    #[test]
    fn typed_getters() {
        let raw = RawEvent::new("swap")
            .with("coin", "100 BTC.BTC, 5 THOR.RUNE")
            .with("swap_slip", "12")
            .with("liquidity_fee", "")
            .with("bad", "x1");
        let attrs = Attributes::decode(&raw, false).unwrap();
        assert_eq!(attrs.coins("coin").unwrap().len(), 2);
        assert_eq!(attrs.int("swap_slip").unwrap(), 12);
        assert_eq!(attrs.int_or_zero("liquidity_fee").unwrap(), 0);
        assert_eq!(attrs.int_or_zero("absent").unwrap(), 0);
        assert!(matches!(
            attrs.int("bad"),
            Err(ParseError::InvalidInteger { .. })
        ));
        assert!(matches!(
            attrs.str("memo"),
            Err(ParseError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn base64_attributes() {
        // "pool" => "BTC.BTC"
        let raw = RawEvent::new("pool").with("cG9vbA==", "QlRDLkJUQw==");
        let attrs = Attributes::decode(&raw, true).unwrap();
        assert_eq!(attrs.str("pool").unwrap(), "BTC.BTC");

        let broken = RawEvent::new("pool").with("cG9vbA==", "%%%");
        assert!(matches!(
            Attributes::decode(&broken, true),
            Err(ParseError::Encoding { .. })
        ));
    }
}
