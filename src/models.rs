use std::fmt;

use chrono::{DateTime, Utc};

use crate::amount::Amount;

/// Ledgers the tracker knows how to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    /// TRON, TRC20 tokens, base58check addresses.
    Tron,
    /// BNB Smart Chain, BEP20 tokens, hex addresses.
    Bsc,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Tron, Chain::Bsc];

    /// Key used in the persisted state document.
    pub fn key(&self) -> &'static str {
        match self {
            Chain::Tron => "tron",
            Chain::Bsc => "bsc",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Chain::ALL.into_iter().find(|c| c.key() == key)
    }

    /// Token standard name, used in logs and labels.
    pub fn network(&self) -> &'static str {
        match self {
            Chain::Tron => "TRC20",
            Chain::Bsc => "BEP20",
        }
    }

    /// Base58 addresses are case-sensitive, hex addresses are not.
    pub fn addresses_match(&self, a: &str, b: &str) -> bool {
        match self {
            Chain::Tron => a == b,
            Chain::Bsc => a.eq_ignore_ascii_case(b),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.network())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Usdt,
    Busd,
}

impl Token {
    pub fn symbol(&self) -> &'static str {
        match self {
            Token::Usdt => "USDT",
            Token::Busd => "BUSD",
        }
    }

    /// Precision of the canonical contract, used when the index omits it.
    pub fn default_decimals(&self, chain: Chain) -> u32 {
        match chain {
            Chain::Tron => 6,
            // Binance-Peg USDT and BUSD both use 18
            Chain::Bsc => 18,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Human label sent along with the amount, e.g. `+12.50 USDT BNB`.
pub fn notification_label(chain: Chain, token: Token) -> String {
    let network = match chain {
        Chain::Tron => "TRON",
        Chain::Bsc => "BNB",
    };
    format!("{} {}", token.symbol(), network)
}

/// A token contract watched on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenContract {
    pub token: Token,
    pub address: String,
}

impl TokenContract {
    pub fn new(token: Token, address: impl Into<String>) -> Self {
        Self {
            token,
            address: address.into(),
        }
    }
}

/// The wallet tracked on one chain and the token contracts watched for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletConfig {
    pub chain: Chain,
    pub wallet: String,
    pub contracts: Vec<TokenContract>,
}

/// One transfer record as reported by a ledger index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransfer {
    /// Transaction hash, unique per chain.
    pub id: String,
    pub from: String,
    pub to: String,
    /// Integer amount in the token's smallest unit.
    pub raw_value: String,
    /// `None` when the index sent a precision we could not read.
    pub token_decimals: Option<u32>,
    pub token: Token,
    pub chain: Chain,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An inbound, previously unseen transfer at or above the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct QualifyingTransfer {
    pub id: String,
    pub chain: Chain,
    pub token: Token,
    pub from: String,
    pub amount: Amount,
}

impl QualifyingTransfer {
    pub fn label(&self) -> String {
        notification_label(self.chain, self.token)
    }

    /// Short hash prefix for log lines.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(16)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_keys_round_trip() {
        for chain in Chain::ALL {
            assert_eq!(Chain::from_key(chain.key()), Some(chain));
        }
        assert_eq!(Chain::from_key("eth"), None);
    }

    #[test]
    fn address_matching_follows_encoding() {
        assert!(Chain::Bsc.addresses_match(
            "0x9dE669d6A5AD8B4df07eD87eB32D078a4342fE9b",
            "0x9de669d6a5ad8b4df07ed87eb32d078a4342fe9b"
        ));
        assert!(!Chain::Tron.addresses_match(
            "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh",
            "tw4i7hytebeRBKxKZfPAxZqEgqUqNGXdSh"
        ));
        assert!(Chain::Tron.addresses_match(
            "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh",
            "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh"
        ));
    }

    #[test]
    fn labels() {
        assert_eq!(notification_label(Chain::Tron, Token::Usdt), "USDT TRON");
        assert_eq!(notification_label(Chain::Bsc, Token::Usdt), "USDT BNB");
        assert_eq!(notification_label(Chain::Bsc, Token::Busd), "BUSD BNB");
    }
}
