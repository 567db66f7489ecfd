use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use tracing::warn;

use super::{
    http_client, int_field, parse_decimals, raw_value_string, read_body, text_field, ChainAdapter,
};
use crate::error::FetchError;
use crate::models::{Chain, RawTransfer, TokenContract};

pub const DEFAULT_API_URL: &str = "https://api.trongrid.io";
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Mainnet address prefix byte.
const ADDRESS_PREFIX: u8 = 0x41;

/// TRC20 transfer history from TronGrid's account endpoint.
pub struct TronGridAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limit: u32,
}

impl TronGridAdapter {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        limit: u32,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            limit,
        })
    }
}

#[async_trait]
impl ChainAdapter for TronGridAdapter {
    fn chain(&self) -> Chain {
        Chain::Tron
    }

    async fn try_fetch(
        &self,
        wallet: &str,
        contract: &TokenContract,
    ) -> Result<Vec<RawTransfer>, FetchError> {
        let url = format!("{}/v1/accounts/{}/transactions/trc20", self.base_url, wallet);
        let limit = self.limit.to_string();
        let mut req = self.client.get(&url).query(&[
            ("only_to", "true"),
            ("limit", limit.as_str()),
            ("contract_address", contract.address.as_str()),
        ]);
        if let Some(key) = &self.api_key {
            req = req.header("TRON-PRO-API-KEY", key);
        }

        let body = read_body(req.send().await?).await?;
        parse_response(&body, contract)
    }
}

#[derive(Deserialize)]
struct Trc20Page {
    /// Records are read one by one so a malformed one cannot sink the page.
    #[serde(default)]
    data: Vec<Value>,
    success: Option<bool>,
    error: Option<String>,
}

/// Maps a `/transactions/trc20` response body into raw transfers.
///
/// Records without a transaction id are skipped. Any other field with an
/// unexpected type is read leniently and left for the classifier to reject,
/// so the record is still marked seen.
pub fn parse_response(body: &str, contract: &TokenContract) -> Result<Vec<RawTransfer>, FetchError> {
    let page: Trc20Page = serde_json::from_str(body)?;
    if page.success == Some(false) {
        return Err(FetchError::Provider(
            page.error.unwrap_or_else(|| "request unsuccessful".to_string()),
        ));
    }

    let default_decimals = contract.token.default_decimals(Chain::Tron);
    let mut transfers = Vec::with_capacity(page.data.len());
    for record in &page.data {
        let id = text_field(record, "transaction_id");
        if id.is_empty() {
            warn!("[{}] skipping {} record without transaction id", Chain::Tron, contract.token);
            continue;
        }
        let decimals = parse_decimals(
            record.get("token_info").and_then(|info| info.get("decimals")),
            default_decimals,
        );
        transfers.push(RawTransfer {
            id,
            from: text_field(record, "from"),
            to: text_field(record, "to"),
            raw_value: raw_value_string(record.get("value")),
            token_decimals: decimals,
            token: contract.token,
            chain: Chain::Tron,
            timestamp: int_field(record, "block_timestamp").and_then(DateTime::from_timestamp_millis),
        });
    }
    Ok(transfers)
}

/// Base58check encoding of a 20-byte account id, e.g. `T...`.
pub fn encode_address(addr20: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(25);
    payload.push(ADDRESS_PREFIX);
    payload.extend_from_slice(addr20);

    let checksum = Sha256::digest(Sha256::digest(&payload));
    payload.extend_from_slice(&checksum[..4]);

    bs58::encode(payload).into_string()
}

/// Whether `address` is a well-formed mainnet base58check address.
pub fn is_valid_address(address: &str) -> bool {
    let Ok(decoded) = bs58::decode(address).into_vec() else {
        return false;
    };
    if decoded.len() != 25 || decoded[0] != ADDRESS_PREFIX {
        return false;
    }
    let mut addr20 = [0u8; 20];
    addr20.copy_from_slice(&decoded[1..21]);
    encode_address(&addr20) == address
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Token;

    const WALLET: &str = "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh";
    const USDT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    fn usdt() -> TokenContract {
        TokenContract::new(Token::Usdt, USDT)
    }

    #[test]
    fn parses_transfer_page() {
        let body = r#"{
            "data": [
                {
                    "transaction_id": "a1b2c3",
                    "token_info": {"symbol": "USDT", "address": "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t", "decimals": 6, "name": "Tether USD"},
                    "block_timestamp": 1700000000000,
                    "from": "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf",
                    "to": "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh",
                    "type": "Transfer",
                    "value": "12500000"
                },
                {
                    "transaction_id": "d4e5f6",
                    "token_info": {"symbol": "USDT", "decimals": "6"},
                    "from": "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh",
                    "to": "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf",
                    "value": "1"
                }
            ],
            "success": true,
            "meta": {"at": 1700000001000, "page_size": 2}
        }"#;

        let transfers = parse_response(body, &usdt()).unwrap();
        assert_eq!(transfers.len(), 2);

        let first = &transfers[0];
        assert_eq!(first.id, "a1b2c3");
        assert_eq!(first.to, WALLET);
        assert_eq!(first.raw_value, "12500000");
        assert_eq!(first.token_decimals, Some(6));
        assert_eq!(first.chain, Chain::Tron);
        assert_eq!(first.token, Token::Usdt);
        assert_eq!(first.timestamp.unwrap().timestamp(), 1_700_000_000);

        assert_eq!(transfers[1].token_decimals, Some(6));
        assert_eq!(transfers[1].timestamp, None);
    }

    #[test]
    fn missing_decimals_fall_back_and_bad_ones_are_flagged() {
        let body = r#"{"data": [
            {"transaction_id": "no-info", "from": "a", "to": "b", "value": "1"},
            {"transaction_id": "bad-info", "from": "a", "to": "b", "value": "1", "token_info": {"decimals": "x"}}
        ], "success": true}"#;
        let transfers = parse_response(body, &usdt()).unwrap();
        assert_eq!(transfers[0].token_decimals, Some(6));
        assert_eq!(transfers[1].token_decimals, None);
    }

    #[test]
    fn records_without_id_are_dropped() {
        let body = r#"{"data": [{"from": "a", "to": "b", "value": "1"}, {"transaction_id": "", "value": "1"}], "success": true}"#;
        assert!(parse_response(body, &usdt()).unwrap().is_empty());
    }

    #[test]
    fn one_malformed_record_does_not_sink_the_page() {
        let body = r#"{"data": [
            {"transaction_id": "good", "from": "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf", "to": "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh", "value": "9000000", "block_timestamp": "1700000000000"},
            {"transaction_id": "odd", "from": null, "to": ["TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh"], "value": null, "token_info": "USDT"},
            "not even an object"
        ], "success": true}"#;

        let transfers = parse_response(body, &usdt()).unwrap();
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].id, "good");
        assert_eq!(transfers[0].raw_value, "9000000");
        assert_eq!(transfers[0].timestamp.unwrap().timestamp(), 1_700_000_000);

        // kept so the classifier can mark it seen and drop it
        let odd = &transfers[1];
        assert_eq!(odd.id, "odd");
        assert_eq!(odd.from, "");
        assert_eq!(odd.to, "");
        assert_eq!(odd.token_decimals, Some(6));
    }

    #[test]
    fn blank_api_key_is_not_sent() {
        let adapter =
            TronGridAdapter::new(DEFAULT_API_URL, Some(String::new()), 50, Duration::from_secs(5))
                .unwrap();
        assert!(adapter.api_key.is_none());
    }

    #[test]
    fn empty_page_is_not_an_error() {
        let transfers = parse_response(r#"{"data": [], "success": true, "meta": {}}"#, &usdt()).unwrap();
        assert!(transfers.is_empty());
    }

    #[test]
    fn provider_failure_is_reported() {
        let body = r#"{"success": false, "error": "invalid address", "statusCode": 400}"#;
        match parse_response(body, &usdt()) {
            Err(FetchError::Provider(msg)) => assert_eq!(msg, "invalid address"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(parse_response("<html>", &usdt()), Err(FetchError::Decode(_))));
    }

    #[test]
    fn validates_base58check_addresses() {
        assert!(is_valid_address(USDT));
        assert!(is_valid_address(&encode_address(&[7u8; 20])));
        // flipped last character breaks the checksum
        assert!(!is_valid_address("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u"));
        assert!(!is_valid_address("0x55d398326f99059fF775485246999027B3197955"));
        assert!(!is_valid_address(""));
    }
}
