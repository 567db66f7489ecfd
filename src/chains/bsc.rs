use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use tracing::warn;

use super::{
    http_client, int_field, parse_decimals, raw_value_string, read_body, text_field, ChainAdapter,
};
use crate::error::FetchError;
use crate::models::{Chain, RawTransfer, TokenContract};

pub const DEFAULT_API_URL: &str = "https://api.bscscan.com/api";
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

const NO_TRANSACTIONS: &str = "No transactions found";

/// BEP20 transfer history from BscScan's `account/tokentx` action.
pub struct BscScanAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    offset: u32,
}

impl BscScanAdapter {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        offset: u32,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            offset,
        })
    }
}

#[async_trait]
impl ChainAdapter for BscScanAdapter {
    fn chain(&self) -> Chain {
        Chain::Bsc
    }

    async fn try_fetch(
        &self,
        wallet: &str,
        contract: &TokenContract,
    ) -> Result<Vec<RawTransfer>, FetchError> {
        let offset = self.offset.to_string();
        let mut params = vec![
            ("module", "account"),
            ("action", "tokentx"),
            ("contractaddress", contract.address.as_str()),
            ("address", wallet),
            ("page", "1"),
            ("offset", offset.as_str()),
            ("sort", "desc"),
        ];
        if let Some(key) = &self.api_key {
            params.push(("apikey", key.as_str()));
        }

        let resp = self.client.get(&self.base_url).query(&params).send().await?;
        let body = read_body(resp).await?;
        parse_response(&body, contract)
    }
}

#[derive(Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

/// Maps a `tokentx` response body into raw transfers.
///
/// Each record is read on its own; a wrongly typed field never fails the
/// whole window.
pub fn parse_response(body: &str, contract: &TokenContract) -> Result<Vec<RawTransfer>, FetchError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    if envelope.status != "1" {
        if envelope.message == NO_TRANSACTIONS {
            return Err(FetchError::NoData);
        }
        let detail = match &envelope.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(FetchError::Provider(format!("{}: {}", envelope.message, detail)));
    }

    let items = match envelope.result {
        Value::Array(items) => items,
        other => {
            return Err(FetchError::Provider(format!("unexpected result shape: {other}")));
        }
    };

    let default_decimals = contract.token.default_decimals(Chain::Bsc);
    let mut transfers = Vec::with_capacity(items.len());
    for item in &items {
        let id = text_field(item, "hash");
        if id.is_empty() {
            warn!("[{}] skipping {} record without hash", Chain::Bsc, contract.token);
            continue;
        }
        transfers.push(RawTransfer {
            id,
            from: text_field(item, "from"),
            to: text_field(item, "to"),
            raw_value: raw_value_string(item.get("value")),
            token_decimals: parse_decimals(item.get("tokenDecimal"), default_decimals),
            token: contract.token,
            chain: Chain::Bsc,
            timestamp: int_field(item, "timeStamp").and_then(|secs| DateTime::from_timestamp(secs, 0)),
        });
    }
    Ok(transfers)
}

/// Whether `address` is `0x` followed by 40 hex digits.
pub fn is_valid_address(address: &str) -> bool {
    let Some(digits) = address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")) else {
        return false;
    };
    digits.len() == 40 && hex::decode(digits).is_ok()
}
