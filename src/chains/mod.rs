pub mod bsc;
pub mod tron;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::models::{Chain, RawTransfer, TokenContract};

pub use bsc::BscScanAdapter;
pub use tron::TronGridAdapter;

/// Reads the most recent window of token transfers for one wallet from a
/// ledger index.
///
/// Implementations hold no state between calls. The window is newest first
/// and may overlap with the previous one.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Fetch a transfer window, surfacing why it failed.
    async fn try_fetch(
        &self,
        wallet: &str,
        contract: &TokenContract,
    ) -> Result<Vec<RawTransfer>, FetchError>;

    /// Fetch a transfer window, degrading every failure to an empty batch.
    ///
    /// An empty result only means "try again next tick". Callers that need
    /// the cause (to count failures, or to hold back a baseline) use
    /// [`ChainAdapter::try_fetch`] and [`or_empty`] instead.
    async fn fetch_transfers(&self, wallet: &str, contract: &TokenContract) -> Vec<RawTransfer> {
        or_empty(self.chain(), contract, self.try_fetch(wallet, contract).await)
    }
}

/// Logs a failed fetch and replaces it with an empty batch.
pub fn or_empty(
    chain: Chain,
    contract: &TokenContract,
    result: Result<Vec<RawTransfer>, FetchError>,
) -> Vec<RawTransfer> {
    match result {
        Ok(transfers) => transfers,
        Err(FetchError::NoData) => {
            debug!("[{}] no {} transfers reported", chain, contract.token);
            Vec::new()
        }
        Err(e) => {
            warn!("[{}] failed to fetch {} transfers: {}", chain, contract.token, e);
            Vec::new()
        }
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    // Some index providers have trouble negotiating h2 over rustls
    Ok(reqwest::ClientBuilder::new()
        .http1_only()
        .timeout(timeout)
        .build()?)
}

/// Reads a GET response body, turning non-2xx statuses into errors.
pub(crate) async fn read_body(resp: reqwest::Response) -> Result<String, FetchError> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        let body: String = body.chars().take(200).collect();
        return Err(FetchError::Status { status, body });
    }
    Ok(body)
}

/// Index APIs disagree on whether precisions are numbers or strings.
pub(crate) fn parse_decimals(value: Option<&Value>, default: u32) -> Option<u32> {
    match value {
        None | Some(Value::Null) => Some(default),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) if s.is_empty() => Some(default),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    }
}

/// Same for raw values; a number is only accepted when it is an integer.
pub(crate) fn raw_value_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.is_u64() => n.to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Reads a scalar field of one record as text. Missing, null or nested
/// values read as empty, which the classifier treats as not ours.
pub(crate) fn text_field(record: &Value, key: &str) -> String {
    match record.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Reads an integer field sent either as a number or as a numeric string.
pub(crate) fn int_field(record: &Value, key: &str) -> Option<i64> {
    match record.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
