//! Decides which fetched transfers deserve a notification.
//!
//! Index APIs return the same recent window on every poll, so every record
//! that gets looked at is remembered in the [`SeenSet`] whether it qualifies or
//! not. A record is inserted before it is evaluated; a transfer can therefore
//! qualify at most once even if a later step fails.

use tracing::{debug, info, trace, warn};

use crate::amount::{normalize, Amount};
use crate::models::{QualifyingTransfer, RawTransfer};
use crate::state::SeenSet;

/// Returns the new, inbound transfers of at least `min_amount`, in batch order.
///
/// Every record not yet in `seen` is added to it, qualifying or not.
pub fn classify(
    batch: &[RawTransfer],
    wallet: &str,
    min_amount: &Amount,
    seen: &mut SeenSet,
) -> Vec<QualifyingTransfer> {
    let mut qualifying = Vec::new();

    for record in batch {
        if seen.contains(&record.id) {
            trace!("[{}] {} already processed", record.chain, record.id);
            continue;
        }
        seen.insert(record.id.as_str());

        if !record.chain.addresses_match(&record.to, wallet) {
            debug!("[{}] {} is not addressed to the wallet, skipping", record.chain, record.id);
            continue;
        }

        let Some(decimals) = record.token_decimals else {
            warn!("[{}] {} has unreadable token precision, dropping", record.chain, record.id);
            continue;
        };
        let amount = match normalize(&record.raw_value, decimals) {
            Ok(amount) => amount,
            Err(e) => {
                warn!("[{}] {} has a malformed amount, dropping: {}", record.chain, record.id, e);
                continue;
            }
        };

        if amount < *min_amount {
            info!(
                "[{}] incoming {} {} below minimum {}: {}",
                record.chain, amount, record.token, min_amount, record.id
            );
            continue;
        }

        qualifying.push(QualifyingTransfer {
            id: record.id.clone(),
            chain: record.chain,
            token: record.token,
            from: record.from.clone(),
            amount,
        });
    }

    qualifying
}

/// Marks every record of `batch` as seen without evaluating it.
///
/// Used on first start so that history is not reported. Returns how many ids
/// were new.
pub fn mark_seen(batch: &[RawTransfer], seen: &mut SeenSet) -> usize {
    batch
        .iter()
        .filter(|record| seen.insert(record.id.as_str()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chain, Token};

    const TRON_WALLET: &str = "TW4i7hytEBeRBKxKZfPAxZqEgqUqNGXdSh";
    const BSC_WALLET: &str = "0x9dE669d6A5AD8B4df07eD87eB32D078a4342fE9b";
    const OTHER: &str = "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf";

    fn tron(id: &str, to: &str, raw: &str) -> RawTransfer {
        RawTransfer {
            id: id.to_string(),
            from: OTHER.to_string(),
            to: to.to_string(),
            raw_value: raw.to_string(),
            token_decimals: Some(6),
            token: Token::Usdt,
            chain: Chain::Tron,
            timestamp: None,
        }
    }

    fn bsc(id: &str, to: &str, raw: &str) -> RawTransfer {
        RawTransfer {
            token_decimals: Some(18),
            token: Token::Busd,
            chain: Chain::Bsc,
            from: "0x1111111111111111111111111111111111111111".to_string(),
            ..tron(id, to, raw)
        }
    }

    fn five() -> Amount {
        Amount::parse("5").unwrap()
    }

    #[test]
    fn classification_is_idempotent() {
        let mut seen = SeenSet::new();
        let batch = [tron("t1", TRON_WALLET, "7000000")];

        let first = classify(&batch, TRON_WALLET, &five(), &mut seen);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].amount, Amount::parse("7").unwrap());
        assert_eq!(first[0].label(), "USDT TRON");

        let snapshot = seen.clone();
        let second = classify(&batch, TRON_WALLET, &five(), &mut seen);
        assert!(second.is_empty());
        assert_eq!(seen, snapshot);
    }

    #[test]
    fn threshold_is_inclusive_for_both_precisions() {
        let mut seen = SeenSet::new();
        let batch = [
            tron("exact6", TRON_WALLET, "5000000"),
            tron("under6", TRON_WALLET, "4999999"),
            bsc("exact18", BSC_WALLET, "5000000000000000000"),
            bsc("under18", BSC_WALLET, "4999999000000000000"),
        ];

        let tron_hits = classify(&batch[..2], TRON_WALLET, &five(), &mut seen);
        let bsc_hits = classify(&batch[2..], BSC_WALLET, &five(), &mut seen);

        let ids: Vec<_> = tron_hits.iter().chain(&bsc_hits).map(|q| q.id.as_str()).collect();
        assert_eq!(ids, ["exact6", "exact18"]);
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn outgoing_transfers_never_qualify_but_are_remembered() {
        let mut seen = SeenSet::new();
        let batch = [tron("out", OTHER, "999999999999")];
        assert!(classify(&batch, TRON_WALLET, &five(), &mut seen).is_empty());
        assert!(seen.contains("out"));
    }

    #[test]
    fn hex_destination_matches_case_insensitively() {
        let mut seen = SeenSet::new();
        let batch = [bsc("0xabc", &BSC_WALLET.to_lowercase(), "6000000000000000000")];
        let hits = classify(&batch, BSC_WALLET, &five(), &mut seen);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label(), "BUSD BNB");
    }

    #[test]
    fn base58_destination_is_case_sensitive() {
        let mut seen = SeenSet::new();
        let batch = [tron("t", &TRON_WALLET.to_lowercase(), "6000000")];
        assert!(classify(&batch, TRON_WALLET, &five(), &mut seen).is_empty());
        assert!(seen.contains("t"));
    }

    #[test]
    fn malformed_records_are_dropped_and_remembered() {
        let mut seen = SeenSet::new();
        let mut bad_precision = tron("bad-dec", TRON_WALLET, "6000000");
        bad_precision.token_decimals = None;
        let batch = [
            tron("bad-value", TRON_WALLET, "lots"),
            bad_precision,
            tron("good", TRON_WALLET, "6000000"),
        ];

        let hits = classify(&batch, TRON_WALLET, &five(), &mut seen);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "good");
        assert!(seen.contains("bad-value"));
        assert!(seen.contains("bad-dec"));
    }

    #[test]
    fn duplicates_within_a_batch_qualify_once() {
        let mut seen = SeenSet::new();
        let batch = [
            tron("dup", TRON_WALLET, "6000000"),
            tron("dup", TRON_WALLET, "6000000"),
        ];
        assert_eq!(classify(&batch, TRON_WALLET, &five(), &mut seen).len(), 1);
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn empty_batch_changes_nothing() {
        let mut seen: SeenSet = ["x"].into_iter().collect();
        assert!(classify(&[], TRON_WALLET, &five(), &mut seen).is_empty());
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn output_keeps_batch_order() {
        let mut seen = SeenSet::new();
        let batch = [
            tron("newest", TRON_WALLET, "9000000"),
            tron("middle", TRON_WALLET, "1000000"),
            tron("oldest", TRON_WALLET, "8000000"),
        ];
        let ids: Vec<_> = classify(&batch, TRON_WALLET, &five(), &mut seen)
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(ids, ["newest", "oldest"]);
    }

    #[test]
    fn baseline_suppresses_the_initial_window() {
        let mut seen = SeenSet::new();
        let batch: Vec<_> = (0..50)
            .map(|i| tron(&format!("tx{i:02}"), TRON_WALLET, "10000000"))
            .collect();

        assert_eq!(mark_seen(&batch, &mut seen), 50);
        assert_eq!(seen.len(), 50);
        assert!(classify(&batch, TRON_WALLET, &five(), &mut seen).is_empty());
        assert_eq!(mark_seen(&batch, &mut seen), 0);
    }

    #[test]
    fn only_new_ids_qualify_after_reload() {
        let mut seen: SeenSet = ["A", "B"].into_iter().collect();
        let batch = [
            tron("A", TRON_WALLET, "6000000"),
            tron("B", TRON_WALLET, "6000000"),
            tron("C", TRON_WALLET, "6000000"),
        ];
        let hits = classify(&batch, TRON_WALLET, &five(), &mut seen);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "C");
    }
}
