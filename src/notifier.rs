use async_trait::async_trait;
use tracing::info;

use crate::amount::Amount;

/// Delivery channel for qualifying transfers.
///
/// Returns whether the message was accepted. Failures are reported, not
/// retried; the caller only logs and counts them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, amount: &Amount, label: &str) -> bool;
}

/// Text sent for a transfer, e.g. `+12.50 USDT BNB`.
pub fn format_message(amount: &Amount, label: &str) -> String {
    format!("+{} {}", amount.to_fixed(2), label)
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, amount: &Amount, label: &str) -> bool {
        info!("[Console] {}", format_message(amount, label));
        true
    }
}
