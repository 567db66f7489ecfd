use std::sync::Arc;

use tracing::info;
use wallet_tracker::config::Settings;
use wallet_tracker::notifier::{ConsoleNotifier, Notifier};
use wallet_tracker::telegram::TelegramNotifier;

pub fn build_notifier(settings: &Settings) -> anyhow::Result<Arc<dyn Notifier>> {
    if settings.use_console {
        info!("Console mode, notifications are only logged");
        return Ok(Arc::new(ConsoleNotifier));
    }

    let telegram = settings.telegram();
    info!(
        "Notifications go to Telegram chat {}{}",
        telegram.chat_id,
        telegram
            .topic_id
            .map(|topic| format!(" (topic {topic})"))
            .unwrap_or_default()
    );
    Ok(Arc::new(TelegramNotifier::new(
        telegram,
        settings.request_timeout(),
    )?))
}
