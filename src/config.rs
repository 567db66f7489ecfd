use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer};
use validator::{Validate, ValidationError};

use crate::amount::Amount;
use crate::chains::{bsc, tron};
use crate::error::ConfigError;
use crate::models::{Chain, Token, TokenContract, WalletConfig};
use crate::monitor::Schedule;
use crate::telegram::TelegramConfig;

pub const ENV_PREFIX: &str = "TRACKER_";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

pub const USDT_TRC20_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
pub const USDT_BEP20_CONTRACT: &str = "0x55d398326f99059fF775485246999027B3197955";
pub const BUSD_BEP20_CONTRACT: &str = "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56";

/// Process settings, loaded once at startup and immutable afterwards.
///
/// Sources, later ones winning: built-in defaults, the TOML file, then
/// `TRACKER_*` environment variables (`TRACKER_TRC20_WALLET`, ...).
#[derive(Clone, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[serde(deserialize_with = "opt_string")]
    pub telegram_bot_token: Option<String>,
    #[serde(deserialize_with = "opt_string")]
    pub telegram_chat_id: Option<String>,
    pub telegram_topic_id: Option<i64>,

    #[validate(custom(function = "validate_tron_address"))]
    pub trc20_wallet: Option<String>,
    #[validate(custom(function = "validate_bsc_address"))]
    pub bep20_wallet: Option<String>,

    #[validate(custom(function = "validate_tron_address"))]
    pub usdt_trc20_contract: String,
    #[validate(custom(function = "validate_bsc_address"))]
    pub usdt_bep20_contract: String,
    #[validate(custom(function = "validate_bsc_address"))]
    pub busd_bep20_contract: String,

    #[validate(length(min = 1))]
    pub trongrid_url: String,
    #[serde(deserialize_with = "opt_string")]
    pub trongrid_api_key: Option<String>,
    #[validate(length(min = 1))]
    pub bscscan_url: String,
    #[serde(deserialize_with = "opt_string")]
    pub bscscan_api_key: Option<String>,

    pub min_amount: Amount,
    #[validate(range(min = 1))]
    pub poll_interval_secs: u64,
    pub chain_pause_ms: u64,
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,
    #[validate(range(min = 1, max = 200))]
    pub trc20_page_limit: u32,
    #[validate(range(min = 1, max = 10000))]
    pub bep20_page_limit: u32,
    #[validate(range(min = 1))]
    pub persist_every_ticks: u64,
    #[validate(range(min = 1))]
    pub heartbeat_every_ticks: u64,

    pub state_file: PathBuf,
    /// Log notifications instead of sending them to Telegram.
    pub use_console: bool,
    pub metrics_port: Option<u16>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            telegram_chat_id: None,
            telegram_topic_id: None,
            trc20_wallet: None,
            bep20_wallet: None,
            usdt_trc20_contract: USDT_TRC20_CONTRACT.to_string(),
            usdt_bep20_contract: USDT_BEP20_CONTRACT.to_string(),
            busd_bep20_contract: BUSD_BEP20_CONTRACT.to_string(),
            trongrid_url: tron::DEFAULT_API_URL.to_string(),
            trongrid_api_key: None,
            bscscan_url: bsc::DEFAULT_API_URL.to_string(),
            bscscan_api_key: None,
            min_amount: Amount::from(fastnum::udec256!(5)),
            poll_interval_secs: 30,
            chain_pause_ms: 1000,
            request_timeout_secs: 15,
            trc20_page_limit: tron::DEFAULT_PAGE_LIMIT,
            bep20_page_limit: bsc::DEFAULT_PAGE_LIMIT,
            persist_every_ticks: 20,
            heartbeat_every_ticks: 10,
            state_file: PathBuf::from("last_transactions.json"),
            use_console: false,
            metrics_port: None,
            log_level: "info".to_string(),
            log_json: true,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| if present(v) { "<set>" } else { "<unset>" };
        f.debug_struct("Settings")
            .field("telegram_bot_token", &redact(&self.telegram_bot_token))
            .field("telegram_chat_id", &self.telegram_chat_id)
            .field("telegram_topic_id", &self.telegram_topic_id)
            .field("trc20_wallet", &self.trc20_wallet)
            .field("bep20_wallet", &self.bep20_wallet)
            .field("usdt_trc20_contract", &self.usdt_trc20_contract)
            .field("usdt_bep20_contract", &self.usdt_bep20_contract)
            .field("busd_bep20_contract", &self.busd_bep20_contract)
            .field("trongrid_url", &self.trongrid_url)
            .field("trongrid_api_key", &redact(&self.trongrid_api_key))
            .field("bscscan_url", &self.bscscan_url)
            .field("bscscan_api_key", &redact(&self.bscscan_api_key))
            .field("min_amount", &self.min_amount.to_string())
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("chain_pause_ms", &self.chain_pause_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("trc20_page_limit", &self.trc20_page_limit)
            .field("bep20_page_limit", &self.bep20_page_limit)
            .field("persist_every_ticks", &self.persist_every_ticks)
            .field("heartbeat_every_ticks", &self.heartbeat_every_ticks)
            .field("state_file", &self.state_file)
            .field("use_console", &self.use_console)
            .field("metrics_port", &self.metrics_port)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .finish()
    }
}

/// Loads settings from `path` (optional) and the environment, then checks them.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX));
    from_figment(figment)
}

pub fn from_figment(figment: Figment) -> Result<Settings, ConfigError> {
    let settings: Settings = figment.extract().map_err(Box::new)?;
    settings.check()?;
    tracing::debug!("Config loaded: {:#?}", settings);
    Ok(settings)
}

/// Bot credentials only, for commands that do not track wallets.
pub fn load_telegram(path: &Path) -> Result<TelegramConfig, ConfigError> {
    let settings: Settings = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(Box::new)?;
    if !present(&settings.telegram_bot_token) {
        return Err(ConfigError::Missing(vec!["telegram_bot_token"]));
    }
    Ok(settings.telegram())
}

impl Settings {
    /// Refuses settings the tracker cannot run correctly with.
    pub fn check(&self) -> Result<(), ConfigError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        self.validate()?;
        Ok(())
    }

    /// Names of required settings that are absent or blank.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut required = vec![
            ("trc20_wallet", &self.trc20_wallet),
            ("bep20_wallet", &self.bep20_wallet),
        ];
        if !self.use_console {
            required.push(("telegram_bot_token", &self.telegram_bot_token));
            required.push(("telegram_chat_id", &self.telegram_chat_id));
        }
        required
            .into_iter()
            .filter(|(_, value)| !present(value))
            .map(|(name, _)| name)
            .collect()
    }

    pub fn telegram(&self) -> TelegramConfig {
        TelegramConfig {
            bot_token: self.telegram_bot_token.clone().unwrap_or_default(),
            chat_id: self.telegram_chat_id.clone().unwrap_or_default(),
            topic_id: self.telegram_topic_id,
        }
    }

    /// The tracked wallet and watched contracts for every chain.
    pub fn wallets(&self) -> Vec<WalletConfig> {
        vec![
            WalletConfig {
                chain: Chain::Tron,
                wallet: self.trc20_wallet.clone().unwrap_or_default(),
                contracts: vec![TokenContract::new(Token::Usdt, &self.usdt_trc20_contract)],
            },
            WalletConfig {
                chain: Chain::Bsc,
                wallet: self.bep20_wallet.clone().unwrap_or_default(),
                contracts: vec![
                    TokenContract::new(Token::Usdt, &self.usdt_bep20_contract),
                    TokenContract::new(Token::Busd, &self.busd_bep20_contract),
                ],
            },
        ]
    }

    pub fn schedule(&self) -> Schedule {
        Schedule {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            chain_pause: Duration::from_millis(self.chain_pause_ms),
            persist_every_ticks: self.persist_every_ticks,
            heartbeat_every_ticks: self.heartbeat_every_ticks,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn validate_tron_address(address: &str) -> Result<(), ValidationError> {
    if tron::is_valid_address(address) {
        Ok(())
    } else {
        Err(ValidationError::new("tron_address"))
    }
}

fn validate_bsc_address(address: &str) -> Result<(), ValidationError> {
    if bsc::is_valid_address(address) {
        Ok(())
    } else {
        Err(ValidationError::new("bsc_address"))
    }
}

/// Environment values that look numeric (chat ids, keys) arrive as numbers.
fn opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        UInt(u64),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|v| match v {
        Scalar::Str(s) => s,
        Scalar::Int(n) => n.to_string(),
        Scalar::UInt(n) => n.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use figment::providers::Serialized;

    use super::*;

    const TRC20_WALLET: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
    const BEP20_WALLET: &str = "0x9dE669d6A5AD8B4df07eD87eB32D078a4342fE9b";

    fn toml(body: &str) -> Figment {
        Figment::new().merge(Toml::string(body))
    }

    fn complete() -> String {
        format!(
            r#"
            telegram_bot_token = "123:abc"
            telegram_chat_id = "-1001234"
            trc20_wallet = "{TRC20_WALLET}"
            bep20_wallet = "{BEP20_WALLET}"
            "#
        )
    }

    #[test]
    fn defaults_fill_everything_optional() {
        let settings = from_figment(toml(&complete())).unwrap();
        assert_eq!(settings.min_amount, Amount::parse("5").unwrap());
        assert_eq!(settings.poll_interval_secs, 30);
        assert_eq!(settings.state_file, PathBuf::from("last_transactions.json"));
        assert_eq!(settings.usdt_trc20_contract, USDT_TRC20_CONTRACT);
        assert!(settings.log_json);

        let wallets = settings.wallets();
        assert_eq!(wallets[0].chain, Chain::Tron);
        assert_eq!(wallets[0].wallet, TRC20_WALLET);
        assert_eq!(wallets[1].contracts.len(), 2);
        assert_eq!(wallets[1].contracts[1].token, Token::Busd);
    }

    #[test]
    fn missing_settings_are_named() {
        let err = from_figment(toml(&format!(r#"trc20_wallet = "{TRC20_WALLET}""#))).unwrap_err();
        match err {
            ConfigError::Missing(names) => {
                assert_eq!(names, ["bep20_wallet", "telegram_bot_token", "telegram_chat_id"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn blank_values_count_as_missing() {
        let body = complete().replace("\"123:abc\"", "\"  \"");
        assert!(matches!(
            from_figment(toml(&body)),
            Err(ConfigError::Missing(names)) if names == ["telegram_bot_token"]
        ));
    }

    #[test]
    fn console_mode_does_not_need_telegram() {
        let body = format!(
            r#"
            use_console = true
            trc20_wallet = "{TRC20_WALLET}"
            bep20_wallet = "{BEP20_WALLET}"
            "#
        );
        let settings = from_figment(toml(&body)).unwrap();
        assert!(!settings.telegram().is_configured());
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let body = complete().replace(BEP20_WALLET, "0x1234");
        assert!(matches!(from_figment(toml(&body)), Err(ConfigError::Invalid(_))));

        let body = complete().replace(TRC20_WALLET, "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u");
        assert!(matches!(from_figment(toml(&body)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ranges_are_enforced() {
        let body = format!("{}\npoll_interval_secs = 0", complete());
        assert!(matches!(from_figment(toml(&body)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn numeric_values_are_accepted_for_strings_and_amounts() {
        let figment = toml(&complete()).merge(Serialized::defaults(serde_json::json!({
            "telegram_chat_id": -1001234,
            "min_amount": "12.5",
        })));
        let settings = from_figment(figment).unwrap();
        assert_eq!(settings.telegram_chat_id.as_deref(), Some("-1001234"));
        assert_eq!(settings.min_amount, Amount::parse("12.5").unwrap());

        let body = format!("{}\nmin_amount = 7", complete());
        let settings = from_figment(toml(&body)).unwrap();
        assert_eq!(settings.min_amount, Amount::parse("7").unwrap());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let settings = from_figment(toml(&complete())).unwrap();
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("123:abc"));
        assert!(rendered.contains("<set>"));
    }
}
