use std::{
    env,
    fmt::Display,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use gsm_session::{
    BackoffStrategy, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PAIRING_TIMEOUT, DEFAULT_PREVIEW_CHARS,
    ManagerOptions, ReconnectPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Simulated pairing for local runs and demos.
    Dev,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            other => Err(anyhow!("unknown session provider `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub session_dir: PathBuf,
    pub provider: ProviderKind,
    pub reconnect: ReconnectPolicy,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub pairing_timeout: Duration,
    pub shutdown_grace: Duration,
    pub send_timeout: Duration,
    pub preview_chars: usize,
    pub log_level: String,
    pub dev_pairing_delay: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`GatewayConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let addr = parse_or(&get, "GATEWAY_BIND", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
        let session_dir = get("SESSION_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".session"));
        let provider = parse_or(&get, "SESSION_PROVIDER", ProviderKind::Dev)?;

        let strategy = match get("RECONNECT_STRATEGY") {
            Some(raw) => raw
                .parse::<BackoffStrategy>()
                .map_err(|err| anyhow!(err))
                .context("invalid RECONNECT_STRATEGY")?,
            None => BackoffStrategy::Exponential,
        };
        let base_delay = millis_or(&get, "RECONNECT_BASE_DELAY_MS", 2_000)?;
        let max_delay = millis_or(&get, "RECONNECT_MAX_DELAY_MS", 60_000)?;
        if base_delay.is_zero() {
            bail!("RECONNECT_BASE_DELAY_MS must be greater than zero");
        }
        if max_delay < base_delay {
            bail!("RECONNECT_MAX_DELAY_MS must not be below RECONNECT_BASE_DELAY_MS");
        }
        let max_attempts = match get("RECONNECT_MAX_ATTEMPTS") {
            Some(raw) => Some(
                raw.parse::<u32>()
                    .context("invalid RECONNECT_MAX_ATTEMPTS")?,
            ),
            None => None,
        };
        let reconnect = ReconnectPolicy {
            strategy,
            base_delay,
            max_delay,
            max_attempts,
            jitter: flag_or(&get, "RECONNECT_JITTER", true)?,
        };

        let connect_timeout = millis_or(
            &get,
            "CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        )?;
        let pairing_timeout = millis_or(
            &get,
            "PAIRING_TIMEOUT_MS",
            DEFAULT_PAIRING_TIMEOUT.as_millis() as u64,
        )?;
        if connect_timeout.is_zero() || pairing_timeout.is_zero() {
            bail!("CONNECT_TIMEOUT_MS and PAIRING_TIMEOUT_MS must be greater than zero");
        }

        let log_level = get("LOG_LEVEL")
            .map(|level| level.to_ascii_lowercase())
            .unwrap_or_else(|| "info".into());

        Ok(Self {
            addr,
            session_dir,
            provider,
            reconnect,
            auto_reconnect: flag_or(&get, "AUTO_RECONNECT", true)?,
            connect_timeout,
            pairing_timeout,
            shutdown_grace: millis_or(&get, "SHUTDOWN_GRACE_MS", 5_000)?,
            send_timeout: millis_or(&get, "SEND_TIMEOUT_MS", 30_000)?,
            preview_chars: parse_or(&get, "LOG_PREVIEW_CHARS", DEFAULT_PREVIEW_CHARS)?,
            log_level,
            dev_pairing_delay: millis_or(&get, "DEV_PAIRING_DELAY_MS", 3_000)?,
        })
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            policy: self.reconnect.clone(),
            auto_reconnect: self.auto_reconnect,
            connect_timeout: self.connect_timeout,
            pairing_timeout: self.pairing_timeout,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow!("{err}"))
            .with_context(|| format!("invalid {key}: `{raw}`")),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &str, default_ms: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

fn flag_or<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid {key}: `{raw}` is not a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = GatewayConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(cfg.addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.session_dir, PathBuf::from(".session"));
        assert_eq!(cfg.provider, ProviderKind::Dev);
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
        assert!(cfg.auto_reconnect);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(60));
        assert_eq!(cfg.pairing_timeout, Duration::from_secs(300));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(5));
        assert_eq!(cfg.send_timeout, Duration::from_secs(30));
        assert_eq!(cfg.preview_chars, 32);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.dev_pairing_delay, Duration::from_secs(3));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = GatewayConfig::from_lookup(lookup(&[
            ("GATEWAY_BIND", "127.0.0.1:9000"),
            ("SESSION_DIR", "/var/lib/gateway"),
            ("RECONNECT_STRATEGY", "fixed"),
            ("RECONNECT_BASE_DELAY_MS", "500"),
            ("RECONNECT_MAX_DELAY_MS", "500"),
            ("RECONNECT_MAX_ATTEMPTS", "12"),
            ("RECONNECT_JITTER", "off"),
            ("AUTO_RECONNECT", "false"),
            ("CONNECT_TIMEOUT_MS", "15000"),
            ("PAIRING_TIMEOUT_MS", "120000"),
            ("LOG_LEVEL", "DEBUG"),
        ]))
        .expect("config");
        assert_eq!(cfg.addr.port(), 9000);
        assert_eq!(cfg.session_dir, PathBuf::from("/var/lib/gateway"));
        assert_eq!(cfg.reconnect.strategy, BackoffStrategy::Fixed);
        assert_eq!(cfg.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(cfg.reconnect.max_attempts, Some(12));
        assert!(!cfg.reconnect.jitter);
        assert!(!cfg.auto_reconnect);
        assert_eq!(cfg.log_level, "debug");

        let options = cfg.manager_options();
        assert!(!options.auto_reconnect);
        assert_eq!(options.policy.max_attempts, Some(12));
        assert_eq!(options.connect_timeout, Duration::from_secs(15));
        assert_eq!(options.pairing_timeout, Duration::from_secs(120));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = GatewayConfig::from_lookup(lookup(&[("RECONNECT_BASE_DELAY_MS", "soon")]))
            .expect_err("invalid delay");
        assert!(format!("{err:#}").contains("RECONNECT_BASE_DELAY_MS"));

        let err = GatewayConfig::from_lookup(lookup(&[("AUTO_RECONNECT", "maybe")]))
            .expect_err("invalid flag");
        assert!(err.to_string().contains("AUTO_RECONNECT"));

        let err = GatewayConfig::from_lookup(lookup(&[("SESSION_PROVIDER", "carrier-pigeon")]))
            .expect_err("invalid provider");
        assert!(format!("{err:#}").contains("SESSION_PROVIDER"));
    }

    #[test]
    fn max_delay_must_cover_base() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("RECONNECT_BASE_DELAY_MS", "5000"),
            ("RECONNECT_MAX_DELAY_MS", "1000"),
        ]))
        .expect_err("inverted bounds");
        assert!(err.to_string().contains("RECONNECT_MAX_DELAY_MS"));
    }

    #[test]
    fn attempt_deadlines_must_be_positive() {
        let err = GatewayConfig::from_lookup(lookup(&[("CONNECT_TIMEOUT_MS", "0")]))
            .expect_err("zero deadline");
        assert!(err.to_string().contains("CONNECT_TIMEOUT_MS"));

        let err = GatewayConfig::from_lookup(lookup(&[("PAIRING_TIMEOUT_MS", "later")]))
            .expect_err("invalid deadline");
        assert!(format!("{err:#}").contains("PAIRING_TIMEOUT_MS"));
    }
}
