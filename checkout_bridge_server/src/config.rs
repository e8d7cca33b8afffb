//! Bridge configuration
//!
//! Everything is read from `CBG_*` environment variables (a `.env` file is loaded first). Missing or malformed values
//! are logged and replaced with their defaults; the bridge never refuses to start over a bad number.
use std::{env, fmt::Display, str::FromStr, time::Duration};

use checkout_bridge_engine::marker_race::{FAILURE_MARKER, SUCCESS_MARKER};
use log::*;
use pocketbase_tools::PocketBaseConfig;

const DEFAULT_CHECKOUT_DRIVER_URL: &str = "http://127.0.0.1:3000/";
const DEFAULT_PROVIDER_NAME: &str = "checkout-driver";
const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_ORDER_COLLECTION: &str = "payment";
const DEFAULT_CREDIT_COLLECTION: &str = "creditTransactions";
const DEFAULT_VERIFY_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_VERIFY_CONCURRENCY: usize = 16;
const DEFAULT_EXPORT_CONCURRENCY: usize = 8;
const DEFAULT_EXPORT_QUEUE_SIZE: usize = 64;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_GATE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_GATE_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(7);
const DEFAULT_AUTH_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_HEALTHY_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub pocketbase: PocketBaseConfig,
    /// How often the PocketBase superuser token is refreshed.
    pub auth_refresh_interval: Duration,
    /// Base URL of the checkout driver sidecar, always with a trailing slash.
    pub checkout_driver_url: String,
    /// The name the checkout driver's provider goes by in order messages.
    pub provider_name: String,
    /// Longest a session, payment or OTP call to the checkout driver may take.
    pub driver_timeout: Duration,
    pub order_collection: String,
    pub credit_collection: String,
    pub verify_interval: Duration,
    /// How long a single verification may wait for either page marker before it is declared ambiguous.
    pub verify_timeout: Duration,
    pub verify_concurrency: usize,
    /// Text the checkout page shows once the payment went through.
    pub success_marker: String,
    /// Text the checkout page shows when the payment failed.
    pub failure_marker: String,
    pub export_concurrency: usize,
    pub export_queue_size: usize,
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
    pub gate_ttl: Duration,
    pub gate_sweep_interval: Duration,
    /// Time given to in-flight work after the shutdown sequence, before the process exits.
    pub shutdown_grace: Duration,
    pub backoff: BackoffConfig,
}

/// Reconnection policy for the realtime subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// A subscription that stays up at least this long resets the backoff to `base`.
    pub healthy_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: DEFAULT_BACKOFF_BASE, cap: DEFAULT_BACKOFF_CAP, healthy_after: DEFAULT_BACKOFF_HEALTHY_AFTER }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pocketbase: PocketBaseConfig::default(),
            auth_refresh_interval: DEFAULT_AUTH_REFRESH_INTERVAL,
            checkout_driver_url: DEFAULT_CHECKOUT_DRIVER_URL.to_string(),
            provider_name: DEFAULT_PROVIDER_NAME.to_string(),
            order_collection: DEFAULT_ORDER_COLLECTION.to_string(),
            credit_collection: DEFAULT_CREDIT_COLLECTION.to_string(),
            verify_interval: DEFAULT_VERIFY_INTERVAL,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            driver_timeout: DEFAULT_DRIVER_TIMEOUT,
            verify_concurrency: DEFAULT_VERIFY_CONCURRENCY,
            success_marker: SUCCESS_MARKER.to_string(),
            failure_marker: FAILURE_MARKER.to_string(),
            export_concurrency: DEFAULT_EXPORT_CONCURRENCY,
            export_queue_size: DEFAULT_EXPORT_QUEUE_SIZE,
            session_ttl: DEFAULT_SESSION_TTL,
            session_sweep_interval: DEFAULT_SESSION_SWEEP_INTERVAL,
            gate_ttl: DEFAULT_GATE_TTL,
            gate_sweep_interval: DEFAULT_GATE_SWEEP_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            backoff: BackoffConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env_or_default() -> Self {
        let pocketbase = PocketBaseConfig::new_from_env_or_default();
        let checkout_driver_url = env::var("CBG_CHECKOUT_DRIVER_URL").ok().unwrap_or_else(|| {
            warn!("🪛️ CBG_CHECKOUT_DRIVER_URL is not set. Using {DEFAULT_CHECKOUT_DRIVER_URL} as default.");
            DEFAULT_CHECKOUT_DRIVER_URL.to_string()
        });
        let checkout_driver_url = with_trailing_slash(checkout_driver_url);
        let provider_name = env::var("CBG_PROVIDER_NAME").ok().unwrap_or_else(|| DEFAULT_PROVIDER_NAME.into());
        let order_collection =
            env::var("CBG_ORDER_COLLECTION").ok().unwrap_or_else(|| DEFAULT_ORDER_COLLECTION.into());
        let credit_collection =
            env::var("CBG_CREDIT_COLLECTION").ok().unwrap_or_else(|| DEFAULT_CREDIT_COLLECTION.into());
        let backoff = BackoffConfig {
            base: secs_from_env("CBG_BACKOFF_BASE_SECS", DEFAULT_BACKOFF_BASE),
            cap: secs_from_env("CBG_BACKOFF_CAP_SECS", DEFAULT_BACKOFF_CAP),
            healthy_after: secs_from_env("CBG_BACKOFF_HEALTHY_SECS", DEFAULT_BACKOFF_HEALTHY_AFTER),
        };
        Self {
            pocketbase,
            auth_refresh_interval: secs_from_env("CBG_AUTH_REFRESH_SECS", DEFAULT_AUTH_REFRESH_INTERVAL),
            checkout_driver_url,
            provider_name,
            order_collection,
            credit_collection,
            verify_interval: secs_from_env("CBG_VERIFY_INTERVAL_SECS", DEFAULT_VERIFY_INTERVAL),
            verify_timeout: secs_from_env("CBG_VERIFY_TIMEOUT_SECS", DEFAULT_VERIFY_TIMEOUT),
            driver_timeout: secs_from_env("CBG_DRIVER_TIMEOUT_SECS", DEFAULT_DRIVER_TIMEOUT),
            verify_concurrency: count_from_env("CBG_VERIFY_CONCURRENCY", DEFAULT_VERIFY_CONCURRENCY),
            success_marker: env::var("CBG_SUCCESS_MARKER").ok().unwrap_or_else(|| SUCCESS_MARKER.into()),
            failure_marker: env::var("CBG_FAILURE_MARKER").ok().unwrap_or_else(|| FAILURE_MARKER.into()),
            export_concurrency: count_from_env("CBG_EXPORT_CONCURRENCY", DEFAULT_EXPORT_CONCURRENCY),
            export_queue_size: count_from_env("CBG_EXPORT_QUEUE_SIZE", DEFAULT_EXPORT_QUEUE_SIZE),
            session_ttl: secs_from_env("CBG_SESSION_TTL_SECS", DEFAULT_SESSION_TTL),
            session_sweep_interval: secs_from_env("CBG_SESSION_SWEEP_SECS", DEFAULT_SESSION_SWEEP_INTERVAL),
            gate_ttl: secs_from_env("CBG_GATE_TTL_SECS", DEFAULT_GATE_TTL),
            gate_sweep_interval: secs_from_env("CBG_GATE_SWEEP_SECS", DEFAULT_GATE_SWEEP_INTERVAL),
            shutdown_grace: secs_from_env("CBG_SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE),
            backoff: backoff.normalized(),
        }
    }
}

impl BackoffConfig {
    /// Makes sure the cap is never below the base.
    pub fn normalized(self) -> Self {
        if self.cap < self.base {
            warn!(
                "🪛️ The backoff cap ({:?}) is below the base delay ({:?}). Using the base delay as the cap.",
                self.cap, self.base
            );
            return Self { cap: self.base, ..self };
        }
        self
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Parses `value` (the contents of env var `name`), logging and returning the default if it is missing or invalid.
fn parse_setting<T>(name: &str, value: Option<String>, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match value {
        None => default,
        Some(s) => s.trim().parse::<T>().unwrap_or_else(|e| {
            error!("🪛️ {s} is not a valid value for {name}. {e} Using the default, {default}, instead.");
            default
        }),
    }
}

fn secs_from_env(name: &str, default: Duration) -> Duration {
    let secs = parse_setting(name, env::var(name).ok(), default.as_secs());
    positive(name, Duration::from_secs(secs), default)
}

fn count_from_env(name: &str, default: usize) -> usize {
    match parse_setting(name, env::var(name).ok(), default) {
        0 => {
            warn!("🪛️ {name} must be at least 1. Using the default, {default}, instead.");
            default
        },
        n => n,
    }
}

fn positive(name: &str, value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        warn!("🪛️ {name} cannot be zero. Using the default, {default:?}, instead.");
        default
    } else {
        value
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.order_collection, "payment");
        assert_eq!(config.credit_collection, "creditTransactions");
        assert_eq!(config.verify_interval, Duration::from_secs(60));
        assert_eq!(config.verify_timeout, Duration::from_secs(30));
        assert_eq!(config.driver_timeout, Duration::from_secs(120));
        assert_eq!(config.verify_concurrency, 16);
        assert_eq!(config.export_concurrency, 8);
        assert_eq!(config.export_queue_size, 64);
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.gate_ttl, Duration::from_secs(300));
        assert_eq!(config.gate_sweep_interval, Duration::from_secs(600));
        assert_eq!(config.shutdown_grace, Duration::from_secs(7));
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.cap, Duration::from_secs(30));
    }

    #[test]
    fn bad_values_fall_back_to_default() {
        assert_eq!(parse_setting("CBG_X", None, 5u64), 5);
        assert_eq!(parse_setting("CBG_X", Some("12".into()), 5u64), 12);
        assert_eq!(parse_setting("CBG_X", Some(" 12 ".into()), 5u64), 12);
        assert_eq!(parse_setting("CBG_X", Some("twelve".into()), 5u64), 5);
        assert_eq!(parse_setting("CBG_X", Some("-1".into()), 5usize), 5);
    }

    #[test]
    fn env_overrides() {
        env::set_var("CBG_TEST_VERIFY_SECS", "90");
        env::set_var("CBG_TEST_ZERO_SECS", "0");
        env::set_var("CBG_TEST_ZERO_COUNT", "0");
        assert_eq!(secs_from_env("CBG_TEST_VERIFY_SECS", DEFAULT_VERIFY_INTERVAL), Duration::from_secs(90));
        assert_eq!(secs_from_env("CBG_TEST_ZERO_SECS", DEFAULT_VERIFY_INTERVAL), DEFAULT_VERIFY_INTERVAL);
        assert_eq!(count_from_env("CBG_TEST_ZERO_COUNT", 8), 8);
        assert_eq!(secs_from_env("CBG_TEST_UNSET_SECS", DEFAULT_BACKOFF_BASE), DEFAULT_BACKOFF_BASE);
    }

    #[test]
    fn backoff_cap_never_below_base() {
        let backoff =
            BackoffConfig { base: Duration::from_secs(5), cap: Duration::from_secs(1), healthy_after: Duration::ZERO };
        assert_eq!(backoff.normalized().cap, Duration::from_secs(5));
    }

    #[test]
    fn driver_url_gets_trailing_slash() {
        assert_eq!(with_trailing_slash("http://driver:3000".into()), "http://driver:3000/");
        assert_eq!(with_trailing_slash("http://driver:3000/".into()), "http://driver:3000/");
    }
}
