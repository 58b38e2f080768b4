//! Hub connection configuration.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HubError, HubResult};

/// Path of the gateway API on the hub.
pub const GATEWAY_API_PATH: &str = "/gateway_api/v1.0";

/// Default number of unclean closes before the link gives up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default time allowed for a connection attempt.
pub const DEFAULT_TIMEOUT_WAIT: Duration = Duration::from_secs(2);

/// Default time a connection must stay open before the retry counter resets.
pub const DEFAULT_OPEN_CONFIRM: Duration = Duration::from_millis(500);

/// Default delay before a send on a closed link retries.
pub const DEFAULT_SEND_RETRY: Duration = Duration::from_millis(750);

/// Default minimum gap between frames sent to the hub.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_millis(136);

/// Reconnect behaviour of the hub link.
///
/// Durations are stored as milliseconds so the struct reads naturally
/// from TOML (`retry_delay_ms = 5000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Unclean closes tolerated before the link stays closed.
    pub max_retries: u32,
    /// Delay between reconnect attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Connection attempt timeout, in milliseconds.
    pub timeout_wait_ms: u64,
    /// Open-confirmation debounce, in milliseconds.
    pub open_confirm_ms: u64,
    /// Retry interval for sends on a closed link, in milliseconds.
    pub send_retry_ms: u64,
    /// Cap on frames waiting for the link to open.
    pub max_pending: Option<usize>,
}

impl LinkConfig {
    /// Create a link configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            timeout_wait_ms: DEFAULT_TIMEOUT_WAIT.as_millis() as u64,
            open_confirm_ms: DEFAULT_OPEN_CONFIRM.as_millis() as u64,
            send_retry_ms: DEFAULT_SEND_RETRY.as_millis() as u64,
            max_pending: None,
        }
    }

    /// Set the maximum number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the retry delay. Zero is ignored.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.retry_delay_ms = delay.as_millis() as u64;
        }
        self
    }

    /// Set the connection timeout. Zero is ignored.
    #[must_use]
    pub const fn with_timeout_wait(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout_wait_ms = timeout.as_millis() as u64;
        }
        self
    }

    /// Set the open-confirmation debounce. Zero is ignored.
    #[must_use]
    pub const fn with_open_confirm(mut self, confirm: Duration) -> Self {
        if !confirm.is_zero() {
            self.open_confirm_ms = confirm.as_millis() as u64;
        }
        self
    }

    /// Set the send retry interval. Zero is ignored.
    #[must_use]
    pub const fn with_send_retry(mut self, retry: Duration) -> Self {
        if !retry.is_zero() {
            self.send_retry_ms = retry.as_millis() as u64;
        }
        self
    }

    /// Cap the number of frames waiting for the link.
    #[must_use]
    pub const fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Delay between reconnect attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Connection attempt timeout.
    #[must_use]
    pub const fn timeout_wait(&self) -> Duration {
        Duration::from_millis(self.timeout_wait_ms)
    }

    /// Open-confirmation debounce.
    #[must_use]
    pub const fn open_confirm(&self) -> Duration {
        Duration::from_millis(self.open_confirm_ms)
    }

    /// Retry interval for sends on a closed link.
    #[must_use]
    pub const fn send_retry(&self) -> Duration {
        Duration::from_millis(self.send_retry_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound pacing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Minimum gap between frames, in milliseconds.
    pub wait_time_ms: u64,
    /// Cap on frames waiting in the pacer.
    pub max_pending: Option<usize>,
}

impl PacerConfig {
    /// Create a pacer configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            wait_time_ms: DEFAULT_WAIT_TIME.as_millis() as u64,
            max_pending: None,
        }
    }

    /// Set the minimum gap between frames. Zero is ignored.
    #[must_use]
    pub const fn with_wait_time(mut self, wait: Duration) -> Self {
        if !wait.is_zero() {
            self.wait_time_ms = wait.as_millis() as u64;
        }
        self
    }

    /// Cap the number of frames waiting in the pacer.
    #[must_use]
    pub const fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Minimum gap between frames.
    #[must_use]
    pub const fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The hub target and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hub host, optionally with a port (`you.majortom.cloud`).
    pub host: String,
    /// Gateway token issued by the hub.
    pub gateway_token: String,
    /// Basic auth credentials (`user:pass`, a trailing `@` is accepted).
    #[serde(default)]
    pub basic_auth: Option<String>,
    /// Connect with `ws://` instead of `wss://`.
    #[serde(default)]
    pub insecure: bool,
    /// Reconnect behaviour.
    #[serde(default)]
    pub link: LinkConfig,
    /// Outbound pacing.
    #[serde(default)]
    pub pacer: PacerConfig,
}

impl HubConfig {
    /// Create a configuration for a hub host and gateway token.
    #[must_use]
    pub fn new(host: impl Into<String>, gateway_token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            gateway_token: gateway_token.into(),
            basic_auth: None,
            insecure: false,
            link: LinkConfig::new(),
            pacer: PacerConfig::new(),
        }
    }

    /// Set basic auth credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, auth: impl Into<String>) -> Self {
        self.basic_auth = Some(auth.into());
        self
    }

    /// Use plain `ws://`.
    #[must_use]
    pub const fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Set the link configuration.
    #[must_use]
    pub const fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Set the pacer configuration.
    #[must_use]
    pub const fn with_pacer(mut self, pacer: PacerConfig) -> Self {
        self.pacer = pacer;
        self
    }

    /// Reject empty hosts and tokens.
    pub fn validate(&self) -> HubResult<()> {
        if self.host.trim().is_empty() {
            return Err(HubError::InvalidConfig("hub host is empty".to_string()));
        }
        if self.gateway_token.trim().is_empty() {
            return Err(HubError::InvalidConfig("gateway token is empty".to_string()));
        }
        self.url().map(|_| ())
    }

    fn credentials(&self) -> Option<&str> {
        self.basic_auth
            .as_deref()
            .map(|auth| auth.trim_end_matches('@'))
            .filter(|auth| !auth.is_empty())
    }

    /// Build the hub WebSocket URL,
    /// `<ws|wss>://[auth@]host/gateway_api/v1.0?gateway_token=<token>`.
    pub fn url(&self) -> HubResult<Url> {
        let scheme = if self.insecure { "ws" } else { "wss" };
        let mut url = Url::parse(&format!("{scheme}://{}{GATEWAY_API_PATH}", self.host))
            .map_err(|e| HubError::InvalidConfig(format!("bad hub host {}: {e}", self.host)))?;

        url.query_pairs_mut()
            .append_pair("gateway_token", &self.gateway_token);

        if let Some(auth) = self.credentials() {
            let (user, pass) = auth.split_once(':').unwrap_or((auth, ""));
            url.set_username(user)
                .map_err(|()| HubError::InvalidConfig("hub url cannot carry credentials".into()))?;
            if !pass.is_empty() {
                url.set_password(Some(pass)).map_err(|()| {
                    HubError::InvalidConfig("hub url cannot carry credentials".into())
                })?;
            }
        }

        Ok(url)
    }

    /// Value of the `Authorization` header sent with the upgrade, if any.
    #[must_use]
    pub fn authorization(&self) -> Option<String> {
        self.credentials()
            .map(|auth| format!("Basic {}", BASE64.encode(auth)))
    }
}
