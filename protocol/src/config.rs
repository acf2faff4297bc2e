//! # Protocol Configuration & Constants
//!
//! Every timeout, limit and default of the token transaction lifecycle
//! lives here. If you're hardcoding a `Duration` somewhere else, move it
//! here and give it a name.
//!
//! The constants are the defaults. The `*Config` structs below are what
//! components actually take in their constructors, so deployments can
//! override any of them from a config file without touching code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate-level protocol version string, reported by the node.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Domain separator mixed into every digest the protocol signs. Keeps a
/// signature over a token request from being replayed as anything else.
pub const SIGNING_DOMAIN: &str = "tokenflow/ttx/v1";

// ---------------------------------------------------------------------------
// Session Timing
// ---------------------------------------------------------------------------

/// How long any party waits for a reply on an interactive session
/// (recipient exchange, action collection, audit round trip).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a responder waits for each individual signature request.
pub const SIGNATURE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of each direction of an in-memory session. Protocol rounds
/// exchange a handful of messages, so this is never the bottleneck.
pub const SESSION_QUEUE_CAPACITY: usize = 64;

/// Capacity of a party inbox (pending incoming sessions).
pub const INBOX_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// Finality
// ---------------------------------------------------------------------------

/// Timeout used by `get_finality` when the caller does not supply one.
pub const DEFAULT_FINALITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Hard ceiling for any finality wait. Caller timeouts are clamped to it.
pub const MAX_FINALITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Tick of the batched status poller. One multi-status query per tick,
/// regardless of how many transactions are pending.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(200);

/// Capacity of a per-transaction status event channel. Two is enough: one
/// event from the store listener and one synthetic event from the poller.
pub const STATUS_EVENT_CAPACITY: usize = 2;

// ---------------------------------------------------------------------------
// Token Selection & Locking
// ---------------------------------------------------------------------------

/// Number of selection attempts before reporting lock contention.
pub const DEFAULT_SELECTOR_RETRIES: usize = 3;

/// Sleep between selection attempts.
pub const DEFAULT_SELECTOR_BACKOFF: Duration = Duration::from_millis(100);

/// How often the lock table scans for evictable entries.
pub const DEFAULT_LOCK_EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// How long a lock held by an already confirmed transaction survives
/// before the eviction scan drops it.
pub const DEFAULT_CONFIRMED_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Audit Limits
// ---------------------------------------------------------------------------

/// Maximum value of a single payment the default audit check accepts.
pub const AUDIT_PAYMENT_LIMIT: u64 = 200;

/// Maximum sum of the last `AUDIT_CUMULATIVE_WINDOW` payments plus the
/// payment under audit.
pub const AUDIT_CUMULATIVE_LIMIT: u64 = 2_000;

/// Number of past payments considered by the cumulative check.
pub const AUDIT_CUMULATIVE_WINDOW: usize = 10;

/// Maximum holding any recipient may reach after the transaction.
pub const AUDIT_HOLDING_LIMIT: u64 = 3_000;

// ---------------------------------------------------------------------------
// Configuration Structs
// ---------------------------------------------------------------------------

/// Settings of the interactive protocol rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtxConfig {
    /// Reply timeout for interactive sessions.
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,
    /// Per-request timeout on the responder side of endorsement.
    #[serde(with = "duration_ms")]
    pub signature_request_timeout: Duration,
    /// Skip caching the token request after a successful broadcast.
    pub no_caching_request: bool,
}

impl Default for TtxConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            signature_request_timeout: SIGNATURE_REQUEST_TIMEOUT,
            no_caching_request: false,
        }
    }
}

/// Settings of the finality service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalityConfig {
    /// Poller tick.
    #[serde(with = "duration_ms")]
    pub polling_interval: Duration,
    /// Timeout applied when the caller passes none.
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    /// Upper bound for any caller-supplied timeout.
    #[serde(with = "duration_ms")]
    pub max_timeout: Duration,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            default_timeout: DEFAULT_FINALITY_TIMEOUT,
            max_timeout: MAX_FINALITY_TIMEOUT,
        }
    }
}

impl FinalityConfig {
    /// Resolves the effective wait for a caller-supplied timeout.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }

    /// Number of poller ticks a pending entry survives: `timeout / tick`,
    /// never less than one.
    pub fn iterations_for(&self, timeout: Duration) -> u32 {
        let tick = self.polling_interval.as_millis().max(1);
        let n = timeout.as_millis() / tick;
        n.clamp(1, u32::MAX as u128) as u32
    }
}

/// Settings of the token selector and its lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Selection attempts before giving up on locked funds.
    pub num_retry: usize,
    /// Sleep between attempts.
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    /// Eviction scan interval.
    #[serde(with = "duration_ms")]
    pub eviction_interval: Duration,
    /// Age after which locks of confirmed transactions are dropped.
    #[serde(with = "duration_ms")]
    pub confirmed_lock_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            num_retry: DEFAULT_SELECTOR_RETRIES,
            retry_backoff: DEFAULT_SELECTOR_BACKOFF,
            eviction_interval: DEFAULT_LOCK_EVICTION_INTERVAL,
            confirmed_lock_timeout: DEFAULT_CONFIRMED_LOCK_TIMEOUT,
        }
    }
}

/// Limits enforced by the default audit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditLimits {
    /// Single payment ceiling.
    pub payment_limit: u64,
    /// Ceiling for the rolling sum of recent payments.
    pub cumulative_limit: u64,
    /// Number of recent payments in the rolling sum.
    pub cumulative_window: usize,
    /// Ceiling for any recipient's holding.
    pub holding_limit: u64,
}

impl Default for AuditLimits {
    fn default() -> Self {
        Self {
            payment_limit: AUDIT_PAYMENT_LIMIT,
            cumulative_limit: AUDIT_CUMULATIVE_LIMIT,
            cumulative_window: AUDIT_CUMULATIVE_WINDOW,
            holding_limit: AUDIT_HOLDING_LIMIT,
        }
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds, which is
/// what operators actually write in config files.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_constants_sanity() {
        // The default wait must fit under the ceiling, and the poller must
        // tick many times within a default wait.
        assert!(DEFAULT_FINALITY_TIMEOUT <= MAX_FINALITY_TIMEOUT);
        assert!(DEFAULT_POLLING_INTERVAL < DEFAULT_FINALITY_TIMEOUT);
        assert!(STATUS_EVENT_CAPACITY >= 2);
    }

    #[test]
    fn test_audit_limits_are_ordered() {
        assert!(AUDIT_PAYMENT_LIMIT < AUDIT_CUMULATIVE_LIMIT);
        assert!(AUDIT_CUMULATIVE_LIMIT < AUDIT_HOLDING_LIMIT);
    }

    #[test]
    fn test_effective_timeout_is_clamped() {
        let cfg = FinalityConfig::default();
        assert_eq!(cfg.effective_timeout(None), DEFAULT_FINALITY_TIMEOUT);
        assert_eq!(
            cfg.effective_timeout(Some(Duration::from_secs(3600))),
            MAX_FINALITY_TIMEOUT
        );
        assert_eq!(
            cfg.effective_timeout(Some(Duration::from_millis(100))),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_iterations_never_zero() {
        let cfg = FinalityConfig {
            polling_interval: Duration::from_millis(200),
            ..FinalityConfig::default()
        };
        assert_eq!(cfg.iterations_for(Duration::from_millis(50)), 1);
        assert_eq!(cfg.iterations_for(Duration::from_secs(2)), 10);
    }

    #[test]
    fn test_config_from_partial_json() {
        // Missing fields fall back to defaults.
        let cfg: SelectorConfig = serde_json::from_str(r#"{"num_retry": 7}"#).unwrap();
        assert_eq!(cfg.num_retry, 7);
        assert_eq!(cfg.retry_backoff, DEFAULT_SELECTOR_BACKOFF);

        let cfg: FinalityConfig = serde_json::from_str(r#"{"polling_interval": 50}"#).unwrap();
        assert_eq!(cfg.polling_interval, Duration::from_millis(50));
        assert_eq!(cfg.max_timeout, MAX_FINALITY_TIMEOUT);
    }
}
