use std::time::Duration;

use cleanops_common::id::{prefix, prefixed_ulid};

/// Token bucket parameters for one publish category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum number of tokens (burst size).
    pub capacity: u32,
    /// Tokens added back per second.
    pub refill_per_sec: f64,
}

/// Per-connection rate limits, configured independently per category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub chat: BucketConfig,
    pub status: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            chat: BucketConfig {
                capacity: 20,
                refill_per_sec: 2.0,
            },
            status: BucketConfig {
                capacity: 5,
                refill_per_sec: 0.5,
            },
        }
    }
}

/// Realtime gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string for the cross-instance backplane. When unset
    /// the process only fans out to its own connections.
    pub redis_url: Option<String>,
    /// HS256 secret shared with the identity provider that issues bearer tokens.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Identifier of this gateway process, stamped on every backplane envelope.
    pub instance_id: String,
    /// Upper bound on credential resolution during the handshake.
    pub auth_timeout: Duration,
    /// Capacity of each connection's outbound event queue.
    pub outbound_queue_size: usize,
    pub rate_limits: RateLimitConfig,
    /// Number of recent chat messages kept in memory per room.
    pub recent_message_cache: usize,
    /// Number of rooms the recent-message cache holds at once.
    pub recent_cache_rooms: usize,
    /// Notifications kept per user; older ones are pruned on insert.
    pub notification_retention: i64,
    /// Ceiling for the backplane reconnect backoff.
    pub backplane_max_backoff: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            database_url: required_var("DATABASE_URL"),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            jwt_secret: required_var("JWT_SECRET"),
            port: parsed_var("PORT", 4010),
            instance_id: std::env::var("INSTANCE_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| prefixed_ulid(prefix::INSTANCE)),
            auth_timeout: Duration::from_secs(parsed_var("AUTH_TIMEOUT_SECS", 10)),
            outbound_queue_size: parsed_var("OUTBOUND_QUEUE_SIZE", 256),
            rate_limits: RateLimitConfig {
                chat: BucketConfig {
                    capacity: parsed_var("RATE_CHAT_CAPACITY", defaults.chat.capacity),
                    refill_per_sec: parsed_var(
                        "RATE_CHAT_REFILL_PER_SEC",
                        defaults.chat.refill_per_sec,
                    ),
                },
                status: BucketConfig {
                    capacity: parsed_var("RATE_STATUS_CAPACITY", defaults.status.capacity),
                    refill_per_sec: parsed_var(
                        "RATE_STATUS_REFILL_PER_SEC",
                        defaults.status.refill_per_sec,
                    ),
                },
            },
            recent_message_cache: parsed_var("RECENT_MESSAGE_CACHE", 50),
            recent_cache_rooms: parsed_var("RECENT_CACHE_ROOMS", 1024),
            notification_retention: parsed_var("NOTIFICATION_RETENTION", 200),
            backplane_max_backoff: Duration::from_secs(parsed_var(
                "BACKPLANE_MAX_BACKOFF_SECS",
                30,
            )),
        }
    }

    /// Configuration suitable for tests and local runs without a database.
    pub fn for_local(jwt_secret: &str) -> Self {
        Self {
            database_url: String::new(),
            redis_url: None,
            jwt_secret: jwt_secret.to_string(),
            port: 0,
            instance_id: prefixed_ulid(prefix::INSTANCE),
            auth_timeout: Duration::from_secs(10),
            outbound_queue_size: 256,
            rate_limits: RateLimitConfig::default(),
            recent_message_cache: 50,
            recent_cache_rooms: 1024,
            notification_retention: 200,
            backplane_max_backoff: Duration::from_secs(30),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
