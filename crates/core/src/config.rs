//! Environment-sourced configuration with the deployment defaults every
//! process shares. Each binary reads its own bind address on top of these.

use std::env;

/// Read an environment variable, falling back to `default` when unset or
/// empty.
pub fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// This process's instance identifier: the hostname, or `fallback` when the
/// hostname is unavailable.
pub fn instance_id(fallback: &str) -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl PostgresConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("POSTGRES_HOST", "localhost"),
            port: env_or("POSTGRES_PORT", "5432"),
            user: env_or("POSTGRES_USER", "jobs"),
            password: env_or("POSTGRES_PASSWORD", "jobs"),
            dbname: env_or("POSTGRES_DB", "jobs"),
        }
    }

    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.dbname
        )
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
    pub db: u32,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            addr: env_or("REDIS_ADDR", "localhost:6379"),
            password: env::var("REDIS_PASSWORD").unwrap_or_default(),
            db: env_or("REDIS_DB", "0").parse().unwrap_or(0),
        }
    }

    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

/// Stream and consumer-group names shared by scheduler, worker and admin.
#[derive(Debug, Clone)]
pub struct StreamsConfig {
    pub scheduled: String,
    pub adhoc: String,
    pub retry: String,
    pub dlq: String,
    pub consumer_group: String,
}

impl StreamsConfig {
    pub fn from_env() -> Self {
        Self {
            scheduled: env_or("REDIS_STREAM_SCHEDULED", "jobs:scheduled"),
            adhoc: env_or("REDIS_STREAM_ADHOC", "jobs:adhoc"),
            retry: env_or("REDIS_STREAM_RETRY", "jobs:retry"),
            dlq: env_or("REDIS_STREAM_DLQ", "jobs:dlq"),
            consumer_group: env_or("REDIS_CONSUMER_GROUP", "cg:workers"),
        }
    }
}

/// Leader-lease key and TTL for the scheduler singleton.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub key: String,
    pub ttl_secs: u64,
}

impl LeaderConfig {
    pub fn from_env() -> Self {
        Self {
            key: env_or("LEADER_KEY", "scheduler:leader"),
            ttl_secs: env_or("LEADER_TTL_SEC", "10").parse().unwrap_or(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_url_shape() {
        let cfg = PostgresConfig {
            host: "db".into(),
            port: "5433".into(),
            user: "u".into(),
            password: "p".into(),
            dbname: "jobs".into(),
        };
        assert_eq!(cfg.url(), "postgres://u:p@db:5433/jobs");
    }

    #[test]
    fn redis_url_with_and_without_password() {
        let mut cfg = RedisConfig {
            addr: "cache:6379".into(),
            password: String::new(),
            db: 0,
        };
        assert_eq!(cfg.url(), "redis://cache:6379/0");
        cfg.password = "s3cret".into();
        assert_eq!(cfg.url(), "redis://:s3cret@cache:6379/0");
    }
}
