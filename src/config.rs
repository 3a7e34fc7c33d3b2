use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Lead time announced before a round starts, resumes or the game pauses
    pub countdown: Duration,
    /// How long a closed connection may stay away before its user reads offline
    pub offline_grace: Duration,
    /// Usernames created in the in-memory store at boot
    pub seed_users: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            countdown: Duration::from_secs(5),
            offline_grace: Duration::from_secs(5),
            seed_users: Vec::new(),
        }
    }
}

fn secs_from_env(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}, using {:?}", name, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = match std::env::var("BIND_ADDR") {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "Ignoring invalid BIND_ADDR={:?}, using {}",
                    raw,
                    defaults.bind_addr
                );
                defaults.bind_addr
            }),
            Err(_) => defaults.bind_addr,
        };

        let seed_users = std::env::var("SEED_USERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_addr,
            countdown: secs_from_env("COUNTDOWN_SECS", defaults.countdown),
            offline_grace: secs_from_env("OFFLINE_GRACE_SECS", defaults.offline_grace),
            seed_users,
        }
    }
}
