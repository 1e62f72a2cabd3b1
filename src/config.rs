use std::time::Duration;

pub const TOPOLOGY_FILE: &str = "restcoder.yaml";
pub const PROCFILE: &str = "Procfile";
pub const ENV_FILE: &str = ".env";

/// Process type published on the base port (directly or through the proxy).
pub const FRONTED_PROCESS: &str = "web";

pub const DEFAULT_BASE_PORT: u16 = 5000;
// Every non-fronted process type gets its own block of ports, so an instance
// count must stay below the stride.
pub const PORT_BLOCK_STRIDE: u32 = 100;

pub const UPSTREAM_HOST: &str = "localhost";
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_SHELL: &str = "/bin/sh";

pub const GRACE_PERIOD_ENV: &str = "RESTCODER_GRACE_PERIOD_SEC";
pub const LOG_ENV: &str = "RESTCODER_LOG";

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const MAX_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Grace period between the termination signal and the forced kill.
///
/// `RESTCODER_GRACE_PERIOD_SEC` overrides the default; unparsable values are
/// ignored and values above [`MAX_GRACE_PERIOD`] are clamped so shutdown stays
/// bounded.
pub fn grace_period_from_env() -> Duration {
    std::env::var(GRACE_PERIOD_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(grace_period_from_secs)
        .unwrap_or(DEFAULT_GRACE_PERIOD)
}

/// Operator-supplied grace period, clamped to [`MAX_GRACE_PERIOD`].
pub fn grace_period_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs).min(MAX_GRACE_PERIOD)
}
