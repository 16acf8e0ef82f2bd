//! Environment-driven configuration (generalizes the teacher's bare
//! `IP`/`PORT`/`DB_STRING` constants into a proper config surface, still
//! env-var driven rather than a config-file parser).

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Err(_) => default,
        Ok(v) => !matches!(
            v.to_lowercase().as_str(),
            "no" | "n" | "false" | "off" | "0"
        ),
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ip: String,
    pub port: u16,
    pub db_url: String,

    pub default_kernel_name: String,

    pub cull_interval: Duration,
    pub cull_idle_timeout: Duration,
    pub cull_busy: bool,
    pub cull_connected: bool,

    pub restart_limit: u32,
    pub time_to_dead: Duration,
    pub stable_start_time: Duration,

    pub kernel_info_timeout: Duration,
    pub use_pending_kernels: bool,
    pub allow_tracebacks: bool,

    /// §4.5 inbound routing: `msg_type`s a client is allowed to send; empty
    /// means allow all.
    pub allowed_msg_types: Vec<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            ip: env::var("ZASPER_IP").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("ZASPER_PORT", 12397),
            db_url: env::var("ZASPER_DB").unwrap_or_else(|_| "sqlite:zasper.db?mode=rwc".to_string()),

            default_kernel_name: env::var("ZASPER_DEFAULT_KERNEL_NAME")
                .unwrap_or_else(|_| "python3".to_string()),

            cull_interval: Duration::from_secs(env_or("ZASPER_CULL_INTERVAL", 300)),
            cull_idle_timeout: Duration::from_secs(env_or("ZASPER_CULL_IDLE_TIMEOUT", 0)),
            cull_busy: env_bool("ZASPER_CULL_BUSY", false),
            cull_connected: env_bool("ZASPER_CULL_CONNECTED", false),

            restart_limit: env_or("ZASPER_RESTART_LIMIT", 5),
            time_to_dead: Duration::from_secs_f64(env_or("ZASPER_TIME_TO_DEAD", 3.0)),
            stable_start_time: Duration::from_secs_f64(env_or("ZASPER_STABLE_START_TIME", 10.0)),

            kernel_info_timeout: Duration::from_secs(env_or("ZASPER_KERNEL_INFO_TIMEOUT", 60)),
            use_pending_kernels: env_bool("ZASPER_USE_PENDING_KERNELS", true),
            allow_tracebacks: env_bool("ZASPER_ALLOW_TRACEBACKS", true),

            allowed_msg_types: env::var("ZASPER_ALLOWED_MSG_TYPES")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        }
    }

    /// Whether idle culling is enabled at all; a zero timeout disables it
    /// (§4.4 Idle culler).
    pub fn cull_enabled(&self) -> bool {
        !self.cull_idle_timeout.is_zero()
    }

    /// §4.5 inbound routing: empty allow-list means allow every `msg_type`.
    pub fn msg_type_allowed(&self, msg_type: &str) -> bool {
        self.allowed_msg_types.is_empty() || self.allowed_msg_types.iter().any(|t| t == msg_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_spec() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "ZASPER_PORT",
            "ZASPER_CULL_IDLE_TIMEOUT",
            "ZASPER_RESTART_LIMIT",
        ] {
            env::remove_var(key);
        }
        let settings = Settings::from_env();
        assert_eq!(settings.port, 12397);
        assert_eq!(settings.restart_limit, 5);
        assert!(!settings.cull_enabled());
    }

    #[test]
    fn idle_timeout_enables_culling() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("ZASPER_CULL_IDLE_TIMEOUT", "120");
        let settings = Settings::from_env();
        env::remove_var("ZASPER_CULL_IDLE_TIMEOUT");
        assert!(settings.cull_enabled());
        assert_eq!(settings.cull_idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("ZASPER_ALLOWED_MSG_TYPES");
        let settings = Settings::from_env();
        assert!(settings.msg_type_allowed("execute_request"));
        assert!(settings.msg_type_allowed("anything"));
    }

    #[test]
    fn nonempty_allowlist_restricts_msg_types() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("ZASPER_ALLOWED_MSG_TYPES", "execute_request, complete_request");
        let settings = Settings::from_env();
        env::remove_var("ZASPER_ALLOWED_MSG_TYPES");
        assert!(settings.msg_type_allowed("execute_request"));
        assert!(!settings.msg_type_allowed("shutdown_request"));
    }
}
