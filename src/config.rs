use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub upstreams: UpstreamConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Trusted DNS-over-TLS upstream, `host:port`
    #[serde(default = "default_tls_dns")]
    pub tls_dns: String,
    /// Ordinary local/ISP resolver, `ip:port`
    #[serde(default = "default_local_dns")]
    pub local_dns: String,
    /// Decoy resolver probed during detection, `ip:port`
    #[serde(default = "default_honeypot_dns")]
    pub honeypot_dns: String,
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    #[serde(default = "default_tls_dial_timeout_secs")]
    pub tls_dial_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    /// Probe attempts before a hostname is fail-closed to polluted
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Hard bound on CNAME chain descent
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,
    #[serde(default = "default_verdict_ttl")]
    pub verdict_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_persist_path")]
    pub path: String,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: default_listen_port(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            tls_dns: default_tls_dns(),
            local_dns: default_local_dns(),
            honeypot_dns: default_honeypot_dns(),
            exchange_timeout_ms: default_exchange_timeout_ms(),
            tls_dial_timeout_secs: default_tls_dial_timeout_secs(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            max_chain_depth: default_max_chain_depth(),
            verdict_ttl_secs: default_verdict_ttl(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_persist_path(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_web_address(),
            port: default_web_port(),
        }
    }
}

// Default value functions
fn default_listen_address() -> String { "0.0.0.0".to_string() }
fn default_listen_port() -> u16 { 1053 }
fn default_tls_dns() -> String { "dns.quad9.net:853".to_string() }
fn default_local_dns() -> String { "119.29.29.29:53".to_string() }
fn default_honeypot_dns() -> String { "198.11.138.248:53".to_string() }
fn default_exchange_timeout_ms() -> u64 { 3000 }
fn default_tls_dial_timeout_secs() -> u64 { 5 }
fn default_retry_limit() -> u32 { 3 }
fn default_max_chain_depth() -> u32 { 10 }
fn default_verdict_ttl() -> u64 { 3600 }
fn default_cache_capacity() -> usize { 1024 }
fn default_true() -> bool { true }
fn default_persist_path() -> String { "detox-cache.json".to_string() }
fn default_sweep_interval() -> u64 { 300 }
fn default_web_address() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8080 }

impl Config {
    /// Load from a TOML file (missing file means full defaults), then apply
    /// environment overrides for the three upstream endpoints.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
            toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TLS_DNS") {
            if !v.is_empty() {
                self.upstreams.tls_dns = v;
            }
        }
        if let Ok(v) = std::env::var("LOCAL_DNS") {
            if !v.is_empty() {
                self.upstreams.local_dns = v;
            }
        }
        if let Ok(v) = std::env::var("HONEYPOT_DNS") {
            if !v.is_empty() {
                self.upstreams.honeypot_dns = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // Loading reads process-global env vars; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_missing_file_gives_defaults() {
        let _guard = ENV_LOCK.lock();
        let config = Config::load("/nonexistent/detox-dns.toml").unwrap();
        assert_eq!(config.listen.port, 1053);
        assert_eq!(config.detection.retry_limit, 3);
        assert_eq!(config.detection.cache_capacity, 1024);
        assert_eq!(config.upstreams.local_dns, "119.29.29.29:53");
        assert!(config.persist.enabled);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let _guard = ENV_LOCK.lock();
        let dir = std::env::temp_dir().join("detox-dns-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.toml");
        std::fs::write(
            &path,
            "[detection]\nretry_limit = 5\n\n[listen]\nport = 5353\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.detection.retry_limit, 5);
        assert_eq!(config.listen.port, 5353);
        // Untouched sections keep defaults
        assert_eq!(config.detection.max_chain_depth, 10);
        assert_eq!(config.upstreams.honeypot_dns, "198.11.138.248:53");
    }

    #[test]
    fn test_env_overrides_endpoints() {
        let _guard = ENV_LOCK.lock();
        std::env::set_var("TLS_DNS", "dot.example.net:853");
        std::env::set_var("LOCAL_DNS", "10.0.0.1:53");
        std::env::set_var("HONEYPOT_DNS", "10.0.0.2:53");

        let config = Config::load("/nonexistent/detox-dns.toml").unwrap();

        std::env::remove_var("TLS_DNS");
        std::env::remove_var("LOCAL_DNS");
        std::env::remove_var("HONEYPOT_DNS");

        assert_eq!(config.upstreams.tls_dns, "dot.example.net:853");
        assert_eq!(config.upstreams.local_dns, "10.0.0.1:53");
        assert_eq!(config.upstreams.honeypot_dns, "10.0.0.2:53");
    }
}
