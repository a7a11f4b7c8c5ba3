//! Configuration management for Ransomguard

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the protected directory tree
    #[serde(default = "default_protected")]
    pub protected: PathBuf,

    /// Paths/patterns to exclude from monitoring and backup
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Detection thresholds
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Event queue sizing and backpressure
    #[serde(default)]
    pub queue: QueueConfig,

    /// Containment actuator settings
    #[serde(default)]
    pub containment: ContainmentConfig,

    /// Backup and keystore locations
    #[serde(default)]
    pub backup: BackupConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protected: default_protected(),
            exclude: vec![
                "*.log".to_string(),
                "*.tmp".to_string(),
                "*.swp".to_string(),
            ],
            detection: DetectionConfig::default(),
            queue: QueueConfig::default(),
            containment: ContainmentConfig::default(),
            backup: BackupConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check if a path should be excluded from monitoring and backup
    pub fn is_excluded(&self, path: &Path) -> bool {
        for pattern in &self.exclude {
            if let Ok(glob) = globset::Glob::new(pattern) {
                if glob.compile_matcher().is_match(path) {
                    return true;
                }
            }
        }
        false
    }
}

/// Detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Bytes to probe at the head of a modified file
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: usize,

    /// Magic-byte prefixes (hex) that flag encrypted/archive containers.
    /// The zip signature is a deliberately weak signal, kept alongside the
    /// burst heuristic rather than trusted on its own.
    #[serde(default = "default_magic_prefixes")]
    pub magic_prefixes: Vec<String>,

    /// Writes per path within the burst window before flagging
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Burst window length in seconds
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,

    /// CPU percentage a process must sustain across consecutive samples
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f32,

    /// Process-name substrings that escalate a resource alert
    #[serde(default = "default_suspicious_names")]
    pub suspicious_names: Vec<String>,

    /// Debounce window for alert deduplication, in seconds
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Interval between resource samples, in seconds
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            probe_bytes: default_probe_bytes(),
            magic_prefixes: default_magic_prefixes(),
            burst_limit: default_burst_limit(),
            burst_window_secs: default_burst_window_secs(),
            cpu_threshold: default_cpu_threshold(),
            suspicious_names: default_suspicious_names(),
            debounce_secs: default_debounce_secs(),
            sample_interval_secs: default_sample_interval_secs(),
        }
    }
}

impl DetectionConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }
}

/// Event queue sizing and backpressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bounded event queue capacity
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// How long the monitor blocks on a full queue before dropping, in ms
    #[serde(default = "default_enqueue_wait_ms")]
    pub enqueue_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            enqueue_wait_ms: default_enqueue_wait_ms(),
        }
    }
}

impl QueueConfig {
    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }
}

/// Containment actuator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainmentConfig {
    /// Retry budget per containment action
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between retries, in ms (doubles per attempt)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Grace period between SIGTERM and SIGKILL, in ms
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Host firewall command template; "{rule}" expands to the rule name.
    /// Platform-specific and external to the core design.
    #[serde(default = "default_firewall_cmd")]
    pub firewall_cmd: Vec<String>,
}

impl Default for ContainmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            firewall_cmd: default_firewall_cmd(),
        }
    }
}

impl ContainmentConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Backup and keystore locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding one subdirectory per backup
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    /// Directory holding key material
    #[serde(default = "default_keystore_dir")]
    pub keystore_dir: PathBuf,

    /// Bounded retries for transient per-file read failures
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            keystore_dir: default_keystore_dir(),
            read_retries: default_read_retries(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// PID file path
    #[serde(default = "default_pid_path")]
    pub pid_file: PathBuf,

    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,

    /// Log file path
    #[serde(default = "default_log_path")]
    pub log_file: PathBuf,

    /// Append-only incident/alert audit log
    #[serde(default = "default_audit_path")]
    pub audit_log: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_path(),
            socket: default_socket_path(),
            log_file: default_log_path(),
            audit_log: default_audit_path(),
        }
    }
}

// Default value functions for serde

fn default_protected() -> PathBuf {
    PathBuf::from("/home")
}

fn default_probe_bytes() -> usize {
    16
}

fn default_magic_prefixes() -> Vec<String> {
    vec![
        "504b0304".to_string(),         // zip (weak: legitimate archives too)
        "1f8b".to_string(),             // gzip
        "425a68".to_string(),           // bzip2
        "fd377a585a00".to_string(),     // xz
        "377abcaf271c".to_string(),     // 7z
        "526172211a07".to_string(),     // rar
        "53616c7465645f5f".to_string(), // openssl "Salted__"
    ]
}

fn default_burst_limit() -> u32 {
    10
}

fn default_burst_window_secs() -> u64 {
    10
}

fn default_cpu_threshold() -> f32 {
    80.0
}

fn default_suspicious_names() -> Vec<String> {
    vec!["suspicious".to_string()]
}

fn default_debounce_secs() -> u64 {
    5
}

fn default_sample_interval_secs() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_enqueue_wait_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_kill_grace_ms() -> u64 {
    500
}

fn default_firewall_cmd() -> Vec<String> {
    vec![
        "iptables".to_string(),
        "-I".to_string(),
        "OUTPUT".to_string(),
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        "{rule}".to_string(),
        "-j".to_string(),
        "DROP".to_string(),
    ]
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/ransomguard/backups")
}

fn default_keystore_dir() -> PathBuf {
    PathBuf::from("/var/lib/ransomguard/keys")
}

fn default_read_retries() -> u32 {
    2
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("/run/ransomguard.pid")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/ransomguard.sock")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/ransomguard.log")
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("/var/lib/ransomguard/incidents.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.detection.burst_limit > 0);
        assert!(config.detection.cpu_threshold > 0.0);
        assert!(config.queue.capacity > 0);
        assert_eq!(config.containment.max_attempts, 3);
    }

    #[test]
    fn test_is_excluded() {
        let config = Config::default();
        assert!(config.is_excluded(Path::new("/home/user/app.log")));
        assert!(config.is_excluded(Path::new("/home/user/scratch.tmp")));
        assert!(!config.is_excluded(Path::new("/home/user/document.pdf")));
    }

    #[test]
    fn test_magic_prefixes_decode() {
        let config = Config::default();
        for prefix in &config.detection.magic_prefixes {
            assert!(hex::decode(prefix).is_ok(), "bad prefix {prefix}");
        }
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.detection.burst_limit, config.detection.burst_limit);
        assert_eq!(parsed.backup.dir, config.backup.dir);
    }
}
