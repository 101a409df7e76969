#![forbid(unsafe_code)]

//! `nodewatch.toml`, overlaid with `NW_*` environment variables and then CLI
//! flags.
//!
//! ```toml
//! log_file = "/var/log/nodewatch.log"
//!
//! [scheduler]
//! users = ["alice", "bob"]
//! partitions = ["compute"]
//!
//! [store]
//! storage_dir = "/var/lib/nodewatch"
//!
//! [monitor]
//! agent_script = "/opt/nodewatch/node_monitor.py"
//!
//! [collection]
//! dir = "/scratch/nodewatch/logs"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "nodewatch.toml";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) log_file: Option<PathBuf>,
    #[serde(default)]
    pub(crate) scheduler: SchedulerConfig,
    #[serde(default)]
    pub(crate) store: StoreConfig,
    #[serde(default)]
    pub(crate) monitor: MonitorConfig,
    #[serde(default)]
    pub(crate) collection: CollectionConfig,
    #[serde(default)]
    pub(crate) reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SchedulerConfig {
    #[serde(default)]
    pub(crate) users: Vec<String>,
    #[serde(default)]
    pub(crate) partitions: Vec<String>,
    #[serde(default = "default_squeue_bin")]
    pub(crate) squeue_bin: String,
    #[serde(default)]
    pub(crate) sudo: bool,
    #[serde(default = "default_scheduler_timeout_s")]
    pub(crate) timeout_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StoreConfig {
    #[serde(default = "default_storage_dir")]
    pub(crate) storage_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MonitorConfig {
    /// Local copy of the agent pushed to every node.
    #[serde(default = "default_agent_script")]
    pub(crate) agent_script: PathBuf,
    #[serde(default = "default_remote_dir")]
    pub(crate) remote_dir: String,
    #[serde(default = "default_sample_interval_s")]
    pub(crate) sample_interval_s: u64,
    /// Login for ssh/scp/rsync. Unset means the ssh client default.
    #[serde(default)]
    pub(crate) remote_user: Option<String>,
    #[serde(default = "default_ssh_bin")]
    pub(crate) ssh_bin: String,
    #[serde(default = "default_scp_bin")]
    pub(crate) scp_bin: String,
    #[serde(default = "default_rsync_bin")]
    pub(crate) rsync_bin: String,
    #[serde(default = "default_artifact_prefix")]
    pub(crate) artifact_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CollectionConfig {
    #[serde(default = "default_collection_dir")]
    pub(crate) dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ReconcileConfig {
    #[serde(default = "default_node_index_width")]
    pub(crate) node_index_width: usize,
    #[serde(default = "default_command_timeout_s")]
    pub(crate) command_timeout_s: u64,
    /// Max hosts actuated in parallel for one job.
    #[serde(default = "default_fanout")]
    pub(crate) fanout: usize,
    /// Advance a job only when every host acknowledged the command.
    #[serde(default)]
    pub(crate) strict_actuation: bool,
    #[serde(default = "default_anon_salt")]
    pub(crate) anon_salt: String,
    #[serde(default = "default_lock_stale_after_s")]
    pub(crate) lock_stale_after_s: u64,
}

fn default_squeue_bin() -> String {
    "squeue".to_string()
}

fn default_scheduler_timeout_s() -> u64 {
    60
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/nodewatch")
}

fn default_agent_script() -> PathBuf {
    PathBuf::from("node_monitor.py")
}

fn default_remote_dir() -> String {
    "/tmp".to_string()
}

fn default_sample_interval_s() -> u64 {
    120
}

fn default_ssh_bin() -> String {
    "ssh".to_string()
}

fn default_scp_bin() -> String {
    "scp".to_string()
}

fn default_rsync_bin() -> String {
    "rsync".to_string()
}

fn default_artifact_prefix() -> String {
    "pfmon".to_string()
}

fn default_collection_dir() -> PathBuf {
    PathBuf::from("/tmp/nodewatch_logs")
}

fn default_node_index_width() -> usize {
    nw_core::DEFAULT_INDEX_WIDTH
}

fn default_command_timeout_s() -> u64 {
    120
}

fn default_fanout() -> usize {
    8
}

fn default_anon_salt() -> String {
    "nodewatch".to_string()
}

fn default_lock_stale_after_s() -> u64 {
    6 * 60 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            partitions: Vec::new(),
            squeue_bin: default_squeue_bin(),
            sudo: false,
            timeout_s: default_scheduler_timeout_s(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            agent_script: default_agent_script(),
            remote_dir: default_remote_dir(),
            sample_interval_s: default_sample_interval_s(),
            remote_user: None,
            ssh_bin: default_ssh_bin(),
            scp_bin: default_scp_bin(),
            rsync_bin: default_rsync_bin(),
            artifact_prefix: default_artifact_prefix(),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            dir: default_collection_dir(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            node_index_width: default_node_index_width(),
            command_timeout_s: default_command_timeout_s(),
            fanout: default_fanout(),
            strict_actuation: false,
            anon_salt: default_anon_salt(),
            lock_stale_after_s: default_lock_stale_after_s(),
        }
    }
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub(crate) fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads `explicit`, or `nodewatch.toml` in the working directory when it
    /// exists. Without either, every setting starts from its default.
    pub(crate) fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.is_file() {
                    return Ok(Config::default());
                }
                fallback
            }
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&text, &path)
    }

    pub(crate) fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("NW_STORAGE_DIR") {
            self.store.storage_dir = PathBuf::from(dir);
        }
        if let Some(users) = lookup("NW_USERS") {
            self.scheduler.users = split_list(&users);
        }
        if let Some(partitions) = lookup("NW_PARTITIONS") {
            self.scheduler.partitions = split_list(&partitions);
        }
        if let Some(dir) = lookup("NW_COLLECTION_DIR") {
            self.collection.dir = PathBuf::from(dir);
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.scheduler.users.is_empty() {
            return invalid("scheduler.users must name at least one user");
        }
        if self
            .scheduler
            .users
            .iter()
            .chain(&self.scheduler.partitions)
            .any(|v| v.trim().is_empty())
        {
            return invalid("scheduler.users/partitions entries must not be empty");
        }
        if self
            .scheduler
            .users
            .iter()
            .chain(&self.scheduler.partitions)
            .any(|v| v.contains(char::is_whitespace) || v.contains(','))
        {
            return invalid("scheduler.users/partitions entries must be single names");
        }
        if self.scheduler.squeue_bin.trim().is_empty() {
            return invalid("scheduler.squeue_bin must not be empty");
        }
        if self.scheduler.timeout_s == 0 {
            return invalid("scheduler.timeout_s must be > 0");
        }
        if self.monitor.sample_interval_s == 0 {
            return invalid("monitor.sample_interval_s must be > 0");
        }
        if self.monitor.remote_dir.trim().is_empty() {
            return invalid("monitor.remote_dir must not be empty");
        }
        if self.monitor.artifact_prefix.trim().is_empty() {
            return invalid("monitor.artifact_prefix must not be empty");
        }
        if self.reconcile.node_index_width == 0 {
            return invalid("reconcile.node_index_width must be > 0");
        }
        if self.reconcile.command_timeout_s == 0 {
            return invalid("reconcile.command_timeout_s must be > 0");
        }
        if self.reconcile.fanout == 0 {
            return invalid("reconcile.fanout must be > 0");
        }
        if self.reconcile.anon_salt.is_empty() {
            return invalid("reconcile.anon_salt must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(text: &str) -> Config {
        Config::from_toml_str(text, Path::new("test.toml")).expect("parse config")
    }

    #[test]
    fn defaults_fill_omitted_sections() {
        let cfg = parse(
            r#"
            [scheduler]
            users = ["alice"]
            "#,
        );
        assert_eq!(cfg.scheduler.squeue_bin, "squeue");
        assert_eq!(cfg.scheduler.timeout_s, 60);
        assert_eq!(cfg.monitor.remote_dir, "/tmp");
        assert_eq!(cfg.monitor.sample_interval_s, 120);
        assert_eq!(cfg.monitor.artifact_prefix, "pfmon");
        assert_eq!(cfg.reconcile.node_index_width, 5);
        assert_eq!(cfg.reconcile.fanout, 8);
        assert!(!cfg.reconcile.strict_actuation);
        assert!(cfg.log_file.is_none());
        cfg.validate().expect("valid");
    }

    #[test]
    fn full_file_parses() {
        let cfg = parse(
            r#"
            log_file = "/var/log/nodewatch.log"

            [scheduler]
            users = ["alice", "bob"]
            partitions = ["compute", "gpu"]
            sudo = true

            [store]
            storage_dir = "/srv/nw"

            [monitor]
            agent_script = "/opt/nw/node_monitor.py"
            remote_user = "root"
            sample_interval_s = 30

            [collection]
            dir = "/scratch/logs"

            [reconcile]
            node_index_width = 4
            strict_actuation = true
            "#,
        );
        assert_eq!(cfg.scheduler.users, vec!["alice", "bob"]);
        assert!(cfg.scheduler.sudo);
        assert_eq!(cfg.store.storage_dir, PathBuf::from("/srv/nw"));
        assert_eq!(cfg.monitor.remote_user.as_deref(), Some("root"));
        assert_eq!(cfg.collection.dir, PathBuf::from("/scratch/logs"));
        assert_eq!(cfg.reconcile.node_index_width, 4);
        assert!(cfg.reconcile.strict_actuation);
        assert_eq!(cfg.log_file, Some(PathBuf::from("/var/log/nodewatch.log")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("[scheduler]\nuser = [\"a\"]\n", Path::new("x.toml"))
            .expect_err("typo must fail");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = parse("[scheduler]\nusers = [\"alice\"]\n");
        let env = HashMap::from([
            ("NW_USERS", "carol, dave"),
            ("NW_PARTITIONS", "debug"),
            ("NW_STORAGE_DIR", "/data/nw"),
        ]);
        cfg.apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(cfg.scheduler.users, vec!["carol", "dave"]);
        assert_eq!(cfg.scheduler.partitions, vec!["debug"]);
        assert_eq!(cfg.store.storage_dir, PathBuf::from("/data/nw"));
        assert_eq!(cfg.collection.dir, default_collection_dir());
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = parse("[scheduler]\nusers = [\"alice\"]\n");
        cfg.reconcile.fanout = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = parse("[scheduler]\nusers = [\"alice\"]\n");
        cfg.reconcile.node_index_width = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = parse("[scheduler]\nusers = [\"alice\"]\n");
        cfg.reconcile.command_timeout_s = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = parse("[scheduler]\nusers = [\"al ice\"]\n");
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.scheduler.users = vec!["alice".to_string()];
        cfg.validate().expect("valid again");
    }

    #[test]
    fn blank_user_or_partition_entries_are_rejected() {
        let cfg = parse("[scheduler]\nusers = [\"\", \"alice\"]\n");
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let cfg = parse("[scheduler]\nusers = [\"alice\"]\npartitions = [\"gpu\", \"\"]\n");
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let cfg = parse("[scheduler]\nusers = [\"alice\", \"bob\"]\npartitions = [\"gpu\"]\n");
        cfg.validate().expect("valid");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let missing = std::env::temp_dir().join(format!(
            "nw_runner_missing_{}_{}.toml",
            std::process::id(),
            crate::now_ms()
        ));
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }
}
