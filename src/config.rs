//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TWINRT__*` 覆盖（双下划线表示嵌套，如 `TWINRT__AGENTS__ASK_TIMEOUT_MS=500`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// [agents] 段：ask / spawn / stop 超时、scratch 根目录、行为并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_ask_timeout_ms")]
    pub ask_timeout_ms: u64,
    /// 子 Agent 初始化并回传引用的时限
    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    /// 停止时等待每个子 Agent 结束的时限
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// scratch 目录的父目录，未设置时用系统临时目录
    pub scratch_root: Option<PathBuf>,
    /// 同一 Agent 上同时运行的行为数上限
    #[serde(default = "default_max_concurrent_behaviors")]
    pub max_concurrent_behaviors: usize,
}

fn default_ask_timeout_ms() -> u64 {
    2000
}

fn default_spawn_timeout_ms() -> u64 {
    2000
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_max_concurrent_behaviors() -> usize {
    4
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            ask_timeout_ms: default_ask_timeout_ms(),
            spawn_timeout_ms: default_spawn_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            scratch_root: None,
            max_concurrent_behaviors: default_max_concurrent_behaviors(),
        }
    }
}

impl AgentsSection {
    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// [scheduler] 段：派生观测（"change in X"）的开关与深度上限
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_derivation_depth")]
    pub max_derivation_depth: u32,
    #[serde(default = "default_derive_change_observables")]
    pub derive_change_observables: bool,
}

fn default_max_derivation_depth() -> u32 {
    1
}

fn default_derive_change_observables() -> bool {
    true
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_derivation_depth: default_max_derivation_depth(),
            derive_change_observables: default_derive_change_observables(),
        }
    }
}

/// [logging] 段：默认日志过滤指令（RUST_LOG 优先）
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TWINRT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TWINRT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TWINRT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；已运行的 Agent 不受影响，新 spawn 的 Agent 使用新值
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
