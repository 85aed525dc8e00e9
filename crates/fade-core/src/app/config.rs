//! Sweeper configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ConfigError は設定の読み込み・検証エラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// SweeperConfig は sweeper のタイミング設定（単位はすべてミリ秒）
///
/// JSON に無いフィールドは [`SweeperConfig::default_v1`] の値になる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// sweep 間の最長 sleep。期限待ちが無いときと、sweep 失敗後の再試行に使う
    pub fallback_interval_ms: u64,

    /// sweep 間の最短 sleep
    pub min_interval_ms: u64,

    /// 次の期限ちょうどではなく少し後に起きるための余裕
    pub wake_epsilon_ms: u64,

    /// ループ起動時に開始失敗のメッセージを修復する
    pub repair_on_start: bool,
}

impl SweeperConfig {
    /// デフォルト: fallback 5 分、最短 1 秒、epsilon 100 ms、起動時修復あり
    pub fn default_v1() -> Self {
        Self {
            fallback_interval_ms: 5 * 60 * 1000,
            min_interval_ms: 1000,
            wake_epsilon_ms: 100,
            repair_on_start: true,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fallback_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "fallback_interval_ms must be positive".to_string(),
            ));
        }
        if self.min_interval_ms > self.fallback_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "min_interval_ms ({}) exceeds fallback_interval_ms ({})",
                self.min_interval_ms, self.fallback_interval_ms
            )));
        }
        Ok(())
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::default_v1()
    }
}
