//! # 配置 (Configuration)
//!
//! 捕获会话的全部可调参数，JSON格式，缺省字段取默认值。
//! 配置在构造时一次性读入，运行期间不再变化。
//!
//! ```json
//! {
//!   "mqtt": { "host": "api.savvycan.com", "port": 8333, "topic": "can0" },
//!   "store": { "overwrite_mode": true },
//!   "pump_interval_ms": 20
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CaptureError, Result};
use crate::frame_store::StoreConfig;
use crate::mqtt_bus::MqttBusConfig;
use crate::performance::PerformanceConfig;

/// 捕获会话配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub mqtt: MqttBusConfig,
    pub store: StoreConfig,
    pub metrics: PerformanceConfig,
    /// 队列泵送间隔（毫秒）
    pub pump_interval_ms: u64,
    /// 统计输出间隔（秒），0表示不输出
    pub stats_interval_secs: u64,
    /// 日志级别
    pub log_level: String,
    /// 启动时合并的过滤文件
    pub filter_file: Option<PathBuf>,
    /// 提供报文名标签的DBC文件
    pub dbc_file: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttBusConfig::default(),
            store: StoreConfig::default(),
            metrics: PerformanceConfig::default(),
            pump_interval_ms: 20,
            stats_interval_secs: 30,
            log_level: "info".to_string(),
            filter_file: None,
            dbc_file: None,
        }
    }
}

impl CaptureConfig {
    /// 从JSON文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!("📋 配置已加载: {:?}", path.as_ref());
        Ok(config)
    }

    /// 写出为JSON文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(CaptureError::Config("代理地址不能为空".to_string()));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(CaptureError::Config("主题不能为空".to_string()));
        }
        if self.mqtt.topic.contains(|c: char| c == '+' || c == '#') {
            return Err(CaptureError::Config(format!(
                "主题不能包含通配符: {}",
                self.mqtt.topic
            )));
        }
        if self.mqtt.queue_capacity == 0 {
            return Err(CaptureError::Config("队列容量必须大于0".to_string()));
        }
        if self.mqtt.client_id_len == 0 {
            return Err(CaptureError::Config("客户端ID长度必须大于0".to_string()));
        }
        if self.pump_interval_ms == 0 {
            return Err(CaptureError::Config("泵送间隔必须大于0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.mqtt.host, "api.savvycan.com");
        assert_eq!(config.mqtt.port, 8333);
        assert_eq!(config.mqtt.user, "Anonymous");
        assert_eq!(config.mqtt.queue_capacity, 4000);
        assert_eq!(config.mqtt.client_id_len, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(
            &path,
            r#"{ "mqtt": { "topic": "bench", "port": 1883 }, "store": { "overwrite_mode": true } }"#,
        )
        .unwrap();

        let config = CaptureConfig::from_file(&path).unwrap();
        assert_eq!(config.mqtt.topic, "bench");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.host, "api.savvycan.com");
        assert!(config.store.overwrite_mode);
        assert_eq!(config.pump_interval_ms, 20);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capture.json");
        let mut config = CaptureConfig::default();
        config.store.use_host_clock = true;
        config.filter_file = Some(PathBuf::from("filters.txt"));
        config.save(&path).unwrap();

        let loaded = CaptureConfig::from_file(&path).unwrap();
        assert!(loaded.store.use_host_clock);
        assert_eq!(loaded.filter_file, Some(PathBuf::from("filters.txt")));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = CaptureConfig::default();
        config.mqtt.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(CaptureError::Config(_))));

        let mut config = CaptureConfig::default();
        config.mqtt.topic = "can0/#".to_string();
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.pump_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CaptureConfig::from_file(&path),
            Err(CaptureError::Json(_))
        ));
    }
}
