//! # 性能监测模块 (Performance Monitoring Module)
//!
//! 指标通过 `metrics` 门面上报，可选安装Prometheus导出器。
//!
//! ## 设计理念
//!
//! - **计数优先**：所有丢帧和解码失败都有对应的计数器，不以错误形式上报
//! - **低开销**：未安装导出器时 `metrics` 宏是空操作
//! - **单次安装**：导出器在进程内只安装一次

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

static PROMETHEUS_INSTALL_ONCE: Once = Once::new();

pub const QUEUE_DROPPED: &str = "cancap_queue_dropped_total";
pub const QUEUE_FLUSHED: &str = "cancap_queue_flushed_total";
pub const DECODE_ERRORS: &str = "cancap_decode_errors_total";
pub const FRAMES_RECEIVED: &str = "cancap_frames_received_total";
pub const FRAMES_SENT: &str = "cancap_frames_sent_total";
pub const STORE_FRAMES: &str = "cancap_store_frames";
pub const STORE_FILTERED_FRAMES: &str = "cancap_store_filtered_frames";
pub const PUMP_DURATION: &str = "cancap_pump_duration_seconds";

/// 指标导出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// 是否安装Prometheus导出器
    pub enabled: bool,
    /// 导出端口
    pub prometheus_port: u16,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prometheus_port: 9090,
        }
    }
}

/// 安装Prometheus导出器并登记指标说明
///
/// 进程内只有第一次调用会安装，之后的调用直接返回成功。
pub fn install_prometheus(config: &PerformanceConfig) -> anyhow::Result<()> {
    if !config.enabled {
        debug!("Prometheus导出未启用");
        return Ok(());
    }

    let mut install_result = Ok(());
    PROMETHEUS_INSTALL_ONCE.call_once(|| {
        install_result = install_exporter(config.prometheus_port);
    });
    install_result?;
    describe_metrics();
    Ok(())
}

fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(PUMP_DURATION.to_string()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1],
        )?
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
    info!("📈 Prometheus导出器已启动，端口: {}", port);
    Ok(())
}

/// 登记指标说明
pub fn describe_metrics() {
    describe_counter!(QUEUE_DROPPED, "交接队列满导致的丢帧数");
    describe_counter!(QUEUE_FLUSHED, "刷新时丢弃的帧数");
    describe_counter!(DECODE_ERRORS, "无法解码而丢弃的入站报文数");
    describe_counter!(FRAMES_RECEIVED, "成功进入交接队列的帧数");
    describe_counter!(FRAMES_SENT, "发送到总线的帧数");
    describe_gauge!(STORE_FRAMES, "帧存储当前帧数");
    describe_gauge!(STORE_FILTERED_FRAMES, "过滤视图当前帧数");
    describe_histogram!(PUMP_DURATION, "一次队列泵送的耗时");
}

/// 记录一次泵送耗时
pub fn record_pump_duration(duration: Duration) {
    histogram!(PUMP_DURATION).record(duration.as_secs_f64());
}
