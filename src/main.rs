use anyhow::{Context, Result};
use cancap::{
    CaptureConfig, CaptureSession, ConnectionState, TestDataConfig, TestDataGenerator,
    performance::install_prometheus,
};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 通过MQTT捕获CAN/CANopen总线流量
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON配置文件
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// MQTT代理地址
    #[clap(long)]
    host: Option<String>,

    /// MQTT代理端口
    #[clap(long)]
    port: Option<u16>,

    /// 总线主题
    #[clap(short, long)]
    topic: Option<String>,

    /// 用户名
    #[clap(long)]
    user: Option<String>,

    /// 每个标识符只保留最新一帧
    #[clap(long)]
    overwrite: bool,

    /// 使用主机墙钟作为时间戳
    #[clap(long)]
    host_clock: bool,

    /// 启动时合并的过滤文件
    #[clap(long, value_parser)]
    filter_file: Option<PathBuf>,

    /// 退出时写出过滤文件
    #[clap(long, value_parser)]
    save_filters: Option<PathBuf>,

    /// 日志级别（RUST_LOG优先）
    #[clap(long)]
    log_level: Option<String>,

    /// 统计输出间隔（秒）
    #[clap(long)]
    stats_interval: Option<u64>,

    /// 不连接代理，注入N帧合成流量
    #[clap(long)]
    simulate: Option<usize>,
}

fn load_config(args: &Args) -> Result<CaptureConfig> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::from_file(path)
            .with_context(|| format!("无法加载配置文件 {:?}", path))?,
        None => CaptureConfig::default(),
    };

    if let Some(host) = &args.host {
        config.mqtt.host = host.clone();
    }
    if let Some(port) = args.port {
        config.mqtt.port = port;
    }
    if let Some(topic) = &args.topic {
        config.mqtt.topic = topic.clone();
    }
    if let Some(user) = &args.user {
        config.mqtt.user = user.clone();
    }
    if args.overwrite {
        config.store.overwrite_mode = true;
    }
    if args.host_clock {
        config.store.use_host_clock = true;
    }
    if args.filter_file.is_some() {
        config.filter_file = args.filter_file.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval_secs = interval;
    }

    config.validate().context("配置无效")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // 初始化日志系统
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 启动CAN捕获引擎");
    info!("📊 捕获配置:");
    info!("   - 代理: {}:{}", config.mqtt.host, config.mqtt.port);
    info!("   - 主题: {}", config.mqtt.topic);
    info!("   - 覆盖模式: {}", config.store.overwrite_mode);
    info!("   - 主机时钟: {}", config.store.use_host_clock);

    install_prometheus(&config.metrics)?;

    let session = CaptureSession::from_config(&config).context("无法创建捕获会话")?;
    let start_time = Instant::now();

    // 连接状态变化
    let mut status_rx = session.transport().subscribe_status();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if status.state == ConnectionState::Disconnected {
                if let Some(reason) = status.diagnostic {
                    warn!("⚠️  连接断开: {}", reason);
                }
            }
        }
    });

    match args.simulate {
        Some(count) => {
            info!("🧪 模拟模式: 注入 {} 帧合成流量", count);
            session.spawn_pump();
            let mut generator = TestDataGenerator::new(TestDataConfig::default());
            let transport = session.transport();
            for (topic, payload) in generator.generate_wire_messages(&config.mqtt.topic, count) {
                transport.on_message_received(&topic, &payload);
                if transport.queue().len() * 2 >= transport.queue().capacity() {
                    tokio::task::yield_now().await;
                }
            }
        }
        None => {
            if let Err(e) = session.start().await {
                error!("❌ 连接失败: {}", e);
                status_task.abort();
                return Err(e.into());
            }
        }
    }

    // 定期统计
    let stats_task = if config.stats_interval_secs > 0 {
        let store = session.store().clone();
        let period = Duration::from_secs(config.stats_interval_secs);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                store.refresh_if_needed();
                store.stats().print_summary();
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("无法监听退出信号")?;
    info!("🛑 收到退出信号");

    if let Some(task) = stats_task {
        task.abort();
    }
    session.stop().await?;
    status_task.abort();

    if let Some(path) = &args.save_filters {
        session
            .store()
            .save_filter_file(path)
            .with_context(|| format!("无法写出过滤文件 {:?}", path))?;
        info!("💾 过滤文件已保存: {:?}", path);
    }

    session.store().refresh_if_needed();
    session.stats().print_summary();
    info!("⏱️ 运行时间: {:.2}秒", start_time.elapsed().as_secs_f64());
    info!("🏁 程序执行完成");
    Ok(())
}
