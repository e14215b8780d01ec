#![allow(dead_code)]

use cancap::{
    CanFrame, CanTransport, CaptureSession, FrameStore, MqttBus, MqttBusConfig, StoreConfig,
    TestDataConfig, TestDataGenerator, WireMessage,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// 测试环境设置
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub store: Arc<FrameStore>,
    pub bus: Arc<MqttBus>,
    pub session: CaptureSession,
}

impl TestEnvironment {
    /// 创建新的测试环境（不连接代理）
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default(), 256)
    }

    pub fn with_config(store_config: StoreConfig, queue_capacity: usize) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FrameStore::new(store_config));
        let bus = Arc::new(MqttBus::new(MqttBusConfig {
            topic: "can0".to_string(),
            queue_capacity,
            ..MqttBusConfig::default()
        }));
        let transport: Arc<dyn CanTransport> = bus.clone();
        let session = CaptureSession::new(store.clone(), transport, Duration::from_millis(5));

        Self {
            temp_dir,
            store,
            bus,
            session,
        }
    }

    /// 模拟一条入站报文
    pub fn deliver(&self, id: u32, timestamp: u64, flags: u8, payload: &[u8]) {
        let bytes = WireMessage {
            timestamp,
            flags,
            payload,
        }
        .to_vec();
        self.bus.on_message_received(&format!("can0/{}", id), &bytes);
    }

    /// 注入合成流量
    pub fn deliver_generated(&self, count: usize) {
        let mut generator = TestDataGenerator::new(TestDataConfig::default());
        for (topic, payload) in generator.generate_wire_messages("can0", count) {
            self.bus.on_message_received(&topic, &payload);
        }
    }

    /// 写入临时文件
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

/// 测试帧构造
pub fn frame(id: u32, timestamp: u64, data: &[u8]) -> CanFrame {
    CanFrame::new(id, data).unwrap().with_timestamp(timestamp)
}

/// 标准DBC内容
pub const TEST_DBC: &str = r#"
VERSION ""

NS_ :
	NS_DESC_
	CM_
	BA_DEF_
	BA_
	VAL_
	CAT_DEF_
	CAT_
	FILTER
	BA_DEF_DEF_
	EV_DATA_
	ENVVAR_DATA_
	SGTYPE_
	SGTYPE_VAL_
	BA_DEF_SGTYPE_
	BA_SGTYPE_
	SIG_TYPE_REF_
	VAL_TABLE_
	SIG_GROUP_
	SIG_VALTYPE_
	SIGTYPE_VALTYPE_
	BO_TX_BU_
	BA_DEF_REL_
	BA_REL_
	BA_DEF_DEF_REL_
	BU_SG_REL_
	BU_EV_REL_
	BU_BO_REL_

BS_:

BU_: Vector__XXX

BO_ 385 DriveTpdo1: 8 Vector__XXX
 SG_ Velocity : 0|16@1+ (1,0) [0|65535] "rpm" Vector__XXX
"#;

/// 性能测试辅助函数
pub mod performance {
    use std::time::{Duration, Instant};

    /// 测量函数执行时间
    pub fn measure_time<F, R>(f: F) -> (Duration, R)
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        (start.elapsed(), result)
    }

    /// 性能断言
    pub fn assert_performance(duration: Duration, max_duration: Duration, operation: &str) {
        assert!(
            duration <= max_duration,
            "{} 执行时间 {} 超过了预期时间 {}",
            operation,
            duration.as_millis(),
            max_duration.as_millis()
        );
    }
}

/// 等待条件成立，超时返回 `false`
pub async fn wait_until<F>(condition: F, limit: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// 回环MQTT代理，只实现测试用到的MQTT 3.1.1子集
pub mod broker {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// 单个连接的脚本
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedConnection {
        /// 订阅确认之后推送的 (主题, 报文体)
        pub publishes: Vec<(String, Vec<u8>)>,
        /// 推送完成后由代理关闭连接
        pub close_after_publish: bool,
    }

    #[derive(Debug, Default)]
    struct Counters {
        accepted: AtomicUsize,
        disconnects: AtomicUsize,
    }

    pub struct FakeBroker {
        pub port: u16,
        counters: Arc<Counters>,
    }

    impl FakeBroker {
        /// 依次为每个脚本接受一个连接
        pub async fn start(script: Vec<ScriptedConnection>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let counters = Arc::new(Counters::default());
            let shared = Arc::clone(&counters);
            tokio::spawn(async move {
                for connection in script {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    shared.accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, connection, Arc::clone(&shared)));
                }
            });
            Self { port, counters }
        }

        /// 已接受的连接数
        pub fn accepted(&self) -> usize {
            self.counters.accepted.load(Ordering::SeqCst)
        }

        /// 收到的DISCONNECT数
        pub fn disconnects(&self) -> usize {
            self.counters.disconnects.load(Ordering::SeqCst)
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn remaining_length(mut len: usize, out: &mut Vec<u8>) {
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if len == 0 {
                break;
            }
        }
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x30];
        remaining_length(2 + topic.len() + payload.len(), &mut out);
        out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        out.extend_from_slice(topic.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn serve(mut stream: TcpStream, connection: ScriptedConnection, counters: Arc<Counters>) {
        while let Some((header, body)) = read_packet(&mut stream).await {
            match header >> 4 {
                // CONNECT
                1 => {
                    if stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.is_err() {
                        return;
                    }
                }
                // SUBSCRIBE
                8 => {
                    let suback = [0x90, 0x03, body[0], body[1], 0x00];
                    if stream.write_all(&suback).await.is_err() {
                        return;
                    }
                    for (topic, payload) in &connection.publishes {
                        if stream.write_all(&publish_packet(topic, payload)).await.is_err() {
                            return;
                        }
                    }
                    if connection.close_after_publish {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        return;
                    }
                }
                // PINGREQ
                12 => {
                    if stream.write_all(&[0xD0, 0x00]).await.is_err() {
                        return;
                    }
                }
                // DISCONNECT
                14 => {
                    counters.disconnects.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                _ => {}
            }
        }
    }
}
