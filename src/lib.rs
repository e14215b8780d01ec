pub mod error;
pub mod frame;
pub mod frame_queue;
pub mod wire_codec;
pub mod filter;
pub mod sort;
pub mod time_basis;
pub mod label;
pub mod frame_store;
pub mod transport;
pub mod mqtt_bus;
pub mod session;
pub mod config;
pub mod performance;
pub mod test_data_generator;

pub use error::{CaptureError, Result};
pub use frame::{CanFrame, CanOpenFunction, Direction, describe_sdo};
pub use frame_queue::{FrameQueue, QueueStats, SlotClaim};
pub use wire_codec::{WireMessage, decode_frame, encode_frame};
pub use filter::{FilterCategory, FilterEngine, FilterLoadReport};
pub use sort::{Column, SortKey, sort_frames};
pub use time_basis::TimeBasis;
pub use label::{CanOpenLabels, DbcLabelResolver, FunctionLabelResolver};
pub use frame_store::{FrameStore, FrameView, StoreConfig, StoreEvent, StoreStats};
pub use transport::{CanTransport, ConnectionState, ConnectionStatus, TransportStats};
pub use mqtt_bus::{MqttBus, MqttBusConfig};
pub use session::{CaptureSession, SessionStats};
pub use config::CaptureConfig;
pub use performance::PerformanceConfig;
pub use test_data_generator::{TestDataGenerator, TestDataConfig, TestDataStats};
