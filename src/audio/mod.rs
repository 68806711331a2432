//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: 共享段中的环形字节缓冲区
//! - Format: 音频格式与硬件参数协商
//! - Timing: 单调时钟与播放位置估算
//! - Stats: 传输统计

pub mod format;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use format::{AudioFormat, FormatError, HwConstraints, HwParams};
pub use ring_buffer::{RingBuffer, SharedRingBuffer, BUFFER_SIZE};
pub use stats::{StatsReport, TransportStats};
pub use timing::{Clock, ManualClock, MonotonicClock, PlaybackClock, PositionEstimator, StartToken, Timestamp};
