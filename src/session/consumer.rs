//! 消费者视角
//!
//! 下游进程映射同一个共享段，只读计数器与缓冲区，
//! 唯一允许写入的字段是 `played_bytes`。

use std::fmt;

use super::SessionError;
use crate::audio::format::AudioFormat;
use crate::shm::{SegmentHeader, SharedSegment, SharedState, SHARED_STATE_SIZE};

/// 计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub running: bool,
    pub queued_bytes: u32,
    pub expected_played_bytes: u32,
    pub played_bytes: u32,
}

impl CounterSnapshot {
    /// 写者领先于时钟估算的字节数；负数表示估算已经跑到数据前面
    pub fn lead_bytes(&self) -> i64 {
        self.queued_bytes.wrapping_sub(self.expected_played_bytes) as i32 as i64
    }

    /// 已写入但消费者尚未回报播放的字节数
    pub fn backlog_bytes(&self) -> u32 {
        self.queued_bytes.wrapping_sub(self.played_bytes)
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | queued: {} | expected: {} | played: {} | lead: {}",
            if self.running { "running" } else { "idle" },
            self.queued_bytes,
            self.expected_played_bytes,
            self.played_bytes,
            self.lead_bytes()
        )
    }
}

/// 消费者端视图
pub struct ConsumerView {
    segment: SharedSegment,
}

impl ConsumerView {
    /// 映射已存在的命名段并校验布局
    pub fn attach(name: &str) -> Result<Self, SessionError> {
        let segment = SharedSegment::open(name, SHARED_STATE_SIZE, false)?;
        Self::from_segment(segment)
    }

    pub fn from_segment(segment: SharedSegment) -> Result<Self, SessionError> {
        SharedState::from_segment(&segment)?.header().validate()?;
        Ok(Self { segment })
    }

    #[inline]
    fn shared(&self) -> &SharedState {
        // from_segment 已校验大小
        unsafe { &*(self.segment.as_ptr() as *const SharedState) }
    }

    pub fn header(&self) -> SegmentHeader {
        *self.shared().header()
    }

    /// 写者协商的流格式（由头部重建）
    pub fn format(&self) -> AudioFormat {
        let header = self.header();
        let channels = AudioFormat::BRIDGE.channels;
        let bits = header.frame_bytes * 8 / channels as u32;
        AudioFormat::new(header.sample_rate, channels, bits as u16)
    }

    /// 读取计数器
    ///
    /// 先读 `queued_bytes`（Acquire），之后读到的缓冲区内容至少覆盖到该位置。
    pub fn snapshot(&self) -> CounterSnapshot {
        let shared = self.shared();
        CounterSnapshot {
            queued_bytes: shared.queued_bytes(),
            running: shared.is_running(),
            expected_played_bytes: shared.expected_played_bytes(),
            played_bytes: shared.played_bytes(),
        }
    }

    /// 缓冲区视图，截断规则同 `RingBuffer::peek`
    pub fn peek(&self, offset: u32, max_count: usize) -> &[u8] {
        self.shared().buffer().peek(offset, max_count)
    }

    /// 从 `offset` 拷贝字节，自动跨越环绕点
    pub fn read_into(&self, offset: u32, output: &mut [u8]) -> usize {
        self.shared().buffer().read_into(offset, output)
    }

    /// 最近写入的 `window_bytes` 字节中的峰值电平（样本绝对值）
    ///
    /// 窗口按帧对齐，且不超过 `queued_bytes` 与缓冲区容量。
    pub fn recent_peak(&self, window_bytes: usize) -> u16 {
        let format = self.format();
        let shared = self.shared();
        let queued = shared.queued_bytes();

        let window = window_bytes
            .min(queued as usize)
            .min(shared.buffer().capacity());
        let window = format.frames_to_bytes(format.bytes_to_frames(window));
        if window == 0 {
            return 0;
        }

        let mut raw = vec![0u8; window];
        let copied = self.read_into(queued.wrapping_sub(window as u32), &mut raw);
        let mut samples = vec![0i16; copied / 2];
        let decoded = format.bytes_to_samples(&raw[..copied], &mut samples);

        samples[..decoded]
            .iter()
            .map(|sample| sample.unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    /// 回报实际播放进度
    pub fn report_played(&self, bytes: u32) {
        self.shared().set_played_bytes(bytes);
    }
}
