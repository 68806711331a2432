//! 单调时钟与播放位置估算
//!
//! 没有真实硬件位置反馈时，用 "启动以来经过的墙钟时间 × 采样率"
//! 模拟播放指针。估算策略通过 `PositionEstimator` 注入，将来有了
//! 消费者回报的真实进度可以直接替换，不用改状态机。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::format::AudioFormat;

const NANOS_PER_MILLI: u64 = 1_000_000;

/// 单调时间戳（纳秒）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * NANOS_PER_MILLI)
    }

    #[inline]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// 自 `earlier` 以来经过的整毫秒数（向下取整）
    ///
    /// `self < earlier`（时钟回拨）时返回 0。
    #[inline]
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0) / NANOS_PER_MILLI
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

/// 获取当前单调时间（纳秒）
#[inline]
pub fn now_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // CLOCK_MONOTONIC 在 Linux/macOS 上不会失败
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// 时间源
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// 系统单调时钟
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp(now_ns())
    }
}

/// 手动推进的时钟
///
/// 用于测试和离线回放，时间只在调用 `advance` 时变化。
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start.as_nanos()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::Relaxed))
    }
}

/// `start` 时刻捕获的时间戳
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartToken(Timestamp);

impl StartToken {
    pub const fn at(ts: Timestamp) -> Self {
        Self(ts)
    }
}

/// 播放位置估算策略
pub trait PositionEstimator {
    /// 自 `start` 到 `now` 之间估计已消费的帧数
    fn estimate_frames(&self, start: StartToken, now: Timestamp) -> u64;

    /// 每帧字节数，用于把帧数换算为 expected-played 字节
    fn frame_bytes(&self) -> u32;
}

/// 墙钟播放时钟
///
/// 纯时间函数，除 start 时间戳外没有可变状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaybackClock {
    sample_rate: u32,
    frame_bytes: u32,
}

impl PlaybackClock {
    pub fn new(format: &AudioFormat) -> Self {
        Self {
            sample_rate: format.sample_rate,
            frame_bytes: format.bytes_per_frame() as u32,
        }
    }

    /// 捕获启动时间
    pub fn start(&self, clock: &impl Clock) -> StartToken {
        StartToken(clock.now())
    }

    /// 经过的帧数：先取整毫秒，再按采样率缩放
    ///
    /// `floor(elapsed_ms * rate / 1000)`，运算顺序决定取整结果，不可交换。
    #[inline]
    pub fn elapsed_frames(&self, token: StartToken, now: Timestamp) -> u64 {
        let elapsed_ms = now.millis_since(token.0);
        elapsed_ms * self.sample_rate as u64 / 1000
    }

    #[inline]
    pub fn elapsed_bytes(&self, frames: u64) -> u64 {
        frames * self.frame_bytes as u64
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new(&AudioFormat::BRIDGE)
    }
}

impl PositionEstimator for PlaybackClock {
    #[inline]
    fn estimate_frames(&self, start: StartToken, now: Timestamp) -> u64 {
        self.elapsed_frames(start, now)
    }

    #[inline]
    fn frame_bytes(&self) -> u32 {
        self.frame_bytes
    }
}
