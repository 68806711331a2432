//! 共享段内存布局
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SegmentHeader (24 bytes)                    │
//! │    magic / version / capacity / format       │
//! ├──────────────────────────────────────────────┤
//! │  queued_bytes           AtomicU32  (写者)     │
//! │  expected_played_bytes  AtomicU32  (写者)     │
//! │  played_bytes           AtomicU32  (消费者)   │
//! │  running                AtomicU32  (写者)     │
//! ├──────────────────────────────────────────────┤
//! │  RingBuffer data (BUFFER_SIZE bytes)         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! 所有字段对任意位模式都合法，因此零页或陌生内容都可以安全地解释为
//! `SharedState`，头部校验只负责判断布局是否一致。
//!
//! 计数器是 32 位，按 2^32 回绕。`BUFFER_SIZE` 必须整除 2^32，
//! 否则回绕处的取模偏移会跳变。

use std::sync::atomic::{AtomicU32, Ordering};

use super::segment::{SharedSegment, ShmError};
use crate::audio::format::AudioFormat;
use crate::audio::ring_buffer::{SharedRingBuffer, BUFFER_SIZE};

/// 段标识
pub const MAGIC: [u8; 8] = *b"PCMSHMB\0";

/// 布局版本，布局变化时递增
pub const LAYOUT_VERSION: u32 = 1;

const _: () = assert!(BUFFER_SIZE.is_power_of_two() && BUFFER_SIZE <= 1 << 31);

/// 段头部
///
/// 写者在 session 打开时写入，消费者映射后据此校验布局。
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub capacity: u32,
    pub frame_bytes: u32,
    pub sample_rate: u32,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == 24);

impl SegmentHeader {
    pub fn new(format: &AudioFormat) -> Self {
        Self {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            capacity: BUFFER_SIZE as u32,
            frame_bytes: format.bytes_per_frame() as u32,
            sample_rate: format.sample_rate,
        }
    }

    /// 校验头部与本进程编译时的布局一致
    pub fn validate(&self) -> Result<(), ShmError> {
        if self.magic != MAGIC {
            return Err(ShmError::BadMagic);
        }
        if self.version != LAYOUT_VERSION {
            return Err(ShmError::VersionMismatch {
                found: self.version,
                expected: LAYOUT_VERSION,
            });
        }
        if self.capacity as usize != BUFFER_SIZE {
            return Err(ShmError::CapacityMismatch {
                found: self.capacity,
                expected: BUFFER_SIZE as u32,
            });
        }
        Ok(())
    }
}

/// 共享 session 状态
///
/// 写者 (本进程) 独占 `queued_bytes`、`expected_played_bytes`、`running`
/// 与缓冲区内容；`played_bytes` 留给消费者回报。
/// 写者以 `Release` 发布计数器，消费者以 `Acquire` 读取，
/// 保证消费者看到 `queued_bytes` 时，对应字节已经落在缓冲区中。
#[repr(C)]
pub struct SharedState {
    header: SegmentHeader,
    queued_bytes: AtomicU32,
    expected_played_bytes: AtomicU32,
    played_bytes: AtomicU32,
    running: AtomicU32,
    buffer: SharedRingBuffer,
}

/// 共享段至少需要的字节数
pub const SHARED_STATE_SIZE: usize = std::mem::size_of::<SharedState>();

impl SharedState {
    /// 检查段能否容纳 `SharedState`
    pub fn check_fits(segment: &SharedSegment) -> Result<(), ShmError> {
        if segment.len() < SHARED_STATE_SIZE {
            return Err(ShmError::TooSmall {
                actual: segment.len(),
                required: SHARED_STATE_SIZE,
            });
        }
        debug_assert_eq!(
            segment.as_ptr() as usize % std::mem::align_of::<SharedState>(),
            0,
            "mmap returned a misaligned region"
        );
        Ok(())
    }

    /// 以只读视角解释段内容
    pub fn from_segment(segment: &SharedSegment) -> Result<&SharedState, ShmError> {
        Self::check_fits(segment)?;
        // 大小已校验；所有字段对任意位模式合法
        Ok(unsafe { &*(segment.as_ptr() as *const SharedState) })
    }

    /// 以写者视角解释段内容
    pub fn from_segment_mut(segment: &mut SharedSegment) -> Result<&mut SharedState, ShmError> {
        Self::check_fits(segment)?;
        Ok(unsafe { &mut *(segment.as_mut_ptr() as *mut SharedState) })
    }

    /// 写头部并清零计数器
    pub fn init(&mut self, format: &AudioFormat) {
        self.header = SegmentHeader::new(format);
        self.running.store(0, Ordering::Release);
        self.reset_counters();
    }

    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// 清零三个字节计数器（缓冲区内容保持不变）
    pub fn reset_counters(&self) {
        self.queued_bytes.store(0, Ordering::Release);
        self.expected_played_bytes.store(0, Ordering::Release);
        self.played_bytes.store(0, Ordering::Release);
    }

    #[inline]
    pub fn queued_bytes(&self) -> u32 {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// 推进 queued_bytes（按 2^32 回绕）
    #[inline]
    pub fn advance_queued(&self, bytes: u32) -> u32 {
        self.queued_bytes
            .fetch_add(bytes, Ordering::Release)
            .wrapping_add(bytes)
    }

    #[inline]
    pub fn expected_played_bytes(&self) -> u32 {
        self.expected_played_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_expected_played_bytes(&self, bytes: u32) {
        self.expected_played_bytes.store(bytes, Ordering::Release);
    }

    #[inline]
    pub fn played_bytes(&self) -> u32 {
        self.played_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_played_bytes(&self, bytes: u32) {
        self.played_bytes.store(bytes, Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn set_running(&self, running: bool) {
        self.running.store(running as u32, Ordering::Release);
    }

    #[inline]
    pub fn buffer(&self) -> &SharedRingBuffer {
        &self.buffer
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> &mut SharedRingBuffer {
        &mut self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_size() {
        assert_eq!(SHARED_STATE_SIZE, 24 + 4 * 4 + BUFFER_SIZE);
        assert_eq!(std::mem::align_of::<SharedState>(), 4);
    }

    #[test]
    fn test_init_and_validate() {
        let mut segment = SharedSegment::anonymous(SHARED_STATE_SIZE).unwrap();
        let state = SharedState::from_segment_mut(&mut segment).unwrap();

        // 零页不是合法头部
        assert!(matches!(state.header().validate(), Err(ShmError::BadMagic)));

        state.init(&AudioFormat::BRIDGE);
        state.header().validate().unwrap();
        assert_eq!(state.header().frame_bytes, 4);
        assert_eq!(state.header().sample_rate, 44100);
        assert!(!state.is_running());
        assert_eq!(state.queued_bytes(), 0);
    }

    #[test]
    fn test_version_mismatch() {
        let mut header = SegmentHeader::new(&AudioFormat::BRIDGE);
        header.version = LAYOUT_VERSION + 1;
        assert!(matches!(
            header.validate(),
            Err(ShmError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_segment_too_small() {
        let segment = SharedSegment::anonymous(4096).unwrap();
        assert!(matches!(
            SharedState::from_segment(&segment),
            Err(ShmError::TooSmall { actual: 4096, .. })
        ));
    }

    #[test]
    fn test_queued_wraps_u32() {
        let mut segment = SharedSegment::anonymous(SHARED_STATE_SIZE).unwrap();
        let state = SharedState::from_segment_mut(&mut segment).unwrap();

        state.advance_queued(u32::MAX);
        assert_eq!(state.advance_queued(2), 1);
    }
}
