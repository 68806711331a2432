//! 传输 session
//!
//! 把宿主的 start/stop/transfer/pointer 回调映射到共享段上的计数器和环形缓冲区。
//! 核心设计：
//! - 写入路径只推进 `queued_bytes`
//! - 位置查询只推进 `expected_played_bytes`，值完全由墙钟推算，与实际写入量无关
//! - 两者互不约束，不产生背压

mod consumer;

pub use consumer::{ConsumerView, CounterSnapshot};

use thiserror::Error;

use crate::audio::format::{AudioFormat, FormatError, HwConstraints, HwParams};
use crate::audio::ring_buffer::SharedRingBuffer;
use crate::audio::stats::TransportStats;
use crate::audio::timing::{Clock, MonotonicClock, PlaybackClock, PositionEstimator, StartToken, Timestamp};
use crate::shm::{SharedSegment, SharedState, ShmError, SHARED_STATE_SIZE};

/// 默认共享段名
pub const DEFAULT_SEGMENT_NAME: &str = "/pcm-shm-bridge";

/// Session 配置
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// POSIX 共享段名（以 '/' 开头）
    pub segment_name: String,
    /// 段不存在时是否创建
    pub create: bool,
    /// 是否获取单写者锁
    pub exclusive: bool,
    /// 是否 mlock 映射内存（失败不致命）
    pub lock_memory: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            segment_name: DEFAULT_SEGMENT_NAME.to_string(),
            create: true,
            exclusive: true,
            lock_memory: false,
        }
    }
}

/// Session 打开错误
///
/// 只在建立 session 时出现；稳态操作没有失败路径。
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Shared segment error: {0}")]
    Shm(#[from] ShmError),
    #[error("Format negotiation failed: {0}")]
    Format(#[from] FormatError),
}

/// 播放状态
///
/// 停止后与从未启动没有区别，都是 `Idle`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
}

/// 写者端传输 session
///
/// 独占共享段中的计数器与缓冲区，直到 session 关闭。
/// 位置估算策略 `E` 可替换，默认是墙钟 `PlaybackClock`。
pub struct TransportSession<E: PositionEstimator = PlaybackClock> {
    segment: SharedSegment,
    format: AudioFormat,
    estimator: E,
    state: SessionState,
    start: Option<StartToken>,
    stats: TransportStats,
}

impl TransportSession<PlaybackClock> {
    /// 协商格式、打开共享段并初始化
    ///
    /// 格式不被接受时不会触碰共享段。
    pub fn open(config: &SessionConfig, params: &HwParams) -> Result<Self, SessionError> {
        let format = HwConstraints::bridge().negotiate(params)?;

        let mut segment =
            SharedSegment::open(&config.segment_name, SHARED_STATE_SIZE, config.create)?;
        if config.exclusive {
            segment.lock_exclusive()?;
        }
        if config.lock_memory {
            segment.lock_memory();
        }

        Self::with_segment(segment, format)
    }

    /// 在已映射的段上建立 session
    pub fn with_segment(segment: SharedSegment, format: AudioFormat) -> Result<Self, SessionError> {
        let estimator = PlaybackClock::new(&format);
        Self::with_estimator(segment, format, estimator)
    }
}

impl<E: PositionEstimator> TransportSession<E> {
    /// 使用自定义位置估算策略建立 session
    pub fn with_estimator(
        mut segment: SharedSegment,
        format: AudioFormat,
        estimator: E,
    ) -> Result<Self, SessionError> {
        SharedState::from_segment_mut(&mut segment)?.init(&format);

        log::info!(
            "Transport session ready: {} ({}Hz {}ch {}bit, {} bytes)",
            segment.name().unwrap_or("<anonymous>"),
            format.sample_rate,
            format.channels,
            format.bits_per_sample,
            segment.len()
        );

        Ok(Self {
            segment,
            format,
            estimator,
            state: SessionState::Idle,
            start: None,
            stats: TransportStats::new(),
        })
    }

    #[inline]
    fn shared(&self) -> &SharedState {
        // 构造时已校验段大小
        unsafe { &*(self.segment.as_ptr() as *const SharedState) }
    }

    #[inline]
    fn shared_mut(&mut self) -> &mut SharedState {
        unsafe { &mut *(self.segment.as_mut_ptr() as *mut SharedState) }
    }

    /// 准备播放（无操作，计数器只在 stop 时清零）
    pub fn prepare(&mut self) {
        log::debug!("prepare (state: {:?})", self.state);
    }

    /// 开始播放，以当前单调时间为起点
    pub fn start(&mut self) {
        self.start_at(MonotonicClock.now());
    }

    /// 以指定时间为起点开始播放
    ///
    /// 已在播放时重新捕获起点；不清零计数器。
    pub fn start_at(&mut self, now: Timestamp) {
        if self.state == SessionState::Running {
            log::debug!("start while running, restarting playback clock");
        }
        self.start = Some(StartToken::at(now));
        self.state = SessionState::Running;
        self.shared().set_running(true);
        log::debug!("Playback started, queued {} bytes", self.queued_bytes());
    }

    /// 停止播放并清零计数器
    ///
    /// 可重复调用。缓冲区内容保留，直到被新的写入覆盖。
    pub fn stop(&mut self) {
        let shared = self.shared();
        shared.set_running(false);
        shared.reset_counters();

        if self.state == SessionState::Running {
            let report = self.stats.report();
            log::info!("Playback stopped | {}", report);
            if report.underrun_count > 0 {
                log::warn!(
                    "{} position queries ran ahead of queued data",
                    report.underrun_count
                );
            }
        }

        self.stats.reset();
        self.start = None;
        self.state = SessionState::Idle;
    }

    /// 排空（无操作：数据早已进入共享缓冲区）
    pub fn drain(&mut self) {
        log::debug!("drain, {} bytes queued", self.queued_bytes());
    }

    /// 写入交织样本
    ///
    /// `data` 是宿主的交织缓冲区，从第 `frames_offset` 帧开始取 `frames` 帧，
    /// 写入 `queued_bytes` 对应的环形偏移。返回被接受的帧数（字节数向零截断为帧）；
    /// 0 表示本次没有帧被接受，调用方应稍后重试，而不是当作错误。
    ///
    /// 任何状态下都接受写入。
    pub fn write(&mut self, frames_offset: usize, frames: usize, data: &[u8]) -> usize {
        let start = self.format.frames_to_bytes(frames_offset).min(data.len());
        let requested = self.format.frames_to_bytes(frames);
        let source = &data[start..];

        let queued = self.shared().queued_bytes();
        let written = self.shared_mut().buffer_mut().write(source, queued, requested);
        self.shared().advance_queued(written as u32);

        self.stats.on_write(requested, written);
        if written == 0 {
            return 0;
        }

        self.format.bytes_to_frames(written)
    }

    /// 采集方向：不读取任何数据，用静音填充
    ///
    /// 返回填充的帧数。
    pub fn read(&mut self, frames_offset: usize, frames: usize, output: &mut [u8]) -> usize {
        let start = self.format.frames_to_bytes(frames_offset).min(output.len());
        let end = start
            .saturating_add(self.format.frames_to_bytes(frames))
            .min(output.len());
        output[start..end].fill(0);
        self.format.bytes_to_frames(end - start)
    }

    /// 查询播放指针（帧）
    ///
    /// 未播放时直接返回 0，不读时钟。播放中返回估算的已播放帧数，
    /// 并把对应字节数写入 `expected_played_bytes`（按 32 位回绕）。
    pub fn query_position(&mut self, now: Timestamp) -> u64 {
        match self.running_token() {
            Some(token) => self.record_position(token, now),
            None => 0,
        }
    }

    /// 以当前单调时间查询播放指针
    pub fn query_position_now(&mut self) -> u64 {
        self.query_position_with(&MonotonicClock)
    }

    /// 以指定时间源查询播放指针
    ///
    /// 先检查状态，未播放时不读取 `clock`。
    pub fn query_position_with(&mut self, clock: &impl Clock) -> u64 {
        match self.running_token() {
            Some(token) => self.record_position(token, clock.now()),
            None => 0,
        }
    }

    #[inline]
    fn running_token(&self) -> Option<StartToken> {
        match (self.state, self.start) {
            (SessionState::Running, Some(token)) => Some(token),
            _ => None,
        }
    }

    fn record_position(&mut self, token: StartToken, now: Timestamp) -> u64 {
        let frames = self.estimator.estimate_frames(token, now);
        let expected = frames.wrapping_mul(self.estimator.frame_bytes() as u64) as u32;

        let shared = self.shared();
        shared.set_expected_played_bytes(expected);
        self.stats.on_position_query(expected, shared.queued_bytes());

        frames
    }

    /// 关闭 session，释放共享段映射与写者锁
    pub fn close(self) {
        log::info!(
            "Transport session closed ({} bytes queued at close)",
            self.queued_bytes()
        );
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    #[inline]
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    #[inline]
    pub fn queued_bytes(&self) -> u32 {
        self.shared().queued_bytes()
    }

    #[inline]
    pub fn expected_played_bytes(&self) -> u32 {
        self.shared().expected_played_bytes()
    }

    /// 由消费者回报的已播放字节数（本 session 从不写入）
    #[inline]
    pub fn played_bytes(&self) -> u32 {
        self.shared().played_bytes()
    }

    /// 代消费者设置 played_bytes
    pub fn set_played_bytes(&self, bytes: u32) {
        self.shared().set_played_bytes(bytes);
    }

    #[inline]
    pub fn buffer(&self) -> &SharedRingBuffer {
        self.shared().buffer()
    }

    #[inline]
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;
    use crate::audio::ring_buffer::BUFFER_SIZE;
    use std::time::Duration;

    fn anonymous_session() -> TransportSession {
        let segment = SharedSegment::anonymous(SHARED_STATE_SIZE).unwrap();
        TransportSession::with_segment(segment, AudioFormat::BRIDGE).unwrap()
    }

    fn test_config(tag: &str) -> SessionConfig {
        SessionConfig {
            segment_name: format!("/pcm-shm-bridge-session-{}-{}", tag, std::process::id()),
            ..SessionConfig::default()
        }
    }

    /// 与时间无关的估算策略：固定返回同一帧数
    struct FixedEstimator(u64);

    impl PositionEstimator for FixedEstimator {
        fn estimate_frames(&self, _start: StartToken, _now: Timestamp) -> u64 {
            self.0
        }

        fn frame_bytes(&self) -> u32 {
            4
        }
    }

    #[test]
    fn test_new_session_is_idle_and_zeroed() {
        let session = anonymous_session();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.queued_bytes(), 0);
        assert_eq!(session.expected_played_bytes(), 0);
        assert_eq!(session.played_bytes(), 0);
    }

    #[test]
    fn test_write_2000_frames() {
        let mut session = anonymous_session();
        session.start_at(Timestamp::from_millis(0));

        let data = vec![0x11u8; 8000];
        assert_eq!(session.write(0, 2000, &data), 2000);
        assert_eq!(session.queued_bytes(), 8000);
        assert_eq!(session.buffer().peek(0, 8000), &data[..]);
    }

    #[test]
    fn test_write_honors_frame_offset() {
        let mut session = anonymous_session();

        let mut data = vec![0u8; 16];
        data[8..].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(session.write(2, 2, &data), 2);
        assert_eq!(session.buffer().peek(0, 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_write_while_idle_is_accepted() {
        let mut session = anonymous_session();
        assert!(!session.is_running());

        let data = [0u8; 400];
        assert_eq!(session.write(0, 100, &data), 100);
        assert_eq!(session.queued_bytes(), 400);
    }

    #[test]
    fn test_write_truncates_at_wrap_then_continues() {
        let mut session = anonymous_session();
        session.start_at(Timestamp::from_millis(0));

        // 推进到距末尾 40 字节
        let fill = vec![0u8; BUFFER_SIZE - 40];
        let frames = (BUFFER_SIZE - 40) / 4;
        assert_eq!(session.write(0, frames, &fill), frames);

        let data = vec![0x77u8; 400];
        assert_eq!(session.write(0, 100, &data), 10);
        assert_eq!(session.queued_bytes() as usize, BUFFER_SIZE);
        assert_eq!(session.stats().report().short_writes, 1);

        // 剩余部分在环绕后的偏移 0 处继续
        assert_eq!(session.write(10, 90, &data), 90);
        assert_eq!(session.queued_bytes() as usize, BUFFER_SIZE + 360);
        assert!(session.buffer().peek(0, 360).iter().all(|&b| b == 0x77));
    }

    #[test]
    fn test_write_with_short_source() {
        let mut session = anonymous_session();

        // 宿主声称 10 帧，实际只给了 6 字节：只接受完整的 1 帧
        let data = [1u8; 6];
        assert_eq!(session.write(0, 10, &data), 1);
        assert_eq!(session.queued_bytes(), 6);

        // 偏移越过数据末尾：什么也不写
        assert_eq!(session.write(100, 10, &data), 0);
        assert_eq!(session.stats().report().zero_writes, 1);
    }

    #[test]
    fn test_position_500ms() {
        let mut session = anonymous_session();
        let t0 = Timestamp::from_millis(1_000);
        session.start_at(t0);

        let frames = session.query_position(t0 + Duration::from_millis(500));
        assert_eq!(frames, 22050);
        assert_eq!(session.expected_played_bytes(), 88200);
    }

    #[test]
    fn test_position_zero_when_not_running() {
        let mut session = anonymous_session();
        let far_future = Timestamp::from_millis(1_000_000);
        assert_eq!(session.query_position(far_future), 0);
        assert_eq!(session.expected_played_bytes(), 0);

        session.start_at(Timestamp::from_millis(0));
        assert!(session.query_position(far_future) > 0);

        session.stop();
        assert_eq!(session.query_position(far_future), 0);
        assert_eq!(session.expected_played_bytes(), 0);
    }

    /// 记录被读取次数的时钟
    struct CountingClock {
        now: Timestamp,
        reads: std::cell::Cell<u32>,
    }

    impl Clock for CountingClock {
        fn now(&self) -> Timestamp {
            self.reads.set(self.reads.get() + 1);
            self.now
        }
    }

    #[test]
    fn test_idle_position_query_skips_clock() {
        let mut session = anonymous_session();
        let clock = CountingClock {
            now: Timestamp::from_millis(500),
            reads: std::cell::Cell::new(0),
        };

        assert_eq!(session.query_position_with(&clock), 0);
        assert_eq!(clock.reads.get(), 0);
        assert_eq!(session.query_position_now(), 0);
        assert_eq!(session.expected_played_bytes(), 0);

        session.start_at(Timestamp::from_millis(0));
        assert_eq!(session.query_position_with(&clock), 22050);
        assert_eq!(clock.reads.get(), 1);

        session.stop();
        assert_eq!(session.query_position_with(&clock), 0);
        assert_eq!(clock.reads.get(), 1);
    }

    #[test]
    fn test_position_monotonic_while_running() {
        let clock = crate::audio::timing::ManualClock::new(Timestamp::from_millis(50));
        let mut session = anonymous_session();
        session.start_at(clock.now());

        let mut last = 0;
        for _ in 0..200 {
            clock.advance(Duration::from_micros(2_345));
            let frames = session.query_position(clock.now());
            assert!(frames >= last);
            last = frames;
        }
    }

    #[test]
    fn test_position_independent_of_writes() {
        let mut session = anonymous_session();
        let t0 = Timestamp::from_millis(0);
        session.start_at(t0);

        let data = [0u8; 40];
        session.write(0, 10, &data);

        // 1 秒后时钟说播放了 44100 帧，远超写入的 10 帧
        assert_eq!(session.query_position(t0 + Duration::from_secs(1)), 44100);
        assert_eq!(session.queued_bytes(), 40);
        assert_eq!(session.stats().underrun_count(), 1);
    }

    #[test]
    fn test_stop_resets_counters_but_not_buffer() {
        let mut session = anonymous_session();
        let t0 = Timestamp::from_millis(0);
        session.start_at(t0);

        let data = [0xABu8; 4000];
        session.write(0, 1000, &data);
        session.query_position(t0 + Duration::from_millis(10));
        session.set_played_bytes(1234);
        assert!(session.queued_bytes() > 0);
        assert!(session.expected_played_bytes() > 0);

        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.queued_bytes(), 0);
        assert_eq!(session.expected_played_bytes(), 0);
        assert_eq!(session.played_bytes(), 0);
        // 旧数据仍在，直到被覆盖
        assert!(session.buffer().peek(0, 4000).iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_double_stop_is_safe() {
        let mut session = anonymous_session();
        session.start_at(Timestamp::from_millis(0));
        session.write(0, 10, &[0u8; 40]);

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.queued_bytes(), 0);
        assert_eq!(session.expected_played_bytes(), 0);
        assert_eq!(session.played_bytes(), 0);
    }

    #[test]
    fn test_start_does_not_reset_counters() {
        let mut session = anonymous_session();
        session.write(0, 10, &[0u8; 40]);

        session.start_at(Timestamp::from_millis(0));
        assert_eq!(session.queued_bytes(), 40);
    }

    #[test]
    fn test_restart_recaptures_clock() {
        let mut session = anonymous_session();
        session.start_at(Timestamp::from_millis(0));
        session.start_at(Timestamp::from_millis(1_000));

        assert_eq!(session.query_position(Timestamp::from_millis(1_100)), 4410);
    }

    #[test]
    fn test_custom_estimator() {
        let segment = SharedSegment::anonymous(SHARED_STATE_SIZE).unwrap();
        let mut session =
            TransportSession::with_estimator(segment, AudioFormat::BRIDGE, FixedEstimator(1000))
                .unwrap();

        assert_eq!(session.query_position(Timestamp::from_millis(5)), 0);
        session.start_at(Timestamp::from_millis(0));
        assert_eq!(session.query_position(Timestamp::from_millis(5)), 1000);
        assert_eq!(session.expected_played_bytes(), 4000);
    }

    #[test]
    fn test_capture_read_is_silence() {
        let mut session = anonymous_session();
        let mut output = [0xFFu8; 32];

        assert_eq!(session.read(2, 4, &mut output), 4);
        assert!(output[..8].iter().all(|&b| b == 0xFF));
        assert!(output[8..24].iter().all(|&b| b == 0));
        assert!(output[24..].iter().all(|&b| b == 0xFF));
        assert_eq!(session.queued_bytes(), 0);
    }

    #[test]
    fn test_huge_frame_counts_are_clamped() {
        let mut session = anonymous_session();
        let data = [0x22u8; 64];

        // 偏移换算饱和后越过数据末尾：不写入
        assert_eq!(session.write(usize::MAX, usize::MAX, &data), 0);
        assert_eq!(session.queued_bytes(), 0);

        // 帧数过大：受源数据长度约束
        assert_eq!(session.write(0, usize::MAX, &data), 16);
        assert_eq!(session.queued_bytes(), 64);

        let mut output = [0xFFu8; 32];
        assert_eq!(session.read(0, usize::MAX, &mut output), 8);
        assert!(output.iter().all(|&b| b == 0));

        let mut output = [0xFFu8; 32];
        assert_eq!(session.read(usize::MAX, usize::MAX, &mut output), 0);
        assert!(output.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_open_rejects_format_before_touching_segment() {
        let config = test_config("badfmt");
        let params = HwParams {
            format: SampleFormat::S24Le,
            ..HwParams::default()
        };

        assert!(matches!(
            TransportSession::open(&config, &params),
            Err(SessionError::Format(FormatError::UnsupportedFormat(
                SampleFormat::S24Le
            )))
        ));
        // 段从未被创建
        assert!(matches!(
            SharedSegment::open(&config.segment_name, 4096, false),
            Err(ShmError::Open { .. })
        ));
    }

    #[test]
    fn test_open_invalid_name_is_shm_error() {
        let config = SessionConfig {
            segment_name: "bad-name".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            TransportSession::open(&config, &HwParams::default()),
            Err(SessionError::Shm(ShmError::InvalidName(_)))
        ));
    }

    #[test]
    fn test_second_writer_rejected() {
        let config = test_config("writer");
        let first = TransportSession::open(&config, &HwParams::default()).unwrap();

        assert!(matches!(
            TransportSession::open(&config, &HwParams::default()),
            Err(SessionError::Shm(ShmError::WriterBusy(_)))
        ));

        first.close();
        SharedSegment::unlink(&config.segment_name).unwrap();
    }

    #[test]
    fn test_consumer_sees_writer_data() {
        let config = test_config("consumer");
        let mut session = TransportSession::open(&config, &HwParams::default()).unwrap();
        let consumer = ConsumerView::attach(&config.segment_name).unwrap();

        assert!(!consumer.snapshot().running);

        let t0 = Timestamp::from_millis(0);
        session.start_at(t0);
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(session.write(0, 1000, &data), 1000);
        session.query_position(t0 + Duration::from_millis(10));

        let snapshot = consumer.snapshot();
        assert!(snapshot.running);
        assert_eq!(snapshot.queued_bytes, 4000);
        assert_eq!(snapshot.expected_played_bytes, 441 * 4);

        let mut out = vec![0u8; 4000];
        assert_eq!(consumer.read_into(0, &mut out), 4000);
        assert_eq!(out, data);

        // 消费者回报进度，写者可见
        consumer.report_played(2000);
        assert_eq!(session.played_bytes(), 2000);

        session.stop();
        assert_eq!(consumer.snapshot(), CounterSnapshot::default());

        session.close();
        SharedSegment::unlink(&config.segment_name).unwrap();
    }
}
