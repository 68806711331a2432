//! 音频格式与硬件参数协商
//!
//! 桥接只接受一种固定格式：
//! - 交织 (Interleaved) 访问
//! - S16_LE，双声道，44100 Hz
//! - 每帧 4 字节
//!
//! 宿主提出的其它参数在 session 打开时即被拒绝，写入路径永远不会看到。

use thiserror::Error;

/// 输出布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputLayout {
    /// 交织：LRLRLR...
    Interleaved,
    /// 非交织：每声道独立 buffer
    NonInterleaved,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::Interleaved
    }
}

/// 宿主可能提出的样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16Le,
    S16Be,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    /// 物理位宽（含填充位）
    pub fn physical_width(self) -> u32 {
        match self {
            Self::U8 => 8,
            Self::S16Le | Self::S16Be => 16,
            Self::S24Le | Self::S32Le | Self::F32Le => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "U8",
            Self::S16Le => "S16_LE",
            Self::S16Be => "S16_BE",
            Self::S24Le => "S24_LE",
            Self::S32Le => "S32_LE",
            Self::F32Le => "FLOAT_LE",
        }
    }
}

/// 宿主提出的访问方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    RwInterleaved,
    RwNonInterleaved,
}

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub layout: OutputLayout,
}

impl AudioFormat {
    /// 桥接唯一支持的格式：44100 Hz / 2ch / 16-bit / 交织
    pub const BRIDGE: AudioFormat = AudioFormat {
        sample_rate: 44100,
        channels: 2,
        bits_per_sample: 16,
        layout: OutputLayout::Interleaved,
    };

    /// 创建新的音频格式
    pub const fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            layout: OutputLayout::Interleaved,
        }
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }

    /// 帧数 → 字节数
    ///
    /// 帧数来自宿主，溢出时饱和到 `usize::MAX`。
    #[inline]
    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames.saturating_mul(self.bytes_per_frame())
    }

    /// 字节数 → 帧数（向零截断，不足一帧的尾部字节丢弃）
    #[inline]
    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            frame_bytes => bytes / frame_bytes,
        }
    }

    /// 每秒字节数
    #[inline]
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }

    /// 将 i16 样本打包为 little-endian 字节
    ///
    /// 返回写入的样本数
    pub fn samples_to_bytes(&self, samples: &[i16], output: &mut [u8]) -> usize {
        let mut written = 0;
        for (chunk, &sample) in output.chunks_exact_mut(2).zip(samples) {
            chunk.copy_from_slice(&sample.to_le_bytes());
            written += 1;
        }
        written
    }

    /// 将 little-endian 字节解码为 i16 样本
    ///
    /// 返回解码的样本数
    pub fn bytes_to_samples(&self, bytes: &[u8], output: &mut [i16]) -> usize {
        let mut decoded = 0;
        for (chunk, sample) in bytes.chunks_exact(2).zip(output.iter_mut()) {
            *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            decoded += 1;
        }
        decoded
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::BRIDGE
    }
}

/// 宿主提出的硬件参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwParams {
    pub access: Access,
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub period_bytes: u32,
    pub periods: u32,
    pub buffer_bytes: u32,
}

impl Default for HwParams {
    /// 典型的宿主请求：4 个 4 KiB 周期
    fn default() -> Self {
        Self {
            access: Access::RwInterleaved,
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
            period_bytes: 4096,
            periods: 4,
            buffer_bytes: 16384,
        }
    }
}

/// 格式协商错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Unsupported access type: {0:?}")]
    UnsupportedAccess(Access),
    #[error("Unsupported format: {}", .0.name())]
    UnsupportedFormat(SampleFormat),
    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u32),
    #[error("Sample rate {0} not supported")]
    UnsupportedRate(u32),
    #[error("Period size {0} bytes is not a power of two in [{}, {}]", MIN_TRANSFER_BYTES, MAX_TRANSFER_BYTES)]
    InvalidPeriodBytes(u32),
    #[error("Period count {0} outside [{}, {}]", MIN_PERIODS, MAX_PERIODS)]
    InvalidPeriods(u32),
    #[error("Buffer size {0} bytes is not a power of two in [{}, {}]", MIN_TRANSFER_BYTES, MAX_TRANSFER_BYTES)]
    InvalidBufferBytes(u32),
}

/// 周期/缓冲区字节数下限 (256 B)
pub const MIN_TRANSFER_BYTES: u32 = 1 << 8;
/// 周期/缓冲区字节数上限 (8 MiB)
pub const MAX_TRANSFER_BYTES: u32 = 1 << 23;
pub const MIN_PERIODS: u32 = 2;
pub const MAX_PERIODS: u32 = 1024;

/// 硬件参数约束
///
/// 描述桥接愿意接受的参数空间，`negotiate` 逐项检查宿主请求。
#[derive(Clone, Debug)]
pub struct HwConstraints {
    pub access: &'static [Access],
    pub formats: &'static [SampleFormat],
    pub channels: (u32, u32),
    pub rate: (u32, u32),
    pub periods: (u32, u32),
}

impl HwConstraints {
    /// 桥接的固定约束
    pub fn bridge() -> Self {
        Self {
            access: &[Access::RwInterleaved],
            formats: &[SampleFormat::S16Le],
            channels: (2, 2),
            rate: (44100, 44100),
            periods: (MIN_PERIODS, MAX_PERIODS),
        }
    }

    /// 检查宿主参数，返回协商后的格式
    pub fn negotiate(&self, params: &HwParams) -> Result<AudioFormat, FormatError> {
        if !self.access.contains(&params.access) {
            return Err(FormatError::UnsupportedAccess(params.access));
        }
        if !self.formats.contains(&params.format) {
            return Err(FormatError::UnsupportedFormat(params.format));
        }
        if !in_range(params.channels, self.channels) {
            return Err(FormatError::UnsupportedChannels(params.channels));
        }
        if !in_range(params.rate, self.rate) {
            return Err(FormatError::UnsupportedRate(params.rate));
        }
        if !is_transfer_size(params.period_bytes) {
            return Err(FormatError::InvalidPeriodBytes(params.period_bytes));
        }
        if !in_range(params.periods, self.periods) {
            return Err(FormatError::InvalidPeriods(params.periods));
        }
        if !is_transfer_size(params.buffer_bytes) {
            return Err(FormatError::InvalidBufferBytes(params.buffer_bytes));
        }

        // 帧大小由物理位宽推出
        let bits = params.format.physical_width() as u16;
        let format = AudioFormat::new(params.rate, params.channels as u16, bits);

        log::debug!(
            "Negotiated {} {}ch {}Hz ({} bytes/frame), period {} B x {}",
            params.format.name(),
            params.channels,
            params.rate,
            format.bytes_per_frame(),
            params.period_bytes,
            params.periods
        );

        Ok(format)
    }
}

impl Default for HwConstraints {
    fn default() -> Self {
        Self::bridge()
    }
}

#[inline]
fn in_range(value: u32, (min, max): (u32, u32)) -> bool {
    value >= min && value <= max
}

/// 2 的幂，且在 [256 B, 8 MiB] 之间
#[inline]
fn is_transfer_size(bytes: u32) -> bool {
    bytes.is_power_of_two() && (MIN_TRANSFER_BYTES..=MAX_TRANSFER_BYTES).contains(&bytes)
}
