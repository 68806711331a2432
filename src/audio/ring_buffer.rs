//! 固定容量的共享内存环形字节缓冲区
//!
//! 设计目标：
//! - 零分配：存储按值嵌入共享段，地址跨进程共享，不可扩容
//! - 无内部位置：偏移由调用方提供（来自共享计数器），取模后使用
//! - 环绕截断：单次 write/peek 绝不越过存储末尾，剩余部分由调用方
//!   在环绕后的偏移上再次发起
//!
//! 并发纪律由调用方负责：本进程是唯一的写者，消费者进程只读。

/// 共享段中环形缓冲区的容量 (1 MiB)
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// 共享段使用的缓冲区类型
pub type SharedRingBuffer = RingBuffer<BUFFER_SIZE>;

/// 环形字节缓冲区
///
/// `#[repr(C)]` 保证布局稳定，可以直接放进 mmap 出来的共享区域。
#[repr(C)]
pub struct RingBuffer<const C: usize> {
    data: [u8; C],
}

impl<const C: usize> RingBuffer<C> {
    /// 创建清零的缓冲区
    ///
    /// 共享段中的实例不走这里，而是由 mmap 的零页直接得到。
    pub const fn new() -> Self {
        Self { data: [0; C] }
    }

    /// 获取容量
    #[inline]
    pub const fn capacity(&self) -> usize {
        C
    }

    /// 偏移取模后，到存储末尾为止的连续字节数
    #[inline]
    fn contiguous(offset: u32, max_count: usize) -> (usize, usize) {
        let start = offset as usize % C;
        (start, max_count.min(C - start))
    }

    /// 在 `offset mod C` 处写入至多 `max_count` 字节
    ///
    /// 返回实际写入的字节数：`min(max_count, data.len(), C - offset mod C)`。
    /// 不修改任何计数器。
    #[inline]
    pub fn write(&mut self, data: &[u8], offset: u32, max_count: usize) -> usize {
        let (start, count) = Self::contiguous(offset, max_count.min(data.len()));
        self.data[start..start + count].copy_from_slice(&data[..count]);
        count
    }

    /// 在 `offset mod C` 处返回至多 `max_count` 字节的视图（不拷贝）
    ///
    /// 截断规则与 `write` 相同。视图在下一次覆盖同一区域的写入之前有效。
    #[inline]
    pub fn peek(&self, offset: u32, max_count: usize) -> &[u8] {
        let (start, count) = Self::contiguous(offset, max_count);
        &self.data[start..start + count]
    }

    /// 从 `offset` 开始拷贝 `output.len()` 字节，跨越环绕点时分段读取
    ///
    /// 返回拷贝的字节数，最多一个完整容量。
    pub fn read_into(&self, offset: u32, output: &mut [u8]) -> usize {
        let total = output.len().min(C);
        let mut copied = 0;
        while copied < total {
            let chunk = self.peek(offset.wrapping_add(copied as u32), total - copied);
            output[copied..copied + chunk.len()].copy_from_slice(chunk);
            copied += chunk.len();
        }
        copied
    }
}

impl<const C: usize> Default for RingBuffer<C> {
    fn default() -> Self {
        Self::new()
    }
}
