//! 传输统计模块
//!
//! 在写入/位置查询回调中收集统计信息，所有操作 lock-free。
//! 只在本进程内使用，不进入共享段布局。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// 传输统计收集器
#[derive(Debug, Default)]
pub struct TransportStats {
    write_calls: CachePadded<AtomicU64>,
    bytes_accepted: CachePadded<AtomicU64>,
    // 因环绕或 frame 对齐被截断的写入
    short_writes: AtomicU64,
    zero_writes: AtomicU64,

    position_queries: CachePadded<AtomicU64>,
    // 位置查询时 expected-played 已超过 queued（按回绕差值判断）
    underrun_count: AtomicU64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次写入
    #[inline]
    pub fn on_write(&self, requested: usize, accepted: usize) {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.bytes_accepted
            .fetch_add(accepted as u64, Ordering::Relaxed);

        if accepted == 0 {
            self.zero_writes.fetch_add(1, Ordering::Relaxed);
        } else if accepted < requested {
            self.short_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 记录一次位置查询
    #[inline]
    pub fn on_position_query(&self, expected_played: u32, queued: u32) {
        self.position_queries.fetch_add(1, Ordering::Relaxed);
        // 两个计数器都在 2^32 回绕，比较有符号差值而不是原值
        if (queued.wrapping_sub(expected_played) as i32) < 0 {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        StatsReport {
            write_calls: self.write_calls.load(Ordering::Relaxed),
            bytes_accepted: self.bytes_accepted.load(Ordering::Relaxed),
            short_writes: self.short_writes.load(Ordering::Relaxed),
            zero_writes: self.zero_writes.load(Ordering::Relaxed),
            position_queries: self.position_queries.load(Ordering::Relaxed),
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.write_calls.store(0, Ordering::Relaxed);
        self.bytes_accepted.store(0, Ordering::Relaxed);
        self.short_writes.store(0, Ordering::Relaxed);
        self.zero_writes.store(0, Ordering::Relaxed);
        self.position_queries.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
    }
}

/// 统计报告
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub write_calls: u64,
    pub bytes_accepted: u64,
    pub short_writes: u64,
    pub zero_writes: u64,
    pub position_queries: u64,
    pub underrun_count: u64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "writes: {} ({} bytes, {} short, {} empty) | position queries: {} | underruns: {}",
            self.write_calls,
            self.bytes_accepted,
            self.short_writes,
            self.zero_writes,
            self.position_queries,
            self.underrun_count
        )
    }
}
