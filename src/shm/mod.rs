//! 共享内存传输层
//!
//! 包含：
//! - Segment: POSIX 共享段的打开/映射/单写者锁
//! - Layout: 段内 `SharedState` 的固定布局

pub mod layout;
pub mod segment;

pub use layout::{SegmentHeader, SharedState, SHARED_STATE_SIZE};
pub use segment::{SharedSegment, ShmError};
