//! PCM Shared-Memory Bridge Library
//!
//! Playback transport between a pull-based host audio framework and an
//! external consumer process: a ring buffer in a POSIX shared memory segment
//! plus a wall-clock playback pointer.

pub mod audio;
pub mod session;
pub mod shm;

pub use audio::{AudioFormat, HwParams, PlaybackClock, Timestamp};
pub use session::{ConsumerView, SessionConfig, SessionError, SessionState, TransportSession};
pub use shm::{SharedSegment, ShmError};
