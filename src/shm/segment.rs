//! POSIX 共享内存段
//!
//! `shm_open` + `ftruncate` + `mmap(MAP_SHARED)`，映射在整个句柄生命周期内
//! 地址不变；`Drop` 负责 `munmap` 和关闭 fd。
//!
//! 单写者约束通过对段 fd 加 `flock(LOCK_EX | LOCK_NB)` 实现：
//! 锁跟随打开的文件描述，fd 关闭即释放，进程崩溃也不会残留。

use std::ffi::CString;
use std::io;
use std::os::raw::c_int;
use std::ptr::NonNull;

use thiserror::Error;

/// 共享段错误
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("Invalid segment name {0:?} (expected \"/name\")")]
    InvalidName(String),
    #[error("Failed to open segment {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to size segment to {size} bytes: {source}")]
    Resize {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to map {size} bytes: {source}")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("Segment is {actual} bytes, need at least {required}")]
    TooSmall { actual: usize, required: usize },
    #[error("Segment {0} already has a writer")]
    WriterBusy(String),
    #[error("Failed to lock segment: {0}")]
    Lock(#[source] io::Error),
    #[error("Failed to unlink segment {name}: {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Segment magic mismatch (not initialized by a writer?)")]
    BadMagic,
    #[error("Layout version {found} not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("Ring buffer capacity {found} does not match {expected}")]
    CapacityMismatch { found: u32, expected: u32 },
}

/// 已映射的共享内存段
pub struct SharedSegment {
    /// 匿名映射时为 None
    name: Option<String>,
    /// 匿名映射时为 -1
    fd: c_int,
    ptr: NonNull<u8>,
    len: usize,
    created: bool,
    writer_locked: bool,
    memory_locked: bool,
}

// 映射地址在生命周期内稳定，访问纪律由上层 (单写者) 保证
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// 打开（或创建）命名共享段并映射 `size` 字节
    ///
    /// 新创建的段由内核零填充。已存在的段小于 `size` 时：
    /// `create` 为真则扩大（新增部分同样为零），否则返回 `TooSmall`。
    pub fn open(name: &str, size: usize, create: bool) -> Result<Self, ShmError> {
        let c_name = segment_name(name)?;

        let (fd, created) = open_fd(&c_name, create).map_err(|source| ShmError::Open {
            name: name.to_string(),
            source,
        })?;

        match Self::map_fd(fd, size, create) {
            Ok(ptr) => {
                log::info!(
                    "Shared segment {} {} ({} bytes)",
                    name,
                    if created { "created" } else { "attached" },
                    size
                );
                Ok(Self {
                    name: Some(name.to_string()),
                    fd,
                    ptr,
                    len: size,
                    created,
                    writer_locked: false,
                    memory_locked: false,
                })
            }
            Err(e) => {
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    /// 匿名共享映射（零填充）
    ///
    /// 不对应任何命名对象，fork 出的子进程可以共享，测试中用作段替身。
    pub fn anonymous(size: usize) -> Result<Self, ShmError> {
        let ptr = mmap_shared(size, -1, libc::MAP_SHARED | libc::MAP_ANONYMOUS)?;
        Ok(Self {
            name: None,
            fd: -1,
            ptr,
            len: size,
            created: true,
            writer_locked: false,
            memory_locked: false,
        })
    }

    /// 删除命名段；已映射的句柄仍然有效
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        let c_name = segment_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
            return Err(ShmError::Unlink {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        log::info!("Shared segment {} unlinked", name);
        Ok(())
    }

    fn map_fd(fd: c_int, size: usize, create: bool) -> Result<NonNull<u8>, ShmError> {
        let actual = fd_size(fd).map_err(|source| ShmError::Resize { size, source })?;

        if actual < size {
            if !create {
                return Err(ShmError::TooSmall {
                    actual,
                    required: size,
                });
            }
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                return Err(ShmError::Resize {
                    size,
                    source: io::Error::last_os_error(),
                });
            }
        }

        mmap_shared(size, fd, libc::MAP_SHARED)
    }

    /// 获取单写者锁
    ///
    /// 已有其它写者持锁时返回 `WriterBusy`。匿名映射没有可加锁的对象，直接成功。
    pub fn lock_exclusive(&mut self) -> Result<(), ShmError> {
        if self.writer_locked || self.fd < 0 {
            self.writer_locked = true;
            return Ok(());
        }

        if unsafe { libc::flock(self.fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK => Err(ShmError::WriterBusy(
                    self.name.clone().unwrap_or_default(),
                )),
                _ => Err(ShmError::Lock(err)),
            };
        }

        self.writer_locked = true;
        log::debug!("Writer lock acquired on {}", self.display_name());
        Ok(())
    }

    /// 锁定映射内存，防止被换页
    ///
    /// 失败不致命，只记录警告。返回是否成功锁定。
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let result = unsafe { libc::mlock(self.ptr.as_ptr() as *const libc::c_void, self.len) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Shared segment memory locked: {} bytes", self.len);
            true
        } else {
            log::warn!(
                "Failed to lock shared segment memory: {}",
                io::Error::last_os_error()
            );
            false
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 本次打开是否新建了段
    #[inline]
    pub fn created(&self) -> bool {
        self.created
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn is_writer_locked(&self) -> bool {
        self.writer_locked
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            let addr = self.ptr.as_ptr() as *mut libc::c_void;
            if self.memory_locked {
                libc::munlock(addr, self.len);
            }
            libc::munmap(addr, self.len);
            // 关闭 fd 同时释放 flock
            if self.fd >= 0 {
                libc::close(self.fd);
            }
        }
        log::debug!("Shared segment {} closed", self.display_name());
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("created", &self.created)
            .field("writer_locked", &self.writer_locked)
            .finish()
    }
}

/// POSIX 段名：以 '/' 开头，后面不再有 '/'
fn segment_name(name: &str) -> Result<CString, ShmError> {
    let valid = name.len() > 1 && name.starts_with('/') && !name[1..].contains('/');
    if !valid {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
}

/// 先尝试独占创建以得知是否为新段，已存在时再普通打开
fn open_fd(name: &CString, create: bool) -> io::Result<(c_int, bool)> {
    if create {
        let fd = shm_open(name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL);
        if fd >= 0 {
            return Ok((fd, true));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }

    let fd = shm_open(name, libc::O_RDWR);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fd, false))
}

#[cfg(not(target_os = "macos"))]
fn shm_open(name: &CString, oflag: c_int) -> c_int {
    unsafe { libc::shm_open(name.as_ptr(), oflag, 0o600 as libc::mode_t) }
}

#[cfg(target_os = "macos")]
fn shm_open(name: &CString, oflag: c_int) -> c_int {
    // macOS 上 shm_open 是变参函数，mode 以 c_uint 传递
    unsafe { libc::shm_open(name.as_ptr(), oflag, 0o600 as libc::c_uint) }
}

fn fd_size(fd: c_int) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

fn mmap_shared(size: usize, fd: c_int, flags: c_int) -> Result<NonNull<u8>, ShmError> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(ShmError::Map {
            size,
            source: io::Error::last_os_error(),
        });
    }

    NonNull::new(addr as *mut u8).ok_or_else(|| ShmError::Map {
        size,
        source: io::Error::from(io::ErrorKind::InvalidData),
    })
}
