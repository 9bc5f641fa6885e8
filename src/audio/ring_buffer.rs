//! Single-Producer Single-Consumer 字节环形缓冲区
//!
//! 设计目标：
//! - 生产者（解码线程）写入无锁，绝不阻塞
//! - 零分配：所有内存在打开流时预分配
//! - 缓存友好：读写游标各占一个 cache line（`CachePadded`）
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 保留一个空槽区分满/空：`read == write` 为空，`write + 1 == read` 为满，
//! 所以可用容量是 `capacity - 1`。
//!
//! 只有生产者修改 write 游标，只有消费者修改 read 游标。
//! `reset` 由生产者在 flush 时调用，和消费者的 read 之间用一把短锁互斥：
//! 消费者持锁完成一次拷贝 + 游标发布，生产者的写入从不拿这把锁。

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use thiserror::Error;

/// 环形缓冲区分配错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingBufferError {
    #[error("ring buffer capacity must be at least 2 bytes, got {0}")]
    TooSmall(usize),
    #[error("cannot allocate ring buffer of {0} bytes")]
    Alloc(usize),
}

/// SPSC 字节环形缓冲区
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    // 消费者读取 与 reset 互斥
    reset_lock: Mutex<()>,

    memory_locked: AtomicBool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// 创建指定容量（字节）的缓冲区
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity < 2 {
            return Err(RingBufferError::TooSmall(capacity));
        }

        let mut storage: Vec<UnsafeCell<u8>> = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| RingBufferError::Alloc(capacity))?;
        storage.extend((0..capacity).map(|_| UnsafeCell::new(0)));

        Ok(Self {
            buffer: storage.into_boxed_slice(),
            capacity,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            reset_lock: Mutex::new(()),
            memory_locked: AtomicBool::new(false),
        })
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.capacity) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", self.capacity);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory ({})",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.capacity);
        }
        log::debug!("Ring buffer memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    #[inline]
    fn used_between(&self, write: usize, read: usize) -> usize {
        if write >= read {
            write - read
        } else {
            self.capacity - (read - write)
        }
    }

    /// 写入字节（生产者调用）
    ///
    /// 返回实际写入的字节数，空间不足时可能小于 `data.len()`。
    /// wait-free，绝不阻塞
    pub fn write(&self, data: &[u8]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let free = self.capacity - 1 - self.used_between(write, read);
        let to_write = data.len().min(free);
        if to_write == 0 {
            return 0;
        }

        let first = to_write.min(self.capacity - write);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(write), first);
            if to_write > first {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), self.base(), to_write - first);
            }
        }

        self.write_pos
            .store((write + to_write) % self.capacity, Ordering::Release);
        to_write
    }

    /// 读取字节（消费者调用）
    ///
    /// 返回实际读取的字节数
    #[inline]
    pub fn read(&self, output: &mut [u8]) -> usize {
        self.read_then(output, |_| {})
    }

    /// 读取字节，并在发布 read 游标后、释放 reset 锁之前调用 `commit(n)`
    ///
    /// 用于和 read 原子地记账（例如时钟的已消费字节数），
    /// 保证 flush 之后不会混入 flush 之前的计数
    pub fn read_then<F: FnOnce(usize)>(&self, output: &mut [u8], commit: F) -> usize {
        let _guard = self.reset_lock.lock();

        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let to_read = output.len().min(self.used_between(write, read));
        if to_read == 0 {
            return 0;
        }

        let first = to_read.min(self.capacity - read);
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(read), output.as_mut_ptr(), first);
            if to_read > first {
                ptr::copy_nonoverlapping(self.base(), output.as_mut_ptr().add(first), to_read - first);
            }
        }

        self.read_pos
            .store((read + to_read) % self.capacity, Ordering::Release);
        commit(to_read);
        to_read
    }

    /// 当前可读字节数（不加锁，快照可能落后一次读/写）
    #[inline]
    pub fn used_bytes(&self) -> usize {
        // 先读 read 再读 write：read 只会落后，不会越过 write
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        self.used_between(write, read)
    }

    /// 当前可写字节数
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.capacity - 1 - self.used_bytes()
    }

    /// 分配的字节数（含保留槽）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 最多能同时存放的字节数
    #[inline]
    pub fn usable_capacity(&self) -> usize {
        self.capacity - 1
    }

    /// 填充比例（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.used_bytes() as f64 / self.usable_capacity() as f64
    }

    /// 清空：两个游标归零（生产者调用）
    #[inline]
    pub fn reset(&self) {
        self.reset_then(|| {});
    }

    /// 清空，并在持有 reset 锁期间调用 `f`
    pub fn reset_then<F: FnOnce()>(&self, f: F) {
        let _guard = self.reset_lock.lock();
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
        f();
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    #[test]
    fn test_ring_buffer_basic() {
        let rb = RingBuffer::new(16).unwrap();

        let data = [1, 2, 3, 4];
        assert_eq!(rb.write(&data), 4);
        assert_eq!(rb.used_bytes(), 4);

        let mut output = [0u8; 4];
        assert_eq!(rb.read(&mut output), 4);
        assert_eq!(output, data);
        assert_eq!(rb.used_bytes(), 0);
    }

    #[test]
    fn test_ring_buffer_wrap() {
        let rb = RingBuffer::new(5).unwrap();

        // 可用 4 字节
        assert_eq!(rb.write(&[1, 2, 3, 4]), 4);

        let mut output = [0u8; 2];
        assert_eq!(rb.read(&mut output), 2);
        assert_eq!(output, [1, 2]);

        // 环绕写入
        assert_eq!(rb.write(&[5, 6]), 2);

        let mut all = [0u8; 8];
        assert_eq!(rb.read(&mut all), 4);
        assert_eq!(&all[..4], &[3, 4, 5, 6]);
    }

    #[test]
    fn test_ring_buffer_full_keeps_one_slot() {
        let rb = RingBuffer::new(4).unwrap();

        assert_eq!(rb.write(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(rb.free_bytes(), 0);
        assert_eq!(rb.used_bytes(), 3);

        // 满了再写返回 0，是正常的背压信号
        assert_eq!(rb.write(&[6]), 0);
    }

    #[test]
    fn test_ring_buffer_empty() {
        let rb = RingBuffer::new(4).unwrap();
        let mut output = [0u8; 4];
        assert_eq!(rb.read(&mut output), 0);
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(RingBuffer::new(1), Err(RingBufferError::TooSmall(1))));
    }

    #[test]
    fn test_reset_empties() {
        let rb = RingBuffer::new(64).unwrap();
        rb.write(&[7; 40]);
        let mut out = [0u8; 10];
        rb.read(&mut out);

        let mut called = false;
        rb.reset_then(|| called = true);
        assert!(called);
        assert_eq!(rb.used_bytes(), 0);
        assert_eq!(rb.free_bytes(), 63);
        assert_eq!(rb.read(&mut out), 0);
    }

    #[test]
    fn test_read_then_commits_count() {
        let rb = RingBuffer::new(32).unwrap();
        rb.write(&[1; 10]);
        let mut out = [0u8; 6];
        let mut committed = 0;
        assert_eq!(rb.read_then(&mut out, |n| committed = n), 6);
        assert_eq!(committed, 6);
    }

    /// 任意读写序列下 used + free == capacity - 1，且字节按 FIFO 顺序
    #[test]
    fn test_invariant_random_ops() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let capacity = rng.gen_range(2..300);
            let rb = RingBuffer::new(capacity).unwrap();
            let mut next_write: u8 = 0;
            let mut next_read: u8 = 0;

            for _ in 0..500 {
                if rng.gen_bool(0.5) {
                    let len = rng.gen_range(0..capacity * 2);
                    let data: Vec<u8> = (0..len)
                        .map(|i| next_write.wrapping_add(i as u8))
                        .collect();
                    let n = rb.write(&data);
                    next_write = next_write.wrapping_add(n as u8);
                } else {
                    let mut out = vec![0u8; rng.gen_range(0..capacity * 2)];
                    let n = rb.read(&mut out);
                    for &b in &out[..n] {
                        assert_eq!(b, next_read);
                        next_read = next_read.wrapping_add(1);
                    }
                }
                assert_eq!(rb.used_bytes() + rb.free_bytes(), capacity - 1);
            }
        }
    }

    /// 真实的两线程 SPSC：消费者看到的字节流与生产者写入完全一致
    #[test]
    fn test_spsc_threads_fifo() {
        const TOTAL: usize = 200_000;
        let rb = Arc::new(RingBuffer::new(1024).unwrap());

        let producer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < TOTAL {
                    let chunk: Vec<u8> = (sent..(sent + 97).min(TOTAL)).map(|i| i as u8).collect();
                    let mut off = 0;
                    while off < chunk.len() {
                        let n = rb.write(&chunk[off..]);
                        if n == 0 {
                            std::thread::yield_now();
                        }
                        off += n;
                    }
                    sent += chunk.len();
                }
            })
        };

        let mut received = 0usize;
        let mut buf = [0u8; 61];
        while received < TOTAL {
            let n = rb.read(&mut buf);
            for &b in &buf[..n] {
                assert_eq!(b, received as u8);
                received += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
