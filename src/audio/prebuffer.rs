//! 预缓冲控制
//!
//! 打开流或 flush 之后处于 Prebuffering，消费者每次准备取数据时按缓冲区占用
//! 电平触发地重新评估，不使用计时器：
//! - 占用达到阈值 → Playing
//! - 设备仍在发声（上一首的尾巴还在硬件里）且允许强制 → 立即 Playing
//!
//! Playing 只会被显式 flush 打回 Prebuffering。
//! 缓冲区暂时被抽空（解码卡顿）仍然保持 Playing。

use std::sync::atomic::{AtomicU8, Ordering};

/// 预缓冲状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrebufferState {
    Prebuffering,
    Playing,
}

const PREBUFFERING: u8 = 0;
const PLAYING: u8 = 1;

/// 预缓冲状态机
pub struct PrebufferController {
    state: AtomicU8,
    /// 进入 Playing 所需的最少缓冲字节
    threshold: usize,
    /// 设备仍在发声时跳过等待
    force_when_rendering: bool,
}

impl PrebufferController {
    pub fn new(threshold: usize, force_when_rendering: bool) -> Self {
        Self {
            state: AtomicU8::new(PREBUFFERING),
            threshold,
            force_when_rendering,
        }
    }

    /// 按缓冲区容量百分比构造
    pub fn with_percent(usable_capacity: usize, percent: u8, force_when_rendering: bool) -> Self {
        let percent = percent.min(100) as usize;
        Self::new(usable_capacity * percent / 100, force_when_rendering)
    }

    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[inline]
    pub fn state(&self) -> PrebufferState {
        match self.state.load(Ordering::Acquire) {
            PLAYING => PrebufferState::Playing,
            _ => PrebufferState::Prebuffering,
        }
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state() == PrebufferState::Playing
    }

    /// 重新评估（消费者调用）
    ///
    /// `used`: 当前缓冲字节，`device_rendering`: 设备是否仍在发声
    pub fn evaluate(&self, used: usize, device_rendering: bool) -> PrebufferState {
        if self.is_playing() {
            return PrebufferState::Playing;
        }

        let reached = used >= self.threshold;
        let forced = self.force_when_rendering && device_rendering;
        if reached || forced {
            self.transition_to_playing(if reached {
                "threshold reached"
            } else {
                "device still rendering"
            });
            return PrebufferState::Playing;
        }

        PrebufferState::Prebuffering
    }

    /// 回到 Prebuffering（只由 flush/open 调用）
    pub fn reset(&self) {
        self.state.store(PREBUFFERING, Ordering::Release);
    }

    /// 流已结束（不会再有写入）时强制开始，短于阈值的曲目也能播完
    pub fn force_start(&self) {
        self.transition_to_playing("end of stream");
    }

    fn transition_to_playing(&self, reason: &str) {
        if self
            .state
            .compare_exchange(PREBUFFERING, PLAYING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::info!("Prebuffer complete ({})", reason);
        }
    }
}
