//! PIT 周期定时器驱动

use embassy_time::Duration;

use super::{Callback, PeriodicTimer};
use crate::util::log::*;

/// 周期中断驱动
pub struct Pit<T> {
    timer: T,
    module_clock_hz: u32,
}

impl<T: PeriodicTimer> Pit<T> {
    pub fn new(timer: T, module_clock_hz: u32) -> Self {
        Self {
            timer,
            module_clock_hz,
        }
    }

    /// 设置周期并启动
    ///
    /// `restart` 为真时先停止计数，使新周期立即生效
    pub fn set(&mut self, period: Duration, restart: bool) {
        if restart {
            self.timer.enable(false);
        }
        let cycles = self.period_to_cycles(period);
        self.timer.load(cycles);
        self.timer.enable(true);
        log_debug!("pit: period {} us = {} cycles", period.as_micros(), cycles);
    }

    pub fn enable(&mut self, enabled: bool) {
        self.timer.enable(enabled);
    }

    /// 中断服务: 清标志并回调
    pub fn on_interrupt(&mut self, callback: &impl Callback) -> bool {
        if !self.timer.take_interrupt() {
            return false;
        }
        callback.on_fire();
        true
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    /// 计数器从 LDVAL 倒数到 0 共 LDVAL + 1 个周期
    fn period_to_cycles(&self, period: Duration) -> u32 {
        let cycles = period.as_micros() * u64::from(self.module_clock_hz) / 1_000_000;
        cycles.saturating_sub(1).min(u64::from(u32::MAX)) as u32
    }
}
