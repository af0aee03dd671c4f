//! FlexTimer 通道驱动
//!
//! 每个通道可绑定一个信号量，通道触发时由中断 `signal`。
//! 重新绑定同一通道会直接覆盖旧的信号量，不做冲突检测。

use super::FtmHw;
use crate::config::FTM_NB_CHANNELS;
use crate::kernel::Semaphore;
use crate::util::log::*;

/// 通道功能
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum TimerFunction {
    InputCapture,
    OutputCompare,
}

/// 通道设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct TimerChannel {
    pub channel: u8,
    pub function: TimerFunction,
    /// 输出比较的延时 (计数器周期)
    pub delay_counts: u16,
}

/// FlexTimer 驱动
pub struct Ftm<H> {
    hw: H,
    bindings: [Option<Semaphore>; FTM_NB_CHANNELS],
}

impl<H: FtmHw> Ftm<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            bindings: [None; FTM_NB_CHANNELS],
        }
    }

    /// 配置通道并绑定信号量
    pub fn set(&mut self, channel: &TimerChannel, semaphore: Semaphore) -> bool {
        let index = channel.channel as usize;
        if index >= FTM_NB_CHANNELS {
            return false;
        }
        if self.bindings[index].is_some() {
            log_debug!("ftm: rebinding channel {}", index);
        }
        self.bindings[index] = Some(semaphore);
        self.hw.configure(channel.channel, channel.function);
        true
    }

    /// 启动一次输出比较: 当前计数 + 延时
    pub fn start_timer(&mut self, channel: &TimerChannel) -> bool {
        if channel.function != TimerFunction::OutputCompare
            || channel.channel as usize >= FTM_NB_CHANNELS
        {
            return false;
        }
        let compare = self.hw.counter().wrapping_add(channel.delay_counts);
        self.hw.set_compare(channel.channel, compare);
        true
    }

    /// 中断服务: 每次只处理一个已绑定的触发通道
    pub fn on_interrupt(&mut self) -> bool {
        while let Some(channel) = self.hw.take_pending() {
            if let Some(semaphore) = self.bindings.get(channel as usize).copied().flatten() {
                semaphore.signal();
                self.hw.detach(channel);
                return true;
            }
        }
        false
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimFtm;
    use crate::kernel::{leak_kernel, KernelConfig};

    const LED_CHANNEL: TimerChannel = TimerChannel {
        channel: 0,
        function: TimerFunction::OutputCompare,
        delay_counts: 100,
    };

    #[test]
    fn test_output_compare_signals_once() {
        let kernel = leak_kernel(KernelConfig::default());
        let sem = kernel.semaphore_create(0).unwrap();
        let mut ftm = Ftm::new(SimFtm::new());

        assert!(ftm.set(&LED_CHANNEL, sem));
        assert!(ftm.start_timer(&LED_CHANNEL));

        ftm.hw_mut().advance(99);
        assert!(!ftm.on_interrupt());
        ftm.hw_mut().advance(1);
        assert!(ftm.on_interrupt());
        assert_eq!(sem.count(), 1);

        ftm.hw_mut().advance(1000);
        assert!(!ftm.on_interrupt());
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_rebinding_replaces_semaphore() {
        let kernel = leak_kernel(KernelConfig::default());
        let first = kernel.semaphore_create(0).unwrap();
        let second = kernel.semaphore_create(0).unwrap();
        let mut ftm = Ftm::new(SimFtm::new());

        ftm.set(&LED_CHANNEL, first);
        ftm.set(&LED_CHANNEL, second);
        ftm.start_timer(&LED_CHANNEL);
        ftm.hw_mut().advance(100);
        ftm.on_interrupt();

        assert_eq!(first.count(), 0);
        assert_eq!(second.count(), 1);
    }

    #[test]
    fn test_invalid_channels_rejected() {
        let kernel = leak_kernel(KernelConfig::default());
        let sem = kernel.semaphore_create(0).unwrap();
        let mut ftm = Ftm::new(SimFtm::new());

        let out_of_range = TimerChannel {
            channel: FTM_NB_CHANNELS as u8,
            ..LED_CHANNEL
        };
        assert!(!ftm.set(&out_of_range, sem));

        let capture = TimerChannel {
            function: TimerFunction::InputCapture,
            ..LED_CHANNEL
        };
        assert!(ftm.set(&capture, sem));
        assert!(!ftm.start_timer(&capture));
    }

    #[test]
    fn test_compare_wraps_counter() {
        let kernel = leak_kernel(KernelConfig::default());
        let sem = kernel.semaphore_create(0).unwrap();
        let mut ftm = Ftm::new(SimFtm::new());

        ftm.hw_mut().advance(u32::from(u16::MAX) - 10);
        ftm.set(&LED_CHANNEL, sem);
        ftm.start_timer(&LED_CHANNEL);
        ftm.hw_mut().advance(100);
        assert!(ftm.on_interrupt());
    }
}
