//! 模拟量采样流水线
//!
//! 周期回调 (10ms) 对每个通道采样一次，只把原始样本写入滑动窗口；
//! 处理线程每次运行时对整个窗口求中值，并记下上一次处理的值用于变化检测。
//! 线程落后几个采样周期时，变化仍相对于它上一次处理的值判断。
//!
//! ```text
//! PIT ──sample_channel(ch)──► window[put]
//! 线程 ──process(ch)──► old_value = value, value = median(window)
//! ```

pub mod ltc;
pub mod median;

pub use ltc::LtcAdc;

use crate::config::{ANALOG_NB_INPUTS, ANALOG_WINDOW_SIZE};
use crate::hal::Adc;

/// 单个通道的滑动窗口与滤波结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogInput {
    /// 当前滤波值
    pub value: i16,
    /// 上一次的滤波值 (变化检测)
    pub old_value: i16,
    window: [i16; ANALOG_WINDOW_SIZE],
    put: usize,
}

impl AnalogInput {
    pub const fn new() -> Self {
        Self {
            value: 0,
            old_value: 0,
            window: [0; ANALOG_WINDOW_SIZE],
            put: 0,
        }
    }

    /// 写入一个原始样本，覆盖最旧的样本
    pub fn push(&mut self, sample: i16) {
        self.window[self.put] = sample;
        self.put = (self.put + 1) % ANALOG_WINDOW_SIZE;
    }

    /// 对当前窗口滤波，旧值移入 `old_value`
    pub fn update(&mut self) {
        self.old_value = self.value;
        self.value = median::filter(&self.window);
    }

    /// 最近一次 `update` 后值是否变化
    #[inline]
    pub fn changed(&self) -> bool {
        self.value != self.old_value
    }

    pub fn window(&self) -> &[i16; ANALOG_WINDOW_SIZE] {
        &self.window
    }
}

impl Default for AnalogInput {
    fn default() -> Self {
        Self::new()
    }
}

/// 全部通道的采样状态
pub struct AnalogPipeline<A> {
    adc: A,
    inputs: [AnalogInput; ANALOG_NB_INPUTS],
}

impl<A: Adc> AnalogPipeline<A> {
    pub fn new(adc: A) -> Self {
        Self {
            adc,
            inputs: [AnalogInput::new(); ANALOG_NB_INPUTS],
        }
    }

    /// 对一个通道采样一次
    ///
    /// 通道号超出范围或 ADC 未返回数据时返回 `false`，窗口不变
    pub fn sample_channel(&mut self, channel: u8) -> bool {
        let Some(input) = self.inputs.get_mut(channel as usize) else {
            return false;
        };
        match self.adc.read(channel) {
            Some(sample) => {
                input.push(sample);
                true
            }
            None => false,
        }
    }

    /// 处理线程: 对通道窗口滤波并返回结果的副本
    pub fn process(&mut self, channel: u8) -> Option<AnalogInput> {
        let input = self.inputs.get_mut(channel as usize)?;
        input.update();
        Some(*input)
    }

    pub fn adc_mut(&mut self) -> &mut A {
        &mut self.adc
    }
}
