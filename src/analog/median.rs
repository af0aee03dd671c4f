//! 中值滤波

use crate::config::ANALOG_WINDOW_SIZE;

/// 对窗口求中值 (不修改输入)
///
/// 空窗口返回 0；偶数个样本取中间两个的平均值 (向零取整)。
/// 只看前 `ANALOG_WINDOW_SIZE` 个样本。
pub fn filter(samples: &[i16]) -> i16 {
    let mut sorted = [0i16; ANALOG_WINDOW_SIZE];
    let n = samples.len().min(ANALOG_WINDOW_SIZE);
    let sorted = &mut sorted[..n];
    sorted.copy_from_slice(&samples[..n]);
    sorted.sort_unstable();

    match n {
        0 => 0,
        n if n % 2 == 1 => sorted[n / 2],
        n => ((i32::from(sorted[n / 2 - 1]) + i32::from(sorted[n / 2])) / 2) as i16,
    }
}
