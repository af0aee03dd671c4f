//! 定长环形缓冲区
//!
//! FIFO 的存储部分: start/end/count 三元组记账，本身不带任何同步。
//! 共享访问由外层 (`sync::fifo::Fifo`) 放进临界区完成，
//! 因为生产者可能是中断处理函数，不假定有原子操作可用。
//!
//! 不变量:
//! - `0 <= count <= N`
//! - `count == (end - start) mod N` (满时 end == start 且 count == N)

/// 定长环形缓冲区
///
/// # Type Parameters
/// * `T` - 元素类型
/// * `N` - 容量 (任意正整数，取模回绕)
///
/// # Example
/// ```ignore
/// let mut buf: RingBuffer<u8, 4> = RingBuffer::new();
/// assert!(buf.try_push(1));
/// assert_eq!(buf.try_pop(), Some(1));
/// ```
pub struct RingBuffer<T, const N: usize> {
    /// 数据存储
    buffer: [T; N],
    /// 读取位置
    start: usize,
    /// 写入位置
    end: usize,
    /// 当前元素数量
    count: usize,
}

impl<T: Copy + Default, const N: usize> RingBuffer<T, N> {
    /// 创建新的空环形缓冲区
    pub fn new() -> Self {
        assert!(N > 0, "N must be non-zero");

        Self {
            buffer: [T::default(); N],
            start: 0,
            end: 0,
            count: 0,
        }
    }
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    /// 当前元素数量
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.count
    }

    /// 是否为空
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 是否已满
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.count == N
    }

    /// 尝试写入单个元素
    ///
    /// # Returns
    /// - `true`: 写入成功
    /// - `false`: 缓冲区已满，内容不变
    #[inline]
    pub fn try_push(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }

        self.buffer[self.end] = value;
        self.count += 1;
        self.end = (self.end + 1) % N;
        true
    }

    /// 尝试读取单个元素
    ///
    /// # Returns
    /// - `Some(T)`: 读取成功
    /// - `None`: 缓冲区为空
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let value = self.buffer[self.start];
        self.count -= 1;
        self.start = (self.start + 1) % N;
        Some(value)
    }
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
