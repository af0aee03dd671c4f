//! 5 字节定长包协议
//!
//! 线上格式 (无分隔符):
//!
//! ```text
//! [command][parameter1][parameter2][parameter3][checksum]
//! checksum = command ^ parameter1 ^ parameter2 ^ parameter3
//! ```
//!
//! command 的最高位是 ACK 请求标志。解码器校验失败时丢弃最早的一个字节
//! 继续收集，依靠校验和重新找回帧边界。

use core::cell::RefCell;

use crate::config::PACKET_SIZE;
use crate::kernel::{Kernel, KernelError, Semaphore};
use crate::serial::{SerialChannel, UartPort};
use crate::sync::primitives::CriticalMutex;
use crate::util::log::*;

/// command 最高位: 请求应答
pub const ACK_MASK: u8 = 0x80;

/// 已解码的数据包
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct Packet {
    pub command: u8,
    pub parameter1: u8,
    pub parameter2: u8,
    pub parameter3: u8,
}

impl Packet {
    pub const fn new(command: u8, parameter1: u8, parameter2: u8, parameter3: u8) -> Self {
        Self {
            command,
            parameter1,
            parameter2,
            parameter3,
        }
    }

    /// parameter2 为低字节、parameter3 为高字节的 16 位值
    pub const fn with_parameter23(command: u8, parameter1: u8, value: u16) -> Self {
        let [lo, hi] = value.to_le_bytes();
        Self::new(command, parameter1, lo, hi)
    }

    /// 小端 16 位视图 (parameter2 = 低字节)
    #[inline]
    pub const fn parameter23(&self) -> u16 {
        u16::from_le_bytes([self.parameter2, self.parameter3])
    }

    #[inline]
    pub const fn checksum(&self) -> u8 {
        self.command ^ self.parameter1 ^ self.parameter2 ^ self.parameter3
    }

    /// 编码为线上 5 字节
    pub const fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        [
            self.command,
            self.parameter1,
            self.parameter2,
            self.parameter3,
            self.checksum(),
        ]
    }

    /// 去掉 ACK 位后的命令字
    #[inline]
    pub const fn command_id(&self) -> u8 {
        self.command & !ACK_MASK
    }

    #[inline]
    pub const fn ack_requested(&self) -> bool {
        self.command & ACK_MASK != 0
    }

    /// 应答回显: 原包，最高位换成处理结果 (1 = ACK, 0 = NAK)
    pub const fn acknowledgement(&self, success: bool) -> Self {
        let flag = if success { ACK_MASK } else { 0 };
        Self::new(
            self.command_id() | flag,
            self.parameter1,
            self.parameter2,
            self.parameter3,
        )
    }
}

/// 逐字节解码状态机
///
/// 缓冲区在两次调用之间始终少于 5 字节: 满 5 字节时要么提交 (清零)，
/// 要么丢弃最早的字节 (剩 4 字节)。
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: [u8; PACKET_SIZE],
    len: usize,
    resyncs: u32,
}

impl PacketDecoder {
    pub const fn new() -> Self {
        Self {
            buffer: [0; PACKET_SIZE],
            len: 0,
            resyncs: 0,
        }
    }

    /// 送入一个字节，校验通过时返回完整的包
    pub fn push(&mut self, byte: u8) -> Option<Packet> {
        self.buffer[self.len] = byte;
        self.len += 1;

        if self.len < PACKET_SIZE {
            return None;
        }

        let [command, parameter1, parameter2, parameter3, checksum] = self.buffer;
        let candidate = Packet::new(command, parameter1, parameter2, parameter3);
        if candidate.checksum() == checksum {
            self.len = 0;
            Some(candidate)
        } else {
            self.buffer.copy_within(1.., 0);
            self.len = PACKET_SIZE - 1;
            self.resyncs = self.resyncs.wrapping_add(1);
            log_debug!("packet: checksum mismatch, discarding 0x{:x}", command);
            None
        }
    }

    /// 已收集但未校验的字节数
    #[inline]
    pub fn pending(&self) -> usize {
        self.len
    }

    /// 累计丢弃字节数
    #[inline]
    pub fn resyncs(&self) -> u32 {
        self.resyncs
    }
}

/// 包收发器
///
/// 接收: 单消费者 (协议线程)；发送: 多线程，以容量为 1 的信号量互斥，
/// 保证 5 个字节连续进入发送 FIFO。
pub struct PacketCodec<P> {
    serial: SerialChannel<P>,
    decoder: CriticalMutex<RefCell<PacketDecoder>>,
    put_mutex: Semaphore,
}

impl<P: UartPort> PacketCodec<P> {
    pub fn new(kernel: &'static Kernel, serial: SerialChannel<P>) -> Result<Self, KernelError> {
        Ok(Self {
            serial,
            decoder: CriticalMutex::new(RefCell::new(PacketDecoder::new())),
            put_mutex: kernel.semaphore_create_bounded(1, 1)?,
        })
    }

    /// 底层串口通道 (中断服务函数使用)
    #[inline]
    pub fn serial(&self) -> &SerialChannel<P> {
        &self.serial
    }

    /// 阻塞接收，直到一个包通过校验
    pub async fn get(&self) -> Packet {
        loop {
            let byte = self.serial.in_char().await;
            if let Some(packet) = self.feed(byte) {
                return packet;
            }
        }
    }

    /// 轮询接收: 处理接收 FIFO 中已有的字节，不等待
    pub fn poll_get(&self) -> Option<Packet> {
        while let Some(byte) = self.serial.try_in_char() {
            if let Some(packet) = self.feed(byte) {
                return Some(packet);
            }
        }
        None
    }

    /// 发送一个包
    ///
    /// 所有字节都进入发送 FIFO 才返回 `true`；某个字节失败后不再继续。
    pub async fn put(&self, packet: Packet) -> bool {
        if self.put_mutex.wait_forever().await.is_err() {
            fatal!("packet: put mutex wait failed");
        }

        let sent = packet.to_bytes().iter().all(|&byte| self.serial.out_char(byte));

        self.put_mutex.signal_and_yield().await;
        sent
    }

    /// 累计的重同步次数
    pub fn resyncs(&self) -> u32 {
        self.decoder.lock(|d| d.borrow().resyncs())
    }

    fn feed(&self, byte: u8) -> Option<Packet> {
        self.decoder.lock(|d| d.borrow_mut().push(byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimUart;
    use crate::kernel::{leak_kernel, KernelConfig};
    use crate::serial::BaudRate;
    use embassy_futures::block_on;

    fn codec() -> PacketCodec<SimUart> {
        let kernel = leak_kernel(KernelConfig::default());
        let serial =
            SerialChannel::new(kernel, SimUart::new(), BaudRate::Baud38400, 50_000_000).unwrap();
        PacketCodec::new(kernel, serial).unwrap()
    }

    fn decode_all(decoder: &mut PacketDecoder, bytes: &[u8]) -> std::vec::Vec<Packet> {
        bytes.iter().filter_map(|&b| decoder.push(b)).collect()
    }

    #[test]
    fn test_parameter23_is_little_endian() {
        let packet = Packet::new(0x0B, 2, 0xAE, 0x12);
        assert_eq!(packet.parameter23(), 0x12AE);
        assert_eq!(Packet::with_parameter23(0x0B, 1, 0x12AE), Packet::new(0x0B, 1, 0xAE, 0x12));
    }

    #[test]
    fn test_acknowledgement_replaces_top_bit() {
        let packet = Packet::new(0x89, b'v', b'x', b'\r');
        assert!(packet.ack_requested());
        assert_eq!(packet.command_id(), 0x09);
        assert_eq!(packet.acknowledgement(true).command, 0x89);
        assert_eq!(packet.acknowledgement(false).command, 0x09);
        assert_eq!(packet.acknowledgement(false).parameter3, b'\r');
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let packet = Packet::new(0x0C, 23, 59, 58);
        let mut decoder = PacketDecoder::new();
        assert_eq!(decode_all(&mut decoder, &packet.to_bytes()), [packet]);
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.resyncs(), 0);
    }

    #[test]
    fn test_single_corrupt_byte_resyncs_once() {
        let mut decoder = PacketDecoder::new();
        let mut stream = std::vec![0xAA];
        stream.extend_from_slice(&Packet::new(0x0B, 1, 0, 0).to_bytes());

        assert_eq!(decode_all(&mut decoder, &stream), [Packet::new(0x0B, 1, 0, 0)]);
        assert_eq!(decoder.resyncs(), 1);
    }

    #[test]
    fn test_pending_never_reaches_packet_size() {
        let mut decoder = PacketDecoder::new();
        for b in 0..=255u8 {
            decoder.push(b.wrapping_mul(37));
            assert!(decoder.pending() < PACKET_SIZE);
        }
    }

    /// 已知弱点: 残留字节与下一个包的前 4 字节恰好满足校验时，
    /// 解码器会接受一个错位的假包
    #[test]
    fn test_false_boundary_is_accepted() {
        let real = Packet::new(0x0B, 0x01, 0xAE, 0x12);
        // 上一个相同包残留的校验字节
        let stray = real.checksum();
        assert_eq!(stray, 0xB6);

        let mut decoder = PacketDecoder::new();
        let mut stream = std::vec![stray];
        stream.extend_from_slice(&real.to_bytes());

        let decoded = decode_all(&mut decoder, &stream);
        assert_eq!(decoded, [Packet::new(0xB6, 0x0B, 0x01, 0xAE)]);
        assert_eq!(decoder.resyncs(), 0);
        assert_eq!(decoder.pending(), 1);
    }

    #[test]
    fn test_put_emits_checksummed_bytes() {
        let codec = codec();
        assert!(block_on(codec.put(Packet::new(0x04, 0, 0, 0))));
        assert!(block_on(codec.put(Packet::new(0x0B, 1, 0xAE, 0x12))));
        codec.serial().on_interrupt();

        assert_eq!(
            codec.serial().with_port(|p| p.transmitted().to_vec()),
            [0x04, 0, 0, 0, 0x04, 0x0B, 1, 0xAE, 0x12, 0xB6]
        );
    }

    #[test]
    fn test_put_reports_full_fifo() {
        let codec = codec();
        let mut results = std::vec::Vec::new();
        for _ in 0..(crate::config::FIFO_SIZE / PACKET_SIZE + 1) {
            results.push(block_on(codec.put(Packet::new(0x50, 0, 1, 2))));
        }
        assert!(results[..results.len() - 1].iter().all(|&ok| ok));
        assert_eq!(results.last(), Some(&false));
    }

    #[test]
    fn test_get_and_poll_get() {
        let codec = codec();
        codec.serial().with_port(|p| {
            p.feed(&[0x13]);
            p.feed(&Packet::new(0x0A, 1, 0, 0).to_bytes());
            p.feed(&Packet::new(0x0C, 1, 2, 3).to_bytes());
        });
        codec.serial().on_interrupt();

        assert_eq!(block_on(codec.get()), Packet::new(0x0A, 1, 0, 0));
        assert_eq!(codec.resyncs(), 1);
        assert_eq!(codec.poll_get(), Some(Packet::new(0x0C, 1, 2, 3)));
        assert_eq!(codec.poll_get(), None);
    }
}
