//! 整机场景测试: 仿真外设 + 真实调度器
//!
//! 每个测试启动一个 Tower，注册全部线程，通过仿真 UART 注入字节、
//! 触发中断入口，再检查发送出去的包和外设状态。

use embassy_futures::block_on;
use towerrtos::hal::sim::SimBoard;
use towerrtos::hal::{Led, Rtc};
use towerrtos::tower::ProtocolMode;
use towerrtos::{Kernel, KernelConfig, Packet, Scheduler, Tower, TowerConfig};

fn boot() -> Tower<SimBoard> {
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(KernelConfig::default())));
    Tower::new(kernel, SimBoard::peripherals(), TowerConfig::default()).unwrap()
}

/// 启动并运行到所有线程阻塞
macro_rules! running_tower {
    ($tower:ident, $sched:ident) => {
        let $tower = boot();
        towerrtos::pin_tower_threads!(threads = $tower);
        let mut $sched = Scheduler::new($tower.kernel());
        threads.register(&mut $sched).unwrap();
        $sched.run_until_idle();
    };
}

/// 把发送 FIFO 搬到仿真 UART 并取出全部已发送字节
fn flush(tower: &Tower<SimBoard>) -> Vec<u8> {
    tower.on_uart_interrupt();
    tower.with_uart(|uart| {
        let out = uart.transmitted().to_vec();
        uart.clear_transmitted();
        out
    })
}

/// 注入一个包，运行线程，返回回复字节
fn exchange(tower: &Tower<SimBoard>, sched: &mut Scheduler<'_>, packet: Packet) -> Vec<u8> {
    tower.with_uart(|uart| uart.feed(&packet.to_bytes()));
    tower.on_uart_interrupt();
    sched.run_until_idle();
    flush(tower)
}

fn bytes_of(packets: &[Packet]) -> Vec<u8> {
    packets.iter().flat_map(|p| p.to_bytes()).collect()
}

#[test]
fn test_startup_broadcast() {
    running_tower!(tower, sched);

    let expected = bytes_of(&[
        Packet::new(0x04, 0, 0, 0),
        Packet::new(0x09, b'v', 1, 0),
        Packet::new(0x0B, 1, 0x6E, 0x12),
        Packet::new(0x0D, 1, 1, 0),
        Packet::new(0x0A, 1, 0, 0),
    ]);
    assert_eq!(flush(&tower), expected);
    assert_eq!(block_on(tower.tower_number()), Ok(4718));
    assert_eq!(block_on(tower.tower_mode()), Ok(1));
    assert!(tower.with_leds(|leds| leds.is_on(Led::Orange)));
    assert_eq!(sched.run_until_idle(), 0);
}

#[test]
fn test_startup_command_repeats_broadcast() {
    running_tower!(tower, sched);
    let startup = flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x04, 0, 0, 0));
    assert_eq!(reply, startup);

    let rejected = exchange(&tower, &mut sched, Packet::new(0x84, 1, 0, 0));
    assert_eq!(rejected, Packet::new(0x04, 1, 0, 0).to_bytes());
}

#[test]
fn test_set_then_get_tower_number() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x0B, 2, 0xAE, 0x12));
    assert!(reply.is_empty());
    assert_eq!(block_on(tower.tower_number()), Ok(0x12AE));

    let reply = exchange(&tower, &mut sched, Packet::new(0x0B, 1, 0, 0));
    assert_eq!(reply, Packet::new(0x0B, 1, 0xAE, 0x12).to_bytes());
}

#[test]
fn test_tower_mode_get_and_set() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x8D, 2, 0x02, 0x00));
    assert_eq!(reply, Packet::new(0x8D, 2, 0x02, 0x00).to_bytes());
    assert_eq!(block_on(tower.tower_mode()), Ok(2));
    // tower number 与 mode 共用一个短语，写 mode 不能破坏 number
    assert_eq!(block_on(tower.tower_number()), Ok(4718));

    let reply = exchange(&tower, &mut sched, Packet::new(0x0D, 1, 0, 0));
    assert_eq!(reply, Packet::new(0x0D, 1, 2, 0).to_bytes());
}

#[test]
fn test_version_with_acknowledgement() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x89, b'v', b'x', b'\r'));
    let expected = bytes_of(&[
        Packet::new(0x09, b'v', 1, 0),
        Packet::new(0x89, b'v', b'x', b'\r'),
    ]);
    assert_eq!(reply, expected);
}

#[test]
fn test_malformed_time_is_nacked() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x8C, 0x1E, 0, 0));
    assert_eq!(reply, Packet::new(0x0C, 0x1E, 0, 0).to_bytes());
    assert_eq!(tower.with_rtc(|rtc| rtc.seconds()), 0);
}

#[test]
fn test_set_time_then_rtc_broadcast() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x0C, 13, 45, 10));
    assert!(reply.is_empty());

    tower.with_rtc(|rtc| rtc.advance(1));
    tower.on_rtc_interrupt();
    sched.run_until_idle();

    assert_eq!(flush(&tower), Packet::new(0x0C, 13, 45, 11).to_bytes());
    assert_eq!(tower.with_leds(|leds| leds.toggle_count(Led::Yellow)), 1);
}

#[test]
fn test_unknown_command_nacked() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x85, 1, 2, 3));
    assert_eq!(reply, Packet::new(0x05, 1, 2, 3).to_bytes());

    // 无应答请求时不回复
    let reply = exchange(&tower, &mut sched, Packet::new(0x05, 1, 2, 3));
    assert!(reply.is_empty());
}

#[test]
fn test_flash_program_read_and_erase() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x87, 5, 0, 0x5A));
    assert_eq!(reply, Packet::new(0x87, 5, 0, 0x5A).to_bytes());

    let reply = exchange(&tower, &mut sched, Packet::new(0x08, 5, 0, 0));
    assert_eq!(reply, Packet::new(0x08, 5, 0, 0x5A).to_bytes());

    // 偏移越界
    let reply = exchange(&tower, &mut sched, Packet::new(0x88, 8, 0, 0));
    assert_eq!(reply, Packet::new(0x08, 8, 0, 0).to_bytes());

    let reply = exchange(&tower, &mut sched, Packet::new(0x07, 8, 0, 0));
    assert!(reply.is_empty());
    assert_eq!(block_on(tower.tower_number()), Ok(0xFFFF));

    let reply = exchange(&tower, &mut sched, Packet::new(0x08, 5, 0, 0));
    assert_eq!(reply, Packet::new(0x08, 5, 0, 0xFF).to_bytes());
}

#[test]
fn test_protocol_mode_get_and_set() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x8A, 2, 1, 0));
    assert_eq!(reply, Packet::new(0x8A, 2, 1, 0).to_bytes());
    assert_eq!(tower.protocol_mode(), ProtocolMode::Synchronous);

    let reply = exchange(&tower, &mut sched, Packet::new(0x8A, 2, 2, 0));
    assert_eq!(reply, Packet::new(0x0A, 2, 2, 0).to_bytes());
    assert_eq!(tower.protocol_mode(), ProtocolMode::Synchronous);

    let reply = exchange(&tower, &mut sched, Packet::new(0x0A, 1, 0, 0));
    assert_eq!(reply, Packet::new(0x0A, 1, 1, 0).to_bytes());
}

#[test]
fn test_blue_led_times_out() {
    running_tower!(tower, sched);
    flush(&tower);
    assert!(!tower.with_leds(|leds| leds.is_on(Led::Blue)));

    exchange(&tower, &mut sched, Packet::new(0x0A, 1, 0, 0));
    assert!(tower.with_leds(|leds| leds.is_on(Led::Blue)));

    tower.with_ftm(|ftm| ftm.hw_mut().advance(32_767));
    tower.on_ftm_interrupt();
    sched.run_until_idle();
    assert!(tower.with_leds(|leds| leds.is_on(Led::Blue)));

    tower.with_ftm(|ftm| ftm.hw_mut().advance(1));
    tower.on_ftm_interrupt();
    sched.run_until_idle();
    assert!(!tower.with_leds(|leds| leds.is_on(Led::Blue)));
}

#[test]
fn test_corrupted_bytes_resync() {
    running_tower!(tower, sched);
    flush(&tower);

    let mut stream = vec![0x00, 0x42];
    stream.extend_from_slice(&Packet::new(0x0B, 1, 0, 0).to_bytes());
    tower.with_uart(|uart| uart.feed(&stream));
    tower.on_uart_interrupt();
    sched.run_until_idle();

    assert_eq!(flush(&tower), Packet::new(0x0B, 1, 0x6E, 0x12).to_bytes());
    assert!(tower.codec().resyncs() >= 1);
}

#[test]
fn test_analog_synchronous_broadcast() {
    running_tower!(tower, sched);
    flush(&tower);
    tower.set_protocol_mode(ProtocolMode::Synchronous);
    tower.with_adc(|adc| adc.set(0, 1000));

    tower.with_pit(|pit| pit.timer_mut().fire());
    tower.on_pit_interrupt();
    sched.run_until_idle();

    // 通道 1 优先级更高，先发送；窗口中只有一个非零样本，中值仍为 0
    let expected = bytes_of(&[
        Packet::new(0x50, 1, 0, 0),
        Packet::new(0x50, 0, 0, 0),
    ]);
    assert_eq!(flush(&tower), expected);
}

#[test]
fn test_analog_asynchronous_reports_changes_only() {
    running_tower!(tower, sched);
    flush(&tower);
    assert_eq!(tower.protocol_mode(), ProtocolMode::Asynchronous);
    tower.with_adc(|adc| adc.set(0, 1000));

    let mut sent = Vec::new();
    for _ in 0..4 {
        tower.with_pit(|pit| pit.timer_mut().fire());
        tower.on_pit_interrupt();
        sched.run_until_idle();
        sent.push(flush(&tower));
    }

    // 第三个样本后中值变为 1000，之后不再变化
    assert!(sent[0].is_empty());
    assert!(sent[1].is_empty());
    assert_eq!(sent[2], Packet::with_parameter23(0x50, 0, 1000).to_bytes());
    assert!(sent[3].is_empty());
}

#[test]
fn test_analog_asynchronous_change_seen_by_lagging_thread() {
    running_tower!(tower, sched);
    flush(&tower);
    tower.with_adc(|adc| adc.set(0, 1000));

    // 线程落后四个采样周期才运行
    for _ in 0..4 {
        tower.with_pit(|pit| pit.timer_mut().fire());
        tower.on_pit_interrupt();
    }
    sched.run_until_idle();

    assert_eq!(flush(&tower), Packet::with_parameter23(0x50, 0, 1000).to_bytes());
}

#[test]
fn test_interrupt_bytes_reach_protocol_thread_in_one_run() {
    running_tower!(tower, sched);
    flush(&tower);

    // 两个包的字节分两次中断到达，其间线程不运行
    let first = Packet::new(0x0B, 1, 0, 0).to_bytes();
    let second = Packet::new(0x0D, 1, 0, 0).to_bytes();
    tower.with_uart(|uart| uart.feed(&first));
    tower.on_uart_interrupt();
    tower.with_uart(|uart| uart.feed(&second));
    tower.on_uart_interrupt();
    sched.run_until_idle();

    let expected = bytes_of(&[
        Packet::new(0x0B, 1, 0x6E, 0x12),
        Packet::new(0x0D, 1, 1, 0),
    ]);
    assert_eq!(flush(&tower), expected);
}

#[test]
fn test_set_tower_number_keeps_mode_slot() {
    running_tower!(tower, sched);
    flush(&tower);

    let reply = exchange(&tower, &mut sched, Packet::new(0x8B, 2, 0x34, 0x12));
    assert_eq!(reply, Packet::new(0x8B, 2, 0x34, 0x12).to_bytes());
    let stored = block_on(tower.with_nv(|nv| {
        let start = nv.config().data_start;
        (nv.read_u16(start), nv.read_u16(start + 2))
    }));
    assert_eq!(stored, (Ok(1), Ok(0x1234)));
}

#[test]
fn test_green_led_toggles_every_fifty_samples() {
    running_tower!(tower, sched);
    flush(&tower);

    for _ in 0..100 {
        tower.with_pit(|pit| pit.timer_mut().fire());
        tower.on_pit_interrupt();
        sched.run_until_idle();
    }
    assert_eq!(tower.with_leds(|leds| leds.toggle_count(Led::Green)), 2);
}
