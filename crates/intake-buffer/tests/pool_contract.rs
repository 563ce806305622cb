//! `pool_contract` 集成测试：验证 `SlabPacketPool` 在公开 API 下的租借、回收与上限契约。
//!
//! # 测试目标（Why）
//! - 收包循环依赖“池耗尽立即失败、回收后立即可用”两条语义，任何回归都会表现为丢包或阻塞；
//! - 通过外部 crate 视角调用，避免依赖内部实现细节。
//!
//! # 结构安排（How）
//! - `packets_have_fixed_capacity_and_fresh_state`：检查租借出的报文形态；
//! - `shrink_releases_only_idle_buffers`：自由链表收缩不影响在外租约；
//! - `lease_accounting_holds_for_any_sequence`：以性质测试覆盖任意租借/归还序列。

use intake_buffer::{PoolConfig, SlabPacketPool};
use intake_core::{PacketPool, PacketStatus};
use proptest::prelude::*;

/// 租借出的报文必须是“干净”的：容量固定、长度为零、无端点。
#[test]
fn packets_have_fixed_capacity_and_fresh_state() {
    let pool = SlabPacketPool::new(PoolConfig {
        packet_capacity: 1500,
        max_packets: 2,
    });
    let mut packet = pool.acquire().expect("租借报文");
    assert_eq!(packet.capacity(), 1500);
    assert_eq!(packet.status(), PacketStatus::Acquired);
    assert!(packet.endpoint().is_none());
    assert!(packet.is_pooled());

    packet.mark_received(4, "127.0.0.1:9000".parse::<std::net::SocketAddr>().expect("解析地址").into());
    packet.recycle();

    let again = pool.acquire().expect("复用报文");
    assert_eq!(again.len(), 0);
    assert!(again.endpoint().is_none());
    assert_eq!(pool.statistics().allocated, 1);
}

/// 验证 `shrink_to_fit` 只清空空闲缓冲。
///
/// # 步骤说明（How）
/// 1. 租借两个报文并归还其中一个；
/// 2. 收缩后空闲数为 0，已分配数只剩仍在外的那一个；
/// 3. 归还剩余报文后再次租借，池应重新分配。
#[test]
fn shrink_releases_only_idle_buffers() {
    let pool = SlabPacketPool::new(PoolConfig {
        packet_capacity: 64,
        max_packets: 4,
    });
    let first = pool.acquire().expect("租借第一个");
    let second = pool.acquire().expect("租借第二个");
    first.recycle();

    assert_eq!(pool.shrink_to_fit(), 64);
    let stats = pool.statistics();
    assert_eq!(stats.free_slots, 0);
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.active_leases, 1);

    drop(second);
    let _third = pool.acquire().expect("收缩后仍可租借");
    assert_eq!(pool.statistics().allocated, 1);
}

#[derive(Clone, Debug)]
enum Op {
    Acquire,
    Recycle(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Acquire), any::<usize>().prop_map(Op::Recycle)]
}

proptest! {
    /// 任意租借/归还序列下：在外租约数等于累计租借减累计归还，分配量永不越过上限。
    #[test]
    fn lease_accounting_holds_for_any_sequence(
        max_packets in 1usize..8,
        ops in proptest::collection::vec(op(), 0..64),
    ) {
        let pool = SlabPacketPool::new(PoolConfig { packet_capacity: 16, max_packets });
        let mut held = Vec::new();
        for op in ops {
            match op {
                Op::Acquire => match pool.acquire() {
                    Ok(packet) => held.push(packet),
                    Err(_) => prop_assert_eq!(held.len(), max_packets),
                },
                Op::Recycle(index) if !held.is_empty() => {
                    let packet = held.swap_remove(index % held.len());
                    packet.recycle();
                }
                Op::Recycle(_) => {}
            }
            let stats = pool.statistics();
            prop_assert_eq!(stats.active_leases, held.len());
            prop_assert_eq!(stats.acquired - stats.recycled, held.len() as u64);
            prop_assert!(stats.allocated <= max_packets);
            prop_assert_eq!(stats.allocated, stats.active_leases + stats.free_slots);
        }
    }
}
