use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use intake_core::{
    IntakeError, Packet, PacketPool, PacketRecycler, PoolStats, Result, SettingsStore,
};

/// 缓冲池参数。
///
/// - `packet_capacity`：每个报文缓冲的固定字节数，超出部分的数据报会被截断；
/// - `max_packets`：同时存在的缓冲上限（在外租约 + 空闲）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    pub packet_capacity: usize,
    pub max_packets: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            packet_capacity: 2048,
            max_packets: 256,
        }
    }
}

impl PoolConfig {
    /// 从配置读取 `pool.packet-capacity` 与 `pool.max-packets`，缺省时使用默认值。
    ///
    /// 任一值为 0 视为配置错误。
    pub fn from_settings(settings: &SettingsStore) -> Result<Self> {
        let defaults = Self::default();
        let packet_capacity =
            settings.get_parsed_or("pool.packet-capacity", defaults.packet_capacity)?;
        let max_packets = settings.get_parsed_or("pool.max-packets", defaults.max_packets)?;
        let config = Self {
            packet_capacity,
            max_packets,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.packet_capacity == 0 {
            return Err(IntakeError::invalid_setting(
                "pool.packet-capacity",
                "0",
                "packet capacity must be positive",
            ));
        }
        if self.max_packets == 0 {
            return Err(IntakeError::invalid_setting(
                "pool.max-packets",
                "0",
                "pool must hold at least one packet",
            ));
        }
        Ok(())
    }
}

/// `SlabPacketPool` 以自由链表复用定长报文缓冲。
///
/// # 模块角色（Why）
/// - 作为 `intake_core::PacketPool` 的默认实现，为收包循环提供稳定的报文来源；
/// - 借助 [`Packet`] 的回收钩子，在 `recycle` 或 `Drop` 时自动归还缓冲，调用方无需关心回收细节。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先复用；
/// - 链表为空且总量未达上限时才新分配，分配计数用 CAS 维护，保证并发租借也不会越过上限；
/// - `PoolMetrics` 以原子计数跟踪租借、回收、失败次数，支撑 `statistics` 快照。
///
/// # 契约说明（What）
/// - **线程安全**：满足 `Send + Sync + 'static`，可被多个模块共享；
/// - **后置条件**：`acquire` 返回的报文容量恒等于 `packet_capacity`，状态为 `Acquired`；
/// - **失败语义**：缓冲总量达到上限且无空闲时返回 [`IntakeError::PoolExhausted`]。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁而非 `parking_lot::Mutex`：临界区只有一次 `push`/`pop`，自旋代价可忽略；
/// - `shrink_to_fit` 采取“清空自由链表”的简单策略，便于在突发流量后归还峰值内存。
#[derive(Clone)]
pub struct SlabPacketPool {
    inner: Arc<PoolInner>,
}

impl Default for SlabPacketPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl SlabPacketPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                free_list: Mutex::new(Vec::new()),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// 释放全部空闲缓冲，返回归还的字节数。在外租约不受影响。
    pub fn shrink_to_fit(&self) -> usize {
        let released = {
            let mut list = self.inner.free_list.lock();
            let count = list.len();
            list.clear();
            count
        };
        saturating_sub(&self.inner.metrics.allocated, released);
        let bytes = released * self.inner.config.packet_capacity;
        if released > 0 {
            tracing::debug!(released, bytes, "packet pool shrunk");
        }
        bytes
    }
}

impl PacketPool for SlabPacketPool {
    fn acquire(&self) -> Result<Packet> {
        let buffer = self.inner.acquire_buffer()?;
        let recycler: Arc<dyn PacketRecycler> = self.inner.clone();
        Ok(Packet::leased(buffer, recycler))
    }

    fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl std::fmt::Debug for SlabPacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabPacketPool")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.snapshot())
            .finish()
    }
}

struct PoolInner {
    config: PoolConfig,
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn acquire_buffer(&self) -> Result<BytesMut> {
        let reused = self.free_list.lock().pop();
        let buffer = match reused {
            Some(buf) => buf,
            None => {
                if !self.reserve_allocation() {
                    self.metrics.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
                    return Err(IntakeError::PoolExhausted {
                        limit: self.config.max_packets,
                    });
                }
                BytesMut::zeroed(self.config.packet_capacity)
            }
        };
        self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        self.metrics.active_leases.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    /// 在上限内为一次新分配占位。
    fn reserve_allocation(&self) -> bool {
        self.metrics
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.config.max_packets).then_some(current + 1)
            })
            .is_ok()
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            acquired: self.metrics.acquired.load(Ordering::Relaxed),
            recycled: self.metrics.recycled.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            free_slots: self.free_list.lock().len(),
            allocated: self.metrics.allocated.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
        }
    }
}

impl PacketRecycler for PoolInner {
    fn reclaim(&self, buffer: BytesMut) {
        self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
        saturating_sub(&self.metrics.active_leases, 1);
        if buffer.len() == self.config.packet_capacity {
            self.free_list.lock().push(buffer);
        } else {
            // 尺寸不符的缓冲不再复用，让出分配名额
            saturating_sub(&self.metrics.allocated, 1);
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    acquired: AtomicU64,
    recycled: AtomicU64,
    active_leases: AtomicUsize,
    allocated: AtomicUsize,
    failed_acquisitions: AtomicU64,
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_packets: usize) -> SlabPacketPool {
        SlabPacketPool::new(PoolConfig {
            packet_capacity: 32,
            max_packets,
        })
    }

    #[test]
    fn recycled_buffer_is_reused_without_new_allocation() {
        let pool = small_pool(4);
        pool.acquire().expect("首次租借").recycle();
        let _second = pool.acquire().expect("复用租借");
        let stats = pool.statistics();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.active_leases, 1);
    }

    #[test]
    fn exhausted_pool_fails_fast() {
        let pool = small_pool(1);
        let held = pool.acquire().expect("租借唯一缓冲");
        assert!(matches!(
            pool.acquire(),
            Err(IntakeError::PoolExhausted { limit: 1 })
        ));
        assert_eq!(pool.statistics().failed_acquisitions, 1);
        drop(held);
        pool.acquire().expect("归还后可再次租借");
    }

    #[test]
    fn zero_sized_config_is_rejected() {
        let settings = SettingsStore::new();
        settings.set("pool.max-packets", "0").expect("写入配置");
        assert!(matches!(
            PoolConfig::from_settings(&settings),
            Err(IntakeError::InvalidSetting { .. })
        ));
    }
}
