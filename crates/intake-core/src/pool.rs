//! 缓冲池契约与具名连接目录。
//!
//! # 模块定位（Why）
//! - 收包循环只消费缓冲池的 `acquire` 能力，从不自行分配或释放底层内存；
//! - 宿主通过 [`PoolDirectory`] 以名称注册缓冲池，模块在 `init` 阶段按配置名解析连接，
//!   在 `destroy` 阶段释放引用。

use std::{collections::BTreeMap, fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{Result, packet::Packet};

/// 缓冲池的统计快照。
///
/// - `acquired` / `recycled`：累计租借与归还次数；两者之差即为在外租约数；
/// - `active_leases`：当前尚未归还的报文数量；
/// - `free_slots`：自由链表中可立即复用的缓冲数量；
/// - `allocated`：池累计分配过的缓冲数量（不含复用）；
/// - `failed_acquisitions`：因耗尽而失败的租借次数。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub acquired: u64,
    pub recycled: u64,
    pub active_leases: usize,
    pub free_slots: usize,
    pub allocated: usize,
    pub failed_acquisitions: u64,
}

/// 报文缓冲池契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 收包循环每轮开头租借一个报文，固定内存被反复复用，避免高包率下的逐包分配。
///
/// ## 契约说明（What）
/// - `acquire`：返回处于 `Acquired` 状态的报文；池耗尽时返回
///   [`IntakeError::PoolExhausted`](crate::IntakeError::PoolExhausted)，不得阻塞；
/// - 归还通过 [`Packet::recycle`] 完成，池无需暴露额外的 `recycle` 方法；
/// - `statistics`：返回当前统计快照，仅用于观测。
///
/// ## 风险提示（Trade-offs）
/// - 交接队列的消费者若长期不回收报文，池终将耗尽，此时每轮收包都会以资源耗尽失败。
pub trait PacketPool: Send + Sync + 'static {
    /// 租借一个报文。
    fn acquire(&self) -> Result<Packet>;

    /// 读取统计快照。
    fn statistics(&self) -> PoolStats;
}

/// 具名缓冲池目录。
///
/// 模块化宿主中“按名称解析到其它模块的连接”的最小实现：注册即覆盖，解析返回共享引用。
#[derive(Clone, Default)]
pub struct PoolDirectory {
    pools: Arc<RwLock<BTreeMap<String, Arc<dyn PacketPool>>>>,
}

impl PoolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以名称注册缓冲池，返回被替换的旧连接（如有）。
    pub fn register(
        &self,
        name: impl Into<String>,
        pool: Arc<dyn PacketPool>,
    ) -> Option<Arc<dyn PacketPool>> {
        self.pools.write().insert(name.into(), pool)
    }

    /// 注销缓冲池。已解析出的引用不受影响。
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn PacketPool>> {
        self.pools.write().remove(name)
    }

    /// 按名称解析缓冲池连接。
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn PacketPool>> {
        self.pools.read().get(name).cloned()
    }
}

impl fmt::Debug for PoolDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.pools.read().keys().cloned().collect();
        f.debug_struct("PoolDirectory").field("pools", &names).finish()
    }
}
