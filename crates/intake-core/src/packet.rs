//! 池化报文缓冲与其元数据。
//!
//! # 模块定位（Why）
//! - 收包循环每轮都向缓冲池租借一个 [`Packet`]，由操作系统直接写入其固定容量的缓冲，
//!   避免逐报文堆分配；
//! - 报文在“池 → 收包循环 → 监听器/队列 → 回收”之间流转，任何时刻只有一个持有者，
//!   这一点由移动语义保证：`Packet` 不实现 `Clone`，[`Packet::recycle`] 消耗自身。
//!
//! # 设计概要（How）
//! - 缓冲使用 `bytes::BytesMut`，由池一次性分配并填零到完整容量，此后只复用、不扩容；
//! - 通过 [`PacketRecycler`] 将回收钩子显式化：显式 `recycle` 与意外 `Drop` 走同一路径，
//!   遗忘回收的消费者不会泄漏内存，只会让池的统计体现出来。
//!
//! # 状态不变式（What）
//! - 来源端点当且仅当状态为 [`PacketStatus::Received`] 时存在；
//! - 租借时状态重置为 `Acquired`，长度清零，端点清空。

use std::{
    fmt, mem,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use bytes::BytesMut;

/// 报文状态。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum PacketStatus {
    /// 刚从池中租借，尚未写入。
    #[default]
    Acquired,
    /// 成功接收到一个数据报，端点与长度有效。
    Received,
    /// 已归还（或正在归还）给池。
    Recycled,
    /// 接收失败，缓冲内容无意义。
    Error,
}

/// 数据报的来源端点（地址 + 端口）。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 转换回标准库地址，便于回包或日志。
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.socket_addr(), f)
    }
}

/// `PacketRecycler` 描述缓冲池在报文生命周期结束时的回收入口。
///
/// # 设计初衷（Why）
/// - [`PacketPool`](crate::pool::PacketPool) 只约束“租借”侧；回收由报文自身携带的句柄完成，
///   调用方无需知道报文来自哪个池。
///
/// # 契约定义（What）
/// - `reclaim` 对每个租借出去的报文恰好调用一次，参数为原始缓冲；
/// - **前置条件**：实现必须线程安全，且不得 panic（该调用位于 `Drop` 路径上）。
pub trait PacketRecycler: Send + Sync + 'static {
    /// 归还报文缓冲。
    fn reclaim(&self, buffer: BytesMut);
}

/// 可复用的数据报缓冲及其元数据。
///
/// # 契约说明（What）
/// - [`Packet::buffer_mut`] 暴露完整容量供 `recv_from` 写入；
/// - [`Packet::mark_received`] 记录长度与端点并切换到 `Received`；
/// - [`Packet::recycle`] 消耗报文并归还给所属池；未回收即被丢弃的报文同样会归还。
pub struct Packet {
    buffer: BytesMut,
    len: usize,
    endpoint: Option<Endpoint>,
    status: PacketStatus,
    recycler: Option<Arc<dyn PacketRecycler>>,
}

impl Packet {
    /// 由缓冲池构造一个已租借的报文。
    ///
    /// - **前置条件**：`buffer.len()` 即为报文容量，池负责预先填充；
    /// - **后置条件**：报文处于 `Acquired` 状态，回收时缓冲交还给 `recycler`。
    pub fn leased(buffer: BytesMut, recycler: Arc<dyn PacketRecycler>) -> Self {
        Self {
            buffer,
            len: 0,
            endpoint: None,
            status: PacketStatus::Acquired,
            recycler: Some(recycler),
        }
    }

    /// 构造不属于任何池的独立报文，回收时直接释放内存。
    pub fn detached(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::zeroed(capacity),
            len: 0,
            endpoint: None,
            status: PacketStatus::Acquired,
            recycler: None,
        }
    }

    /// 缓冲的固定容量。
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// 最近一次接收写入的字节数。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 有效负载的只读视图。
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// 完整容量的可写视图，供套接字直接写入。
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
    }

    pub fn status(&self) -> PacketStatus {
        self.status
    }

    /// 报文是否由缓冲池租借而来。
    pub fn is_pooled(&self) -> bool {
        self.recycler.is_some()
    }

    /// 记录一次成功接收。`len` 超出容量时按容量截断。
    pub fn mark_received(&mut self, len: usize, endpoint: Endpoint) {
        self.len = len.min(self.capacity());
        self.endpoint = Some(endpoint);
        self.status = PacketStatus::Received;
    }

    /// 记录一次失败接收，端点随之清空。
    pub fn mark_error(&mut self) {
        self.len = 0;
        self.endpoint = None;
        self.status = PacketStatus::Error;
    }

    /// 将报文归还给所属池。
    pub fn recycle(mut self) {
        self.status = PacketStatus::Recycled;
        self.endpoint = None;
        self.len = 0;
        // 实际归还发生在 Drop 中
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            recycler.reclaim(mem::take(&mut self.buffer));
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
