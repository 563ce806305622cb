#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! `intake-buffer` 提供 `intake-core::PacketPool` 的默认实现。
//!
//! # 模块定位（Why）
//! - 收包循环每轮租借一个定长报文；本 crate 以自由链表复用固定容量的 `BytesMut`，
//!   在高包率下把堆分配降到“只在预热阶段发生”。
//! - 池容量有硬上限：在外租约达到上限时立即返回 `PoolExhausted`，绝不阻塞收包线程。
//!
//! # 设计概要（How）
//! - [`SlabPacketPool`] 内部以 `spin::Mutex<Vec<BytesMut>>` 保存空闲缓冲，统计使用原子计数；
//! - 报文通过 `intake_core::PacketRecycler` 回到池中，显式回收与意外 `Drop` 走同一路径。

mod pool;

pub use pool::{PoolConfig, SlabPacketPool};
