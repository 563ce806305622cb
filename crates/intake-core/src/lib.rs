#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = r#"
# intake-core

## 模块使命（Why）
- **统一收包契约**：为单套接字 UDP 收包循环提供报文、缓冲池、配置、调度与生命周期的共同语言，
  使传输实现（`intake-transport-udp`）与缓冲实现（`intake-buffer`）可以独立演进。
- **外部协作者边界**：缓冲池、配置存储与 Tick 调度器在语义上属于外部协作者，本 crate 只定义
  它们被消费的契约，并给出可运行、可测试的最小实现。

## 核心契约（What）
- [`Packet`]：池化、可复用的报文缓冲，携带来源端点与状态，所有权转移由移动语义保证；
- [`PacketPool`]：`acquire` 契约，耗尽时返回 [`IntakeError::PoolExhausted`]，绝不阻塞；
- [`SettingsStore`]：具名配置值 + 变更通知，监听器在注册时以当前值或默认值触发一次；
- [`TickGroup`] / [`Tick`]：单工作线程调度器，逐个、串行地驱动激活的 Tick；
- [`LifecycleState`]：`Created → Initialized → Started → Stopped → Destroyed` 线性状态机；
- [`IntakeError`]：统一错误枚举，通过 [`ErrorCategory`] 区分瞬态、背压、资源耗尽、套接字故障与误用。

## 实现策略（How）
- 错误基于 `thiserror` 派生，日志统一走 `tracing`；库代码从不安装 Subscriber。
- 配置快照借助 `arc-swap` 做无锁读取，监听器注册表使用 `parking_lot::Mutex` 保护。
- 调度器失败通道使用 `crossbeam-channel`，消费者可在任意线程读取。
"#]

pub mod error;
pub mod lifecycle;
pub mod packet;
pub mod pool;
pub mod settings;
pub mod tick;

pub use error::{ErrorCategory, IntakeError, Result};
pub use lifecycle::LifecycleState;
pub use packet::{Endpoint, Packet, PacketRecycler, PacketStatus};
pub use pool::{PacketPool, PoolDirectory, PoolStats};
pub use settings::{IntSettingListener, ListenerId, SettingsStore};
pub use tick::{Tick, TickFailure, TickGroup, TickGroupOptions, TickId, TickRunnable};
