#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = r#"
# intake-transport-udp

## 模块使命（Why）
- **单套接字收包循环**：一个 UDP 套接字、一个工作线程，逐轮“租借报文 → 阻塞读取 → 交付或入队”，
  交付顺序即到达顺序；
- **背压不阻塞**：下游队列满时报文被回收并记录告警，收包线程永不因消费者变慢而停顿；
- **可拆卸**：生命周期控制器保证 `destroy` 之后不存在打开的套接字或仍在调度的工作。

## 核心契约（What）
- [`SocketReceiver::run_cycle`]：一轮收包，结果为 [`CycleOutcome`] 或 `IntakeError`；
- [`HandoffQueue`]：有界 FIFO，`offer` 满时退回报文；
- [`ReceiveTick`]：把收包器挂到 `intake_core::TickGroup` 上；
- [`UdpSocketModule`]：`init → start → stop_force → destroy` 生命周期控制器；
- [`UdpSocketConfig`]：配置键与默认值，支持 TOML 文件输入。

## 实现策略（How）
- 套接字经 `socket2` 创建并设置 `SO_REUSEADDR`，随后以标准库阻塞读驱动；
- 关闭通过 `shutdown(Both)` 唤醒阻塞读取，拆除标志决定该次错误被吸收还是上报；
- 日志统一走 `tracing`，库代码从不安装 Subscriber。
"#]

pub mod binding;
pub mod config;
pub mod module;
pub mod queue;
pub mod receiver;
pub mod socket;

pub use binding::ReceiveTick;
pub use config::UdpSocketConfig;
pub use module::UdpSocketModule;
pub use queue::HandoffQueue;
pub use receiver::{CycleOutcome, ReceiverStats, Route, SocketListener, SocketReceiver};
pub use socket::{BindOptions, BoundUdpSocket, DatagramSource};
