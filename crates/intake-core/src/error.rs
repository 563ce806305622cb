//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为收包循环对外暴露的错误语义提供集中定义，调度器、生命周期控制器与配置层共享同一枚举；
//! - 区分“预期且被吸收”的结果（超时、背压）与“必须大声失败”的错误（套接字故障、生命周期误用）。
//!
//! ## 设计要求（What）
//! - 所有错误实现 `thiserror::Error`，满足 `Send + Sync + 'static`，可跨线程投递到调度器失败通道；
//! - [`IntakeError::category`] 给出稳定分类，调用方据此决定重试、告警或停用。
//!
//! ## 扩展建议（How）
//! - 新增变体时同步更新 [`IntakeError::category`] 与 [`IntakeError::is_fatal`]，避免分类漂移。

use std::io;

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// 收包核心统一使用的结果别名。
pub type Result<T, E = IntakeError> = core::result::Result<T, E>;

/// 错误分类。
///
/// # 教案式说明
/// - **意图 (Why)**：把错误按处置策略归档，而不是按出错位置归档；
/// - **契约 (What)**：
///   - `Transient`：接收超时，循环照常继续；
///   - `Backpressure`：交接队列已满，报文被回收，仅记录告警；
///   - `ResourceExhausted`：缓冲池耗尽或连接不可用，本轮失败；
///   - `SocketFault`：除超时之外的接收错误，交由调度器决定是否致命；
///   - `IllegalState`：生命周期误用，禁止自动重试；
///   - `Configuration`：配置值非法。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Transient,
    Backpressure,
    ResourceExhausted,
    SocketFault,
    IllegalState,
    Configuration,
}

impl ErrorCategory {
    /// 稳定的小写标签，便于作为日志字段或指标维度。
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Backpressure => "backpressure",
            ErrorCategory::ResourceExhausted => "resource_exhausted",
            ErrorCategory::SocketFault => "socket_fault",
            ErrorCategory::IllegalState => "illegal_state",
            ErrorCategory::Configuration => "configuration",
        }
    }
}

impl core::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 收包核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合缓冲池、套接字、生命周期与配置路径的异常，调度器只需面对一个类型；
/// - **契约 (What)**：所有变体均可安全跨线程传播；`source` 链保留底层 `std::io::Error`；
/// - **设计权衡 (Trade-offs)**：上下文使用 `String` 保存，换取错误信息可读性。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IntakeError {
    /// 缓冲池已无可租借的报文。
    #[error("packet pool exhausted: all {limit} packets are leased")]
    PoolExhausted { limit: usize },

    /// 指定名称的缓冲池连接无法解析。
    #[error("packet pool connection `{name}` is not available")]
    PoolUnavailable { name: String },

    /// 套接字绑定失败。
    #[error("failed to bind udp socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// 接收过程中出现的非超时错误。
    #[error("udp receive failed: {0}")]
    Receive(#[source] io::Error),

    /// 套接字已在外部被关闭。
    #[error("udp socket is closed")]
    SocketClosed,

    /// 生命周期误用：在不允许的状态下调用了某个操作。
    #[error("cannot {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// 配置值无法解析或超出允许范围。
    #[error("invalid value `{value}` for setting `{key}`: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    /// 配置源本身无法读取或解析。
    #[error("configuration error: {0}")]
    Config(String),

    /// 调度器内部错误，例如工作线程无法启动。
    #[error("tick scheduler error: {0}")]
    Scheduler(String),
}

impl IntakeError {
    /// 便捷构造生命周期误用错误。
    pub fn illegal_state(operation: &'static str, state: LifecycleState) -> Self {
        IntakeError::IllegalState { operation, state }
    }

    /// 便捷构造配置值非法错误。
    pub fn invalid_setting(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        IntakeError::InvalidSetting {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// 返回错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            IntakeError::PoolExhausted { .. } | IntakeError::PoolUnavailable { .. } => {
                ErrorCategory::ResourceExhausted
            }
            IntakeError::Bind { .. } | IntakeError::Receive(_) | IntakeError::SocketClosed => {
                ErrorCategory::SocketFault
            }
            IntakeError::IllegalState { .. } | IntakeError::Scheduler(_) => {
                ErrorCategory::IllegalState
            }
            IntakeError::InvalidSetting { .. } | IntakeError::Config(_) => {
                ErrorCategory::Configuration
            }
        }
    }

    /// 该错误是否意味着同一 Tick 后续再执行也注定失败。
    ///
    /// - 套接字已关闭与生命周期误用属于此类，调度器上报一次后应停用对应 Tick；
    /// - 其它错误（如一次性的 IO 故障、缓冲池暂时耗尽）仅上报，循环继续。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IntakeError::SocketClosed | IntakeError::IllegalState { .. } | IntakeError::Scheduler(_)
        )
    }
}
