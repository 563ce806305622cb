//! # 生命周期状态机
//!
//! ## 核心意图（Why）
//! - 收包模块必须按 `init → start → stopForce → destroy` 的顺序装配与拆除，任何越级调用都应
//!   立即失败，而不是静默忽略；
//! - 把合法跃迁集中在 [`LifecycleState::can_transition_to`] 中，控制器与调度器共用同一张状态图。
//!
//! ## 状态机约束（What）
//! - 合法跃迁：`Created → Initialized → Started → Stopped → Destroyed`；
//!   另外 `Started → Destroyed` 与 `Initialized → Destroyed` 也被允许；
//! - `Destroyed` 为终态，不接受任何跃迁；同态跃迁一律视为非法（`destroy` 两次即为误用）。

/// 四阶段生命周期的状态。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum LifecycleState {
    /// 实例已创建，尚未装配任何资源。
    #[default]
    Created,
    /// 套接字、队列与调度绑定均已就绪，但尚未开始收包。
    Initialized,
    /// 调度绑定已激活，周期性收包进行中。
    Started,
    /// 已强制停止调度，套接字与队列仍保留。
    Stopped,
    /// 所有资源均已释放。
    Destroyed,
}

impl LifecycleState {
    /// 判断是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: LifecycleState) -> bool {
        matches!(
            (self, target),
            (LifecycleState::Created, LifecycleState::Initialized)
                | (LifecycleState::Initialized, LifecycleState::Started)
                | (LifecycleState::Initialized, LifecycleState::Destroyed)
                | (LifecycleState::Started, LifecycleState::Stopped)
                | (LifecycleState::Started, LifecycleState::Destroyed)
                | (LifecycleState::Stopped, LifecycleState::Destroyed)
        )
    }

    /// 状态是否为终态。
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Destroyed)
    }
}

impl core::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "Created"),
            LifecycleState::Initialized => write!(f, "Initialized"),
            LifecycleState::Started => write!(f, "Started"),
            LifecycleState::Stopped => write!(f, "Stopped"),
            LifecycleState::Destroyed => write!(f, "Destroyed"),
        }
    }
}
