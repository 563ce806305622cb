//! UDP 收包模块的生命周期控制器。
//!
//! # 模块定位（Why）
//! - 把套接字、交接队列、收包器与调度绑定按 `init → start → stop_force → destroy`
//!   的固定顺序装配与拆除，保证不留下悬挂的套接字或仍在调度的工作；
//! - 越级调用在产生任何副作用之前以 [`IntakeError::IllegalState`] 失败。
//!
//! # 装配顺序（How）
//! - `init`：读配置 → 解析缓冲池连接 → 绑定套接字 → 创建队列与收包器 → 创建并初始化调度组与 Tick
//!   → 注册 `socket-timeout` 监听器；任一步失败都回滚已完成的步骤，状态保持 `Created`；
//! - `start`：固定交付路由 → 激活 Tick → 启动调度组；
//! - `destroy`：置拆除标志 → 关闭套接字 → 注销监听器 → 销毁 Tick 与调度组 → 回收队列残留报文
//!   → 释放缓冲池连接。

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use intake_core::{
    IntSettingListener, IntakeError, LifecycleState, ListenerId, PacketPool, PoolDirectory,
    Result, SettingsStore, Tick, TickFailure, TickGroup,
};

use crate::{
    binding::ReceiveTick,
    config::{DEFAULT_SOCKET_TIMEOUT_MS, KEY_SOCKET_TIMEOUT, UdpSocketConfig},
    queue::HandoffQueue,
    receiver::{ReceiverStats, Route, SocketListener, SocketReceiver},
    socket::{BoundUdpSocket, DatagramSource},
};

/// `init` 装配出的全部资源，`destroy` 时整体拆除。
struct Assembly {
    config: UdpSocketConfig,
    socket: Arc<BoundUdpSocket>,
    receiver: Arc<SocketReceiver>,
    queue: HandoffQueue,
    // 缓冲池连接；随装配一同释放
    _pool: Arc<dyn PacketPool>,
    group: TickGroup,
    tick: Tick,
    timeout_listener: ListenerId,
}

#[derive(Default)]
struct ModuleState {
    state: LifecycleState,
    listener: Option<Arc<dyn SocketListener>>,
    assembly: Option<Assembly>,
    final_stats: Option<ReceiverStats>,
}

/// 单套接字 UDP 收包模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 宿主只与本类型交互：注入配置存储与缓冲池目录，按顺序调用生命周期方法；
/// - 收包本身由内部调度组的单个工作线程驱动，模块方法只负责装配、切换与观测。
///
/// ## 契约（What）
/// - 状态图：`Created → Initialized → Started → Stopped → Destroyed`，
///   另允许 `Initialized → Destroyed` 与 `Started → Destroyed`；
/// - [`UdpSocketModule::set_listener`] 仅在启动前有效；启动时若已设置监听器则同步交付，
///   否则报文进入 [`HandoffQueue`]；
/// - 外部关闭套接字（[`UdpSocketModule::close_socket`]）后，下一轮收包以
///   [`IntakeError::SocketClosed`] 上报一次，随后收包 Tick 被停用；
/// - **前置条件**：监听器回调不得在持有模块锁的路径上重入；模块方法本身不会在收包线程上持锁等待。
///
/// ## 风险提示（Trade-offs）
/// - `stop_force` 不等待正在阻塞中的读取，最长需要一个读超时周期工作线程才真正空闲；
///   需要立即释放套接字时直接调用 `destroy`。
pub struct UdpSocketModule {
    name: String,
    settings: SettingsStore,
    pools: PoolDirectory,
    inner: Mutex<ModuleState>,
}

impl UdpSocketModule {
    pub fn new(name: impl Into<String>, settings: SettingsStore, pools: PoolDirectory) -> Self {
        Self {
            name: name.into(),
            settings,
            pools,
            inner: Mutex::new(ModuleState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// 设置同步监听器。只允许在 `start` 之前调用，后设置的覆盖先设置的。
    pub fn set_listener<L: SocketListener>(&self, listener: L) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            LifecycleState::Created | LifecycleState::Initialized
        ) {
            return Err(IntakeError::illegal_state("set listener", inner.state));
        }
        inner.listener = Some(Arc::new(listener));
        Ok(())
    }

    /// 装配套接字、队列与调度绑定。失败时回滚并保持 `Created`。
    pub fn init(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_transition(inner.state, "init", LifecycleState::Initialized)?;
        let assembly = self.assemble()?;
        inner.assembly = Some(assembly);
        inner.state = LifecycleState::Initialized;
        Ok(())
    }

    /// 固定交付路由并开始周期性收包。
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        ensure_transition(state, "start", LifecycleState::Started)?;
        {
            let current = &*inner;
            let Some(assembly) = current.assembly.as_ref() else {
                return Err(IntakeError::illegal_state("start", state));
            };
            if assembly.socket.is_closed() {
                return Err(IntakeError::illegal_state("start on a closed socket", state));
            }
            if assembly.receiver.route().is_none() {
                let route = match &current.listener {
                    Some(listener) => Route::Listener(Arc::clone(listener)),
                    None => Route::Queue(assembly.queue.clone()),
                };
                assembly.receiver.install_route(route)?;
            }
            assembly.tick.activate()?;
            if let Err(err) = assembly.group.start() {
                if let Err(rollback) = assembly.tick.inactivate() {
                    tracing::warn!(module = %self.name, error = %rollback, "failed to inactivate receive tick");
                }
                return Err(err);
            }
            tracing::info!(
                module = %self.name,
                route = ?assembly.receiver.route(),
                "udp socket module started"
            );
        }
        inner.state = LifecycleState::Started;
        Ok(())
    }

    /// 强制停止调度；不等待正在进行的一轮，套接字与队列保留。
    pub fn stop_force(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_transition(inner.state, "stop_force", LifecycleState::Stopped)?;
        if let Some(assembly) = inner.assembly.as_ref() {
            assembly.tick.inactivate()?;
            assembly.group.stop_force()?;
        }
        inner.state = LifecycleState::Stopped;
        tracing::info!(module = %self.name, "udp socket module force-stopped");
        Ok(())
    }

    /// 释放全部资源。终态，之后任何生命周期调用都会失败。
    pub fn destroy(&self) -> Result<()> {
        let assembly = {
            let mut inner = self.inner.lock();
            ensure_transition(inner.state, "destroy", LifecycleState::Destroyed)?;
            inner.state = LifecycleState::Destroyed;
            inner.listener = None;
            inner.assembly.take()
        };
        // 拆除在模块锁之外进行：等待工作线程时，监听器仍可查询模块状态
        if let Some(assembly) = assembly {
            let stats = self.teardown(assembly);
            self.inner.lock().final_stats = Some(stats);
        }
        tracing::info!(module = %self.name, "udp socket module destroyed");
        Ok(())
    }

    /// 实际绑定的本地地址；未初始化或已销毁时为 `None`。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock();
        inner
            .assembly
            .as_ref()
            .and_then(|assembly| assembly.socket.local_addr().ok())
    }

    /// 交接队列的消费句柄。
    pub fn packet_queue(&self) -> Option<HandoffQueue> {
        let inner = self.inner.lock();
        inner.assembly.as_ref().map(|assembly| assembly.queue.clone())
    }

    /// 当前生效的读超时；`Duration::ZERO` 表示不设上限。
    pub fn socket_timeout(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .assembly
            .as_ref()
            .map(|assembly| assembly.receiver.timeout())
    }

    /// `init` 时读取的配置。
    pub fn config(&self) -> Option<UdpSocketConfig> {
        let inner = self.inner.lock();
        inner.assembly.as_ref().map(|assembly| assembly.config.clone())
    }

    /// 收包计数；销毁后返回销毁时刻的最终值。
    pub fn stats(&self) -> Option<ReceiverStats> {
        let inner = self.inner.lock();
        match inner.assembly.as_ref() {
            Some(assembly) => Some(assembly.receiver.stats()),
            None => inner.final_stats,
        }
    }

    /// 调度组的失败通道。
    pub fn tick_failures(&self) -> Option<Receiver<TickFailure>> {
        let inner = self.inner.lock();
        inner.assembly.as_ref().map(|assembly| assembly.group.failures())
    }

    /// 从模块外部关闭套接字（不经 `destroy`）。
    ///
    /// 阻塞中的读取被唤醒后以 `SocketClosed` 上报一次；之后 `start` 会被拒绝。
    pub fn close_socket(&self) -> Result<()> {
        let inner = self.inner.lock();
        let Some(assembly) = inner.assembly.as_ref() else {
            return Err(IntakeError::illegal_state("close socket", inner.state));
        };
        assembly.socket.close();
        tracing::info!(module = %self.name, "udp socket closed externally");
        Ok(())
    }

    fn assemble(&self) -> Result<Assembly> {
        let config = UdpSocketConfig::from_settings(&self.settings)?;
        let pool = self.pools.resolve(&config.pool_connection).ok_or_else(|| {
            IntakeError::PoolUnavailable {
                name: config.pool_connection.clone(),
            }
        })?;

        let socket = Arc::new(BoundUdpSocket::bind(config.bind_options())?);
        let port = socket.port().map_err(|source| IntakeError::Bind {
            port: config.socket_port,
            source,
        })?;
        tracing::info!(module = %self.name, port, "socket port is {port}");

        let queue = HandoffQueue::bounded(config.buffer_size)?;
        let source: Arc<dyn DatagramSource> = socket.clone();
        let receiver = Arc::new(SocketReceiver::new(
            source,
            Arc::clone(&pool),
            config.socket_timeout(),
        ));

        let group = TickGroup::new(config.tick_group_options(&self.name));
        group.init()?;
        let tick = group.create_tick(Arc::new(ReceiveTick::new(Arc::clone(&receiver))))?;
        tick.init()?;

        let timeout_listener = match self.settings.set_listener(
            KEY_SOCKET_TIMEOUT,
            timeout_listener(Arc::downgrade(&receiver)),
            DEFAULT_SOCKET_TIMEOUT_MS,
        ) {
            Ok(id) => id,
            Err(err) => {
                if let Err(rollback) = tick.destroy() {
                    tracing::warn!(module = %self.name, error = %rollback, "failed to destroy receive tick");
                }
                if let Err(rollback) = group.destroy() {
                    tracing::warn!(module = %self.name, error = %rollback, "failed to destroy tick group");
                }
                return Err(err);
            }
        };

        Ok(Assembly {
            config,
            socket,
            receiver,
            queue,
            _pool: pool,
            group,
            tick,
            timeout_listener,
        })
    }

    fn teardown(&self, assembly: Assembly) -> ReceiverStats {
        assembly.receiver.begin_teardown();
        assembly.socket.close();
        self.settings.remove_listener(assembly.timeout_listener);

        if let Err(err) = assembly.tick.destroy() {
            tracing::warn!(module = %self.name, error = %err, "failed to destroy receive tick");
        }
        if let Err(err) = assembly.group.destroy() {
            tracing::warn!(module = %self.name, error = %err, "failed to destroy tick group");
        }

        let leftovers = assembly.queue.drain();
        let recycled = leftovers.len();
        leftovers.into_iter().for_each(|packet| packet.recycle());
        if recycled > 0 {
            tracing::debug!(module = %self.name, recycled, "recycled packets left in handoff queue");
        }
        assembly.receiver.stats()
    }
}

impl Drop for UdpSocketModule {
    fn drop(&mut self) {
        let needs_teardown = self.inner.get_mut().assembly.is_some();
        if needs_teardown {
            let _ = self.destroy();
        }
    }
}

impl fmt::Debug for UdpSocketModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSocketModule")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn ensure_transition(
    state: LifecycleState,
    operation: &'static str,
    target: LifecycleState,
) -> Result<()> {
    if state.can_transition_to(target) {
        Ok(())
    } else {
        Err(IntakeError::illegal_state(operation, state))
    }
}

/// `socket-timeout` 变更监听器：新值立即作用于已打开的套接字。
fn timeout_listener(receiver: Weak<SocketReceiver>) -> Arc<dyn IntSettingListener> {
    Arc::new(move |key: &str, value: i64| -> Result<()> {
        let millis = u64::try_from(value).map_err(|_| {
            IntakeError::invalid_setting(key, value.to_string(), "timeout must not be negative")
        })?;
        let Some(receiver) = receiver.upgrade() else {
            return Ok(());
        };
        receiver
            .update_timeout(Duration::from_millis(millis))
            .map_err(|err| IntakeError::invalid_setting(key, value.to_string(), err.to_string()))?;
        tracing::debug!(timeout_ms = millis, "socket timeout applied");
        Ok(())
    })
}
