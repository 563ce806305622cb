//! 单工作线程 Tick 调度器。
//!
//! # 模块定位（Why）
//! - 收包模块不定义节奏，只提供“每轮做什么”；节奏由调度器决定。本模块给出最小可运行的调度器：
//!   一个 [`TickGroup`] 拥有一个工作线程，按注册顺序逐个、串行地调用处于激活态的 [`Tick`]；
//! - 同一组内的 Tick 绝不并发执行，收包循环因此天然满足“单套接字单工作者”的约束。
//!
//! # 暴露接口（What）
//! - [`TickGroup`]：`init → start → stop_force → destroy`，与模块共用 [`LifecycleState`] 状态图；
//! - [`Tick`]：`init → activate ⇄ inactivate → destroy`，绑定一个 [`TickRunnable`]；
//! - [`TickFailure`]：每轮失败都投递到组的失败通道，并以 error 级别记录日志。
//!
//! # 失败策略（How）
//! - 普通失败只上报，Tick 保持激活；
//! - 资源耗尽（缓冲池空）是可预期的持续状态：该 Tick 按 `idle` 起步、逐次加倍的间隔退避，
//!   上限 100ms，成功一轮后复位；同一 Tick 同类失败每秒至多记录一条日志，其余只计数；
//! - [`IntakeError::is_fatal`] 为真的失败（套接字已关闭、生命周期误用、panic）上报一次后停用该 Tick；
//! - `stop_force` 只清除运行标志，不等待正在执行的一轮；`destroy` 会等待工作线程退出，
//!   若由工作线程自身调用则跳过等待。

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::{ErrorCategory, IntakeError, LifecycleState, Result};

/// 失败通道容量；积压超过该值时新失败只记录日志。
const FAILURE_BACKLOG: usize = 256;
/// 资源耗尽退避的最小间隔。
const BACKOFF_FLOOR: Duration = Duration::from_millis(1);
/// 资源耗尽退避的最大间隔。
const BACKOFF_CEILING: Duration = Duration::from_millis(100);
/// 同类失败两条日志之间的最短间隔。
const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Tick 的执行体。
pub trait TickRunnable: Send + Sync + 'static {
    /// 执行一轮工作。`elapsed` 为距上一轮开始的时间（首轮为零）。
    fn tick(&self, elapsed: Duration) -> Result<()>;
}

/// 组内唯一的 Tick 标识。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TickId(u64);

impl TickId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick#{}", self.0)
    }
}

/// 一次失败的上报记录。
#[derive(Debug)]
pub struct TickFailure {
    pub tick: TickId,
    pub error: IntakeError,
}

/// 调度组参数。
#[derive(Clone, Debug)]
pub struct TickGroupOptions {
    /// 组名，同时用作工作线程名。
    pub name: String,
    /// 没有激活 Tick 时的空转休眠间隔。
    pub idle: Duration,
}

impl Default for TickGroupOptions {
    fn default() -> Self {
        Self {
            name: "tick-group".into(),
            idle: Duration::from_millis(1),
        }
    }
}

impl TickGroupOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
enum TickState {
    Created = 0,
    Initialized = 1,
    Active = 2,
    Inactive = 3,
    Destroyed = 4,
}

impl TickState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TickState::Created,
            1 => TickState::Initialized,
            2 => TickState::Active,
            3 => TickState::Inactive,
            _ => TickState::Destroyed,
        }
    }

    fn as_lifecycle(self) -> LifecycleState {
        match self {
            TickState::Created => LifecycleState::Created,
            TickState::Initialized => LifecycleState::Initialized,
            TickState::Active => LifecycleState::Started,
            TickState::Inactive => LifecycleState::Stopped,
            TickState::Destroyed => LifecycleState::Destroyed,
        }
    }
}

struct TickSlot {
    id: TickId,
    runnable: Arc<dyn TickRunnable>,
    state: AtomicU8,
    last_run: Mutex<Option<Instant>>,
    throttle: Mutex<Throttle>,
}

/// 单个 Tick 的失败节流状态：退避截止时间与日志抑制计数。
#[derive(Default)]
struct Throttle {
    delay: Duration,
    resume_at: Option<Instant>,
    last_logged: Option<(ErrorCategory, Instant)>,
    suppressed: u64,
}

impl Throttle {
    fn ready(&self, now: Instant) -> bool {
        self.resume_at.is_none_or(|at| now >= at)
    }

    /// 连续失败时退避间隔从 `floor` 起逐次加倍，不超过上限。
    fn back_off(&mut self, now: Instant, floor: Duration) -> Duration {
        self.delay = if self.delay.is_zero() {
            floor.clamp(BACKOFF_FLOOR, BACKOFF_CEILING)
        } else {
            (self.delay * 2).min(BACKOFF_CEILING)
        };
        self.resume_at = Some(now + self.delay);
        self.delay
    }

    /// 返回 `Some(此前被抑制的条数)` 表示本次失败应写日志。
    fn should_log(&mut self, category: ErrorCategory, now: Instant, force: bool) -> Option<u64> {
        match self.last_logged {
            Some((last, at))
                if !force && last == category && now.duration_since(at) < FAILURE_LOG_INTERVAL =>
            {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_logged = Some((category, now));
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    /// 成功一轮后复位，返回复位前仍未记录的失败条数。
    fn recover(&mut self) -> Option<u64> {
        if self.last_logged.is_none() && self.delay.is_zero() {
            return None;
        }
        self.delay = Duration::ZERO;
        self.resume_at = None;
        self.last_logged = None;
        Some(std::mem::take(&mut self.suppressed))
    }
}

impl TickSlot {
    fn state(&self) -> TickState {
        TickState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_active(&self) -> bool {
        self.state() == TickState::Active
    }

    /// 从 `from` 集合中的任一状态切换到 `to`；失败时返回当前状态。
    fn transition(&self, from: &[TickState], to: TickState) -> core::result::Result<(), TickState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = TickState::from_u8(current);
            if !from.contains(&state) {
                return Err(state);
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn mark_run(&self) -> Duration {
        let now = Instant::now();
        let mut last = self.last_run.lock();
        let elapsed = last.map(|prev| now.duration_since(prev)).unwrap_or_default();
        *last = Some(now);
        elapsed
    }
}

struct GroupShared {
    options: TickGroupOptions,
    state: Mutex<LifecycleState>,
    running: AtomicBool,
    ticks: Mutex<Vec<Arc<TickSlot>>>,
    failures_tx: Sender<TickFailure>,
    failures_rx: Receiver<TickFailure>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GroupShared {
    fn transition(&self, operation: &'static str, to: LifecycleState) -> Result<LifecycleState> {
        let mut state = self.state.lock();
        if !state.can_transition_to(to) {
            return Err(IntakeError::illegal_state(operation, *state));
        }
        let previous = *state;
        *state = to;
        Ok(previous)
    }

    fn report(&self, failure: TickFailure) {
        match self.failures_tx.try_send(failure) {
            Ok(()) => {}
            Err(TrySendError::Full(failure)) => {
                tracing::debug!(
                    group = %self.options.name,
                    tick = %failure.tick,
                    "failure channel is full; failure only logged"
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// 单工作线程调度组，可克隆共享。
#[derive(Clone)]
pub struct TickGroup {
    shared: Arc<GroupShared>,
}

impl TickGroup {
    pub fn new(options: TickGroupOptions) -> Self {
        let (failures_tx, failures_rx) = crossbeam_channel::bounded(FAILURE_BACKLOG);
        Self {
            shared: Arc::new(GroupShared {
                options,
                state: Mutex::new(LifecycleState::Created),
                running: AtomicBool::new(false),
                ticks: Mutex::new(Vec::new()),
                failures_tx,
                failures_rx,
                next_id: AtomicU64::new(1),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.options.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock()
    }

    /// 失败通道的接收端；可在任意线程消费。
    pub fn failures(&self) -> Receiver<TickFailure> {
        self.shared.failures_rx.clone()
    }

    /// 当前挂在组上的 Tick 数量。
    pub fn tick_count(&self) -> usize {
        self.shared.ticks.lock().len()
    }

    pub fn init(&self) -> Result<()> {
        self.shared
            .transition("init tick group", LifecycleState::Initialized)
            .map(|_| ())
    }

    /// 启动工作线程。
    pub fn start(&self) -> Result<()> {
        self.shared
            .transition("start tick group", LifecycleState::Started)?;
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.options.name.clone())
            .spawn(move || run_worker(shared));
        match spawned {
            Ok(handle) => {
                *self.shared.worker.lock() = Some(handle);
                tracing::debug!(group = %self.name(), "tick group started");
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                *self.shared.state.lock() = LifecycleState::Initialized;
                Err(IntakeError::Scheduler(format!(
                    "failed to spawn worker for `{}`: {err}",
                    self.name()
                )))
            }
        }
    }

    /// 强制停止：不再调度新的一轮，正在执行的一轮自行结束。
    pub fn stop_force(&self) -> Result<()> {
        self.shared
            .transition("stop tick group", LifecycleState::Stopped)?;
        self.shared.running.store(false, Ordering::Release);
        tracing::debug!(group = %self.name(), "tick group force-stopped");
        Ok(())
    }

    /// 销毁调度组：停用并移除全部 Tick，等待工作线程退出。
    pub fn destroy(&self) -> Result<()> {
        self.shared
            .transition("destroy tick group", LifecycleState::Destroyed)?;
        self.shared.running.store(false, Ordering::Release);

        let slots: Vec<Arc<TickSlot>> = self.shared.ticks.lock().drain(..).collect();
        for slot in slots {
            slot.state
                .store(TickState::Destroyed as u8, Ordering::Release);
        }

        let handle = self.shared.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // 在工作线程内销毁：线程会在本轮结束后自行退出
                return Ok(());
            }
            if handle.join().is_err() {
                return Err(IntakeError::Scheduler(format!(
                    "worker of `{}` terminated abnormally",
                    self.name()
                )));
            }
        }
        tracing::debug!(group = %self.name(), "tick group destroyed");
        Ok(())
    }

    /// 创建绑定 `runnable` 的 Tick；新 Tick 处于 `Created` 状态，不会被调度。
    pub fn create_tick(&self, runnable: Arc<dyn TickRunnable>) -> Result<Tick> {
        let state = self.state();
        if state.is_terminal() {
            return Err(IntakeError::illegal_state("create tick", state));
        }
        let id = TickId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(TickSlot {
            id,
            runnable,
            state: AtomicU8::new(TickState::Created as u8),
            last_run: Mutex::new(None),
            throttle: Mutex::new(Throttle::default()),
        });
        self.shared.ticks.lock().push(Arc::clone(&slot));
        Ok(Tick {
            slot,
            group: Arc::downgrade(&self.shared),
        })
    }
}

impl fmt::Debug for TickGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickGroup")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("ticks", &self.tick_count())
            .finish()
    }
}

/// 调度组中的一个执行单元。
pub struct Tick {
    slot: Arc<TickSlot>,
    group: Weak<GroupShared>,
}

impl Tick {
    pub fn id(&self) -> TickId {
        self.slot.id
    }

    /// 以生命周期语义表示的当前状态：激活对应 `Started`，停用对应 `Stopped`。
    pub fn state(&self) -> LifecycleState {
        self.slot.state().as_lifecycle()
    }

    pub fn is_active(&self) -> bool {
        self.slot.is_active()
    }

    pub fn init(&self) -> Result<()> {
        self.slot
            .transition(&[TickState::Created], TickState::Initialized)
            .map_err(|state| IntakeError::illegal_state("init tick", state.as_lifecycle()))
    }

    pub fn activate(&self) -> Result<()> {
        self.slot
            .transition(
                &[TickState::Initialized, TickState::Inactive],
                TickState::Active,
            )
            .map_err(|state| IntakeError::illegal_state("activate tick", state.as_lifecycle()))
    }

    /// 停用 Tick。对尚未激活或已停用的 Tick 调用是无害的。
    pub fn inactivate(&self) -> Result<()> {
        match self.slot.state() {
            TickState::Initialized | TickState::Inactive => Ok(()),
            _ => self
                .slot
                .transition(&[TickState::Active], TickState::Inactive)
                .map_err(|state| {
                    IntakeError::illegal_state("inactivate tick", state.as_lifecycle())
                }),
        }
    }

    /// 销毁 Tick 并从所属组移除。
    pub fn destroy(&self) -> Result<()> {
        self.slot
            .transition(
                &[
                    TickState::Created,
                    TickState::Initialized,
                    TickState::Active,
                    TickState::Inactive,
                ],
                TickState::Destroyed,
            )
            .map_err(|state| IntakeError::illegal_state("destroy tick", state.as_lifecycle()))?;
        if let Some(group) = self.group.upgrade() {
            group
                .ticks
                .lock()
                .retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        }
        Ok(())
    }
}

impl fmt::Debug for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tick")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

fn run_worker(shared: Arc<GroupShared>) {
    let name = shared.options.name.clone();
    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let ready: Vec<Arc<TickSlot>> = shared
            .ticks
            .lock()
            .iter()
            .filter(|slot| slot.is_active() && slot.throttle.lock().ready(now))
            .cloned()
            .collect();
        if ready.is_empty() {
            thread::sleep(shared.options.idle);
            continue;
        }

        for slot in ready {
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            if !slot.is_active() {
                continue;
            }
            let elapsed = slot.mark_run();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| slot.runnable.tick(elapsed)))
                .unwrap_or_else(|payload| {
                    Err(IntakeError::Scheduler(format!(
                        "tick panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            match outcome {
                Ok(()) => {
                    if let Some(suppressed) = slot.throttle.lock().recover() {
                        tracing::info!(group = %name, tick = %slot.id, suppressed, "tick recovered");
                    }
                }
                Err(error) => on_failure(&shared, &slot, error),
            }
        }
    }
    tracing::trace!(group = %name, "tick worker exited");
}

fn on_failure(shared: &GroupShared, slot: &TickSlot, error: IntakeError) {
    let name = &shared.options.name;
    let category = error.category();
    let now = Instant::now();
    let (logged, backoff) = {
        let mut throttle = slot.throttle.lock();
        let logged = throttle.should_log(category, now, error.is_fatal());
        let backoff = (category == ErrorCategory::ResourceExhausted)
            .then(|| throttle.back_off(now, shared.options.idle));
        (logged, backoff)
    };

    if let Some(suppressed) = logged {
        tracing::error!(
            group = %name,
            tick = %slot.id,
            category = %category,
            error = %error,
            suppressed,
            backoff = ?backoff,
            "tick failed"
        );
    }
    if error.is_fatal() && slot.transition(&[TickState::Active], TickState::Inactive).is_ok() {
        tracing::warn!(group = %name, tick = %slot.id, "tick inactivated after fatal failure");
    }
    shared.report(TickFailure {
        tick: slot.id,
        error,
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
