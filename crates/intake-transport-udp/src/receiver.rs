//! 单轮收包算法。
//!
//! # 模块定位（Why）
//! - 每一轮：租借报文 → 阻塞读取 → 盖上来源与状态 → 交给监听器或放入队列；
//! - 三类结果被严格区分：正常交付、预期内的“空转”（超时、背压丢弃、销毁中止），以及必须上报的错误；
//! - 任何退出路径上，本轮租借的报文要么交付一次、要么回收一次，回收总发生在错误返回之前。
//!
//! # 共享状态（How）
//! - 读超时保存在 `AtomicU64` 中，每次阻塞读取前比对并按需下发到套接字；
//!   下发本身在一把短锁内进行，锁内总是读取最新值，因此并发的热更新不会被旧值覆盖；
//! - 交付路由在启动时写入 `OnceLock`，此后不再变化；
//! - 拆除标志由生命周期控制器在关闭套接字前置位，用于把销毁引起的读错误吸收为 [`CycleOutcome::Aborted`]。

use std::{
    fmt, io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use intake_core::{
    ErrorCategory, IntakeError, LifecycleState, Packet, PacketPool, Result,
};
use parking_lot::Mutex;

use crate::{
    queue::HandoffQueue,
    socket::{DatagramSource, read_timeout},
};

/// 同步报文处理者。
///
/// `process` 在收包线程上执行并获得报文所有权，处理完毕后应调用 [`Packet::recycle`]
/// （遗忘回收的报文会在丢弃时归还给池）。闭包 `Fn(Packet)` 自动实现该 trait。
pub trait SocketListener: Send + Sync + 'static {
    fn process(&self, packet: Packet);
}

impl<F> SocketListener for F
where
    F: Fn(Packet) + Send + Sync + 'static,
{
    fn process(&self, packet: Packet) {
        self(packet)
    }
}

/// 报文交付路由，启动时确定。
#[derive(Clone)]
pub enum Route {
    Listener(Arc<dyn SocketListener>),
    Queue(HandoffQueue),
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Listener(_) => f.write_str("Route::Listener"),
            Route::Queue(queue) => f.debug_tuple("Route::Queue").field(queue).finish(),
        }
    }
}

/// 一轮收包的正常结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    /// 报文已同步交给监听器。
    Delivered,
    /// 报文已放入交接队列。
    Queued,
    /// 队列已满，报文被回收。
    Dropped,
    /// 读超时，报文被回收。
    TimedOut,
    /// 套接字因销毁而关闭，本轮被中止。
    Aborted,
}

impl CycleOutcome {
    /// 空转类结果对应的错误分类，便于与错误统一打点。
    pub fn category(self) -> Option<ErrorCategory> {
        match self {
            CycleOutcome::TimedOut => Some(ErrorCategory::Transient),
            CycleOutcome::Dropped => Some(ErrorCategory::Backpressure),
            _ => None,
        }
    }
}

/// 收包计数快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReceiverStats {
    pub cycles: u64,
    pub received: u64,
    pub delivered: u64,
    pub queued: u64,
    pub dropped_backpressure: u64,
    pub timeouts: u64,
    pub faults: u64,
    pub aborted: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    queued: AtomicU64,
    dropped_backpressure: AtomicU64,
    timeouts: AtomicU64,
    faults: AtomicU64,
    aborted: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

/// 尚未下发到套接字的超时值。
const TIMEOUT_UNAPPLIED: u64 = u64::MAX;

/// 单套接字收包器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“一轮收包”实现为可独立调用的同步函数，调度器只负责反复调用它；
/// - 同一收包器在任意时刻只应被一个工作者驱动，交付顺序即到达顺序。
///
/// ## 契约（What）
/// - [`SocketReceiver::run_cycle`]：执行一轮，预期内的结果以 [`CycleOutcome`] 返回，
///   池耗尽、套接字故障、外部关闭与未启动以 [`IntakeError`] 返回；
/// - [`SocketReceiver::install_route`]：只能成功一次；
/// - [`SocketReceiver::update_timeout`]：立即下发到套接字，并作用于其后的每次读取。
pub struct SocketReceiver {
    source: Arc<dyn DatagramSource>,
    pool: Arc<dyn PacketPool>,
    route: OnceLock<Route>,
    timeout_ms: AtomicU64,
    // 已下发到套接字的超时；锁同时串行化所有下发动作
    applied_timeout_ms: Mutex<u64>,
    teardown: AtomicBool,
    counters: Counters,
}

impl SocketReceiver {
    pub fn new(
        source: Arc<dyn DatagramSource>,
        pool: Arc<dyn PacketPool>,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            pool,
            route: OnceLock::new(),
            timeout_ms: AtomicU64::new(duration_millis(timeout)),
            applied_timeout_ms: Mutex::new(TIMEOUT_UNAPPLIED),
            teardown: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn source(&self) -> &Arc<dyn DatagramSource> {
        &self.source
    }

    /// 固定交付路由。重复安装返回 `IllegalState`。
    pub fn install_route(&self, route: Route) -> Result<()> {
        self.route
            .set(route)
            .map_err(|_| IntakeError::illegal_state("install delivery route", LifecycleState::Started))
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.get()
    }

    /// 当前配置的读超时；`Duration::ZERO` 表示不设上限。
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    /// 更新读超时并立即下发到套接字。
    ///
    /// 下发失败时新值仍然保留，下一轮读取前会再次尝试。
    pub fn update_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.timeout_ms
            .store(duration_millis(timeout), Ordering::Release);
        self.push_timeout(true)
    }

    /// 标记进入拆除流程；此后因关闭导致的读错误被吸收。
    pub fn begin_teardown(&self) {
        self.teardown.store(true, Ordering::Release);
    }

    pub fn is_tearing_down(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReceiverStats {
        self.counters.snapshot()
    }

    /// 执行一轮收包。
    ///
    /// # 执行步骤（How）
    /// 1. 路由未安装（模块未启动）时返回 `IllegalState`；
    /// 2. 向池租借报文，失败直接上抛，本轮无需清理；
    /// 3. 按需下发最新读超时，随后阻塞读取到报文缓冲；
    /// 4. 成功：记录端点与长度，交给监听器或入队；队列满则回收并告警；
    /// 5. 超时：回收并返回 `TimedOut`；
    /// 6. 其它错误或套接字已关闭：标记错误、回收，再按拆除标志区分吸收或上报。
    pub fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(route) = self.route.get() else {
            return Err(IntakeError::illegal_state(
                "run receive cycle",
                LifecycleState::Initialized,
            ));
        };
        Counters::bump(&self.counters.cycles);

        let mut packet = self.pool.acquire()?;
        if self.source.is_closed() {
            return self.close_cycle(packet);
        }

        let received = self
            .apply_timeout()
            .and_then(|()| self.source.recv_from(packet.buffer_mut()));

        if self.source.is_closed() {
            return self.close_cycle(packet);
        }

        match received {
            Ok((len, from)) => {
                packet.mark_received(len, from.into());
                Counters::bump(&self.counters.received);
                Ok(self.deliver(route, packet))
            }
            Err(err) if is_timeout(&err) => {
                packet.recycle();
                Counters::bump(&self.counters.timeouts);
                tracing::debug!(timeout_ms = self.timeout_ms.load(Ordering::Relaxed), "udp receive timed out");
                Ok(CycleOutcome::TimedOut)
            }
            Err(err) => {
                packet.mark_error();
                packet.recycle();
                if self.is_tearing_down() {
                    return Ok(self.abort(&err));
                }
                Counters::bump(&self.counters.faults);
                Err(IntakeError::Receive(err))
            }
        }
    }

    fn deliver(&self, route: &Route, packet: Packet) -> CycleOutcome {
        match route {
            Route::Listener(listener) => {
                listener.process(packet);
                Counters::bump(&self.counters.delivered);
                CycleOutcome::Delivered
            }
            Route::Queue(queue) => match queue.offer(packet) {
                Ok(()) => {
                    Counters::bump(&self.counters.queued);
                    CycleOutcome::Queued
                }
                Err(rejected) => {
                    let from = rejected.endpoint();
                    let len = rejected.len();
                    rejected.recycle();
                    Counters::bump(&self.counters.dropped_backpressure);
                    tracing::warn!(
                        capacity = queue.capacity(),
                        len,
                        from = ?from,
                        "handoff queue is full; packet recycled"
                    );
                    CycleOutcome::Dropped
                }
            },
        }
    }

    fn close_cycle(&self, mut packet: Packet) -> Result<CycleOutcome> {
        packet.mark_error();
        packet.recycle();
        if self.is_tearing_down() {
            return Ok(self.abort(&io::Error::from(io::ErrorKind::NotConnected)));
        }
        Counters::bump(&self.counters.faults);
        Err(IntakeError::SocketClosed)
    }

    fn abort(&self, err: &io::Error) -> CycleOutcome {
        Counters::bump(&self.counters.aborted);
        tracing::debug!(error = %err, "receive aborted by teardown");
        CycleOutcome::Aborted
    }

    fn apply_timeout(&self) -> io::Result<()> {
        self.push_timeout(false)
    }

    /// 在锁内读取最新超时并下发；`force` 为假时与已下发值相同则跳过。
    fn push_timeout(&self, force: bool) -> io::Result<()> {
        let mut applied = self.applied_timeout_ms.lock();
        let wanted = self.timeout_ms.load(Ordering::Acquire);
        if !force && *applied == wanted {
            return Ok(());
        }
        match self.source.set_read_timeout(read_timeout(wanted)) {
            Ok(()) => {
                *applied = wanted;
                Ok(())
            }
            Err(err) => {
                *applied = TIMEOUT_UNAPPLIED;
                Err(err)
            }
        }
    }
}

impl fmt::Debug for SocketReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketReceiver")
            .field("route", &self.route.get())
            .field("timeout", &self.timeout())
            .field("tearing_down", &self.is_tearing_down())
            .field("stats", &self.stats())
            .finish()
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn duration_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(TIMEOUT_UNAPPLIED - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::atomic::AtomicUsize,
    };

    use intake_buffer::{PoolConfig, SlabPacketPool};
    use crossbeam_channel::Sender;
    use intake_core::PacketStatus;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    #[derive(Clone, Debug)]
    enum Step {
        Datagram(Vec<u8>),
        Timeout,
        Fault,
    }

    /// 按脚本逐步吐出结果的数据报来源；脚本耗尽后表现为超时。
    #[derive(Default)]
    struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        timeouts: Mutex<Vec<Option<Duration>>>,
        closed: AtomicBool,
        close_on_next_recv: AtomicBool,
        // 下发该超时时先通知再停顿，模拟缓慢的系统调用
        stall_on: Mutex<Option<(Duration, Sender<()>)>>,
    }

    impl ScriptedSource {
        fn with(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into_iter().collect()),
                ..Default::default()
            })
        }
    }

    impl DatagramSource for ScriptedSource {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            if self.close_on_next_recv.load(Ordering::SeqCst) {
                self.close();
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            match self.steps.lock().pop_front() {
                Some(Step::Datagram(bytes)) => {
                    let len = bytes.len().min(buf.len());
                    buf[..len].copy_from_slice(&bytes[..len]);
                    Ok((bytes.len(), "192.0.2.7:5060".parse().expect("解析地址")))
                }
                Some(Step::Fault) => Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                Some(Step::Timeout) | None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            let stall = self
                .stall_on
                .lock()
                .take_if(|(at, _)| timeout == Some(*at));
            if let Some((_, entered)) = stall {
                entered.send(()).expect("通知测试线程");
                std::thread::sleep(Duration::from_millis(50));
            }
            self.timeouts.lock().push(timeout);
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().expect("解析地址"))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn pool(max_packets: usize) -> Arc<SlabPacketPool> {
        Arc::new(SlabPacketPool::new(PoolConfig {
            packet_capacity: 64,
            max_packets,
        }))
    }

    fn queued_receiver(
        source: Arc<ScriptedSource>,
        pool: Arc<SlabPacketPool>,
        capacity: usize,
    ) -> (SocketReceiver, HandoffQueue) {
        let receiver = SocketReceiver::new(source, pool, Duration::from_millis(100));
        let queue = HandoffQueue::bounded(capacity).expect("创建队列");
        receiver
            .install_route(Route::Queue(queue.clone()))
            .expect("安装路由");
        (receiver, queue)
    }

    #[test]
    fn cycle_before_route_is_illegal_state() {
        let source = ScriptedSource::with([Step::Datagram(b"x".to_vec())]);
        let pool = pool(4);
        let receiver = SocketReceiver::new(source, pool.clone(), Duration::from_millis(100));
        assert!(matches!(
            receiver.run_cycle(),
            Err(IntakeError::IllegalState { .. })
        ));
        assert_eq!(pool.statistics().acquired, 0, "未启动时不得租借报文");
    }

    #[test]
    fn route_is_fixed_once_installed() {
        let receiver = SocketReceiver::new(
            ScriptedSource::with([]),
            pool(1),
            Duration::from_millis(1),
        );
        let queue = HandoffQueue::bounded(1).expect("创建队列");
        receiver
            .install_route(Route::Queue(queue.clone()))
            .expect("首次安装");
        assert!(receiver.install_route(Route::Queue(queue)).is_err());
    }

    #[test]
    fn received_packet_carries_endpoint_and_payload() {
        let source = ScriptedSource::with([Step::Datagram(b"INVITE".to_vec())]);
        let (receiver, queue) = queued_receiver(source, pool(4), 4);
        assert_eq!(receiver.run_cycle().expect("收包"), CycleOutcome::Queued);

        let packet = queue.poll().expect("队列中应有报文");
        assert_eq!(packet.status(), PacketStatus::Received);
        assert_eq!(packet.payload(), b"INVITE");
        assert_eq!(
            packet.endpoint().map(|e| e.socket_addr()),
            Some("192.0.2.7:5060".parse().expect("解析地址"))
        );
    }

    #[test]
    fn timeout_recycles_and_is_not_an_error() {
        let pool = pool(4);
        let (receiver, queue) = queued_receiver(ScriptedSource::with([Step::Timeout]), pool.clone(), 4);
        assert_eq!(receiver.run_cycle().expect("超时不是错误"), CycleOutcome::TimedOut);
        assert!(queue.is_empty());
        let stats = pool.statistics();
        assert_eq!((stats.acquired, stats.recycled), (1, 1));
        assert_eq!(CycleOutcome::TimedOut.category(), Some(ErrorCategory::Transient));
    }

    #[test]
    #[traced_test]
    fn full_queue_drops_with_warning() {
        let pool = pool(8);
        let source = ScriptedSource::with([
            Step::Datagram(b"a".to_vec()),
            Step::Datagram(b"b".to_vec()),
        ]);
        let (receiver, queue) = queued_receiver(source, pool.clone(), 1);

        assert_eq!(receiver.run_cycle().expect("第一轮"), CycleOutcome::Queued);
        assert_eq!(receiver.run_cycle().expect("第二轮"), CycleOutcome::Dropped);
        assert!(logs_contain("handoff queue is full"));
        assert_eq!(queue.len(), 1);
        assert_eq!(receiver.stats().dropped_backpressure, 1);
        assert_eq!(pool.statistics().recycled, 1);
    }

    #[test]
    fn listener_receives_every_datagram_and_queue_stays_unused() {
        let source = ScriptedSource::with([
            Step::Datagram(b"1".to_vec()),
            Step::Timeout,
            Step::Datagram(b"2".to_vec()),
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receiver = SocketReceiver::new(source, pool(4), Duration::from_millis(100));
        receiver
            .install_route(Route::Listener(Arc::new(move |packet: Packet| {
                sink.lock().push(packet.payload().to_vec());
                packet.recycle();
            })))
            .expect("安装监听器");

        let outcomes: Vec<CycleOutcome> = (0..3)
            .map(|_| receiver.run_cycle().expect("收包"))
            .collect();
        assert_eq!(
            outcomes,
            vec![CycleOutcome::Delivered, CycleOutcome::TimedOut, CycleOutcome::Delivered]
        );
        assert_eq!(*seen.lock(), vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(receiver.stats().queued, 0);
    }

    #[test]
    fn pool_exhaustion_propagates_without_touching_socket() {
        let pool = pool(1);
        let _held = pool.acquire().expect("占用唯一报文");
        let source = ScriptedSource::with([Step::Datagram(b"x".to_vec())]);
        let (receiver, _queue) = queued_receiver(source.clone(), pool, 1);
        assert!(matches!(
            receiver.run_cycle(),
            Err(IntakeError::PoolExhausted { limit: 1 })
        ));
        assert_eq!(source.steps.lock().len(), 1, "池耗尽时不应读取套接字");
    }

    #[test]
    fn socket_fault_is_reported_after_recycle() {
        let pool = pool(2);
        let (receiver, _queue) = queued_receiver(ScriptedSource::with([Step::Fault]), pool.clone(), 1);
        let err = receiver.run_cycle().expect_err("套接字故障必须上报");
        assert!(matches!(err, IntakeError::Receive(_)));
        assert_eq!(err.category(), ErrorCategory::SocketFault);
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn external_close_surfaces_socket_closed() {
        let pool = pool(2);
        let source = ScriptedSource::with([]);
        source.close_on_next_recv.store(true, Ordering::SeqCst);
        let (receiver, _queue) = queued_receiver(source, pool.clone(), 1);
        assert!(matches!(receiver.run_cycle(), Err(IntakeError::SocketClosed)));
        assert_eq!(pool.statistics().active_leases, 0);
        assert_eq!(receiver.stats().faults, 1);
    }

    #[test]
    fn close_during_teardown_is_absorbed() {
        let pool = pool(2);
        let source = ScriptedSource::with([]);
        source.close_on_next_recv.store(true, Ordering::SeqCst);
        let (receiver, _queue) = queued_receiver(source, pool.clone(), 1);
        receiver.begin_teardown();
        assert_eq!(receiver.run_cycle().expect("销毁期间吸收错误"), CycleOutcome::Aborted);
        assert_eq!(receiver.run_cycle().expect("关闭后继续吸收"), CycleOutcome::Aborted);
        assert_eq!(receiver.stats().aborted, 2);
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn timeout_changes_are_applied_before_next_receive() {
        let source = ScriptedSource::with([Step::Timeout, Step::Timeout, Step::Timeout]);
        let (receiver, _queue) = queued_receiver(source.clone(), pool(2), 1);

        receiver.run_cycle().expect("第一轮");
        receiver.run_cycle().expect("第二轮：超时未变，不重复下发");
        receiver
            .update_timeout(Duration::from_millis(250))
            .expect("更新超时");
        receiver.run_cycle().expect("第三轮");

        assert_eq!(
            *source.timeouts.lock(),
            vec![Some(Duration::from_millis(100)), Some(Duration::from_millis(250))]
        );
        receiver.update_timeout(Duration::ZERO).expect("取消超时上限");
        assert_eq!(source.timeouts.lock().last().copied(), Some(None));
    }

    #[test]
    fn concurrent_update_is_not_overwritten_by_stale_apply() {
        let source = ScriptedSource::with([Step::Timeout, Step::Timeout]);
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        *source.stall_on.lock() = Some((Duration::from_millis(5000), entered_tx));
        let receiver = SocketReceiver::new(source.clone(), pool(2), Duration::from_millis(5000));
        let queue = HandoffQueue::bounded(1).expect("创建队列");
        receiver
            .install_route(Route::Queue(queue))
            .expect("安装路由");

        std::thread::scope(|scope| {
            let worker = scope.spawn(|| receiver.run_cycle());
            entered_rx
                .recv_timeout(Duration::from_secs(2))
                .expect("收包线程开始下发旧超时");
            receiver
                .update_timeout(Duration::from_millis(100))
                .expect("热更新超时");
            worker
                .join()
                .expect("收包线程")
                .expect("本轮超时");
        });

        assert_eq!(
            source.timeouts.lock().last().copied(),
            Some(Some(Duration::from_millis(100))),
            "套接字上最终必须是最新的超时"
        );
        receiver.run_cycle().expect("下一轮");
        assert_eq!(
            *source.timeouts.lock(),
            vec![Some(Duration::from_millis(5000)), Some(Duration::from_millis(100))]
        );
    }

    proptest! {
        /// 任意收包脚本下：租借次数 = 回收次数 + 仍在队列中的报文数。
        #[test]
        fn every_acquired_packet_is_recycled_or_delivered(
            capacity in 1usize..6,
            steps in proptest::collection::vec(
                prop_oneof![
                    proptest::collection::vec(any::<u8>(), 0..80).prop_map(Step::Datagram),
                    Just(Step::Timeout),
                    Just(Step::Fault),
                ],
                0..40,
            ),
        ) {
            let pool = pool(64);
            let cycles = steps.len();
            let (receiver, queue) = queued_receiver(ScriptedSource::with(steps), pool.clone(), capacity);
            let dropped = AtomicUsize::new(0);
            for _ in 0..cycles {
                if let Ok(CycleOutcome::Dropped) = receiver.run_cycle() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            let stats = pool.statistics();
            prop_assert_eq!(stats.acquired, stats.recycled + queue.len() as u64);
            prop_assert_eq!(stats.active_leases, queue.len());
            prop_assert!(queue.len() <= capacity);
            prop_assert_eq!(receiver.stats().dropped_backpressure, dropped.load(Ordering::Relaxed) as u64);
        }

        /// 监听器路由：租借次数 = 回收次数 + 监听器仍持有的报文数，交付计数等于监听器被调用的次数。
        #[test]
        fn listener_route_accounts_for_every_acquired_packet(
            steps in proptest::collection::vec(
                prop_oneof![
                    proptest::collection::vec(any::<u8>(), 0..80).prop_map(Step::Datagram),
                    Just(Step::Timeout),
                    Just(Step::Fault),
                ],
                0..40,
            ),
            release_every in 1usize..4,
        ) {
            let pool = pool(64);
            let cycles = steps.len();
            let held = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&held);
            let seen = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&seen);
            let receiver = SocketReceiver::new(ScriptedSource::with(steps), pool.clone(), Duration::from_millis(100));
            receiver
                .install_route(Route::Listener(Arc::new(move |packet: Packet| {
                    // 每隔若干个报文立即回收一个，其余由监听器持有
                    if counter.fetch_add(1, Ordering::Relaxed) % release_every == 0 {
                        packet.recycle();
                    } else {
                        sink.lock().push(packet);
                    }
                })))
                .expect("安装路由");
            for _ in 0..cycles {
                let _ = receiver.run_cycle();
            }
            let stats = pool.statistics();
            let holding = held.lock().len();
            prop_assert_eq!(stats.acquired, stats.recycled + holding as u64);
            prop_assert_eq!(stats.active_leases, holding);
            prop_assert_eq!(receiver.stats().delivered, seen.load(Ordering::Relaxed) as u64);
            prop_assert_eq!(receiver.stats().queued, 0);
        }
    }
}
