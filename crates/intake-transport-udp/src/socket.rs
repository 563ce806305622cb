//! 数据报来源抽象与基于 `socket2` 的生产实现。
//!
//! # 模块定位（Why）
//! - 收包循环只需要“阻塞读一个数据报、调整读超时、关闭”三种能力；把它们收敛到
//!   [`DatagramSource`]，循环即可在脚本化来源上做确定性测试；
//! - [`BoundUdpSocket`] 负责真实套接字的绑定参数（`SO_REUSEADDR`、接收缓冲）与关闭语义。
//!
//! # 关闭语义（How）
//! - `close` 先置位关闭标志，再执行 `shutdown(Both)`：在 Linux 上这会唤醒阻塞中的 `recv_from`；
//! - 唤醒后的读取可能返回零长度或 `InvalidInput`，调用方必须以 [`DatagramSource::is_closed`]
//!   为准判定“套接字已关闭”，而不是依据具体错误码。

use std::{
    io,
    net::{Ipv4Addr, Shutdown, SocketAddr, UdpSocket},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use intake_core::{IntakeError, Result};

/// 阻塞式数据报来源。
///
/// # 契约说明（What）
/// - `recv_from`：阻塞直到收到一个数据报、读超时（`WouldBlock`/`TimedOut`）或出错；
/// - `set_read_timeout`：`None` 表示无限期阻塞；
/// - `close`：幂等；之后 `is_closed` 恒为真，阻塞中的读取应尽快返回；
/// - **线程安全**：`recv_from` 与 `close` 可在不同线程并发调用。
pub trait DatagramSource: Send + Sync + 'static {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// 绑定参数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BindOptions {
    /// 监听端口，0 表示由系统分配。
    pub port: u16,
    /// 内核接收缓冲大小（`SO_RCVBUF`），缺省沿用系统默认值。
    pub recv_buffer_size: Option<usize>,
}

impl BindOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            recv_buffer_size: None,
        }
    }

    pub fn with_recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }
}

/// 绑定在全部 IPv4 接口上的 UDP 套接字。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 使用 `socket2` 创建套接字，以便在绑定前设置 `SO_REUSEADDR` 与接收缓冲；
///   绑定完成后转换为标准库 `UdpSocket` 执行阻塞读。
///
/// ## 契约（What）
/// - `bind` 失败返回 [`IntakeError::Bind`]，携带端口与底层 `io::Error`；
/// - 套接字在值被丢弃时释放；`close` 只关闭收发方向，描述符保持有效直到丢弃。
#[derive(Debug)]
pub struct BoundUdpSocket {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl BoundUdpSocket {
    pub fn bind(options: BindOptions) -> Result<Self> {
        let port = options.port;
        let bind_error = |source: io::Error| IntakeError::Bind { port, source };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        if let Some(size) = options.recv_buffer_size {
            socket.set_recv_buffer_size(size).map_err(bind_error)?;
        }
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into()).map_err(bind_error)?;

        Ok(Self {
            socket: socket.into(),
            closed: AtomicBool::new(false),
        })
    }

    /// 实际绑定的端口（端口 0 时由系统分配）。
    pub fn port(&self) -> io::Result<u16> {
        self.socket.local_addr().map(|addr| addr.port())
    }
}

impl DatagramSource for BoundUdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // 未连接的 UDP 套接字上 shutdown 会返回 ENOTCONN，但阻塞的读取仍会被唤醒
        if let Err(err) = SockRef::from(&self.socket).shutdown(Shutdown::Both) {
            tracing::trace!(error = %err, "udp shutdown reported an error");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 毫秒超时到读超时参数的换算：0 表示不设上限。
pub(crate) fn read_timeout(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}
