//! 收包循环与下游消费者之间的有界交接队列。

use std::{fmt, time::Duration};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use intake_core::{IntakeError, Packet, Result};

/// 有界、线程安全的 FIFO 交接队列。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在未注册监听器时，收包线程把报文放入队列，由独立消费者异步取出；
/// - 队列满时生产端绝不阻塞：报文原样退回，由收包循环回收并计入背压丢弃。
///
/// ## 契约（What）
/// - [`HandoffQueue::offer`]：非阻塞；队列满时返回 `Err(packet)` 交还所有权；
/// - 消费端：`poll` / `poll_timeout` / `drain`，取出的报文由消费者负责回收；
/// - 句柄可克隆，所有克隆共享同一队列；队列同时持有两端，因此永远不会断开。
///
/// ## 实现（How）
/// - 基于 `crossbeam_channel::bounded`，容量在构造时固定。
#[derive(Clone)]
pub struct HandoffQueue {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    capacity: usize,
}

impl HandoffQueue {
    /// 创建容量为 `capacity` 的队列。容量为 0 视为配置错误。
    pub fn bounded(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(IntakeError::invalid_setting(
                "buffer-size",
                "0",
                "handoff queue needs room for at least one packet",
            ));
        }
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Ok(Self { tx, rx, capacity })
    }

    /// 尝试入队；队列已满时退回报文。
    pub fn offer(&self, packet: Packet) -> core::result::Result<(), Packet> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(packet)) | Err(TrySendError::Disconnected(packet)) => {
                Err(packet)
            }
        }
    }

    /// 非阻塞取出队首报文。
    pub fn poll(&self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// 最多等待 `timeout` 取出队首报文。
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Packet> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// 取出当前全部报文。
    pub fn drain(&self) -> Vec<Packet> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for HandoffQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: u8) -> Packet {
        let mut packet = Packet::detached(4);
        packet.buffer_mut()[0] = tag;
        packet.mark_received(1, "127.0.0.1:7000".parse::<std::net::SocketAddr>().expect("解析地址").into());
        packet
    }

    #[test]
    fn full_queue_hands_packet_back() {
        let queue = HandoffQueue::bounded(1).expect("创建队列");
        queue.offer(tagged(1)).expect("首个报文入队");
        let rejected = queue.offer(tagged(2)).expect_err("队列已满");
        assert_eq!(rejected.payload(), &[2]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn packets_leave_in_arrival_order() {
        let queue = HandoffQueue::bounded(4).expect("创建队列");
        for tag in 1..=3 {
            queue.offer(tagged(tag)).expect("入队");
        }
        assert_eq!(queue.poll().map(|p| p.payload()[0]), Some(1));
        let rest: Vec<u8> = queue.drain().iter().map(|p| p.payload()[0]).collect();
        assert_eq!(rest, vec![2, 3]);
        assert!(queue.is_empty());
        assert!(queue.poll_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            HandoffQueue::bounded(0),
            Err(IntakeError::InvalidSetting { .. })
        ));
    }
}
