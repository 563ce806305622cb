//! 收包器与 Tick 调度器之间的绑定。

use std::{sync::Arc, time::Duration};

use intake_core::{Result, TickRunnable};

use crate::receiver::SocketReceiver;

/// 每次 `tick` 恰好执行一轮收包。
///
/// 错误原样交还调度组，由调度组记录日志、投递失败通道，并在致命错误后停用本 Tick。
#[derive(Clone, Debug)]
pub struct ReceiveTick {
    receiver: Arc<SocketReceiver>,
}

impl ReceiveTick {
    pub fn new(receiver: Arc<SocketReceiver>) -> Self {
        Self { receiver }
    }
}

impl TickRunnable for ReceiveTick {
    fn tick(&self, _elapsed: Duration) -> Result<()> {
        let outcome = self.receiver.run_cycle()?;
        tracing::trace!(?outcome, "receive cycle finished");
        Ok(())
    }
}
