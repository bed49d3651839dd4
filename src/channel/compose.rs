//! Fallback rules turning a driver's native primitives into the full
//! send/recv/transact surface.
//!
//! Each rule is a plan chosen from the driver's declared [`Operations`];
//! the executors below only follow the plan.

use super::driver::{DriverApi, Operations, Transfer};
use super::ChannelInfo;
use crate::error::{Error, Result};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPlan {
    Direct,
    /// `transact` with no receive side.
    ViaTransact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvPlan {
    Direct,
    /// `transact` with no send side.
    ViaTransact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactPlan {
    Direct,
    /// `send`, sleep for the delay, then `recv`.
    Sequential,
}

impl SendPlan {
    pub fn for_operations(ops: Operations) -> Option<Self> {
        if ops.contains(Operations::SEND) {
            Some(SendPlan::Direct)
        } else if ops.contains(Operations::TRANSACT) {
            Some(SendPlan::ViaTransact)
        } else {
            None
        }
    }
}

impl RecvPlan {
    pub fn for_operations(ops: Operations) -> Option<Self> {
        if ops.contains(Operations::RECV) {
            Some(RecvPlan::Direct)
        } else if ops.contains(Operations::TRANSACT) {
            Some(RecvPlan::ViaTransact)
        } else {
            None
        }
    }
}

impl TransactPlan {
    /// `None` for a one-sided driver: it cannot do two-sided work.
    pub fn for_operations(ops: Operations) -> Option<Self> {
        if ops.contains(Operations::TRANSACT) {
            Some(TransactPlan::Direct)
        } else if ops.contains(Operations::SEND | Operations::RECV) {
            Some(TransactPlan::Sequential)
        } else {
            None
        }
    }
}

pub fn send(api: &dyn DriverApi, channel: &ChannelInfo, transfer: Transfer<'_>) -> Result<()> {
    match SendPlan::for_operations(api.operations()).ok_or(Error::Illegal)? {
        SendPlan::Direct => api.send(channel, transfer.frame, transfer.count),
        SendPlan::ViaTransact => api.transact(channel, Some(transfer), Duration::ZERO, None),
    }
}

pub fn recv(api: &dyn DriverApi, channel: &ChannelInfo, transfer: Transfer<'_>) -> Result<()> {
    match RecvPlan::for_operations(api.operations()).ok_or(Error::Illegal)? {
        RecvPlan::Direct => api.recv(channel, transfer.frame, transfer.count),
        RecvPlan::ViaTransact => api.transact(channel, None, Duration::ZERO, Some(transfer)),
    }
}

pub fn transact(
    api: &dyn DriverApi,
    channel: &ChannelInfo,
    send: Option<Transfer<'_>>,
    delay: Duration,
    recv: Option<Transfer<'_>>,
) -> Result<()> {
    match TransactPlan::for_operations(api.operations()).ok_or(Error::Illegal)? {
        TransactPlan::Direct => api.transact(channel, send, delay, recv),
        TransactPlan::Sequential => {
            if let Some(out) = send {
                api.send(channel, out.frame, out.count)?;
            }
            if let Some(input) = recv {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                api.recv(channel, input.frame, input.count)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_plan() {
        assert_eq!(SendPlan::for_operations(Operations::SEND), Some(SendPlan::Direct));
        assert_eq!(
            SendPlan::for_operations(Operations::SEND | Operations::TRANSACT),
            Some(SendPlan::Direct)
        );
        assert_eq!(SendPlan::for_operations(Operations::TRANSACT), Some(SendPlan::ViaTransact));
        assert_eq!(SendPlan::for_operations(Operations::RECV), None);
    }

    #[test]
    fn test_recv_plan() {
        assert_eq!(RecvPlan::for_operations(Operations::RECV), Some(RecvPlan::Direct));
        assert_eq!(RecvPlan::for_operations(Operations::TRANSACT), Some(RecvPlan::ViaTransact));
        assert_eq!(RecvPlan::for_operations(Operations::SEND), None);
    }

    #[test]
    fn test_transact_plan() {
        assert_eq!(
            TransactPlan::for_operations(Operations::TRANSACT),
            Some(TransactPlan::Direct)
        );
        assert_eq!(
            TransactPlan::for_operations(Operations::SEND | Operations::RECV),
            Some(TransactPlan::Sequential)
        );
        assert_eq!(TransactPlan::for_operations(Operations::SEND), None);
        assert_eq!(TransactPlan::for_operations(Operations::RECV), None);
        assert_eq!(TransactPlan::for_operations(Operations::empty()), None);
    }
}
