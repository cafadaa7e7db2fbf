//! Priority lanes — three in-process FIFO queues over the durable store.
//!
//! The store's QUEUED status is authoritative; lanes only carry task ids
//! for dispatch. A crash loses lane contents, never tasks: startup recovery
//! re-injects every persisted QUEUED row.

pub mod retry;

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::tasks::model::TaskPriority;

pub use retry::{RetryDecision, RetryPolicy};

/// One of three logical dispatch queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Urgent,
    Normal,
    Low,
}

impl Lane {
    /// The fixed priority -> lane mapping.
    pub fn for_priority(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::Urgent => Self::Urgent,
            TaskPriority::Normal => Self::Normal,
            TaskPriority::Low => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Poll order for one dequeue cycle.
///
/// Urgent is preferred, but every 4th cycle leads with Normal and every 8th
/// with Low, so under sustained urgent load Normal is serviced within 4
/// cycles and Low within 8 — no lane starves.
pub fn poll_order(cycle: u64) -> [Lane; 3] {
    if cycle % 8 == 7 {
        [Lane::Low, Lane::Normal, Lane::Urgent]
    } else if cycle % 4 == 3 {
        [Lane::Normal, Lane::Urgent, Lane::Low]
    } else {
        [Lane::Urgent, Lane::Normal, Lane::Low]
    }
}

/// The three lanes plus a wakeup signal for blocked workers.
pub struct LaneQueues {
    lanes: [Mutex<VecDeque<Uuid>>; 3],
    notify: Notify,
}

impl LaneQueues {
    pub fn new() -> Self {
        Self {
            lanes: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            notify: Notify::new(),
        }
    }

    /// Push a task id onto a lane and wake one blocked worker.
    pub async fn push(&self, lane: Lane, task_id: Uuid) {
        self.lanes[lane.index()].lock().await.push_back(task_id);
        self.notify.notify_one();
    }

    /// Try each lane in `order`, returning the first available task.
    async fn try_pop(&self, order: &[Lane; 3]) -> Option<(Lane, Uuid)> {
        for lane in order {
            if let Some(id) = self.lanes[lane.index()].lock().await.pop_front() {
                return Some((*lane, id));
            }
        }
        None
    }

    /// Blocking dequeue with a timeout.
    ///
    /// Polls lanes in the anti-starvation order for `cycle`, then parks on
    /// the notify signal (no busy-spin) until a push arrives or the timeout
    /// elapses.
    pub async fn pop_weighted(
        &self,
        cycle: u64,
        timeout: std::time::Duration,
    ) -> Option<(Lane, Uuid)> {
        let order = poll_order(cycle);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop(&order).await {
                return Some(hit);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Number of queued ids in one lane.
    pub async fn lane_len(&self, lane: Lane) -> usize {
        self.lanes[lane.index()].lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        for lane in &self.lanes {
            if !lane.lock().await.is_empty() {
                return false;
            }
        }
        true
    }
}

impl Default for LaneQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fixed_priority_mapping() {
        assert_eq!(Lane::for_priority(TaskPriority::Urgent), Lane::Urgent);
        assert_eq!(Lane::for_priority(TaskPriority::Normal), Lane::Normal);
        assert_eq!(Lane::for_priority(TaskPriority::Low), Lane::Low);
    }

    #[tokio::test]
    async fn fifo_within_a_lane() {
        let queues = LaneQueues::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queues.push(Lane::Normal, first).await;
        queues.push(Lane::Normal, second).await;

        let (_, a) = queues.pop_weighted(0, Duration::from_millis(10)).await.unwrap();
        let (_, b) = queues.pop_weighted(0, Duration::from_millis(10)).await.unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
    }

    #[tokio::test]
    async fn urgent_preferred_on_plain_cycles() {
        let queues = LaneQueues::new();
        let low = Uuid::new_v4();
        let urgent = Uuid::new_v4();
        queues.push(Lane::Low, low).await;
        queues.push(Lane::Urgent, urgent).await;

        let (lane, id) = queues.pop_weighted(0, Duration::from_millis(10)).await.unwrap();
        assert_eq!(lane, Lane::Urgent);
        assert_eq!(id, urgent);
    }

    #[tokio::test]
    async fn lower_lanes_serviced_within_bounded_cycles() {
        let queues = LaneQueues::new();
        let normal = Uuid::new_v4();
        let low = Uuid::new_v4();
        queues.push(Lane::Normal, normal).await;
        queues.push(Lane::Low, low).await;

        // Keep urgent saturated the whole time.
        let mut normal_seen_at = None;
        let mut low_seen_at = None;
        for cycle in 0..16u64 {
            queues.push(Lane::Urgent, Uuid::new_v4()).await;
            let (lane, id) = queues
                .pop_weighted(cycle, Duration::from_millis(10))
                .await
                .unwrap();
            if lane == Lane::Normal && id == normal {
                normal_seen_at = Some(cycle);
            }
            if lane == Lane::Low && id == low {
                low_seen_at = Some(cycle);
            }
        }

        assert!(
            normal_seen_at.is_some_and(|c| c <= 3),
            "normal not serviced within 4 cycles: {normal_seen_at:?}"
        );
        assert!(
            low_seen_at.is_some_and(|c| c <= 7),
            "low not serviced within 8 cycles: {low_seen_at:?}"
        );
    }

    #[tokio::test]
    async fn empty_pop_times_out() {
        let queues = LaneQueues::new();
        let start = std::time::Instant::now();
        let popped = queues.pop_weighted(0, Duration::from_millis(50)).await;
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let queues = std::sync::Arc::new(LaneQueues::new());
        let id = Uuid::new_v4();

        let waiter = {
            let queues = std::sync::Arc::clone(&queues);
            tokio::spawn(async move { queues.pop_weighted(0, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queues.push(Lane::Urgent, id).await;

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake quickly")
            .unwrap();
        assert_eq!(got, Some((Lane::Urgent, id)));
    }
}
