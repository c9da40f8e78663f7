//! Per-IKE_SA timers
//!
//! Each armed timer is a sleeping tokio task that posts a
//! [`SaEvent::Timer`] to the SA's inbox. Re-arming or cancelling aborts the
//! sleeper. A sleeper that already posted its event cannot be recalled; the
//! generation it carries lets the SA discard it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::actor::SaEvent;
use super::ike_sa::Timer;

pub(crate) struct Scheduler {
    tx: mpsc::Sender<SaEvent>,
    jobs: HashMap<Timer, JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn new(tx: mpsc::Sender<SaEvent>) -> Self {
        Scheduler {
            tx,
            jobs: HashMap::new(),
        }
    }

    pub(crate) fn schedule(&mut self, timer: Timer, generation: u64, after: Duration) {
        let tx = self.tx.clone();
        let job = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The inbox is gone once the SA is
            let _ = tx.send(SaEvent::Timer { timer, generation }).await;
        });
        if let Some(previous) = self.jobs.insert(timer, job) {
            previous.abort();
        }
    }

    pub(crate) fn cancel(&mut self, timer: Timer) {
        if let Some(job) = self.jobs.remove(&timer) {
            job.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, job) in self.jobs.drain() {
            job.abort();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.jobs.values().filter(|job| !job.is_finished()).count()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_with_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);
        scheduler.schedule(Timer::Dpd, 7, Duration::from_secs(30));

        match rx.recv().await {
            Some(SaEvent::Timer { timer, generation }) => {
                assert_eq!(timer, Timer::Dpd);
                assert_eq!(generation, 7);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);
        scheduler.schedule(Timer::Retransmit, 1, Duration::from_secs(1));
        scheduler.schedule(Timer::Retransmit, 2, Duration::from_secs(2));
        assert_eq!(scheduler.pending(), 1);

        match rx.recv().await {
            Some(SaEvent::Timer { generation, .. }) => assert_eq!(generation, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut scheduler = Scheduler::new(tx);
        scheduler.schedule(Timer::Dpd, 1, Duration::from_secs(1));
        scheduler.schedule(Timer::RekeyIke, 2, Duration::from_secs(1));
        scheduler.cancel_all();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
