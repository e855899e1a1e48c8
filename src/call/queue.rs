//! Per-trunk origination queue with rate-limited draining.
//!
//! The PBX rejects rapid originations on the same outbound route, so each
//! trunk drains its own FIFO with a minimum gap between calls while
//! different trunks proceed concurrently.

use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};

const SPACING: Duration = Duration::from_millis(1100);
const LIMIT: usize = 50;

pub type OriginateJob = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;

struct QueuedJob {
    job: OriginateJob,
    reply: oneshot::Sender<anyhow::Result<String>>,
}

#[derive(Default)]
struct TrunkQueue {
    jobs: VecDeque<QueuedJob>,
    draining: bool,
    last_fired_at: Option<Instant>,
}

pub struct OriginationQueue {
    trunks: Mutex<HashMap<String, TrunkQueue>>,
    spacing: Duration,
    limit: usize,
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub trunk_id: String,
    pub pending: usize,
    pub draining: bool,
    pub last_fired_ms_ago: Option<u64>,
}

impl OriginationQueue {
    pub fn new() -> Self {
        Self {
            trunks: Mutex::new(HashMap::new()),
            spacing: SPACING,
            limit: LIMIT,
        }
    }

    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Submit a job for the trunk and wait for its outcome. Jobs on one
    /// trunk run in submission order with at least the configured spacing
    /// between them; a job error is returned here and still counts as the
    /// last attempt for spacing purposes.
    pub async fn enqueue(self: &Arc<Self>, trunk_id: &str, job: OriginateJob) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut trunks = self.trunks.lock().unwrap();
            let queue = trunks.entry(trunk_id.to_string()).or_default();
            if queue.jobs.len() >= self.limit {
                warn!(trunk_id, pending = queue.jobs.len(), "origination queue full");
                return Err(Error::QueueFull(trunk_id.to_string()));
            }
            queue.jobs.push_back(QueuedJob {
                job,
                reply: reply_tx,
            });
            if !queue.draining {
                queue.draining = true;
                let this = self.clone();
                let trunk_id = trunk_id.to_string();
                tokio::spawn(async move { this.drain(trunk_id).await });
            }
        }
        reply_rx
            .await
            .map_err(|_| Error::Internal("origination job dropped".to_string()))?
            .map_err(|e| Error::PbxUnavailable(e.to_string()))
    }

    async fn drain(self: Arc<Self>, trunk_id: String) {
        loop {
            let wait = {
                let trunks = self.trunks.lock().unwrap();
                trunks
                    .get(&trunk_id)
                    .and_then(|q| q.last_fired_at)
                    .map(|at| self.spacing.saturating_sub(at.elapsed()))
                    .unwrap_or(Duration::ZERO)
            };
            if !wait.is_zero() {
                sleep(wait).await;
            }

            let next = {
                let mut trunks = self.trunks.lock().unwrap();
                let Some(queue) = trunks.get_mut(&trunk_id) else {
                    return;
                };
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let result = next.job.await;
            if let Err(ref e) = result {
                debug!(trunk_id, "origination job failed: {}", e);
            }
            next.reply.send(result).ok();

            let mut trunks = self.trunks.lock().unwrap();
            let Some(queue) = trunks.get_mut(&trunk_id) else {
                return;
            };
            queue.last_fired_at = Some(Instant::now());
            if queue.jobs.is_empty() {
                queue.draining = false;
                return;
            }
        }
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        let trunks = self.trunks.lock().unwrap();
        trunks
            .iter()
            .map(|(trunk_id, queue)| QueueStats {
                trunk_id: trunk_id.clone(),
                pending: queue.jobs.len(),
                draining: queue.draining,
                last_fired_ms_ago: queue
                    .last_fired_at
                    .map(|at| at.elapsed().as_millis() as u64),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(spacing_ms: u64) -> Arc<OriginationQueue> {
        Arc::new(OriginationQueue::new().with_spacing(Duration::from_millis(spacing_ms)))
    }

    #[tokio::test]
    async fn test_jobs_run_in_order_with_spacing() {
        let queue = queue(80);
        let fired: Arc<Mutex<Vec<(usize, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let queue = queue.clone();
            let fired = fired.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        "custom_A",
                        Box::pin(async move {
                            fired.lock().unwrap().push((i, Instant::now()));
                            Ok(format!("ch-{}", i))
                        }),
                    )
                    .await
            }));
            // submission order must be deterministic for this test
            sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let fired = fired.lock().unwrap();
        assert_eq!(
            fired.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        for pair in fired.windows(2) {
            let gap = pair[1].1.duration_since(pair[0].1);
            assert!(gap >= Duration::from_millis(80), "gap was {:?}", gap);
        }
    }

    #[tokio::test]
    async fn test_trunks_drain_concurrently() {
        let queue = queue(150);
        let start = Instant::now();

        let a = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue("custom_A", Box::pin(async { Ok("a".to_string()) }))
                    .await
            })
        };
        let b = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue("custom_B", Box::pin(async { Ok("b".to_string()) }))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        // neither first job waits on the other trunk's spacing
        assert!(start.elapsed() < Duration::from_millis(140));
    }

    #[tokio::test]
    async fn test_job_error_reaches_submitter_and_does_not_stall() {
        let queue = queue(20);
        let err = queue
            .enqueue(
                "custom_A",
                Box::pin(async { Err(anyhow::anyhow!("pbx rejected")) }),
            )
            .await;
        assert!(matches!(err, Err(Error::PbxUnavailable(_))));

        let ok = queue
            .enqueue("custom_A", Box::pin(async { Ok("ch-2".to_string()) }))
            .await;
        assert_eq!(ok.unwrap(), "ch-2");
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = Arc::new(
            OriginationQueue::new()
                .with_spacing(Duration::from_millis(200))
                .with_limit(2),
        );
        let ran = Arc::new(AtomicUsize::new(0));

        // first job occupies the drainer; two more fill the queue
        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            let ran = ran.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        "custom_A",
                        Box::pin(async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(50)).await;
                            Ok("ch".to_string())
                        }),
                    )
                    .await
            }));
            sleep(Duration::from_millis(5)).await;
        }

        let overflow = queue
            .enqueue("custom_A", Box::pin(async { Ok("never".to_string()) }))
            .await;
        assert!(matches!(overflow, Err(Error::QueueFull(_))));

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }
}
