//! The workers of one operation.
//!
//! Workers live in an arena and are addressed by [`WorkerId`]. The pool
//! routes events, applies batched commands and moves items between workers
//! so a freshly logged-in worker can take over the item of one that is still
//! connecting.

use crate::ftp::epoch::Epoch;
use crate::ftp::events::{Action, WorkerEvent};
use crate::ftp::queue::OperationQueue;
use crate::ftp::tls::CertificateCache;
use crate::ftp::types::{ConnectionConfig, EngineConfig, WorkerId, WorkerStatus};
use crate::ftp::worker::{Worker, WorkerError, WorkerState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which workers a command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerTarget {
    One(WorkerId),
    All,
}

/// How many workers [`WorkerPool::offer_work`] wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Offer {
    One,
    All,
}

pub struct WorkerPool {
    queue: Arc<OperationQueue>,
    engine: Arc<EngineConfig>,
    config: ConnectionConfig,
    certs: Arc<CertificateCache>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<OperationQueue>,
        engine: Arc<EngineConfig>,
        config: ConnectionConfig,
        certs: Arc<CertificateCache>,
        count: usize,
    ) -> Self {
        let mut pool = Self {
            queue,
            engine,
            config,
            certs,
            workers: Vec::new(),
        };
        for _ in 0..count.max(1) {
            pool.add_worker();
        }
        pool
    }

    pub fn add_worker(&mut self) -> WorkerId {
        let id = WorkerId(self.workers.len());
        self.workers.push(Worker::new(
            id,
            Arc::clone(&self.queue),
            Arc::clone(&self.engine),
            self.config.clone(),
            Arc::clone(&self.certs),
        ));
        log::debug!("pool: added {}", id);
        id
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(id.0)
    }

    pub fn worker_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(id.0)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    /// Feed an event to its worker, then let idle workers help out.
    pub fn handle(&mut self, id: WorkerId, epoch: Epoch, event: WorkerEvent) {
        let Some(worker) = self.workers.get_mut(id.0) else {
            log::debug!("pool: event for unknown {}", id);
            return;
        };
        worker.handle(epoch, event);
        self.hand_off();
        if self.queue.has_waiting() {
            self.offer_work(Offer::All);
        }
    }

    /// Actions of every worker, in worker order.
    pub fn drain_actions(&mut self) -> Vec<(WorkerId, Action)> {
        let mut all = Vec::new();
        for w in &mut self.workers {
            let id = w.id();
            all.extend(w.drain_actions().into_iter().map(|a| (id, a)));
        }
        all
    }

    /// Give the item of a worker that is still connecting to one that is
    /// already logged in and has nothing to do.
    fn hand_off(&mut self) {
        loop {
            let Some(taker) = self.workers.iter().position(Worker::is_connected_idle) else {
                return;
            };
            if !self.queue.counts().is_settled() && self.queue.has_waiting() {
                // it will find queued work on its own
                return;
            }
            let donor = self.workers.iter().position(|w| {
                w.state() == WorkerState::Connecting && w.holds_item() && !w.control().is_logged_in()
            });
            let Some(donor) = donor else {
                return;
            };
            let Some(item) = self.workers[donor].take_connecting_item() else {
                return;
            };
            log::info!(
                "pool: {} takes {} over from {}",
                self.workers[taker].id(),
                item.id,
                self.workers[donor].id()
            );
            if let Err(item) = self.workers[taker].adopt(item) {
                if let Err(e) = self.queue.return_to_waiting(item.id) {
                    log::error!("pool: cannot return {}: {}", item.id, e);
                }
                return;
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Wake idle workers. Workers with an open connection go first.
    pub fn offer_work(&mut self, offer: Offer) {
        let mut order: Vec<usize> = (0..self.workers.len())
            .filter(|&i| {
                let w = &self.workers[i];
                w.is_idle() && !w.is_paused() && !w.is_stopping()
            })
            .collect();
        order.sort_by_key(|&i| !self.workers[i].control().is_logged_in());
        for i in order {
            if !self.queue.has_waiting() {
                break;
            }
            self.workers[i].activate();
            if offer == Offer::One && self.workers[i].holds_item() {
                break;
            }
        }
    }

    /// Apply `f` to at most `max` of the targeted workers that still `need`
    /// it. Returns how many still need it afterwards.
    fn batch(
        &mut self,
        target: WorkerTarget,
        max: usize,
        need: impl Fn(&Worker) -> bool,
        f: impl Fn(&mut Worker),
    ) -> usize {
        match target {
            WorkerTarget::One(id) => {
                if let Some(w) = self.workers.get_mut(id.0) {
                    if need(w) {
                        f(w);
                    }
                }
                0
            }
            WorkerTarget::All => {
                let mut done = 0;
                for w in self.workers.iter_mut() {
                    if done >= max {
                        break;
                    }
                    if need(w) {
                        f(w);
                        done += 1;
                    }
                }
                self.workers.iter().filter(|w| need(w)).count()
            }
        }
    }

    /// Stop up to `max` workers; returns how many are left to stop.
    pub fn stop(&mut self, target: WorkerTarget, max: usize) -> usize {
        self.batch(
            target,
            max,
            |w| w.state() != WorkerState::Stopped && !w.is_stopping(),
            Worker::stop,
        )
    }

    /// Restart up to `max` stopped or failed workers.
    pub fn start(&mut self, target: WorkerTarget, max: usize) -> usize {
        self.batch(
            target,
            max,
            |w| matches!(w.state(), WorkerState::Stopped | WorkerState::ConnectionError),
            Worker::start,
        )
    }

    pub fn pause(&mut self, target: WorkerTarget, paused: bool, max: usize) -> usize {
        self.batch(target, max, |w| w.is_paused() != paused, |w| w.pause(paused))
    }

    /// The error with the smallest sequence number after `last_seen`.
    pub fn next_error_after(&self, last_seen: u64) -> Option<(WorkerId, WorkerError)> {
        self.workers
            .iter()
            .filter_map(|w| w.error().map(|e| (w.id(), e.clone())))
            .filter(|(_, e)| e.seq > last_seen)
            .min_by_key(|(_, e)| e.seq)
    }

    /// No worker holds an item, or those that do are stopping.
    pub fn all_idle_or_stopping(&self) -> bool {
        self.workers.iter().all(|w| !w.holds_item() || w.is_stopping())
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(Worker::status).collect()
    }

    pub fn shutdown(&mut self) {
        for w in &mut self.workers {
            w.shutdown();
        }
    }
}
