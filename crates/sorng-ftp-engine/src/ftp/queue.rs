//! Operation queue: the items of one operation, their states and the
//! parent/child bookkeeping that releases a directory item once everything
//! below it is finished.
//!
//! Every item has exactly one owner at a time: it is either in the waiting
//! list or held by one worker (`Processing`). Terminal states are `Done`,
//! `Skipped`, `Failed`, `ForcedToFail` and `NeedsInput`; the last two can be
//! moved back to `Waiting` with [`OperationQueue::resolve`].
//!
//! The queue also hands out error sequence numbers, a logical clock that
//! orders every error recorded by any worker of the operation.

use crate::ftp::error::{DiskProblemKind, FtpError, FtpResult};
use crate::ftp::types::{ForcedAction, FtpEntry, ItemId, ItemKind, ItemState, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// What an earlier attempt did to the local target of a download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LocalTarget {
    #[default]
    Untouched,
    Created,
    Resumed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: ItemId,
    pub kind: ItemKind,
    pub state: ItemState,
    pub parent: Option<ItemId>,
    /// Children not yet in a terminal state.
    pub pending_children: usize,
    /// Children that ended failed.
    pub failed_children: usize,
    pub owner: Option<WorkerId>,
    pub forced: ForcedAction,
    pub problem: Option<DiskProblemKind>,
    pub error: Option<String>,
    pub error_seq: Option<u64>,
    /// Transfer attempts that ended with a transient server error.
    pub attempts: u32,
    pub local_target: LocalTarget,
    /// Result of a `ListDir` item.
    pub listing: Option<Vec<FtpEntry>>,
}

impl QueueItem {
    fn new(id: ItemId, kind: ItemKind, parent: Option<ItemId>) -> Self {
        Self {
            id,
            kind,
            state: ItemState::Waiting,
            parent,
            pending_children: 0,
            failed_children: 0,
            owner: None,
            forced: ForcedAction::None,
            problem: None,
            error: None,
            error_seq: None,
            attempts: 0,
            local_target: LocalTarget::Untouched,
            listing: None,
        }
    }
}

/// Number of items per state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub processing: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub forced_to_fail: usize,
    pub needs_input: usize,
}

impl QueueCounts {
    /// Nothing left that a worker could pick up or is working on.
    pub fn is_settled(&self) -> bool {
        self.waiting == 0 && self.delayed == 0 && self.processing == 0
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    items: HashMap<ItemId, QueueItem>,
    waiting: VecDeque<ItemId>,
    next_id: u64,
    last_error_seq: u64,
}

impl QueueInner {
    fn insert(&mut self, kind: ItemKind, parent: Option<ItemId>) -> ItemId {
        self.next_id += 1;
        let id = ItemId(self.next_id);
        self.items.insert(id, QueueItem::new(id, kind, parent));
        id
    }

    fn get_mut(&mut self, id: ItemId) -> FtpResult<&mut QueueItem> {
        self.items
            .get_mut(&id)
            .ok_or_else(|| FtpError::not_found(format!("{} not in queue", id)))
    }

    fn next_seq(&mut self) -> u64 {
        self.last_error_seq += 1;
        self.last_error_seq
    }

    /// Move `id` into a terminal state and update its ancestors.
    fn finish(&mut self, id: ItemId, state: ItemState) -> FtpResult<()> {
        debug_assert!(state.is_terminal(), "{:?} is not a final state", state);
        let item = self.get_mut(id)?;
        item.state = state;
        item.owner = None;
        let parent = item.parent;
        if let Some(parent) = parent {
            self.child_finished(parent, state.is_success());
        }
        Ok(())
    }

    fn child_finished(&mut self, parent: ItemId, success: bool) {
        let Some(p) = self.items.get_mut(&parent) else {
            return;
        };
        p.pending_children = p.pending_children.saturating_sub(1);
        if !success {
            p.failed_children += 1;
        }
        if p.pending_children > 0 || p.state != ItemState::Delayed {
            return;
        }
        if p.failed_children == 0 {
            p.state = ItemState::Waiting;
            self.waiting.push_front(parent);
        } else {
            log::debug!("queue: {} forced to fail by its children", parent);
            p.state = ItemState::ForcedToFail;
            let grand = p.parent;
            if let Some(grand) = grand {
                self.child_finished(grand, false);
            }
        }
    }

    /// Reverse [`child_finished`] for a failed child that is retried.
    fn child_reopened(&mut self, parent: ItemId) {
        let Some(p) = self.items.get_mut(&parent) else {
            return;
        };
        p.pending_children += 1;
        p.failed_children = p.failed_children.saturating_sub(1);
        if p.state == ItemState::ForcedToFail {
            p.state = ItemState::Delayed;
            let grand = p.parent;
            if let Some(grand) = grand {
                self.child_reopened(grand);
            }
        }
    }
}

/// Thread-safe queue of one operation.
#[derive(Debug)]
pub struct OperationQueue {
    operation_id: Uuid,
    inner: Mutex<QueueInner>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue {
    pub fn new() -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a top-level item.
    pub fn add(&self, kind: ItemKind) -> ItemId {
        let mut q = self.lock();
        let id = q.insert(kind, None);
        q.waiting.push_back(id);
        log::trace!("queue: added {}", id);
        id
    }

    /// Replace the processing item `id` by `children`, optionally followed
    /// by `after` which runs once every child finished successfully. The
    /// children run before anything else that is waiting.
    pub fn expand(&self, id: ItemId, children: Vec<ItemKind>, after: Option<ItemKind>) -> FtpResult<Vec<ItemId>> {
        let mut q = self.lock();
        let parent = q.get_mut(id)?.parent;

        let child_parent = match after {
            Some(kind) => {
                let after_id = q.insert(kind, parent);
                if let Some(p) = parent {
                    q.get_mut(p)?.pending_children += 1;
                }
                let after_item = q.get_mut(after_id)?;
                after_item.pending_children = children.len();
                if children.is_empty() {
                    q.waiting.push_front(after_id);
                } else {
                    after_item.state = ItemState::Delayed;
                }
                Some(after_id)
            }
            None => {
                if let Some(p) = parent {
                    q.get_mut(p)?.pending_children += children.len();
                }
                parent
            }
        };

        let ids: Vec<ItemId> = children.into_iter().map(|kind| q.insert(kind, child_parent)).collect();
        for &cid in ids.iter().rev() {
            q.waiting.push_front(cid);
        }
        q.finish(id, ItemState::Done)?;
        log::debug!("queue: {} expanded into {} items", id, ids.len());
        Ok(ids)
    }

    /// Hand the first waiting item to `worker`.
    pub fn take_next_waiting(&self, worker: WorkerId) -> Option<QueueItem> {
        let mut q = self.lock();
        while let Some(id) = q.waiting.pop_front() {
            let Some(item) = q.items.get_mut(&id) else {
                continue;
            };
            if item.state != ItemState::Waiting {
                continue;
            }
            item.state = ItemState::Processing;
            item.owner = Some(worker);
            return Some(item.clone());
        }
        None
    }

    /// Give a processing item back; it is the next one handed out.
    pub fn return_to_waiting(&self, id: ItemId) -> FtpResult<()> {
        let mut q = self.lock();
        let item = q.get_mut(id)?;
        item.state = ItemState::Waiting;
        item.owner = None;
        q.waiting.push_front(id);
        Ok(())
    }

    /// Move a processing item to another worker.
    pub fn reassign(&self, id: ItemId, worker: WorkerId) -> FtpResult<()> {
        let mut q = self.lock();
        let item = q.get_mut(id)?;
        if item.state != ItemState::Processing {
            return Err(FtpError::invalid_config(format!("{} is not being processed", id)));
        }
        item.owner = Some(worker);
        Ok(())
    }

    pub fn has_waiting(&self) -> bool {
        let q = self.lock();
        q.waiting
            .iter()
            .any(|id| q.items.get(id).is_some_and(|i| i.state == ItemState::Waiting))
    }

    pub fn set_done(&self, id: ItemId) -> FtpResult<()> {
        self.lock().finish(id, ItemState::Done)
    }

    pub fn set_skipped(&self, id: ItemId) -> FtpResult<()> {
        self.lock().finish(id, ItemState::Skipped)
    }

    /// Mark failed; returns the error sequence number.
    pub fn set_failed(&self, id: ItemId, error: &FtpError) -> FtpResult<u64> {
        let mut q = self.lock();
        let seq = q.next_seq();
        let item = q.get_mut(id)?;
        item.error = Some(error.to_string());
        item.error_seq = Some(seq);
        item.problem = error.disk_problem();
        q.finish(id, ItemState::Failed)?;
        log::warn!("queue: {} failed: {}", id, error);
        Ok(seq)
    }

    /// Suspend until the host decides; returns the error sequence number.
    pub fn set_needs_input(&self, id: ItemId, problem: Option<DiskProblemKind>, message: &str) -> FtpResult<u64> {
        let mut q = self.lock();
        let seq = q.next_seq();
        let item = q.get_mut(id)?;
        item.problem = problem;
        item.error = Some(message.to_string());
        item.error_seq = Some(seq);
        q.finish(id, ItemState::NeedsInput)?;
        log::info!("queue: {} needs input: {}", id, message);
        Ok(seq)
    }

    /// Retry a failed or suspended item with `forced` applied.
    pub fn resolve(&self, id: ItemId, forced: ForcedAction) -> FtpResult<()> {
        let mut q = self.lock();
        let item = q.get_mut(id)?;
        if !matches!(item.state, ItemState::NeedsInput | ItemState::Failed) {
            return Err(FtpError::invalid_config(format!(
                "{} cannot be resolved in state {:?}",
                id, item.state
            )));
        }
        item.state = ItemState::Waiting;
        item.forced = forced;
        item.problem = None;
        item.error = None;
        item.attempts = 0;
        let parent = item.parent;
        if let Some(parent) = parent {
            q.child_reopened(parent);
        }
        q.waiting.push_back(id);
        Ok(())
    }

    pub fn set_forced(&self, id: ItemId, forced: ForcedAction) -> FtpResult<()> {
        self.lock().get_mut(id)?.forced = forced;
        Ok(())
    }

    /// Count one more transient failure; returns the new total.
    pub fn record_attempt(&self, id: ItemId) -> FtpResult<u32> {
        let mut q = self.lock();
        let item = q.get_mut(id)?;
        item.attempts += 1;
        Ok(item.attempts)
    }

    pub fn set_local_target(&self, id: ItemId, target: LocalTarget) -> FtpResult<()> {
        self.lock().get_mut(id)?.local_target = target;
        Ok(())
    }

    pub fn set_listing(&self, id: ItemId, listing: Vec<FtpEntry>) -> FtpResult<()> {
        self.lock().get_mut(id)?.listing = Some(listing);
        Ok(())
    }

    /// Next error sequence number, for errors not tied to an item.
    pub fn next_error_seq(&self) -> u64 {
        self.lock().next_seq()
    }

    pub fn item(&self, id: ItemId) -> Option<QueueItem> {
        self.lock().items.get(&id).cloned()
    }

    /// All items ordered by id.
    pub fn items(&self) -> Vec<QueueItem> {
        let q = self.lock();
        let mut items: Vec<QueueItem> = q.items.values().cloned().collect();
        items.sort_by_key(|i| i.id);
        items
    }

    pub fn counts(&self) -> QueueCounts {
        let q = self.lock();
        let mut c = QueueCounts::default();
        for item in q.items.values() {
            match item.state {
                ItemState::Waiting => c.waiting += 1,
                ItemState::Delayed => c.delayed += 1,
                ItemState::Processing => c.processing += 1,
                ItemState::Done => c.done += 1,
                ItemState::Skipped => c.skipped += 1,
                ItemState::Failed => c.failed += 1,
                ItemState::ForcedToFail => c.forced_to_fail += 1,
                ItemState::NeedsInput => c.needs_input += 1,
            }
        }
        c
    }
}
