use itertools::Itertools;
use sf_domain::{ManufacturingTask, TaskId, TaskStatus, TaskType, TradeGoodSymbol, WaypointSymbol};
use std::sync::RwLock;

#[derive(Debug, Clone)]
struct QueuedTask {
    task: ManufacturingTask,
    ready: bool,
}

#[derive(Debug, Default)]
struct Inner {
    fabrication: Vec<QueuedTask>,
    collection: Vec<QueuedTask>,
}

impl Inner {
    fn store_for(&mut self, task_type: TaskType) -> &mut Vec<QueuedTask> {
        match task_type {
            TaskType::AcquireDeliver => &mut self.fabrication,
            TaskType::CollectSell | TaskType::Liquidate => &mut self.collection,
        }
    }
}

/// Dual-store ready-task cache. Collection tasks (CollectSell, Liquidate)
/// are kept separate from fabrication tasks (AcquireDeliver) so collection
/// work is always handed out first; within a store, ordering is priority
/// descending, then creation ascending.
///
/// The queue is not authoritative: the task repository is. CollectSell
/// tasks whose dependencies completed but whose factory is not yet ready
/// are *staged* here (non-ready) so a supply observation can promote them
/// without a repository scan.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: RwLock<Inner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: ManufacturingTask) {
        let ready = task.status == TaskStatus::Ready;
        let mut inner = self.inner.write().expect("task queue lock poisoned");
        let store = inner.store_for(task.task_type);
        if store.iter().any(|entry| entry.task.id == task.id) {
            return;
        }
        store.push(QueuedTask { task, ready });
    }

    /// Same routing as `enqueue`; exists for call sites that enqueue
    /// above-default-priority work (the ordering does the rest).
    pub fn enqueue_priority(&self, task: ManufacturingTask) {
        self.enqueue(task);
    }

    /// Stages a CollectSell task whose dependencies are satisfied but
    /// whose factory has not reached collectable supply yet.
    pub fn stage_collect_task(&self, task: ManufacturingTask) {
        let mut inner = self.inner.write().expect("task queue lock poisoned");
        let store = inner.store_for(task.task_type);
        if store.iter().any(|entry| entry.task.id == task.id) {
            return;
        }
        store.push(QueuedTask { task, ready: false });
    }

    pub fn get_ready_tasks(&self) -> Vec<ManufacturingTask> {
        let inner = self.inner.read().expect("task queue lock poisoned");
        let sorted = |entries: &[QueuedTask]| {
            entries
                .iter()
                .filter(|entry| entry.ready)
                .map(|entry| entry.task.clone())
                .sorted_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)))
                .collect_vec()
        };
        let mut tasks = sorted(&inner.collection);
        tasks.extend(sorted(&inner.fabrication));
        tasks
    }

    pub fn get_ready_tasks_by_type(&self, task_type: TaskType) -> Vec<ManufacturingTask> {
        self.get_ready_tasks()
            .into_iter()
            .filter(|task| task.task_type == task_type)
            .collect_vec()
    }

    pub fn has_ready_tasks_by_type(&self, task_type: TaskType) -> bool {
        !self.get_ready_tasks_by_type(task_type).is_empty()
    }

    pub fn remove(&self, task_id: &TaskId) -> bool {
        let mut inner = self.inner.write().expect("task queue lock poisoned");
        let before = inner.fabrication.len() + inner.collection.len();
        inner.fabrication.retain(|entry| &entry.task.id != task_id);
        inner.collection.retain(|entry| &entry.task.id != task_id);
        before != inner.fabrication.len() + inner.collection.len()
    }

    /// Promotes staged CollectSell tasks bound to the given factory and
    /// output good. Returns the promoted snapshots (the caller persists
    /// the Ready transition; the count is `len()`).
    pub fn mark_collect_tasks_ready(&self, factory_symbol: &WaypointSymbol, output_good: &TradeGoodSymbol) -> Vec<ManufacturingTask> {
        let mut inner = self.inner.write().expect("task queue lock poisoned");
        let mut promoted = vec![];
        for entry in inner.collection.iter_mut() {
            if entry.ready || entry.task.task_type != TaskType::CollectSell {
                continue;
            }
            let matches_factory = entry.task.factory_symbol.as_ref() == Some(factory_symbol);
            let matches_good = &entry.task.good == output_good;
            if matches_factory && matches_good {
                entry.ready = true;
                promoted.push(entry.task.clone());
            }
        }
        promoted
    }

    /// Inverse of promotion: a Ready collect task whose factory drifted
    /// out of collectable supply goes back to staged.
    pub fn demote_collect_task(&self, task_id: &TaskId) -> bool {
        let mut inner = self.inner.write().expect("task queue lock poisoned");
        for entry in inner.collection.iter_mut() {
            if &entry.task.id == task_id && entry.ready {
                entry.ready = false;
                return true;
            }
        }
        false
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("task queue lock poisoned");
        inner.fabrication.clear();
        inner.collection.clear();
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.read().expect("task queue lock poisoned");
        inner.fabrication.len() + inner.collection.len()
    }

    pub fn fabrication_size(&self) -> usize {
        self.inner.read().expect("task queue lock poisoned").fabrication.len()
    }

    pub fn collection_size(&self) -> usize {
        self.inner.read().expect("task queue lock poisoned").collection.len()
    }

    /// Rebuilds the cache from authoritative rows: Ready tasks are
    /// enqueued, Pending CollectSell tasks are staged, everything else is
    /// ignored.
    pub fn load_from_repository(&self, tasks: Vec<ManufacturingTask>) {
        self.clear();
        for task in tasks {
            match (task.status, task.task_type) {
                (TaskStatus::Ready, _) => self.enqueue(task),
                (TaskStatus::Pending, TaskType::CollectSell) => self.stage_collect_task(task),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use sf_domain::{PipelineId, PlayerId, LIQUIDATE_TASK_PRIORITY};

    fn task(task_type: TaskType, good: &str, status: TaskStatus) -> ManufacturingTask {
        let mut task = ManufacturingTask::new(
            PipelineId::generate(),
            PlayerId("player-1".to_string()),
            task_type,
            TradeGoodSymbol::new(good),
            10,
            Some(WaypointSymbol("X1-A-M2".to_string())),
            Some(WaypointSymbol("X1-A-F1".to_string())),
            Some(WaypointSymbol("X1-A-M1".to_string())),
            Utc::now(),
        );
        if status == TaskStatus::Ready {
            task.mark_ready(Utc::now()).unwrap();
        }
        task
    }

    #[test]
    fn empty_queue_reads_are_safe() {
        let queue = TaskQueue::new();
        assert!(queue.get_ready_tasks().is_empty());
        assert!(queue.get_ready_tasks().is_empty());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn collection_tasks_come_before_fabrication_tasks() {
        let queue = TaskQueue::new();
        queue.enqueue(task(TaskType::AcquireDeliver, "COPPER", TaskStatus::Ready));
        queue.enqueue(task(TaskType::CollectSell, "ELECTRONICS", TaskStatus::Ready));

        let ready = queue.get_ready_tasks();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].task_type, TaskType::CollectSell);
        assert_eq!(ready[1].task_type, TaskType::AcquireDeliver);
    }

    #[test]
    fn priority_then_age_ordering_within_a_store() {
        let queue = TaskQueue::new();
        let now = Utc::now();

        let mut old_default = task(TaskType::AcquireDeliver, "COPPER", TaskStatus::Ready);
        old_default.created_at = now - Duration::minutes(5);

        let mut new_default = task(TaskType::AcquireDeliver, "IRON", TaskStatus::Ready);
        new_default.created_at = now;

        let mut urgent = task(TaskType::AcquireDeliver, "GOLD", TaskStatus::Ready);
        urgent.priority = LIQUIDATE_TASK_PRIORITY;
        urgent.created_at = now;

        queue.enqueue(new_default.clone());
        queue.enqueue(urgent.clone());
        queue.enqueue(old_default.clone());

        let ready = queue.get_ready_tasks();
        assert_eq!(ready[0].id, urgent.id);
        assert_eq!(ready[1].id, old_default.id);
        assert_eq!(ready[2].id, new_default.id);
    }

    #[test]
    fn enqueue_then_remove_leaves_queue_unchanged() {
        let queue = TaskQueue::new();
        queue.enqueue(task(TaskType::AcquireDeliver, "COPPER", TaskStatus::Ready));
        let baseline = queue.get_ready_tasks();

        let mut extra = task(TaskType::AcquireDeliver, "IRON", TaskStatus::Pending);
        extra.mark_ready(Utc::now()).unwrap();
        queue.enqueue(extra.clone());
        assert!(queue.remove(&extra.id));

        assert_eq!(queue.get_ready_tasks(), baseline);
        assert!(!queue.remove(&extra.id));
    }

    #[test]
    fn enqueue_is_idempotent_per_task_id() {
        let queue = TaskQueue::new();
        let t = task(TaskType::AcquireDeliver, "COPPER", TaskStatus::Ready);
        queue.enqueue(t.clone());
        queue.enqueue(t);
        assert_eq!(queue.fabrication_size(), 1);
    }

    #[test]
    fn staged_collect_tasks_promote_by_factory_and_good() {
        let queue = TaskQueue::new();
        let staged = task(TaskType::CollectSell, "ELECTRONICS", TaskStatus::Pending);
        queue.stage_collect_task(staged.clone());

        assert!(queue.get_ready_tasks().is_empty());

        let other_factory = queue.mark_collect_tasks_ready(&WaypointSymbol("X1-A-F9".to_string()), &TradeGoodSymbol::new("ELECTRONICS"));
        assert!(other_factory.is_empty());

        let promoted = queue.mark_collect_tasks_ready(&WaypointSymbol("X1-A-F1".to_string()), &TradeGoodSymbol::new("ELECTRONICS"));
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, staged.id);
        assert_eq!(queue.get_ready_tasks().len(), 1);

        // promotion is one-shot until demoted again
        assert!(queue
            .mark_collect_tasks_ready(&WaypointSymbol("X1-A-F1".to_string()), &TradeGoodSymbol::new("ELECTRONICS"))
            .is_empty());

        assert!(queue.demote_collect_task(&staged.id));
        assert!(queue.get_ready_tasks().is_empty());
    }

    #[test]
    fn load_from_repository_rebuilds_from_scratch() {
        let queue = TaskQueue::new();
        queue.enqueue(task(TaskType::AcquireDeliver, "STALE", TaskStatus::Ready));

        let ready = task(TaskType::AcquireDeliver, "COPPER", TaskStatus::Ready);
        let staged = task(TaskType::CollectSell, "ELECTRONICS", TaskStatus::Pending);
        let ignored = task(TaskType::AcquireDeliver, "IRON", TaskStatus::Pending);

        queue.load_from_repository(vec![ready.clone(), staged.clone(), ignored]);

        assert_eq!(queue.size(), 2);
        let ready_now = queue.get_ready_tasks();
        assert_eq!(ready_now.len(), 1);
        assert_eq!(ready_now[0].id, ready.id);
        assert_eq!(queue.collection_size(), 1);
    }
}
