//! The round-robin scheduler.
//!
//! Policy lives in [`Scheduler`], which is plain data and fully
//! exercised by the host test suite; the context-switch mechanism is
//! wired up by the module-level functions at the bottom, which only
//! compile for bare metal.
//!
//! Selection is strictly queue-ordered round robin over READY tasks.
//! Priority buys a longer quantum, never earlier selection, so every
//! READY task keeps making forward progress. The idle task sits outside
//! the ring and runs exactly when nothing else is READY.

use alloc::vec::Vec;

use slab::Slab;

use crate::{
    arch::x86::context::CpuContext,
    error::{KernelResult, SchedError},
    mm::PhysAddr,
    sched::task::{Priority, Task, TaskId, TaskState},
};

/// Aggregate scheduler statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedStats {
    pub context_switches: u64,
    pub preemptions: u64,
    pub tasks: usize,
}

/// Scheduler state: the TCB arena, the circular run queue of task ids,
/// and the distinguished idle task.
pub struct Scheduler {
    tasks: Slab<alloc::boxed::Box<Task>>,
    /// Circular run-queue order; excludes the idle task.
    ring: Vec<TaskId>,
    /// Ring position of the last ring task that ran; the next walk
    /// starts one past it, which is what makes the rotation fair.
    cursor: usize,
    current: TaskId,
    idle: TaskId,
    next_id: u32,
    /// Gates timer-driven preemption (manual `schedule` always works).
    pub preemption_enabled: bool,
    context_switches: u64,
    preemptions: u64,
}

/// Sentinel meaning "no task": ids are non-zero by construction.
const NO_TASK: TaskId = TaskId(0);

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Slab::new(),
            ring: Vec::new(),
            cursor: 0,
            current: NO_TASK,
            idle: NO_TASK,
            next_id: 1,
            preemption_enabled: false,
            context_switches: 0,
            preemptions: 0,
        }
    }

    fn alloc_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    fn slot_of(&self, id: TaskId) -> Option<usize> {
        self.tasks
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|(slot, _)| slot)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|(_, t)| t.id == id).map(|(_, t)| &**t)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|(_, t)| t.id == id)
            .map(|(_, t)| &mut **t)
    }

    pub fn current_id(&self) -> TaskId {
        self.current
    }

    pub fn idle_id(&self) -> TaskId {
        self.idle
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            context_switches: self.context_switches,
            preemptions: self.preemptions,
            tasks: self.tasks.len(),
        }
    }

    /// Create the idle task. It lives outside the run queue and is
    /// always READY (or RUNNING when nothing else is).
    pub fn create_idle(&mut self, entry: usize, exit: usize) -> KernelResult<TaskId> {
        let id = self.alloc_id();
        let mut task = Task::new(id, "idle", entry, 0, Priority::Low, exit)?;
        task.state = TaskState::Ready;
        self.tasks.insert(task);
        self.idle = id;
        Ok(id)
    }

    /// Create a task and link it into the run queue (CREATED → READY).
    pub fn spawn(
        &mut self,
        name: &str,
        entry: usize,
        arg: usize,
        priority: Priority,
        exit: usize,
    ) -> KernelResult<TaskId> {
        let id = self.alloc_id();
        let task = Task::new(id, name, entry, arg, priority, exit)?;
        self.tasks.insert(task);
        // Linked into the ring: the task becomes schedulable.
        self.ring.push(id);
        if let Some(t) = self.task_mut(id) {
            t.state = TaskState::Ready;
        }
        log::debug!(target: "sched", "spawned {} '{}' prio {:?}", id, name, priority);
        Ok(id)
    }

    /// Declare `id` the very first running task (used by the boot
    /// sequencer just before `start_first_task`).
    pub fn set_first(&mut self, id: TaskId) -> KernelResult<*const CpuContext> {
        let pos = self.ring.iter().position(|&r| r == id);
        let task = self
            .task_mut(id)
            .ok_or(SchedError::TaskNotFound { id: id.0 })?;
        task.state = TaskState::Running;
        task.run_count += 1;
        let ctx = &task.context as *const CpuContext;
        self.current = id;
        if let Some(pos) = pos {
            self.cursor = pos;
        }
        Ok(ctx)
    }

    /// Walk the ring from one past the cursor and return the first READY
    /// task, falling back to the idle task. Ties break by queue order.
    fn pick_next(&mut self) -> TaskId {
        let len = self.ring.len();
        for step in 1..=len {
            let idx = (self.cursor + step) % len.max(1);
            let cand = self.ring[idx];
            if self
                .task(cand)
                .map(|t| t.state == TaskState::Ready)
                .unwrap_or(false)
            {
                self.cursor = idx;
                return cand;
            }
        }
        self.idle
    }

    /// Scheduling decision. Returns the context pair to switch between,
    /// or `None` when the current task simply keeps running.
    pub fn prepare_switch(&mut self) -> Option<(*mut CpuContext, *const CpuContext)> {
        let cur_id = self.current;
        if cur_id == NO_TASK {
            return None;
        }

        if let Some(cur) = self.task_mut(cur_id) {
            if cur.state == TaskState::Running {
                cur.state = TaskState::Ready;
            }
        }

        let next_id = self.pick_next();
        if next_id == cur_id {
            // Nothing better: keep running.
            if let Some(cur) = self.task_mut(cur_id) {
                if cur.state == TaskState::Ready {
                    cur.state = TaskState::Running;
                }
            }
            return None;
        }

        let old = self
            .task_mut(cur_id)
            .map(|t| &mut t.context as *mut CpuContext)?;

        let next = self.task_mut(next_id)?;
        next.state = TaskState::Running;
        next.time_slice_remaining = next.priority.quantum();
        next.run_count += 1;
        let new = &next.context as *const CpuContext;

        self.current = next_id;
        self.context_switches += 1;
        Some((old, new))
    }

    /// Fault-path variant: the current task is condemned, not rotated.
    /// Marks it ZOMBIE, promotes any READY task (else idle) and returns
    /// the context pair for the final switch away from the dead stack.
    pub fn terminate_current(&mut self) -> Option<(*mut CpuContext, *const CpuContext)> {
        let cur_id = self.current;
        let old = {
            let cur = self.task_mut(cur_id)?;
            cur.state = TaskState::Zombie;
            cur.sleep_until = 0;
            &mut cur.context as *mut CpuContext
        };

        let next_id = self.pick_next();
        let next = self.task_mut(next_id)?;
        next.state = TaskState::Running;
        next.time_slice_remaining = next.priority.quantum();
        next.run_count += 1;
        let new = &next.context as *const CpuContext;

        self.current = next_id;
        self.context_switches += 1;
        Some((old, new))
    }

    /// Timer-tick bookkeeping: wake expired sleepers, charge the current
    /// task's quantum. Returns whether the caller should `schedule()`.
    pub fn tick(&mut self, now_ticks: u64) -> bool {
        for (_, task) in self.tasks.iter_mut() {
            if task.state == TaskState::Sleeping
                && task.sleep_until != 0
                && now_ticks >= task.sleep_until
            {
                task.state = TaskState::Ready;
                task.sleep_until = 0;
            }
        }

        if !self.preemption_enabled {
            return false;
        }
        let Some(cur) = self.task_mut(self.current) else {
            return false;
        };
        if cur.state != TaskState::Running {
            return true;
        }
        cur.time_slice_remaining = cur.time_slice_remaining.saturating_sub(1);
        if cur.time_slice_remaining == 0 {
            self.preemptions += 1;
            return true;
        }
        false
    }

    /// Put the current task to sleep until `until_ticks`. The caller
    /// must follow up with `schedule()`.
    pub fn sleep_current(&mut self, until_ticks: u64) {
        let id = self.current;
        if let Some(cur) = self.task_mut(id) {
            cur.state = TaskState::Sleeping;
            cur.sleep_until = until_ticks;
        }
    }

    /// Mark the current task FINISHED (its entry returned). The caller
    /// must follow up with `schedule()`, which never comes back here.
    pub fn exit_current(&mut self) {
        let id = self.current;
        if let Some(cur) = self.task_mut(id) {
            cur.state = TaskState::Finished;
            cur.sleep_until = 0;
        }
    }

    /// Wake a SLEEPING task immediately (wake-on-send).
    pub fn wake(&mut self, id: TaskId) {
        if let Some(task) = self.task_mut(id) {
            if task.state == TaskState::Sleeping {
                task.state = TaskState::Ready;
                task.sleep_until = 0;
            }
        }
    }

    /// Unlink and drop a TCB, returning its user page directory (if any)
    /// for the caller to release. Refused for the current task and for
    /// the idle task.
    pub fn destroy(&mut self, id: TaskId) -> KernelResult<Option<PhysAddr>> {
        if id == self.current {
            return Err(SchedError::DestroyCurrent { id: id.0 }.into());
        }
        if id == self.idle {
            return Err(crate::KernelError::InvalidArgument {
                name: "id",
                reason: "the idle task is never destroyed",
            });
        }
        let slot = self
            .slot_of(id)
            .ok_or(SchedError::TaskNotFound { id: id.0 })?;

        if let Some(pos) = self.ring.iter().position(|&r| r == id) {
            self.ring.remove(pos);
            // Keep the cursor pointing at the task that last ran.
            if pos < self.cursor && self.cursor > 0 {
                self.cursor -= 1;
            } else if self.cursor >= self.ring.len() {
                self.cursor = 0;
            }
        }

        let task = self.tasks.remove(slot);
        let pd = task.user_page_directory;
        log::debug!(target: "sched", "destroyed {} '{}'", id, task.name());
        Ok(pd)
    }

    /// Reap every ZOMBIE/FINISHED task except the current one. Returns
    /// the released user page directories.
    pub fn reap(&mut self) -> Vec<PhysAddr> {
        let victims: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.is_reapable() && t.id != self.current)
            .map(|(_, t)| t.id)
            .collect();

        let mut pds = Vec::new();
        for id in victims {
            match self.destroy(id) {
                Ok(Some(pd)) => pds.push(pd),
                Ok(None) => {}
                Err(e) => log::warn!(target: "sched", "reap of {} failed: {}", id, e),
            }
        }
        pds
    }

    /// Invariant check used by tests and the self-test path: exactly one
    /// RUNNING task, and it is the idle task iff nothing else is READY.
    pub fn check_running_invariant(&self) -> bool {
        let running: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.state == TaskState::Running)
            .map(|(_, t)| &**t)
            .collect();
        if running.len() != 1 {
            return false;
        }
        let any_ready = self
            .tasks
            .iter()
            .any(|(_, t)| t.state == TaskState::Ready && t.id != self.idle);
        if running[0].id == self.idle {
            !any_ready
        } else {
            true
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Bare-metal wiring: the module-level API the rest of the kernel calls.
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod wiring {
    use super::*;
    use crate::{
        arch::x86::{context, cpu},
        config::CLEANUP_INTERVAL_MS,
        kernel::kernel,
        sched::task::TaskEntry,
        sync::InterruptGuard,
        time,
    };

    /// Reschedule: pick the next READY task and switch to it. Returns
    /// (much later) when this task is selected again.
    pub fn schedule() {
        let _guard = InterruptGuard::new();
        // SAFETY: interrupts are disabled and the borrow ends before the
        // switch call (only raw pointers cross it).
        let decision = unsafe { kernel().sched.get_mut() }.prepare_switch();
        if let Some((old, new)) = decision {
            // SAFETY: both contexts live in arena-boxed TCBs which are
            // only reaped after a switch away; interrupts are off.
            if let Err(e) = unsafe { context::switch(old, new) } {
                log::error!(target: "sched", "context switch refused: {}", e);
            }
        }
    }

    /// Timer ISR entry: clock bookkeeping ran already; preempt if due.
    pub fn timer_tick() {
        let should_switch = {
            let _guard = InterruptGuard::new();
            // SAFETY: interrupts disabled; borrow scoped to this block.
            unsafe { kernel().sched.get_mut() }.tick(time::ticks())
        };
        #[cfg(feature = "sched_trace")]
        log::trace!(target: "sched", "tick {} preempt={}", time::ticks(), should_switch);
        if should_switch {
            schedule();
        }
    }

    /// Trampoline a finished entry function falls into (planted on every
    /// initial stack). Marks the task FINISHED and leaves forever.
    pub extern "C" fn task_exit() -> ! {
        {
            let _guard = InterruptGuard::new();
            // SAFETY: interrupts disabled; borrow scoped to this block.
            unsafe { kernel().sched.get_mut() }.exit_current();
        }
        loop {
            schedule();
        }
    }

    /// Create a kernel task (CREATED, then READY once linked).
    pub fn task_create(
        name: &str,
        entry: TaskEntry,
        arg: *mut (),
        priority: Priority,
    ) -> KernelResult<TaskId> {
        let _guard = InterruptGuard::new();
        // SAFETY: interrupts disabled; borrow scoped to this function.
        unsafe { kernel().sched.get_mut() }.spawn(
            name,
            entry as usize,
            arg as usize,
            priority,
            task_exit as usize,
        )
    }

    /// Sleep the current task for at least `ms` milliseconds.
    pub fn task_sleep(ms: u64) {
        {
            let _guard = InterruptGuard::new();
            let until = time::ticks() + time::ms_to_ticks(ms);
            // SAFETY: interrupts disabled; borrow scoped to this block.
            unsafe { kernel().sched.get_mut() }.sleep_current(until);
        }
        schedule();
    }

    /// Yield the rest of the quantum.
    pub fn task_yield() {
        schedule();
    }

    /// Destroy a task that is not the current one, releasing its kernel
    /// stack and user page directory.
    pub fn task_destroy(id: TaskId) -> KernelResult<()> {
        let pd = {
            let _guard = InterruptGuard::new();
            // SAFETY: interrupts disabled; borrow scoped to this block.
            unsafe { kernel().sched.get_mut() }.destroy(id)?
        };
        if let Some(pd) = pd {
            kernel().phys.lock().free_frame(pd);
        }
        Ok(())
    }

    /// Id of the task currently executing.
    pub fn current_task_id() -> TaskId {
        let _guard = InterruptGuard::new();
        // SAFETY: interrupts disabled; borrow scoped to this function.
        unsafe { kernel().sched.get_mut() }.current_id()
    }

    /// The idle loop: halt until the next interrupt, forever.
    pub extern "C" fn idle_main(_arg: *mut ()) {
        loop {
            cpu::halt();
        }
    }

    /// The cleanup task: periodically reap ZOMBIE/FINISHED TCBs and
    /// return their user page directories to the frame allocator.
    pub extern "C" fn cleanup_main(_arg: *mut ()) {
        loop {
            task_sleep(CLEANUP_INTERVAL_MS);
            let pds = {
                let _guard = InterruptGuard::new();
                // SAFETY: interrupts disabled; borrow scoped to this block.
                unsafe { kernel().sched.get_mut() }.reap()
            };
            for pd in pds {
                kernel().phys.lock().free_frame(pd);
            }
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use wiring::{
    cleanup_main, current_task_id, idle_main, schedule, task_create, task_destroy, task_exit,
    task_sleep, task_yield, timer_tick,
};

/// Host stand-in so cross-cutting code (mutexes) can name a current
/// task in unit tests.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn current_task_id() -> TaskId {
    TaskId(1)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const ENTRY: usize = 0x0040_0000;
    const EXIT: usize = 0x0041_0000;

    fn fixture() -> (Scheduler, TaskId, TaskId, TaskId) {
        let mut s = Scheduler::new();
        s.create_idle(ENTRY, EXIT).unwrap();
        let a = s.spawn("a", ENTRY, 0, Priority::Normal, EXIT).unwrap();
        let b = s.spawn("b", ENTRY, 0, Priority::High, EXIT).unwrap();
        let c = s.spawn("c", ENTRY, 0, Priority::Low, EXIT).unwrap();
        s.set_first(a).unwrap();
        (s, a, b, c)
    }

    #[test]
    fn round_robin_rotates_in_queue_order() {
        let (mut s, a, b, c) = fixture();
        assert!(s.check_running_invariant());

        assert!(s.prepare_switch().is_some());
        assert_eq!(s.current_id(), b);
        assert!(s.check_running_invariant());

        assert!(s.prepare_switch().is_some());
        assert_eq!(s.current_id(), c);

        assert!(s.prepare_switch().is_some());
        assert_eq!(s.current_id(), a);
    }

    #[test]
    fn selection_ignores_priority_but_quantum_scales() {
        let (mut s, _a, b, _c) = fixture();
        s.prepare_switch().unwrap();
        assert_eq!(s.current_id(), b);
        let t = s.task(b).unwrap();
        assert_eq!(t.time_slice_remaining, Priority::High.quantum());
    }

    #[test]
    fn lone_task_keeps_running_without_switch() {
        let mut s = Scheduler::new();
        s.create_idle(ENTRY, EXIT).unwrap();
        let a = s.spawn("only", ENTRY, 0, Priority::Normal, EXIT).unwrap();
        s.set_first(a).unwrap();
        assert!(s.prepare_switch().is_none());
        assert_eq!(s.current_id(), a);
        assert_eq!(s.task(a).unwrap().state, TaskState::Running);
    }

    #[test]
    fn idle_runs_iff_nothing_ready() {
        let (mut s, a, b, c) = fixture();
        let now = 100;
        for id in [b, c] {
            s.task_mut(id).unwrap().state = TaskState::Sleeping;
            s.task_mut(id).unwrap().sleep_until = now + 50;
        }
        // a (current) goes to sleep too; only idle remains.
        s.sleep_current(now + 50);
        assert!(s.prepare_switch().is_some());
        assert_eq!(s.current_id(), s.idle_id());
        assert!(s.check_running_invariant());

        // Wake-up at the deadline puts sleepers back in rotation.
        assert!(!s.tick(now + 50)); // preemption disabled
        assert_eq!(s.task(a).unwrap().state, TaskState::Ready);
        assert!(s.prepare_switch().is_some());
        assert_ne!(s.current_id(), s.idle_id());
        assert!(s.check_running_invariant());
    }

    #[test]
    fn tick_charges_quantum_and_requests_preemption() {
        let (mut s, a, _b, _c) = fixture();
        s.preemption_enabled = true;
        let quantum = s.task(a).unwrap().time_slice_remaining;
        let mut fired = false;
        for t in 0..quantum + 1 {
            if s.tick(t as u64) {
                fired = true;
                break;
            }
        }
        assert!(fired, "quantum exhaustion must request a reschedule");
        assert_eq!(s.stats().preemptions, 1);
    }

    #[test]
    fn sleep_wake_cycle_hits_deadline_exactly() {
        let (mut s, a, _b, _c) = fixture();
        s.sleep_current(10);
        s.prepare_switch().unwrap();
        // One tick early: still sleeping.
        s.tick(9);
        assert_eq!(s.task(a).unwrap().state, TaskState::Sleeping);
        s.tick(10);
        assert_eq!(s.task(a).unwrap().state, TaskState::Ready);
        assert_eq!(s.task(a).unwrap().sleep_until, 0);
    }

    #[test]
    fn destroy_rules() {
        let (mut s, a, b, _c) = fixture();
        // Current task refuses destruction.
        assert!(matches!(
            s.destroy(a),
            Err(crate::KernelError::Sched(SchedError::DestroyCurrent { .. }))
        ));
        // Idle refuses destruction.
        assert!(s.destroy(s.idle_id()).is_err());
        // Others are destroyable and leave the rotation.
        s.destroy(b).unwrap();
        assert!(s.task(b).is_none());
        assert_eq!(s.task_count(), 3); // idle + a + c
    }

    #[test]
    fn terminate_current_zombifies_and_promotes() {
        let (mut s, a, b, _c) = fixture();
        let pair = s.terminate_current();
        assert!(pair.is_some());
        assert_eq!(s.task(a).unwrap().state, TaskState::Zombie);
        assert_eq!(s.current_id(), b);
        assert!(s.check_running_invariant());

        // The cleanup pass reaps the zombie.
        s.reap();
        assert!(s.task(a).is_none());
    }

    #[test]
    fn terminate_current_falls_back_to_idle() {
        let mut s = Scheduler::new();
        s.create_idle(ENTRY, EXIT).unwrap();
        let a = s.spawn("only", ENTRY, 0, Priority::Normal, EXIT).unwrap();
        s.set_first(a).unwrap();
        s.terminate_current().unwrap();
        assert_eq!(s.current_id(), s.idle_id());
        assert!(s.check_running_invariant());
    }

    #[test]
    fn reap_skips_current_and_returns_page_directories() {
        let (mut s, _a, b, c) = fixture();
        s.task_mut(b).unwrap().state = TaskState::Finished;
        s.task_mut(c).unwrap().state = TaskState::Zombie;
        s.task_mut(c).unwrap().user_page_directory = Some(PhysAddr::new(0x0070_0000));
        let pds = s.reap();
        assert_eq!(pds, alloc::vec![PhysAddr::new(0x0070_0000)]);
        assert!(s.task(b).is_none());
        assert!(s.task(c).is_none());
    }

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let (s, a, b, c) = fixture();
        assert!(a.0 > 0);
        assert!(b.0 > a.0);
        assert!(c.0 > b.0);
        assert_eq!(s.task_count(), 4);
    }
}
