//! Per-task bounded message queues.
//!
//! A queue is created lazily the first time some task sends to its
//! owner. Send runs under the interrupt guard, publishes the payload
//! with a release store on `has_messages`, and wakes a SLEEPING
//! receiver (wake-on-send). Within one sender/receiver pair messages
//! arrive in send order; across senders only per-sender FIFO holds.

use alloc::{boxed::Box, collections::VecDeque};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    config::{MAX_MESSAGES_PER_QUEUE, MAX_MSG},
    error::{IpcError, KernelResult},
    sched::{Scheduler, TaskId},
};

/// One message. The payload is stored inline so queue nodes never chase
/// a second allocation.
#[derive(Clone)]
pub struct Message {
    pub sender: TaskId,
    pub kind: u32,
    len: u16,
    payload: [u8; MAX_MSG],
}

impl Message {
    fn new(sender: TaskId, kind: u32, data: &[u8]) -> Self {
        let mut payload = [0u8; MAX_MSG];
        payload[..data.len()].copy_from_slice(data);
        Self {
            sender,
            kind,
            len: data.len() as u16,
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A task's inbox.
pub struct MessageQueue {
    messages: VecDeque<Message>,
    /// Receiver-visible "mail waiting" flag; paired release/acquire with
    /// the payload copy so a receiver that observes `true` also observes
    /// the full message.
    has_messages: AtomicBool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            has_messages: AtomicBool::new(false),
        }
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn has_messages(&self) -> bool {
        self.has_messages.load(Ordering::Acquire)
    }

    fn push(&mut self, msg: Message) -> KernelResult<()> {
        if self.messages.len() >= MAX_MESSAGES_PER_QUEUE {
            return Err(IpcError::QueueFull {
                capacity: MAX_MESSAGES_PER_QUEUE,
            }
            .into());
        }
        self.messages.push_back(msg);
        // Publish after the payload copy (release pairs with the
        // receiver's acquire load).
        self.has_messages.store(true, Ordering::Release);
        Ok(())
    }

    fn pop(&mut self) -> Option<Message> {
        let msg = self.messages.pop_front();
        if self.messages.is_empty() {
            self.has_messages.store(false, Ordering::Release);
        }
        msg
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue a message for `target`, creating its queue on first use and
/// waking it if it sleeps. Runs on the scheduler arena the caller has
/// already locked (interrupts disabled).
pub fn enqueue(
    sched: &mut Scheduler,
    target: TaskId,
    sender: TaskId,
    kind: u32,
    payload: &[u8],
) -> KernelResult<()> {
    if payload.len() > MAX_MSG {
        return Err(IpcError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MSG,
        }
        .into());
    }
    let task = sched
        .task_mut(target)
        .ok_or(IpcError::TaskNotFound { id: target.0 })?;
    let queue = task.queue.get_or_insert_with(|| Box::new(MessageQueue::new()));
    queue.push(Message::new(sender, kind, payload))?;

    // Wake-on-send: a sleeping receiver becomes READY with its deadline
    // cleared and sees the message at its next quantum.
    sched.wake(target);
    Ok(())
}

/// Dequeue the oldest message for `receiver`, if any.
pub fn dequeue(sched: &mut Scheduler, receiver: TaskId) -> KernelResult<Message> {
    let task = sched
        .task_mut(receiver)
        .ok_or(IpcError::TaskNotFound { id: receiver.0 })?;
    let queue = task.queue.as_mut().ok_or(IpcError::Empty)?;
    if !queue.has_messages() {
        return Err(IpcError::Empty.into());
    }
    queue.pop().ok_or_else(|| IpcError::Empty.into())
}

// ---------------------------------------------------------------------------
// Bare-metal entry points
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod wiring {
    use super::*;
    use crate::{
        config::{RECEIVE_POLL_MS, RECEIVE_TIMEOUT_MS},
        kernel::kernel,
        sched::scheduler::{current_task_id, task_sleep},
        sync::InterruptGuard,
        time,
    };

    /// Send `payload` with tag `kind` to `target`'s queue.
    pub fn send(target: TaskId, kind: u32, payload: &[u8]) -> KernelResult<()> {
        let sender = current_task_id();
        let _guard = InterruptGuard::new();
        // SAFETY: interrupts disabled; borrow scoped to this function.
        enqueue(unsafe { kernel().sched.get_mut() }, target, sender, kind, payload)
    }

    /// Receive the next message for the calling task.
    ///
    /// Non-blocking returns [`IpcError::Empty`] immediately; blocking
    /// polls in short sleeps and gives up with [`IpcError::Timeout`]
    /// after the soft deadline.
    pub fn receive(blocking: bool) -> KernelResult<Message> {
        let me = current_task_id();
        let deadline = time::now_ms() + RECEIVE_TIMEOUT_MS;
        loop {
            let attempt = {
                let _guard = InterruptGuard::new();
                // SAFETY: interrupts disabled; borrow scoped to this block.
                dequeue(unsafe { kernel().sched.get_mut() }, me)
            };
            match attempt {
                Ok(msg) => return Ok(msg),
                Err(crate::KernelError::Ipc(IpcError::Empty)) if blocking => {
                    if time::now_ms() >= deadline {
                        return Err(IpcError::Timeout.into());
                    }
                    task_sleep(RECEIVE_POLL_MS);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use wiring::{receive, send};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::{Priority, TaskState};

    const ENTRY: usize = 0x0040_0000;
    const EXIT: usize = 0x0041_0000;

    fn fixture() -> (Scheduler, TaskId, TaskId) {
        let mut s = Scheduler::new();
        s.create_idle(ENTRY, EXIT).unwrap();
        let a = s.spawn("sender", ENTRY, 0, Priority::Normal, EXIT).unwrap();
        let b = s.spawn("receiver", ENTRY, 0, Priority::Normal, EXIT).unwrap();
        s.set_first(a).unwrap();
        (s, a, b)
    }

    #[test]
    fn queue_is_created_lazily_on_first_send() {
        let (mut s, a, b) = fixture();
        assert!(s.task(b).unwrap().queue.is_none());
        enqueue(&mut s, b, a, 7, b"hi").unwrap();
        let q = s.task(b).unwrap().queue.as_ref().unwrap();
        assert_eq!(q.count(), 1);
        assert!(q.has_messages());
    }

    #[test]
    fn round_trip_preserves_kind_and_payload() {
        let (mut s, a, b) = fixture();
        enqueue(&mut s, b, a, 7, b"hi").unwrap();
        let msg = dequeue(&mut s, b).unwrap();
        assert_eq!(msg.sender, a);
        assert_eq!(msg.kind, 7);
        assert_eq!(msg.len(), 2);
        assert_eq!(msg.payload(), b"hi");
        // Queue flag drops with the last message.
        assert!(!s.task(b).unwrap().queue.as_ref().unwrap().has_messages());
    }

    #[test]
    fn send_order_is_preserved_per_sender() {
        let (mut s, a, b) = fixture();
        for i in 0..5u32 {
            enqueue(&mut s, b, a, i, &[i as u8]).unwrap();
        }
        for i in 0..5u32 {
            let msg = dequeue(&mut s, b).unwrap();
            assert_eq!(msg.kind, i);
            assert_eq!(msg.payload(), &[i as u8]);
        }
    }

    #[test]
    fn wake_on_send_flips_sleeping_receiver_to_ready() {
        let (mut s, a, b) = fixture();
        s.task_mut(b).unwrap().state = TaskState::Sleeping;
        s.task_mut(b).unwrap().sleep_until = 1_000;

        enqueue(&mut s, b, a, 1, b"x").unwrap();
        let t = s.task(b).unwrap();
        assert_eq!(t.state, TaskState::Ready);
        assert_eq!(t.sleep_until, 0);
    }

    #[test]
    fn bounded_depth_is_enforced() {
        let (mut s, a, b) = fixture();
        for _ in 0..MAX_MESSAGES_PER_QUEUE {
            enqueue(&mut s, b, a, 0, b"m").unwrap();
        }
        assert!(matches!(
            enqueue(&mut s, b, a, 0, b"m"),
            Err(crate::KernelError::Ipc(IpcError::QueueFull { .. }))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (mut s, a, b) = fixture();
        let big = [0u8; MAX_MSG + 1];
        assert!(matches!(
            enqueue(&mut s, b, a, 0, &big),
            Err(crate::KernelError::Ipc(IpcError::MessageTooLarge { .. }))
        ));
    }

    #[test]
    fn empty_and_missing_queues_report_empty() {
        let (mut s, _a, b) = fixture();
        assert!(matches!(
            dequeue(&mut s, b),
            Err(crate::KernelError::Ipc(IpcError::Empty))
        ));
        // Send to a task that never existed.
        assert!(matches!(
            enqueue(&mut s, TaskId(999), b, 0, b"x"),
            Err(crate::KernelError::Ipc(IpcError::TaskNotFound { .. }))
        ));
    }
}
