//! The process-wide message mailbox.
//!
//! One bounded FIFO of fixed-size messages, shared by every producer in the
//! system: task handlers running in the main loop and interrupt sources
//! firing between them. The spinlock around the ring stands in for masking
//! the producing interrupt source on a bare-metal target; either way an
//! enqueue is atomic with respect to every other enqueue.
//!
//! Lost messages are counted, never retried. A task that depends on a reply
//! must guard it with a clock alarm.

use core::sync::atomic::{AtomicU32, Ordering};

use heron_abi::Message;
use msg_ring::MsgRing;
use spinning_top::Spinlock;

/// The process-wide bounded message FIFO.
pub struct Mailbox {
    ring: Spinlock<MsgRing<Message>>,
    /// Messages dropped on a full ring, plus messages nobody could handle.
    lost: AtomicU32,
    /// Largest backlog observed, for sizing the ring on real hardware.
    high_water: AtomicU32,
}

impl Mailbox {
    /// Create a mailbox holding at most `capacity` undelivered messages.
    pub fn new(capacity: usize) -> Mailbox {
        Mailbox {
            ring: Spinlock::new(MsgRing::new(capacity)),
            lost: AtomicU32::new(0),
            high_water: AtomicU32::new(0),
        }
    }

    /// Enqueue a message. Callable from any context.
    ///
    /// Returns `false` if the mailbox was full: the message is dropped, the
    /// lost counter is incremented, and prior contents stay intact.
    pub fn post(&self, msg: Message) -> bool {
        let mut ring = self.ring.lock();
        match ring.push(msg) {
            Ok(()) => {
                let depth = ring.len() as u32;
                self.high_water.fetch_max(depth, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Dequeue the oldest message, if any.
    pub fn take(&self) -> Option<Message> {
        self.ring.lock().pop()
    }

    /// Number of undelivered messages.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Whether the mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Messages lost so far (full mailbox or no handler).
    pub fn lost(&self) -> u32 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Count a message that was extracted but could not be delivered.
    pub fn count_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Largest backlog observed since construction.
    pub fn high_water(&self) -> u32 {
        self.high_water.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_abi::{Opcode, TaskId};

    fn msg(n: u8) -> Message {
        Message::notify(TaskId(n), TaskId(1), Opcode::NotBusy)
    }

    #[test]
    fn test_post_take_order() {
        let mailbox = Mailbox::new(4);
        assert!(mailbox.post(msg(1)));
        assert!(mailbox.post(msg(2)));

        assert_eq!(mailbox.take().unwrap().sender, TaskId(1));
        assert_eq!(mailbox.take().unwrap().sender, TaskId(2));
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn test_full_mailbox_counts_and_keeps_contents() {
        let mailbox = Mailbox::new(3);
        for n in 1..=3 {
            assert!(mailbox.post(msg(n)));
        }

        // Overflow: dropped, counted, prior contents intact.
        assert!(!mailbox.post(msg(4)));
        assert!(!mailbox.post(msg(5)));
        assert_eq!(mailbox.lost(), 2);

        for n in 1..=3 {
            assert_eq!(mailbox.take().unwrap().sender, TaskId(n));
        }
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn test_high_water_mark() {
        let mailbox = Mailbox::new(8);
        mailbox.post(msg(1));
        mailbox.post(msg(2));
        mailbox.post(msg(3));
        mailbox.take();
        mailbox.post(msg(4));

        assert_eq!(mailbox.high_water(), 3);
    }
}
