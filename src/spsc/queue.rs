//! Lock-free intrusive SPSC node queue.
//!
//! An unbounded singly-linked queue for exactly one producer thread and one
//! consumer thread. Structural operations never block (allocation in `push`
//! excepted): the producer appends with a single release-store, the consumer
//! detaches with a single release-store, and popped nodes are recycled
//! through a second linked list running in the opposite direction, so a
//! steady-state producer/consumer pair stops allocating entirely.
//!
//! # Overview
//!
//! - [`NodeQueue`] - The unsafe core. Callers uphold the SPSC role contract.
//! - [`Sender`] / [`Receiver`] - Safe single-owner endpoints from
//!   [`channel`], with blocking behavior chosen by a [`WaitMode`].
//!
//! # Representation
//!
//! Both lists use a dummy head: `head` points at a node whose value is dead,
//! `head.next` is the logical front, `tail` is the logical back, and
//! emptiness is `head == tail`. Popping moves the front value out, makes the
//! front node the new dummy, and hands the old dummy to the freelist. Node
//! addresses are stable until the node is recycled.
//!
//! # Example
//!
//! ```
//! use bytepipe::spsc::queue;
//! use bytepipe::wait::Spin;
//!
//! let (mut tx, mut rx) = queue::channel::<u64, Spin>().unwrap();
//!
//! let producer = std::thread::spawn(move || {
//!     for i in 0..100 {
//!         tx.push(i);
//!     }
//! });
//!
//! for i in 0..100 {
//!     assert_eq!(rx.pop(), i);
//! }
//! producer.join().unwrap();
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use rustix::io::Errno;

use crate::wait::WaitMode;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    /// Allocates a node with a dead value slot.
    fn dummy() -> *mut Self {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }))
    }

    /// Allocates a node carrying `value`.
    fn with_value(value: T) -> *mut Self {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }))
    }
}

/// The wait-free SPSC queue core.
///
/// All operations are `unsafe fn`: the queue itself cannot know which thread
/// is calling. The contract is the usual SPSC split:
///
/// - **producer role** (one thread): [`push`](Self::push), [`back`](Self::back)
/// - **consumer role** (one thread): [`pop`](Self::pop), [`front`](Self::front),
///   [`is_empty`](Self::is_empty)
///
/// The safe [`Sender`]/[`Receiver`] endpoints enforce this contract by
/// construction; the byte buffer enforces it with its own endpoint split.
///
/// # Field roles
///
/// `head` and `free_tail` are owned by the consumer; `tail` and `free_head`
/// by the producer. `tail` and `free_tail` are additionally *read* by the
/// opposite side, which is why they are atomics: the release-store of `tail`
/// is the publication event for a pushed value, and the release-store of
/// `free_tail` is the publication event for a recycled node.
pub struct NodeQueue<T> {
    /// Dummy node; `head.next` is the logical front. Consumer-owned.
    head: UnsafeCell<*mut Node<T>>,
    /// Logical back. Written only by the producer, read by both.
    tail: AtomicPtr<Node<T>>,
    /// Freelist dummy. Producer-owned.
    free_head: UnsafeCell<*mut Node<T>>,
    /// Freelist back. Written only by the consumer, read by both.
    free_tail: AtomicPtr<Node<T>>,
}

// SAFETY: the SPSC role contract partitions every field between the two
// threads; the shared reads (`tail`, `free_tail`) are atomic with
// release/acquire pairing, and value slots transfer ownership through those
// publication events.
unsafe impl<T: Send> Send for NodeQueue<T> {}
unsafe impl<T: Send> Sync for NodeQueue<T> {}

impl<T> NodeQueue<T> {
    /// Creates an empty queue. Not thread-safe; callers publish the queue to
    /// both threads afterwards (e.g. via `Arc`).
    #[must_use]
    pub fn new() -> Self {
        let dummy = Node::dummy();
        let free_dummy = Node::dummy();
        Self {
            head: UnsafeCell::new(dummy),
            tail: AtomicPtr::new(dummy),
            free_head: UnsafeCell::new(free_dummy),
            free_tail: AtomicPtr::new(free_dummy),
        }
    }

    /// Whether the node freelist is empty.
    ///
    /// # Safety
    ///
    /// Producer role only.
    #[inline]
    unsafe fn free_list_empty(&self) -> bool {
        // SAFETY: free_head is producer-owned per the caller's contract.
        let free_head = unsafe { *self.free_head.get() };
        ptr::eq(free_head, self.free_tail.load(Ordering::Acquire))
    }

    /// Appends a value. The trailing release-store of `tail` is the single
    /// event that makes the value visible to the consumer.
    ///
    /// # Safety
    ///
    /// Producer role only: exactly one thread may call `push`/`back`.
    pub unsafe fn push(&self, value: T) {
        // SAFETY: producer role per caller contract.
        let node = if unsafe { self.free_list_empty() } {
            Node::with_value(value)
        } else {
            // Detach the freelist dummy and reuse it; its successor becomes
            // the new dummy. The acquire in free_list_empty ordered this
            // chain after the consumer's writes to it.
            // SAFETY: the freelist is non-empty, so free_head has a
            // successor, and both nodes are producer-reachable only.
            unsafe {
                let node = *self.free_head.get();
                *self.free_head.get() = (*node).next.load(Ordering::Relaxed);
                (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                (*(*node).value.get()).write(value);
                node
            }
        };

        let tail = self.tail.load(Ordering::Relaxed);
        // SAFETY: tail is the producer's own last published node; linking
        // through it before the release-store below is the publication
        // protocol.
        unsafe {
            (*tail).next.store(node, Ordering::Relaxed);
        }
        self.tail.store(node, Ordering::Release);
    }

    /// Detaches and returns the front value, recycling the detached node.
    ///
    /// # Safety
    ///
    /// Consumer role only, and the queue must be non-empty (checked by
    /// [`is_empty`](Self::is_empty) or a prior wait).
    pub unsafe fn pop(&self) -> T {
        // SAFETY: head is consumer-owned; non-emptiness means head.next was
        // published by a release-store of tail, which the acquire here (or
        // an earlier acquire in is_empty) pairs with.
        unsafe {
            let head = *self.head.get();
            let front = (*head).next.load(Ordering::Acquire);
            debug_assert!(!front.is_null(), "pop on empty queue");
            let value = (*(*front).value.get()).assume_init_read();
            *self.head.get() = front;

            // The old dummy goes to the freelist; the release-store of
            // free_tail publishes it to the producer.
            (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
            let free_tail = self.free_tail.load(Ordering::Relaxed);
            (*free_tail).next.store(head, Ordering::Relaxed);
            self.free_tail.store(head, Ordering::Release);

            value
        }
    }

    /// Returns a reference to the front value.
    ///
    /// # Safety
    ///
    /// Consumer role only, and the queue must be non-empty.
    pub unsafe fn front(&self) -> &T {
        // SAFETY: as in pop; the reference stays valid until this value is
        // popped, because nodes never move.
        unsafe {
            let front = (*(*self.head.get())).next.load(Ordering::Acquire);
            debug_assert!(!front.is_null(), "front on empty queue");
            (*(*front).value.get()).assume_init_ref()
        }
    }

    /// Returns a reference to the back value.
    ///
    /// # Safety
    ///
    /// Producer role only, and the queue must be non-empty *from the
    /// producer's point of view*: the producer has pushed at least one value
    /// that it knows the consumer will not pop (the byte buffer's tail
    /// segment, for instance, is never popped).
    pub unsafe fn back(&self) -> &T {
        // SAFETY: tail is the producer's own last store; the caller
        // guarantees its value is still live.
        unsafe {
            let tail = self.tail.load(Ordering::Relaxed);
            (*(*tail).value.get()).assume_init_ref()
        }
    }

    /// Whether the queue is empty.
    ///
    /// # Safety
    ///
    /// Consumer role only.
    #[inline]
    pub unsafe fn is_empty(&self) -> bool {
        // SAFETY: head is consumer-owned per the caller's contract.
        let head = unsafe { *self.head.get() };
        ptr::eq(head, self.tail.load(Ordering::Acquire))
    }
}

impl<T> Default for NodeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for NodeQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: drop unread values (everything after the dummy),
        // then free the nodes of both lists.
        unsafe {
            let mut node = *self.head.get();
            let mut is_dummy = true;
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                if !is_dummy {
                    (*(*node).value.get()).assume_init_drop();
                }
                drop(Box::from_raw(node));
                is_dummy = false;
                node = next;
            }

            let mut node = *self.free_head.get();
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}

struct Shared<T, W> {
    queue: NodeQueue<T>,
    wait: W,
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the queue.
///
/// `Sender` is [`Send`] but **not** [`Sync`], which enforces the
/// single-producer contract at compile time: the endpoint can move to
/// another thread, but `&Sender` cannot be shared across threads.
pub struct Sender<T: Send, W: WaitMode> {
    shared: Arc<Shared<T, W>>,
    _unsync: PhantomUnsync,
}

/// Read end of the queue.
///
/// Same thread-safety shape as [`Sender`]: `Send` but not `Sync`.
pub struct Receiver<T: Send, W: WaitMode> {
    shared: Arc<Shared<T, W>>,
    _unsync: PhantomUnsync,
}

/// Creates an SPSC node queue with the given wait mode.
///
/// # Errors
///
/// Fails only if the wait mode's construction fails (eventfd creation).
pub fn channel<T: Send, W: WaitMode>() -> Result<(Sender<T, W>, Receiver<T, W>), Errno> {
    let shared = Arc::new(Shared {
        queue: NodeQueue::new(),
        wait: W::new()?,
    });

    Ok((
        Sender {
            shared: Arc::clone(&shared),
            _unsync: PhantomData,
        },
        Receiver {
            shared,
            _unsync: PhantomData,
        },
    ))
}

impl<T: Send, W: WaitMode> Sender<T, W> {
    /// Appends a value and wakes the consumer per the wait mode.
    ///
    /// Under [`Condvar`](crate::wait::Condvar)-family modes the publication
    /// happens while holding the mode's mutex; the atomic store still
    /// happens, so a consumer probing [`Receiver::is_empty`] without the
    /// mutex stays correct.
    pub fn push(&mut self, value: T) {
        let shared = &*self.shared;
        // SAFETY: this endpoint is the unique producer (Send + !Sync + no
        // Clone), so the producer role contract holds.
        shared.wait.signal(|| unsafe { shared.queue.push(value) });
    }
}

impl<T: Send, W: WaitMode> Receiver<T, W> {
    /// Pops the front value if one is available.
    #[must_use]
    pub fn try_pop(&mut self) -> Option<T> {
        // SAFETY: this endpoint is the unique consumer.
        unsafe {
            if self.shared.queue.is_empty() {
                None
            } else {
                Some(self.shared.queue.pop())
            }
        }
    }

    /// Pops the front value, waiting for one per the wait mode.
    ///
    /// Under [`WaitFree`](crate::wait::WaitFree) this panics if the queue is
    /// empty - availability is the caller's precondition there.
    #[must_use]
    pub fn pop(&mut self) -> T {
        let shared = &*self.shared;
        // SAFETY: unique consumer endpoint.
        shared.wait.wait(|| unsafe { !shared.queue.is_empty() });
        unsafe { shared.queue.pop() }
    }

    /// Returns the front value without popping, if one is available.
    ///
    /// The reference stays valid until [`pop`](Self::pop) or
    /// [`try_pop`](Self::try_pop), both of which need `&mut self`.
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        // SAFETY: unique consumer endpoint.
        unsafe {
            if self.shared.queue.is_empty() {
                None
            } else {
                Some(self.shared.queue.front())
            }
        }
    }

    /// Returns the front value, waiting for one per the wait mode.
    #[must_use]
    pub fn wait_front(&self) -> &T {
        let shared = &*self.shared;
        // SAFETY: unique consumer endpoint.
        shared.wait.wait(|| unsafe { !shared.queue.is_empty() });
        unsafe { self.shared.queue.front() }
    }

    /// Whether the queue is empty right now.
    ///
    /// Opportunistic under condvar modes: the check does not take the
    /// mode's mutex.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        // SAFETY: unique consumer endpoint.
        unsafe { self.shared.queue.is_empty() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{Condvar, Spin, WaitFree};
    use std::time::Duration;

    #[test]
    fn basic_push_pop() {
        let (mut tx, mut rx) = channel::<u64, WaitFree>().unwrap();

        tx.push(42);
        assert_eq!(rx.try_pop(), Some(42));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = channel::<u64, WaitFree>().unwrap();

        for i in 0..10 {
            tx.push(i);
        }
        for i in 0..10 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn front_then_pop() {
        let (mut tx, mut rx) = channel::<String, WaitFree>().unwrap();

        assert!(rx.front().is_none());
        tx.push("hello".to_string());
        tx.push("world".to_string());

        assert_eq!(rx.front().map(String::as_str), Some("hello"));
        assert_eq!(rx.try_pop().as_deref(), Some("hello"));
        assert_eq!(rx.front().map(String::as_str), Some("world"));
    }

    #[test]
    fn nodes_are_recycled() {
        let (mut tx, mut rx) = channel::<u64, WaitFree>().unwrap();

        // Fill/drain a few rounds; pushes after the first round reuse
        // freelist nodes. Only FIFO behavior is observable, which must be
        // unaffected.
        for round in 0..5 {
            for i in 0..8 {
                tx.push(round * 10 + i);
            }
            for i in 0..8 {
                assert_eq!(rx.try_pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn spin_pop_blocks_until_push() {
        let (mut tx, mut rx) = channel::<u64, Spin>().unwrap();

        let consumer = std::thread::spawn(move || rx.pop());

        std::thread::sleep(Duration::from_millis(20));
        tx.push(7);
        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn condvar_pop_blocks_until_push() {
        let (mut tx, mut rx) = channel::<u64, Condvar>().unwrap();

        let consumer = std::thread::spawn(move || rx.pop());

        std::thread::sleep(Duration::from_millis(20));
        tx.push(99);
        assert_eq!(consumer.join().unwrap(), 99);
    }

    #[test]
    fn concurrent_fifo_stress() {
        const COUNT: u64 = 100_000;
        let (mut tx, mut rx) = channel::<u64, Spin>().unwrap();

        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                tx.push(i);
            }
        });

        let consumer = std::thread::spawn(move || {
            for i in 0..COUNT {
                assert_eq!(rx.pop(), i);
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn unread_values_are_dropped() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Droppable;
        impl Drop for Droppable {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        DROPS.store(0, Ordering::Relaxed);
        let (mut tx, mut rx) = channel::<Droppable, WaitFree>().unwrap();

        tx.push(Droppable);
        tx.push(Droppable);
        tx.push(Droppable);
        drop(rx.try_pop());
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);

        // The two unread values are dropped with the queue.
        drop(tx);
        drop(rx);
        assert_eq!(DROPS.load(Ordering::Relaxed), 3);
    }
}
