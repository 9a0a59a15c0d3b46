//! Unbounded SPSC byte buffer over linked fixed-size segments.
//!
//! One producer thread appends bytes, one consumer thread reads them back in
//! FIFO order. The buffer grows without bound by linking fresh segments
//! (recycled through an internal freelist once the consumer releases them),
//! and segment memory never moves: a slice handed out by
//! [`Reader::read_cont`] stays valid until the caller releases it with
//! [`Reader::clear_preserved`] - a contract the borrow checker enforces,
//! since reads borrow the reader shared and `clear_preserved` needs it
//! exclusively.
//!
//! # Overview
//!
//! - [`Writer`] - producer end: raw, contiguous, typed and length-prefixed
//!   writes, in-place production via [`ensure_cont`](Writer::ensure_cont),
//!   and direct fills from a file descriptor.
//! - [`Reader`] - consumer end: typed and zero-copy reads, value-returning
//!   `get_*` operations that auto-release, and direct drains to a file
//!   descriptor.
//! - The blocking discipline is a compile-time [`WaitMode`] choice; see
//!   [`crate::wait`].
//!
//! # Contiguity
//!
//! Reads require the requested size to be at most the block size, and every
//! datum written through [`put`](Writer::put), [`write_cont`](Writer::write_cont)
//! or the length-prefixed operations lands wholly within one segment, so it
//! reads back as a single contiguous slice. The raw [`write`](Writer::write)
//! splits freely across segment boundaries and pairs with chunked reads or
//! [`drain_to_fd`](Reader::drain_to_fd).
//!
//! # Example
//!
//! ```
//! use bytepipe::spsc::buffer;
//! use bytepipe::wait::Condvar;
//!
//! let (mut tx, mut rx) = buffer::channel_with_block_size::<Condvar>(4096).unwrap();
//!
//! let producer = std::thread::spawn(move || {
//!     tx.put(1u64, true);
//!     tx.write_str("payload", true);
//! });
//!
//! // Blocks on the condition variable until the producer publishes.
//! assert_eq!(rx.get::<u64>(), 1);
//! assert_eq!(rx.get_string(), "payload");
//! producer.join().unwrap();
//! ```

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use rustix::io::Errno;
use thiserror::Error;

use crate::block::{Block, alloc_block};
use crate::plain::Plain;
use crate::spsc::queue::NodeQueue;
use crate::trace;
use crate::wait::{EventFd, WaitMode};

/// Errors that can occur constructing a buffer.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Creating the notification eventfd failed.
    #[error("eventfd creation failed: {0}")]
    Eventfd(#[source] Errno),
}

/// A fixed-size byte block plus its published length.
///
/// `end` starts at 0 and grows monotonically. For the tail segment it is the
/// producer's release-visible write cursor; for every other segment it is
/// the sealed final length. The block allocation never moves for the
/// segment's entire lifetime.
struct Segment {
    data: Block,
    end: AtomicUsize,
}

impl Segment {
    fn new(data: Block) -> Self {
        Self {
            data,
            end: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }
}

/// A drained segment whose memory is still addressable by handed-out
/// slices, plus its sealed length for release accounting.
struct Preserved {
    seg: Segment,
    len: usize,
}

struct Shared<M: WaitMode> {
    block_size: usize,
    /// Live segments, oldest first. The producer pushes the tail, the
    /// consumer pops drained heads. Never empty.
    segs: NodeQueue<Segment>,
    /// Detached blocks flowing back consumer -> producer for reuse.
    free: NodeQueue<Block>,
    /// Address of the tail segment's `end` field. Release-stored by the
    /// producer whenever a new tail is linked; acquire-loaded by the
    /// consumer. This is the pointer the `one_block_left` hysteresis
    /// compares against.
    wpos: AtomicPtr<AtomicUsize>,
    /// Fresh block allocations so far (diagnostic; observing freelist
    /// steady-state).
    allocated: AtomicUsize,
    mode: M,
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the buffer. `Send` but not `Sync`: exactly one thread
/// produces.
pub struct Writer<M: WaitMode> {
    shared: Arc<Shared<M>>,
    /// True write offset within the tail segment. Only published into the
    /// tail's `end` by [`notify`](Self::notify) or when the tail is sealed.
    wpos_private: usize,
    notify_counter: u32,
    _unsync: PhantomUnsync,
}

/// Read end of the buffer. `Send` but not `Sync`: exactly one thread
/// consumes.
///
/// Read operations take `&self` so that multiple zero-copy reads can be
/// held at once; everything that can invalidate them takes `&mut self`.
pub struct Reader<M: WaitMode> {
    shared: Arc<Shared<M>>,
    /// Offset of the next unread byte within the head segment.
    rpos: Cell<usize>,
    /// Hysteresis flag: when `false` there is provably more than one live
    /// segment, so the head's `end` is sealed and plain loads suffice.
    /// When `true` the producer may still be appending to the head and the
    /// consumer must acquire-load through the published cursor.
    one_block_left: Cell<bool>,
    /// Fully-drained segments not yet released by `clear_preserved`.
    preserved: RefCell<VecDeque<Preserved>>,
    _unsync: PhantomUnsync,
}

/// Creates a buffer with the OS page size as block size.
///
/// # Errors
///
/// Fails only if the wait mode's construction fails (eventfd creation).
pub fn channel<M: WaitMode>() -> Result<(Writer<M>, Reader<M>), ChannelError> {
    channel_with_block_size(rustix::param::page_size())
}

/// Creates a buffer with an explicit block size.
///
/// The block size bounds the largest datum a single read can return; see
/// the module docs on contiguity.
///
/// # Errors
///
/// Fails only if the wait mode's construction fails (eventfd creation).
///
/// # Panics
///
/// Panics if `block_size` is 0.
pub fn channel_with_block_size<M: WaitMode>(
    block_size: usize,
) -> Result<(Writer<M>, Reader<M>), ChannelError> {
    assert!(block_size > 0, "block size must be greater than 0");

    let shared = Arc::new(Shared {
        block_size,
        segs: NodeQueue::new(),
        free: NodeQueue::new(),
        wpos: AtomicPtr::new(ptr::null_mut()),
        allocated: AtomicUsize::new(1),
        mode: M::new().map_err(ChannelError::Eventfd)?,
    });

    // Seed the first segment so the list is never empty. Construction is
    // single-threaded; the Arc handoff below publishes everything.
    // SAFETY: no other thread can hold a queue role yet.
    unsafe {
        shared.segs.push(Segment::new(alloc_block(block_size)));
        let end = ptr::from_ref(&shared.segs.back().end).cast_mut();
        shared.wpos.store(end, Ordering::Release);
    }

    Ok((
        Writer {
            shared: Arc::clone(&shared),
            wpos_private: 0,
            notify_counter: 0,
            _unsync: PhantomData,
        },
        Reader {
            shared,
            rpos: Cell::new(0),
            one_block_left: Cell::new(true),
            preserved: RefCell::new(VecDeque::new()),
            _unsync: PhantomData,
        },
    ))
}

impl<M: WaitMode> Writer<M> {
    /// The segment size this buffer was built with.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// How many segment blocks have been freshly allocated so far. Stops
    /// growing once the freelist reaches steady state.
    #[must_use]
    pub fn blocks_allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    #[inline]
    fn tail(&self) -> &Segment {
        // SAFETY: producer role; the tail segment is never popped, so the
        // queue is non-empty from the producer's point of view.
        unsafe { self.shared.segs.back() }
    }

    /// Seals the current tail and links a fresh one, reusing a freelist
    /// block when available. Publishes the new tail's `end` address with
    /// release ordering so the consumer never dereferences a stale cursor.
    fn add_block(&mut self) {
        self.tail().end.store(self.wpos_private, Ordering::Release);
        self.wpos_private = 0;

        // The producer is the free queue's consumer.
        // SAFETY: producer role on `free` (pop side) and `segs` (push side).
        let block = unsafe {
            if self.shared.free.is_empty() {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                trace::trace!(block_size = self.shared.block_size, "allocated fresh block");
                alloc_block(self.shared.block_size)
            } else {
                self.shared.free.pop()
            }
        };
        // SAFETY: producer role.
        unsafe {
            self.shared.segs.push(Segment::new(block));
        }
        let end = ptr::from_ref(&self.tail().end).cast_mut();
        self.shared.wpos.store(end, Ordering::Release);
    }

    #[inline]
    fn add_block_if_full(&mut self) {
        if self.wpos_private == self.shared.block_size {
            self.add_block();
        }
    }

    #[inline]
    fn add_block_if_wont_fit(&mut self, len: usize) {
        if len > self.shared.block_size - self.wpos_private {
            self.add_block();
        }
    }

    /// Copies `bytes` into the buffer, crossing segment boundaries as
    /// needed. Pair with chunked reads or [`Reader::drain_to_fd`]; data that
    /// must read back as one slice goes through [`write_cont`](Self::write_cont)
    /// or [`put`](Self::put) instead.
    pub fn write(&mut self, mut bytes: &[u8], notify: bool) {
        while !bytes.is_empty() {
            self.add_block_if_full();
            let n = bytes.len().min(self.shared.block_size - self.wpos_private);
            // SAFETY: [wpos_private, block_size) of the tail is
            // producer-exclusive; the consumer reads only below the
            // published end, which never exceeds wpos_private.
            unsafe {
                ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    self.tail().base().add(self.wpos_private),
                    n,
                );
            }
            self.wpos_private += n;
            bytes = &bytes[n..];
        }
        if notify {
            self.notify();
        }
    }

    /// Copies `bytes` into a single segment. If the remaining tail capacity
    /// is insufficient the tail is sealed and a fresh segment is linked
    /// first, so the bytes land contiguously.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len()` exceeds the block size.
    pub fn write_cont(&mut self, bytes: &[u8], notify: bool) {
        if bytes.is_empty() {
            return;
        }
        assert!(
            bytes.len() <= self.shared.block_size,
            "contiguous write larger than the block size"
        );
        self.add_block_if_wont_fit(bytes.len());
        // SAFETY: as in write; add_block_if_wont_fit guaranteed the room.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.tail().base().add(self.wpos_private),
                bytes.len(),
            );
        }
        self.wpos_private += bytes.len();
        if notify {
            self.notify();
        }
    }

    /// Writes a value as raw bytes, host byte order and layout. The value
    /// lands wholly within one segment so [`Reader::read`] can return it as
    /// a unit.
    ///
    /// # Panics
    ///
    /// Panics if `size_of::<T>()` exceeds the block size.
    pub fn put<T: Plain>(&mut self, value: T, notify: bool) {
        // SAFETY: Plain guarantees the value is padding-free plain bytes.
        let bytes = unsafe {
            slice::from_raw_parts(ptr::from_ref(&value).cast::<u8>(), mem::size_of::<T>())
        };
        self.write_cont(bytes, notify);
    }

    /// Writes a length-prefixed byte string: a host-layout `usize` length,
    /// then the bytes. The notification is deferred to the end so the
    /// consumer never observes a prefix without its body.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len()` exceeds the block size (the body must read
    /// back as one slice).
    pub fn write_bytes(&mut self, bytes: &[u8], notify: bool) {
        self.put::<usize>(bytes.len(), false);
        if !bytes.is_empty() {
            self.write_cont(bytes, false);
        }
        if notify {
            self.notify();
        }
    }

    /// [`write_bytes`](Self::write_bytes) for a `&str`; read back with
    /// [`Reader::get_string`].
    pub fn write_str(&mut self, s: &str, notify: bool) {
        self.write_bytes(s.as_bytes(), notify);
    }

    /// Returns a writable slice of `len` bytes inside a single segment,
    /// sealing the tail and linking a fresh one if the remainder would not
    /// fit. Produce into it, then [`commit`](Self::commit) what was written.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the block size.
    pub fn ensure_cont(&mut self, len: usize) -> &mut [u8] {
        assert!(
            len <= self.shared.block_size,
            "contiguous reservation larger than the block size"
        );
        self.add_block_if_wont_fit(len);
        // SAFETY: producer-exclusive spare region of the tail segment; the
        // bytes stay invisible to the consumer until committed and
        // published.
        unsafe { slice::from_raw_parts_mut(self.tail().base().add(self.wpos_private), len) }
    }

    /// Advances the write cursor over bytes produced directly into an
    /// [`ensure_cont`](Self::ensure_cont) reservation.
    pub fn commit(&mut self, len: usize, notify: bool) {
        debug_assert!(
            len <= self.shared.block_size - self.wpos_private,
            "commit past the reserved region"
        );
        self.wpos_private += len;
        if notify {
            self.notify();
        }
    }

    /// Publishes the write cursor and wakes the consumer per the wait mode.
    ///
    /// Under batching modes only every `NOTIFY_EVERY`-th call signals; the
    /// others still perform the release-store, so spinning consumers and
    /// [`Reader::is_empty`] observe progress regardless.
    pub fn notify(&mut self) {
        self.notify_counter += 1;
        let signal = self.notify_counter >= M::NOTIFY_EVERY;
        if signal {
            self.notify_counter = 0;
        }
        let value = self.wpos_private;
        let end = &self.tail().end;
        if signal {
            self.shared.mode.signal(|| end.store(value, Ordering::Release));
        } else {
            end.store(value, Ordering::Release);
        }
    }

    /// Loop-reads from `fd` directly into the buffer, linking segments on
    /// boundary, until EOF, an error, or `max` bytes.
    ///
    /// Notifies once at the end iff at least one byte arrived.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if *no* bytes were transferred in this call and
    /// the underlying read failed; after a partial transfer the error is
    /// swallowed and the count returned, so an event loop can re-schedule.
    pub fn fill_from_fd<Fd: AsFd>(&mut self, fd: Fd, max: Option<usize>) -> Result<usize, Errno> {
        self.fill_inner(fd, max, false)
    }

    /// [`fill_from_fd`](Self::fill_from_fd) capped at a single `read` call.
    pub fn fill_from_fd_once<Fd: AsFd>(
        &mut self,
        fd: Fd,
        max: Option<usize>,
    ) -> Result<usize, Errno> {
        self.fill_inner(fd, max, true)
    }

    fn fill_inner<Fd: AsFd>(
        &mut self,
        fd: Fd,
        max: Option<usize>,
        once: bool,
    ) -> Result<usize, Errno> {
        let mut total = 0usize;
        let result = loop {
            self.add_block_if_full();
            let mut want = self.shared.block_size - self.wpos_private;
            if let Some(max) = max {
                want = want.min(max - total);
                if want == 0 {
                    break Ok(());
                }
            }
            // SAFETY: producer-exclusive spare region of the tail segment.
            let buf = unsafe {
                slice::from_raw_parts_mut(self.tail().base().add(self.wpos_private), want)
            };
            match rustix::io::read(fd.as_fd(), buf) {
                Err(e) => break Err(e),
                Ok(0) => break Ok(()), // EOF
                Ok(n) => {
                    total += n;
                    self.wpos_private += n;
                    if once {
                        break Ok(());
                    }
                }
            }
        };

        match result {
            Err(e) if total == 0 => Err(e),
            _ => {
                if total > 0 {
                    self.notify();
                }
                trace::debug!(total, "fd fill finished");
                Ok(total)
            }
        }
    }
}

impl<M: WaitMode> Reader<M> {
    /// The segment size this buffer was built with.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// How many segment blocks have been freshly allocated so far.
    #[must_use]
    pub fn blocks_allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    #[inline]
    fn head(&self) -> &Segment {
        // SAFETY: consumer role; the segment list is never empty.
        unsafe { self.shared.segs.front() }
    }

    /// Whether the head segment's `end` field is the one the producer is
    /// still appending through.
    #[inline]
    fn check_one_block_left(&self) -> bool {
        ptr::eq(
            ptr::from_ref(&self.head().end),
            self.shared.wpos.load(Ordering::Acquire),
        )
    }

    #[inline]
    fn published_wpos(&self) -> &AtomicUsize {
        // SAFETY: wpos always points at the end field of a live segment;
        // the tail is never popped, and the pointer was release-published.
        unsafe { &*self.shared.wpos.load(Ordering::Acquire) }
    }

    /// Moves the drained head into the preserved list and re-evaluates the
    /// hysteresis flag. Callers guarantee more than one segment exists.
    fn pop_block(&self) {
        // SAFETY: consumer role; more than one segment exists, so the tail
        // (and the published cursor target) survives this pop.
        let seg = unsafe { self.shared.segs.pop() };
        let len = seg.end.load(Ordering::Relaxed);
        self.preserved.borrow_mut().push_back(Preserved { seg, len });
        self.rpos.set(0);
        self.one_block_left.set(self.check_one_block_left());
        trace::trace!(len, "head segment drained");
    }

    /// Ensures `len` readable bytes sit contiguously at the read cursor,
    /// popping a drained head and waiting per the mode as needed.
    fn pop_block_if_needed(&self, len: usize) {
        assert!(
            len <= self.shared.block_size,
            "read larger than the block size"
        );
        if M::BLOCKING {
            if self.one_block_left.get() {
                self.shared.mode.wait(|| {
                    !(self.check_one_block_left()
                        && self.head().end.load(Ordering::Acquire) - self.rpos.get() < len)
                });
                if self.head().end.load(Ordering::Acquire) - self.rpos.get() < len {
                    // The wait proved there is more than one segment.
                    self.pop_block();
                    if self.one_block_left.get() {
                        // rpos is 0 after the pop.
                        self.shared
                            .mode
                            .wait(|| self.head().end.load(Ordering::Acquire) >= len);
                    }
                }
            } else if self.head().end.load(Ordering::Relaxed) - self.rpos.get() < len {
                self.pop_block();
                if self.one_block_left.get() {
                    self.shared
                        .mode
                        .wait(|| self.head().end.load(Ordering::Acquire) >= len);
                }
            }
        } else {
            // Non-blocking modes cannot wait for the producer. Outrunning
            // it is a caller error, caught below instead of racing the
            // unpublished bytes.
            if self.one_block_left.get() {
                if !self.check_one_block_left()
                    && self.head().end.load(Ordering::Relaxed) - self.rpos.get() < len
                {
                    self.pop_block();
                }
            } else if self.head().end.load(Ordering::Relaxed) - self.rpos.get() < len {
                self.pop_block();
            }
            let end = if self.one_block_left.get() {
                self.head().end.load(Ordering::Acquire)
            } else {
                self.head().end.load(Ordering::Relaxed)
            };
            assert!(
                end - self.rpos.get() >= len,
                "read past published data; check availability before reading in a non-blocking mode"
            );
        }
    }

    /// Reads a value written by [`Writer::put`], advancing the read cursor.
    /// Blocks per the wait mode until the bytes are published.
    ///
    /// The consumed bytes stay preserved until released; use
    /// [`get`](Self::get) for the self-releasing variant.
    ///
    /// # Panics
    ///
    /// Panics if `size_of::<T>()` exceeds the block size, or - in
    /// non-blocking modes - if the data has not been published yet.
    #[must_use]
    pub fn read<T: Plain>(&self) -> T {
        self.pop_block_if_needed(mem::size_of::<T>());
        // SAFETY: pop_block_if_needed established size_of::<T>() published
        // bytes at rpos; Plain accepts any bit pattern; read_unaligned
        // tolerates arbitrary stream offsets.
        let value = unsafe {
            self.head()
                .base()
                .add(self.rpos.get())
                .cast::<T>()
                .read_unaligned()
        };
        self.rpos.set(self.rpos.get() + mem::size_of::<T>());
        value
    }

    /// Zero-copy read: returns `len` contiguous bytes, advancing the read
    /// cursor. Blocks per the wait mode until the bytes are published.
    ///
    /// The slice borrows the reader shared, so several reads can be held at
    /// once; it stays valid until [`clear_preserved`](Self::clear_preserved)
    /// (which requires `&mut self`, ending all such borrows) releases the
    /// containing segment.
    ///
    /// # Panics
    ///
    /// As in [`read`](Self::read).
    #[must_use]
    pub fn read_cont(&self, len: usize) -> &[u8] {
        self.pop_block_if_needed(len);
        let start = self.rpos.get();
        self.rpos.set(start + len);
        // SAFETY: the bytes are published, the block never moves, and the
        // only operation that frees it takes `&mut self`.
        unsafe { slice::from_raw_parts(self.head().base().add(start).cast_const(), len) }
    }

    /// Reads a value and releases its bytes.
    #[must_use]
    pub fn get<T: Plain>(&mut self) -> T {
        let value = self.read::<T>();
        self.clear_preserved(mem::size_of::<T>());
        value
    }

    /// Copies `dst.len()` bytes out of the stream and releases them.
    pub fn get_cont(&mut self, dst: &mut [u8]) {
        let len = dst.len();
        self.pop_block_if_needed(len);
        let start = self.rpos.get();
        // SAFETY: as in read_cont; dst is caller memory, disjoint from the
        // segment.
        unsafe {
            ptr::copy_nonoverlapping(
                self.head().base().add(start).cast_const(),
                dst.as_mut_ptr(),
                len,
            );
        }
        self.rpos.set(start + len);
        self.clear_preserved(len);
    }

    /// Reads a length-prefixed byte string written by
    /// [`Writer::write_bytes`] and releases it.
    #[must_use]
    pub fn get_bytes(&mut self) -> Vec<u8> {
        let len = self.read::<usize>();
        let bytes = self.read_cont(len).to_vec();
        self.clear_preserved(mem::size_of::<usize>() + len);
        bytes
    }

    /// Reads a length-prefixed string written by [`Writer::write_str`] and
    /// releases it.
    ///
    /// # Panics
    ///
    /// Panics if the bytes are not valid UTF-8 - reading data as a string
    /// that was not written as one is a caller error.
    #[must_use]
    pub fn get_string(&mut self) -> String {
        String::from_utf8(self.get_bytes()).expect("string data was not written with write_str")
    }

    /// Whether the buffer has no published unread bytes.
    ///
    /// Consumer-side and opportunistic: condvar modes do not take the mutex
    /// here, so the answer can be stale by one publication. Also refreshes
    /// the hysteresis flag.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        if !self.one_block_left.get() {
            return false;
        }
        let one_left = self.check_one_block_left();
        self.one_block_left.set(one_left);
        one_left && self.rpos.get() == self.published_wpos().load(Ordering::Acquire)
    }

    /// Releases preserved segments whose sealed lengths fit within `len`
    /// cumulative bytes, returning their blocks to the producer's freelist.
    ///
    /// Slices previously returned by [`read_cont`](Self::read_cont) cannot
    /// outlive this call - it takes `&mut self` - which is exactly the
    /// stability contract.
    pub fn clear_preserved(&mut self, len: usize) {
        let mut cleared = 0usize;
        let mut preserved = self.preserved.borrow_mut();
        loop {
            let fits = match preserved.front() {
                Some(p) => cleared + p.len <= len,
                None => false,
            };
            if !fits {
                break;
            }
            if let Some(p) = preserved.pop_front() {
                cleared += p.len;
                // The reader is the free queue's producer.
                // SAFETY: consumer role on the buffer, producer role on
                // `free`.
                unsafe {
                    self.shared.free.push(p.seg.data);
                }
            }
        }
    }

    /// Pops the head if it is fully drained and more segments exist.
    fn pop_block_if_drained(&self) {
        if self.one_block_left.get() {
            if !self.check_one_block_left()
                && self.head().end.load(Ordering::Relaxed) == self.rpos.get()
            {
                self.pop_block();
            }
        } else if self.head().end.load(Ordering::Relaxed) == self.rpos.get() {
            self.pop_block();
        }
    }

    /// Loop-writes published bytes to `fd`, popping drained heads, until
    /// the buffer has nothing published or the fd stops accepting. Releases
    /// everything that was written. Never suspends.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if *no* bytes were transferred in this call and
    /// the underlying write failed; after a partial transfer the error is
    /// swallowed and the count returned.
    pub fn drain_to_fd<Fd: AsFd>(&mut self, fd: Fd) -> Result<usize, Errno> {
        let mut total = 0usize;
        let result = loop {
            self.pop_block_if_drained();
            let end = if self.one_block_left.get() {
                self.head().end.load(Ordering::Acquire)
            } else {
                self.head().end.load(Ordering::Relaxed)
            };
            let start = self.rpos.get();
            // SAFETY: published bytes of the head segment; the producer
            // writes only at or past the published end.
            let buf = unsafe {
                slice::from_raw_parts(self.head().base().add(start).cast_const(), end - start)
            };
            match rustix::io::write(fd.as_fd(), buf) {
                Err(e) => break Err(e),
                Ok(0) => break Ok(()),
                Ok(n) => {
                    self.rpos.set(start + n);
                    total += n;
                }
            }
        };

        match result {
            Err(e) if total == 0 => Err(e),
            _ => {
                self.clear_preserved(total);
                trace::debug!(total, "fd drain finished");
                Ok(total)
            }
        }
    }
}

impl Reader<EventFd> {
    /// The eventfd the producer notifies through. Poll it, drain its
    /// counter, then consume; each notification adds 1.
    #[must_use]
    pub fn eventfd(&self) -> BorrowedFd<'_> {
        self.shared.mode.fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{Spin, WaitFree};

    #[test]
    fn raw_write_then_get_cont() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(16).unwrap();

        tx.write(b"hello", true);
        tx.write(b"world", true);

        let mut buf = [0u8; 10];
        rx.get_cont(&mut buf);
        assert_eq!(&buf, b"helloworld");
        assert!(rx.is_empty());
    }

    #[test]
    fn typed_values_cross_segment_boundaries() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(8).unwrap();

        tx.put(0x1122_3344u32, true);
        tx.put(0xAABB_CCDDu32, true);
        tx.put(0x5566_7788u32, true);

        assert_eq!(rx.get::<u32>(), 0x1122_3344);
        assert_eq!(rx.get::<u32>(), 0xAABB_CCDD);
        // The third value sits in a second segment; reading it pops the
        // first.
        assert_eq!(rx.get::<u32>(), 0x5566_7788);
        assert!(rx.is_empty());
    }

    #[test]
    fn strings_round_trip() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(64).unwrap();

        tx.write_str("abc", true);
        tx.write_str("defgh", true);

        assert_eq!(rx.get_string(), "abc");
        assert_eq!(rx.get_string(), "defgh");
    }

    #[test]
    fn empty_byte_string_round_trips() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(32).unwrap();

        tx.write_bytes(b"", true);
        tx.write_bytes(b"x", true);

        assert_eq!(rx.get_bytes(), b"");
        assert_eq!(rx.get_bytes(), b"x");
    }

    #[test]
    fn write_cont_lands_contiguously() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(16).unwrap();

        tx.write(b"0123456789", true);
        // Only 6 bytes left in the tail; the contiguous write must seal it
        // and land in a fresh segment.
        tx.write_cont(b"ABCDEFGHIJ", true);

        let mut first = [0u8; 10];
        rx.get_cont(&mut first);
        assert_eq!(&first, b"0123456789");

        let chunk = rx.read_cont(10);
        assert_eq!(chunk, b"ABCDEFGHIJ");
        rx.clear_preserved(10);
    }

    #[test]
    fn ensure_cont_and_commit() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(32).unwrap();

        let dst = tx.ensure_cont(4);
        dst.copy_from_slice(b"spsc");
        tx.commit(4, true);

        let mut buf = [0u8; 4];
        rx.get_cont(&mut buf);
        assert_eq!(&buf, b"spsc");
    }

    #[test]
    fn slices_stay_valid_until_cleared() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(16).unwrap();

        tx.write_cont(b"aaaa", true);
        tx.write_cont(b"bbbb", true);

        // Hold two zero-copy reads simultaneously; both must stay intact
        // even after further pops happen under the hood.
        let a = rx.read_cont(4);
        let b = rx.read_cont(4);
        assert_eq!(a, b"aaaa");
        assert_eq!(b, b"bbbb");

        rx.clear_preserved(8);
    }

    #[test]
    fn segments_are_recycled() {
        let (mut tx, mut rx) = channel_with_block_size::<Spin>(16).unwrap();

        let mut buf = [0u8; 16];
        for round in 0..50u8 {
            for i in 0..4u8 {
                let chunk = [round.wrapping_add(i); 16];
                tx.write(&chunk, true);
            }
            for i in 0..4u8 {
                rx.get_cont(&mut buf);
                assert_eq!(buf, [round.wrapping_add(i); 16]);
            }
        }

        // Steady state: the freelist satisfies all growth after the first
        // few rounds.
        assert!(
            rx.blocks_allocated() <= 8,
            "allocated {} blocks across 50 rounds",
            rx.blocks_allocated()
        );
    }

    #[test]
    fn empty_transitions() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(32).unwrap();

        assert!(rx.is_empty());
        tx.put(7u64, true);
        assert!(!rx.is_empty());
        assert_eq!(rx.get::<u64>(), 7);
        assert!(rx.is_empty());
    }

    #[test]
    fn deferred_notify_publishes_once() {
        let (mut tx, mut rx) = channel_with_block_size::<WaitFree>(64).unwrap();

        tx.put(1u32, false);
        tx.put(2u32, false);
        // Nothing published yet.
        assert!(rx.is_empty());

        tx.notify();
        assert!(!rx.is_empty());
        assert_eq!(rx.get::<u32>(), 1);
        assert_eq!(rx.get::<u32>(), 2);
    }

    #[test]
    #[should_panic(expected = "read past published data")]
    fn wait_free_read_past_published_panics() {
        let (mut tx, rx) = channel_with_block_size::<WaitFree>(32).unwrap();
        tx.put(1u8, false); // written but not published
        let _ = rx.read::<u8>();
    }

    #[test]
    #[should_panic(expected = "larger than the block size")]
    fn oversized_read_panics() {
        let (_tx, rx) = channel_with_block_size::<WaitFree>(8).unwrap();
        let _ = rx.read_cont(9);
    }
}
