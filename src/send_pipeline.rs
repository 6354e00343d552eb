//! Double-buffered send pipeline with a single-writer discipline.
//!
//! Callers append into the `main` buffer under the pipeline lock and wake the
//! session's writer. The writer swaps `main` with its exclusively-owned
//! `flush` buffer and performs at most one socket write at a time, so the
//! append path never waits on the kernel and memory stays bounded by the two
//! buffers' high-water marks. The `flush` buffer and its offset live in the
//! writer task; the lock guards `main` and the byte counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::buffer::ByteBuffer;

#[derive(Debug)]
struct PipelineState {
    main: ByteBuffer,
    bytes_pending: u64,
    bytes_sending: u64,
}

/// Shared half of the per-session send machinery.
#[derive(Debug)]
pub(crate) struct SendPipeline {
    state: Mutex<PipelineState>,
    sending: AtomicBool,
    open: AtomicBool,
    writer_wake: Notify,
    drained: Notify,
}

impl SendPipeline {
    pub(crate) fn new(initial_capacity: usize) -> Self {
        Self {
            state: Mutex::new(PipelineState {
                main: ByteBuffer::with_capacity(initial_capacity),
                bytes_pending: 0,
                bytes_sending: 0,
            }),
            sending: AtomicBool::new(false),
            open: AtomicBool::new(true),
            writer_wake: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Queue bytes for transmission. Returns false once the pipeline closed.
    pub(crate) fn append(&self, data: &[u8]) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut st = self.state.lock().expect("send lock poisoned");
            st.main.append(data);
            st.bytes_pending = st.main.len() as u64;
        }
        self.writer_wake.notify_one();
        true
    }

    /// Writer side: exchange the drained `flush` buffer for the accumulated
    /// `main` buffer. Returns false when nothing is queued.
    pub(crate) fn swap_into(&self, flush: &mut ByteBuffer) -> bool {
        let mut st = self.state.lock().expect("send lock poisoned");
        if st.main.is_empty() {
            return false;
        }
        std::mem::swap(&mut st.main, flush);
        st.bytes_sending = flush.len() as u64;
        st.bytes_pending = 0;
        true
    }

    /// Writer side: a socket write is being submitted.
    pub(crate) fn begin_send(&self) {
        debug_assert!(!self.sending.load(Ordering::Relaxed));
        self.sending.store(true, Ordering::Release);
    }

    /// Writer side: a socket write completed with `n` bytes accepted.
    /// Returns the bytes still queued or in flight afterwards.
    pub(crate) fn complete_send(&self, n: u64) -> u64 {
        let still = {
            let mut st = self.state.lock().expect("send lock poisoned");
            st.bytes_sending = st.bytes_sending.saturating_sub(n);
            st.bytes_pending + st.bytes_sending
        };
        self.sending.store(false, Ordering::Release);
        if still == 0 {
            self.drained.notify_waiters();
        }
        still
    }

    /// Writer side: the submitted write never completed.
    pub(crate) fn abort_send(&self) {
        self.sending.store(false, Ordering::Release);
    }

    /// Refuse further appends, drop queued bytes and release every waiter.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
        {
            let mut st = self.state.lock().expect("send lock poisoned");
            st.main.clear();
            st.bytes_pending = 0;
            st.bytes_sending = 0;
        }
        self.sending.store(false, Ordering::Release);
        self.writer_wake.notify_one();
        self.drained.notify_waiters();
    }

    pub(crate) fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub(crate) fn bytes_pending(&self) -> u64 {
        self.state.lock().expect("send lock poisoned").bytes_pending
    }

    pub(crate) fn bytes_sending(&self) -> u64 {
        self.state.lock().expect("send lock poisoned").bytes_sending
    }

    /// Bytes queued plus bytes handed to an in-flight write.
    pub(crate) fn total_queued(&self) -> u64 {
        let st = self.state.lock().expect("send lock poisoned");
        st.bytes_pending + st.bytes_sending
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.total_queued() == 0
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.bytes_pending() > 0
    }

    /// Future resolving on the next writer wakeup.
    pub(crate) fn writer_notified(&self) -> Notified<'_> {
        self.writer_wake.notified()
    }

    /// Future resolving the next time the pipeline drains (or closes).
    pub(crate) fn drained_notified(&self) -> Notified<'_> {
        self.drained.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_swap_complete_accounting() {
        let pipeline = SendPipeline::new(64);
        assert!(pipeline.append(b"hello"));
        assert!(pipeline.append(b" world"));
        assert_eq!(pipeline.bytes_pending(), 11);
        assert_eq!(pipeline.bytes_sending(), 0);

        let mut flush = ByteBuffer::new();
        assert!(pipeline.swap_into(&mut flush));
        assert_eq!(flush.as_slice(), b"hello world");
        assert_eq!(pipeline.bytes_pending(), 0);
        assert_eq!(pipeline.bytes_sending(), 11);

        // Partial completion, with a concurrent append in between.
        pipeline.begin_send();
        assert!(pipeline.is_sending());
        assert_eq!(pipeline.complete_send(5), 6);
        assert!(!pipeline.is_sending());
        assert!(pipeline.append(b"!!"));
        assert_eq!(pipeline.complete_send(6), 2);
        assert_eq!(pipeline.total_queued(), 2);

        let mut flush2 = ByteBuffer::new();
        assert!(pipeline.swap_into(&mut flush2));
        assert_eq!(flush2.as_slice(), b"!!");
        assert_eq!(pipeline.complete_send(2), 0);
        assert!(pipeline.is_idle());
    }

    #[test]
    fn test_byte_conservation() {
        // bytes_sent + bytes_sending + bytes_pending == total appended.
        let pipeline = SendPipeline::new(0);
        let mut appended = 0u64;
        let mut sent = 0u64;
        let mut flush = ByteBuffer::new();

        for chunk in [17usize, 1, 300, 42] {
            pipeline.append(&vec![0xCD; chunk]);
            appended += chunk as u64;

            if pipeline.swap_into(&mut flush) {
                let half = flush.len() as u64 / 2;
                pipeline.begin_send();
                pipeline.complete_send(half);
                sent += half;
                assert_eq!(sent + pipeline.total_queued(), appended);

                let rest = flush.len() as u64 - half;
                pipeline.begin_send();
                pipeline.complete_send(rest);
                sent += rest;
                flush.clear();
            }
            assert_eq!(sent + pipeline.total_queued(), appended);
        }
        assert!(pipeline.is_idle());
        assert_eq!(sent, appended);
    }

    #[test]
    fn test_swap_on_empty_returns_false() {
        let pipeline = SendPipeline::new(0);
        let mut flush = ByteBuffer::new();
        assert!(!pipeline.swap_into(&mut flush));
    }

    #[test]
    fn test_close_refuses_appends_and_clears() {
        let pipeline = SendPipeline::new(0);
        assert!(pipeline.append(b"abc"));
        pipeline.close();
        assert!(!pipeline.append(b"def"));
        assert!(pipeline.is_idle());
    }

    #[tokio::test]
    async fn test_drained_signal_wakes_waiter() {
        use std::sync::Arc;
        let pipeline = Arc::new(SendPipeline::new(0));
        pipeline.append(b"data");
        let mut flush = ByteBuffer::new();
        pipeline.swap_into(&mut flush);

        let waiter = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                loop {
                    let drained = pipeline.drained_notified();
                    if pipeline.is_idle() {
                        return;
                    }
                    drained.await;
                }
            })
        };

        pipeline.begin_send();
        pipeline.complete_send(4);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("drain waiter timed out")
            .unwrap();
    }
}
