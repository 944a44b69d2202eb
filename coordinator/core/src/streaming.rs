//! Streaming Multiplexer
//!
//! One bounded frame queue per streaming task. Producers are the per-node
//! protocol readers (via the task driver); the single consumer is the HTTP
//! server-sent stream handler draining frames in arrival order.
//!
//! Ordering: frames within one subtask keep the order the worker sent them;
//! interleaving across subtasks is arbitrary, so consumers that care must
//! demultiplex by subtask index. The capacity bound applies to payload
//! chunks; marker frames are never counted and never dropped. On overflow
//! the oldest chunk of the slowest subtask (the one with the most queued
//! chunks) is replaced by a `Dropped` marker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ReasonCode;
use crate::tasks::TaskId;

/// One frame on a task's stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFrame {
    /// A fragment of generated text.
    Chunk {
        /// Subtask the fragment belongs to.
        subtask: u32,
        /// Worker-assigned sequence number, monotonic per attempt.
        seq: u64,
        /// The text fragment.
        text: String,
    },
    /// No more frames will arrive for this subtask.
    SubtaskDone {
        /// The finished subtask.
        subtask: u32,
    },
    /// Chunks were discarded for this subtask because the consumer fell
    /// behind.
    Dropped {
        /// Subtask whose chunks were discarded.
        subtask: u32,
    },
    /// The subtask was handed to another worker; earlier chunks belong to a
    /// superseded attempt and sequence numbers restart.
    AttemptRestart {
        /// Subtask being retried.
        subtask: u32,
        /// Attempt number now producing.
        attempt: u32,
    },
    /// The task ended in failure. Final frame.
    Error {
        /// Machine-readable failure reason.
        reason: ReasonCode,
    },
    /// The task was cancelled or the consumer went away. Final frame.
    Aborted,
}

impl StreamFrame {
    /// Whether this frame may never be dropped by the overflow policy.
    #[must_use]
    pub fn is_marker(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }
}

struct StreamInner {
    queue: VecDeque<StreamFrame>,
    chunk_count: usize,
    closed: bool,
}

/// Bounded frame queue for one streaming task.
///
/// Single producer side (the task driver), single consumer (the stream
/// subscription). Closing is sticky: pushes after close are discarded.
pub struct TaskStream {
    task_id: TaskId,
    capacity: usize,
    inner: Mutex<StreamInner>,
    notify: Notify,
    created_at: Instant,
}

impl TaskStream {
    fn new(task_id: TaskId, capacity: usize) -> Self {
        Self {
            task_id,
            capacity: capacity.max(1),
            inner: Mutex::new(StreamInner {
                queue: VecDeque::new(),
                chunk_count: 0,
                closed: false,
            }),
            notify: Notify::new(),
            created_at: Instant::now(),
        }
    }

    /// Task this stream belongs to.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Enqueue a frame, applying the overflow policy to chunks.
    pub fn push(&self, frame: StreamFrame) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        if let StreamFrame::Chunk { .. } = frame {
            if inner.chunk_count >= self.capacity {
                self.drop_from_slowest(&mut inner);
            }
            inner.chunk_count += 1;
        }

        inner.queue.push_back(frame);
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueue a final marker and close in one step. No-op when already
    /// closed, which makes double-cancel safe.
    pub fn close_with(&self, frame: StreamFrame) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.queue.push_back(frame);
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    /// Close without a marker (every subtask already has its terminal frame).
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    /// Whether the stream has been closed. Queued frames may still be
    /// drained after close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Age of the stream, for stale cleanup.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Wait for the next frame. Returns `None` once the stream is closed and
    /// drained.
    pub async fn next(&self) -> Option<StreamFrame> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.queue.pop_front() {
                    if let StreamFrame::Chunk { .. } = frame {
                        inner.chunk_count -= 1;
                    }
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Replace the oldest chunk of the subtask with the most queued chunks
    /// by a `Dropped` marker (unless one is already there).
    fn drop_from_slowest(&self, inner: &mut StreamInner) {
        let mut per_subtask: HashMap<u32, usize> = HashMap::new();
        for frame in &inner.queue {
            if let StreamFrame::Chunk { subtask, .. } = frame {
                *per_subtask.entry(*subtask).or_default() += 1;
            }
        }

        // Deterministic victim: most chunks, lowest index on ties.
        let Some(victim) = per_subtask
            .into_iter()
            .max_by(|(sa, ca), (sb, cb)| ca.cmp(cb).then(sb.cmp(sa)))
            .map(|(subtask, _)| subtask)
        else {
            return;
        };

        let Some(pos) = inner
            .queue
            .iter()
            .position(|f| matches!(f, StreamFrame::Chunk { subtask, .. } if *subtask == victim))
        else {
            return;
        };

        let already_marked = pos > 0
            && matches!(
                inner.queue.get(pos - 1),
                Some(StreamFrame::Dropped { subtask }) if *subtask == victim
            );

        if already_marked {
            inner.queue.remove(pos);
        } else {
            inner.queue[pos] = StreamFrame::Dropped { subtask: victim };
        }
        inner.chunk_count -= 1;
    }
}

/// Consumer handle for one task's stream.
///
/// Dropping the subscription counts as the consumer going away: the stream
/// is closed with an `Aborted` marker so producers stop buffering.
pub struct StreamSubscription {
    stream: Arc<TaskStream>,
}

impl StreamSubscription {
    /// Wait for the next frame; `None` once the stream is closed and drained.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        self.stream.next().await
    }

    /// Task this subscription is attached to.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        self.stream.task_id()
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.stream.close_with(StreamFrame::Aborted);
    }
}

/// Owner of every live stream, keyed by task id.
#[derive(Clone)]
pub struct StreamManager {
    streams: Arc<RwLock<HashMap<TaskId, Arc<TaskStream>>>>,
    capacity: usize,
}

impl StreamManager {
    /// Create a manager whose streams buffer at most `capacity` chunks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Open (or return the existing) stream for a task.
    pub fn open(&self, task_id: &TaskId) -> Arc<TaskStream> {
        let mut streams = self.streams.write();
        streams
            .entry(task_id.clone())
            .or_insert_with(|| Arc::new(TaskStream::new(task_id.clone(), self.capacity)))
            .clone()
    }

    /// Look up the stream for a task.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<Arc<TaskStream>> {
        self.streams.read().get(task_id).cloned()
    }

    /// Attach the single consumer to a task's stream.
    #[must_use]
    pub fn subscribe(&self, task_id: &TaskId) -> Option<StreamSubscription> {
        self.get(task_id)
            .map(|stream| StreamSubscription { stream })
    }

    /// Drop a task's stream entirely.
    pub fn remove(&self, task_id: &TaskId) -> Option<Arc<TaskStream>> {
        self.streams.write().remove(task_id)
    }

    /// Number of streams currently held.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Remove streams that are closed or older than `ttl`. Returns how many
    /// were removed.
    pub fn cleanup(&self, ttl: std::time::Duration) -> usize {
        let mut streams = self.streams.write();
        let before = streams.len();
        streams.retain(|_, s| !s.is_closed() && s.age() < ttl);
        before - streams.len()
    }

    /// Close and drop everything. Used at shutdown.
    pub fn clear(&self) {
        let mut streams = self.streams.write();
        for stream in streams.values() {
            stream.close_with(StreamFrame::Aborted);
        }
        streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(subtask: u32, seq: u64) -> StreamFrame {
        StreamFrame::Chunk {
            subtask,
            seq,
            text: format!("s{subtask}c{seq}"),
        }
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let manager = StreamManager::new(256);
        let id = TaskId::new("t1");
        let stream = manager.open(&id);

        stream.push(chunk(0, 0));
        stream.push(chunk(0, 1));
        stream.push(StreamFrame::SubtaskDone { subtask: 0 });
        stream.close();

        let mut sub = manager.subscribe(&id).unwrap();
        assert_eq!(sub.next().await, Some(chunk(0, 0)));
        assert_eq!(sub.next().await, Some(chunk(0, 1)));
        assert_eq!(
            sub.next().await,
            Some(StreamFrame::SubtaskDone { subtask: 0 })
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let manager = StreamManager::new(256);
        let id = TaskId::new("t1");
        let a = manager.open(&id);
        let b = manager.open(&id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_blocks_until_frame() {
        let manager = StreamManager::new(256);
        let id = TaskId::new("t1");
        let stream = manager.open(&id);

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.next().await })
        };

        tokio::task::yield_now().await;
        stream.push(chunk(0, 0));

        let frame = waiter.await.unwrap();
        assert_eq!(frame, Some(chunk(0, 0)));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_of_slowest() {
        let manager = StreamManager::new(4);
        let id = TaskId::new("t1");
        let stream = manager.open(&id);

        // Subtask 0 floods the queue; subtask 1 contributes one chunk.
        stream.push(chunk(0, 0));
        stream.push(chunk(0, 1));
        stream.push(chunk(0, 2));
        stream.push(chunk(1, 0));
        stream.push(chunk(0, 3)); // over capacity, subtask 0 is slowest
        stream.close();

        let mut frames = Vec::new();
        while let Some(f) = stream.next().await {
            frames.push(f);
        }

        // Oldest chunk of subtask 0 replaced by a marker.
        assert_eq!(frames[0], StreamFrame::Dropped { subtask: 0 });
        assert!(frames.contains(&chunk(1, 0)));
        assert!(frames.contains(&chunk(0, 3)));
        assert!(!frames.contains(&chunk(0, 0)));
    }

    #[tokio::test]
    async fn test_overflow_never_drops_markers() {
        let manager = StreamManager::new(2);
        let id = TaskId::new("t1");
        let stream = manager.open(&id);

        stream.push(StreamFrame::SubtaskDone { subtask: 7 });
        for seq in 0..10 {
            stream.push(chunk(0, seq));
        }
        stream.close();

        let mut frames = Vec::new();
        while let Some(f) = stream.next().await {
            frames.push(f);
        }

        assert!(frames.contains(&StreamFrame::SubtaskDone { subtask: 7 }));
        let chunks = frames
            .iter()
            .filter(|f| matches!(f, StreamFrame::Chunk { .. }))
            .count();
        assert!(chunks <= 2);
        // Consecutive drops coalesce into one marker.
        assert!(frames.contains(&StreamFrame::Dropped { subtask: 0 }));
    }

    #[tokio::test]
    async fn test_close_with_enqueues_final_marker_once() {
        let manager = StreamManager::new(256);
        let id = TaskId::new("t1");
        let stream = manager.open(&id);

        stream.close_with(StreamFrame::Error {
            reason: ReasonCode::NoNodes,
        });
        // Second close is a no-op.
        stream.close_with(StreamFrame::Aborted);

        let mut sub = manager.subscribe(&id).unwrap();
        assert_eq!(
            sub.next().await,
            Some(StreamFrame::Error {
                reason: ReasonCode::NoNodes
            })
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_push_after_close_is_discarded() {
        let manager = StreamManager::new(256);
        let id = TaskId::new("t1");
        let stream = manager.open(&id);

        stream.close();
        stream.push(chunk(0, 0));

        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_dropping_subscription_aborts_stream() {
        let manager = StreamManager::new(256);
        let id = TaskId::new("t1");
        let stream = manager.open(&id);

        let sub = manager.subscribe(&id).unwrap();
        drop(sub);

        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_cleanup_removes_closed_streams() {
        let manager = StreamManager::new(256);
        let a = TaskId::new("a");
        let b = TaskId::new("b");
        manager.open(&a).close();
        manager.open(&b);

        let removed = manager.cleanup(std::time::Duration::from_secs(600));
        assert_eq!(removed, 1);
        assert!(manager.get(&a).is_none());
        assert!(manager.get(&b).is_some());
    }
}
