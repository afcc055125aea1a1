// Priority-aware admission queue for LLM calls.
//
// Two FIFO lanes: chat-priority tokens may run while
// inflight < max_concurrency + chat_priority_extra_slots; default tokens run
// only when the chat lane is empty and inflight < max_concurrency. Releases
// wake every waiter so the new queue heads re-check admission.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct QueueState {
    chat: VecDeque<u64>,
    default: VecDeque<u64>,
    inflight: usize,
    next_token: u64,
}

struct QueueInner {
    max_concurrency: usize,
    chat_priority_extra_slots: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Clone)]
pub struct BrainQueue {
    inner: Arc<QueueInner>,
}

/// RAII admission permit; dropping it releases the slot and wakes waiters.
pub struct QueuePermit {
    inner: Arc<QueueInner>,
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.inflight = state.inflight.saturating_sub(1);
        }
        self.inner.notify.notify_waiters();
    }
}

impl BrainQueue {
    pub fn new(max_concurrency: usize, chat_priority_extra_slots: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_concurrency: max_concurrency.max(1),
                chat_priority_extra_slots,
                state: Mutex::new(QueueState {
                    chat: VecDeque::new(),
                    default: VecDeque::new(),
                    inflight: 0,
                    next_token: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn can_acquire(inner: &QueueInner, state: &QueueState, token: u64, is_chat: bool) -> bool {
        if is_chat {
            if state.chat.front() != Some(&token) {
                return false;
            }
            return state.inflight < inner.max_concurrency + inner.chat_priority_extra_slots;
        }
        if !state.chat.is_empty() {
            return false;
        }
        if state.default.front() != Some(&token) {
            return false;
        }
        state.inflight < inner.max_concurrency
    }

    pub async fn acquire(&self, prioritize_chat: bool) -> QueuePermit {
        let token = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.next_token += 1;
            let token = state.next_token;
            if prioritize_chat {
                state.chat.push_back(token);
            } else {
                state.default.push_back(token);
            }
            token
        };

        loop {
            // Register for wakeups before checking state so a release between
            // the check and the await is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if Self::can_acquire(&self.inner, &state, token, prioritize_chat) {
                    if prioritize_chat {
                        state.chat.pop_front();
                    } else {
                        state.default.pop_front();
                    }
                    state.inflight += 1;
                    drop(state);
                    // The next head may be admissible in the same wave.
                    self.inner.notify.notify_waiters();
                    return QueuePermit {
                        inner: self.inner.clone(),
                    };
                }
            }

            notified.await;
        }
    }

    #[cfg(test)]
    pub fn inflight(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .inflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn chat_uses_extra_slot_while_default_waits() {
        let queue = BrainQueue::new(1, 1);

        // default_A is already running.
        let permit_a = queue.acquire(false).await;
        assert_eq!(queue.inflight(), 1);

        // chat_B is admitted through the extra slot.
        let permit_b = tokio::time::timeout(Duration::from_secs(1), queue.acquire(true))
            .await
            .expect("chat token must be admitted via extra slot");
        assert_eq!(queue.inflight(), 2);

        // default_C stays parked: inflight >= max_concurrency.
        let queue_c = queue.clone();
        let c_running = Arc::new(AtomicUsize::new(0));
        let c_flag = c_running.clone();
        let c_task = tokio::spawn(async move {
            let permit = queue_c.acquire(false).await;
            c_flag.store(1, Ordering::SeqCst);
            permit
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c_running.load(Ordering::SeqCst), 0);

        // Chat finishing is not enough for C (still 1 inflight = max).
        drop(permit_b);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c_running.load(Ordering::SeqCst), 0);

        // default_A finishing admits C.
        drop(permit_a);
        let permit_c = tokio::time::timeout(Duration::from_secs(1), c_task)
            .await
            .expect("default token must run after release")
            .unwrap();
        assert_eq!(c_running.load(Ordering::SeqCst), 1);
        drop(permit_c);
    }

    #[tokio::test]
    async fn queued_chat_blocks_new_default_tokens() {
        // max_concurrency=1, no extra slots: a waiting chat token must win the
        // next free slot even if a default token queued first after it.
        let queue = BrainQueue::new(1, 0);
        let running = queue.acquire(false).await;

        let order = Arc::new(Mutex::new(Vec::new()));

        let queue_chat = queue.clone();
        let order_chat = order.clone();
        let chat = tokio::spawn(async move {
            let permit = queue_chat.acquire(true).await;
            order_chat.lock().unwrap().push("chat");
            permit
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let queue_default = queue.clone();
        let order_default = order.clone();
        let default = tokio::spawn(async move {
            let permit = queue_default.acquire(false).await;
            order_default.lock().unwrap().push("default");
            permit
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        drop(running);
        let chat_permit = tokio::time::timeout(Duration::from_secs(1), chat)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(order.lock().unwrap().as_slice(), &["chat"]);

        drop(chat_permit);
        let default_permit = tokio::time::timeout(Duration::from_secs(1), default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), &["chat", "default"]);
        drop(default_permit);
    }

    #[tokio::test]
    async fn fifo_within_one_lane() {
        let queue = BrainQueue::new(1, 0);
        let running = queue.acquire(false).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let permit = queue.acquire(false).await;
                order.lock().unwrap().push(i);
                drop(permit);
            }));
            // Give each waiter time to join the lane in submission order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(running);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2]);
    }
}
