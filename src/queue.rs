use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::model::Priority;

/// 多生产者多消费者的优先级队列
///
/// 四个档位各自保持FIFO，高档位永远先于低档位出队。
/// 生产者永不阻塞；消费者可以等待 signal() 被唤醒。
pub struct PriorityQueue<T> {
    inner: Arc<Mutex<[VecDeque<T>; Priority::COUNT]>>,
    notify: Arc<Notify>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        PriorityQueue {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        PriorityQueue {
            inner: Arc::new(Mutex::new([
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ])),
            notify: Arc::new(Notify::new()),
        }
    }

    /// 以普通优先级入队
    pub fn append(&self, item: T) {
        self.append_priority(item, Priority::Normal);
    }

    /// 以指定优先级入队
    pub fn append_priority(&self, item: T, priority: Priority) {
        let was_empty = {
            let mut bands = self.inner.lock().unwrap();
            let empty = bands.iter().all(|b| b.is_empty());
            bands[priority as usize].push_back(item);
            empty
        };
        // 只在空转非空时唤醒一个等待者
        if was_empty {
            self.notify.notify_one();
        }
    }

    /// 非阻塞出队，高档位优先
    pub fn next(&self) -> Option<T> {
        let mut bands = self.inner.lock().unwrap();
        for p in (0..Priority::COUNT).rev() {
            if let Some(item) = bands[p].pop_front() {
                return Some(item);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        let bands = self.inner.lock().unwrap();
        bands.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 等待队列从空变为非空
    pub async fn signal(&self) {
        self.notify.notified().await;
    }

    /// 取走当前积压的全部元素并逐个处理
    pub fn process<F: FnMut(T)>(&self, mut each: F) {
        loop {
            let drained: Vec<T> = {
                let mut bands = self.inner.lock().unwrap();
                let mut out = Vec::new();
                for p in (0..Priority::COUNT).rev() {
                    out.extend(bands[p].drain(..));
                }
                out
            };
            if drained.is_empty() {
                break;
            }
            for item in drained {
                each(item);
            }
        }
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;

    #[test]
    fn bands_drain_high_first() {
        let q = PriorityQueue::new();
        q.append_priority(1, Priority::Low);
        q.append_priority(2, Priority::Critical);
        q.append_priority(3, Priority::High);
        q.append_priority(4, Priority::Normal);

        assert_eq!(q.next(), Some(2));
        assert_eq!(q.next(), Some(3));
        assert_eq!(q.next(), Some(4));
        assert_eq!(q.next(), Some(1));
        assert_eq!(q.next(), None);
    }

    #[test]
    fn fifo_within_band() {
        let q = PriorityQueue::new();
        for i in 0..10 {
            q.append(i);
        }
        for i in 0..10 {
            assert_eq!(q.next(), Some(i));
        }
    }

    #[test]
    fn process_drains_everything() {
        let q = PriorityQueue::new();
        for i in 0..100 {
            q.append_priority(i, Priority::High);
        }
        let mut seen = Vec::new();
        q.process(|v| seen.push(v));
        assert_eq!(seen.len(), 100);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn signal_wakes_consumer() {
        let q: PriorityQueue<u32> = PriorityQueue::new();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.signal().await;
            q2.next()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.append(7);
        let got = waiter.await.unwrap();
        assert_eq!(got, Some(7));
    }
}
