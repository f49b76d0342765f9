use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::rollout::Prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// `chunk_size` prompts collected.
    Full,
    /// `submit_delay` ran out with a partial chunk.
    Deadline,
    /// The prompt supply closed with a partial chunk.
    Closed,
}

#[derive(Debug)]
pub struct Chunk {
    pub prompts: Vec<Prompt>,
    pub reason: FlushReason,
}

impl Chunk {
    pub fn is_partial(&self) -> bool {
        self.reason != FlushReason::Full
    }
}

/// Prompt supply shared by every lane of every actor.
#[derive(Debug, Clone)]
pub struct PromptFeed {
    rx: Arc<Mutex<mpsc::Receiver<Prompt>>>,
}

impl PromptFeed {
    pub fn new(rx: mpsc::Receiver<Prompt>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Collect the next chunk.
    ///
    /// Waits as long as needed for the first prompt, then at most
    /// `submit_delay` for the rest. One lane collects at a time so each chunk
    /// is a contiguous run of the feed. Returns `None` once the feed is closed
    /// and empty.
    pub async fn next_chunk(&self, chunk_size: usize, submit_delay: Duration) -> Option<Chunk> {
        let chunk_size = chunk_size.max(1);
        let mut rx = self.rx.lock().await;

        let first = rx.recv().await?;
        let mut prompts = Vec::with_capacity(chunk_size);
        prompts.push(first);
        let deadline = Instant::now() + submit_delay;

        while prompts.len() < chunk_size {
            // Drain what is already buffered before looking at the clock.
            match rx.try_recv() {
                Ok(prompt) => {
                    prompts.push(prompt);
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Some(Chunk {
                        prompts,
                        reason: FlushReason::Closed,
                    });
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(prompt)) => prompts.push(prompt),
                Ok(None) => {
                    return Some(Chunk {
                        prompts,
                        reason: FlushReason::Closed,
                    });
                }
                Err(_) => {
                    return Some(Chunk {
                        prompts,
                        reason: FlushReason::Deadline,
                    });
                }
            }
        }

        Some(Chunk {
            prompts,
            reason: FlushReason::Full,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(i: usize) -> Prompt {
        Prompt {
            id: format!("p{i}"),
            dataset: "train".to_string(),
            tokens: vec![i as u32],
            answer: None,
        }
    }

    async fn fill(tx: &mpsc::Sender<Prompt>, range: std::ops::Range<usize>) {
        for i in range {
            tx.send(prompt(i)).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_hundred_prompts_make_full_chunks() {
        let (tx, rx) = mpsc::channel(256);
        let feed = PromptFeed::new(rx);
        fill(&tx, 0..200).await;

        // Sixteen lanes pulling concurrently.
        let mut lanes = Vec::new();
        for _ in 0..16 {
            let feed = feed.clone();
            lanes.push(tokio::spawn(async move {
                let mut chunks = Vec::new();
                while let Some(chunk) = feed.next_chunk(8, Duration::from_secs(1)).await {
                    chunks.push((chunk.prompts.len(), chunk.reason));
                }
                chunks
            }));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(tx);

        let mut full = 0;
        let mut partial = 0;
        let mut total = 0;
        for lane in lanes {
            for (len, reason) in lane.await.unwrap() {
                total += len;
                if reason == FlushReason::Full {
                    assert_eq!(len, 8);
                    full += 1;
                } else {
                    partial += 1;
                }
            }
        }
        assert_eq!(total, 200);
        assert!(full >= 24, "expected at least 24 full chunks, got {full}");
        assert!(partial <= 1);
        assert_eq!(full, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_chunk_flushed_after_submit_delay() {
        let (tx, rx) = mpsc::channel(256);
        let feed = PromptFeed::new(rx);
        fill(&tx, 0..11).await;

        let first = feed.next_chunk(8, Duration::from_millis(500)).await.unwrap();
        assert_eq!(first.reason, FlushReason::Full);

        let started = Instant::now();
        let second = feed.next_chunk(8, Duration::from_millis(500)).await.unwrap();
        assert_eq!(second.reason, FlushReason::Deadline);
        assert_eq!(second.prompts.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(500));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_prompt_joins_chunk_before_deadline() {
        let (tx, rx) = mpsc::channel(16);
        let feed = PromptFeed::new(rx);
        fill(&tx, 0..1).await;

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(prompt(1)).await.unwrap();
            tx
        });
        let chunk = feed.next_chunk(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(chunk.reason, FlushReason::Full);
        assert_eq!(chunk.prompts[1].id, "p1");
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_feed() {
        let (tx, rx) = mpsc::channel(4);
        let feed = PromptFeed::new(rx);
        fill(&tx, 0..3).await;
        drop(tx);

        let chunk = feed.next_chunk(8, Duration::from_secs(60)).await.unwrap();
        assert_eq!(chunk.reason, FlushReason::Closed);
        assert_eq!(chunk.prompts.len(), 3);
        assert!(chunk.is_partial());
        assert!(feed.next_chunk(8, Duration::from_secs(60)).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_delay_flushes_what_is_buffered() {
        let (tx, rx) = mpsc::channel(4);
        let feed = PromptFeed::new(rx);
        fill(&tx, 0..2).await;

        let chunk = feed.next_chunk(8, Duration::ZERO).await.unwrap();
        assert_eq!(chunk.prompts.len(), 2);
        assert_eq!(chunk.reason, FlushReason::Deadline);
    }
}
