//! TCP port allocation for job containers.
//!
//! The allocator hands out distinct ports from a fixed window, one per
//! claim, in strictly increasing order. There is no reuse tracking and no
//! wraparound: once the window is exhausted, further claims block forever.
//! That limitation is inherited from the original design and is preserved
//! here rather than silently papered over.

use tokio::sync::{mpsc, Mutex};

/// Hands out claimable TCP ports from a fixed window.
pub struct PortAllocator {
    rx: Mutex<mpsc::Receiver<u16>>,
}

impl PortAllocator {
    /// Spawn the producer task for the window `start..end` and return the
    /// allocator handle.
    pub fn start(start: u16, end: u16) -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for port in start..end {
                if tx.send(port).await.is_err() {
                    return;
                }
            }
        });
        Self { rx: Mutex::new(rx) }
    }

    /// Claim the next port, blocking until one is produced.
    ///
    /// Concurrent claimers each receive a distinct value. After the window
    /// is exhausted this never completes.
    pub async fn claim(&self) -> u16 {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(port) => port,
            // Window exhausted. Block forever instead of wrapping around.
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_claims_are_strictly_increasing() {
        let allocator = PortAllocator::start(55000, 55010);
        let mut last = None;
        for _ in 0..10 {
            let port = allocator.claim().await;
            if let Some(prev) = last {
                assert!(port > prev);
            }
            last = Some(port);
        }
        assert_eq!(last, Some(55009));
    }

    #[tokio::test]
    async fn test_first_claim_returns_lower_bound() {
        let allocator = PortAllocator::start(55000, 65535);
        assert_eq!(allocator.claim().await, 55000);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_distinct() {
        let allocator = Arc::new(PortAllocator::start(55000, 55032));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move { allocator.claim().await }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 32);
    }

    #[tokio::test]
    async fn test_exhaustion_blocks_forever() {
        let allocator = PortAllocator::start(55000, 55002);
        assert_eq!(allocator.claim().await, 55000);
        assert_eq!(allocator.claim().await, 55001);

        // Exhaustion is observable as permanent blocking, not an error.
        let blocked = timeout(Duration::from_millis(100), allocator.claim()).await;
        assert!(blocked.is_err());
    }
}
