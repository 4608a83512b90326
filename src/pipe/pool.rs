//! Idle pipe pool
//!
//! A bounded FIFO of idle pipes. Pipes age from front to back, so
//! eviction only ever inspects the front. A background task evicts
//! expired pipes and refills the pool up to a low-water mark, amortizing
//! TLS handshake latency across inbound connections.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{Pipe, PipeError};

/// Factory producing fresh pipes, typically by dialing the remote over
/// TLS. Invoked with the pool lock released.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    async fn dial(&self) -> Result<Pipe<Self::Stream>, PipeError>;
}

/// Bounded FIFO of idle pipes with age-based eviction.
pub struct Pool<D: Dialer> {
    pipes: Mutex<VecDeque<Pipe<D::Stream>>>,
    dialer: D,
    max_size: usize,
    max_age: Duration,
    low_water_mark: usize,
    gc_interval: Duration,
}

impl<D: Dialer> Pool<D> {
    /// Create a pool and start its maintenance task. The task stops once
    /// the pool is dropped.
    pub fn new(max_size: usize, max_age: Duration, dialer: D) -> Arc<Self> {
        let pool = Arc::new(Self {
            pipes: Mutex::new(VecDeque::new()),
            dialer,
            max_size,
            max_age,
            low_water_mark: 8.max(max_size / 2),
            gc_interval: max_age / 4,
        });

        let weak = Arc::downgrade(&pool);
        let interval = pool.gc_interval;
        tokio::spawn(async move {
            loop {
                match weak.upgrade() {
                    Some(pool) => pool.gc().await,
                    None => return,
                }
                tokio::time::sleep(interval).await;
            }
        });

        pool
    }

    pub fn len(&self) -> usize {
        self.pipes.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the oldest idle pipe, evicting any expired ones in front of
    /// it. Dials a fresh pipe when the pool is empty.
    pub async fn get(&self) -> Result<Pipe<D::Stream>, PipeError> {
        let (pipe, expired) = {
            let mut pipes = self.pipes.lock().expect("pool lock poisoned");
            let expired = cleanup(&mut pipes, self.max_age);
            (pipes.pop_front(), expired)
        };
        for pipe in expired {
            pipe.close().await;
        }
        match pipe {
            Some(pipe) => Ok(pipe),
            None => self.dialer.dial().await,
        }
    }

    /// Return an idle pipe, evicting from the front while the pool is at
    /// capacity.
    pub async fn put(&self, mut pipe: Pipe<D::Stream>) {
        let evicted = {
            let mut pipes = self.pipes.lock().expect("pool lock poisoned");
            let mut evicted = Vec::new();
            while pipes.len() >= self.max_size {
                if let Some(old) = pipes.pop_front() {
                    evicted.push(old);
                }
            }
            pipe.touch();
            pipes.push_back(pipe);
            evicted
        };
        for pipe in evicted {
            pipe.close().await;
        }
    }

    async fn gc(self: Arc<Self>) {
        let (expired, need) = {
            let mut pipes = self.pipes.lock().expect("pool lock poisoned");
            let expired = cleanup(&mut pipes, self.max_age);
            let need = self.low_water_mark.saturating_sub(pipes.len());
            (expired, need)
        };
        let removed = expired.len();
        for pipe in expired {
            pipe.close().await;
        }
        for _ in 0..need {
            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                match pool.dialer.dial().await {
                    Ok(pipe) => pool.put(pipe).await,
                    Err(e) => debug!("pool refill dial failed: {}", e),
                }
            });
        }
        info!("pool gc: evicted {}, refilling {}", removed, need);
    }
}

/// Pop expired pipes off the front, stopping at the first one still
/// young enough. FIFO order makes ages monotonic front to back.
fn cleanup<S: AsyncRead + AsyncWrite>(pipes: &mut VecDeque<Pipe<S>>, max_age: Duration) -> Vec<Pipe<S>> {
    let mut expired = Vec::new();
    while let Some(front) = pipes.front() {
        if front.idle_for() < max_age {
            break;
        }
        if let Some(pipe) = pipes.pop_front() {
            expired.push(pipe);
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, DuplexStream};

    struct LoopDialer {
        dials: AtomicUsize,
    }

    impl LoopDialer {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Dialer for LoopDialer {
        type Stream = DuplexStream;

        async fn dial(&self) -> Result<Pipe<DuplexStream>, PipeError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, far) = duplex(1024);
            std::mem::forget(far);
            Ok(Pipe::new(near, Duration::from_secs(60)))
        }
    }

    /// Pool with no maintenance task, for deterministic tests.
    fn bare_pool(max_size: usize, max_age: Duration) -> Pool<LoopDialer> {
        Pool {
            pipes: Mutex::new(VecDeque::new()),
            dialer: LoopDialer::new(),
            max_size,
            max_age,
            low_water_mark: 8.max(max_size / 2),
            gc_interval: max_age / 4,
        }
    }

    fn idle_pipe() -> Pipe<DuplexStream> {
        let (near, far) = duplex(64);
        std::mem::forget(far);
        Pipe::new(near, Duration::from_secs(60))
    }

    fn backdate<S>(pipe: &mut Pipe<S>, age: Duration) {
        if let Some(at) = pipe.last_active.checked_sub(age) {
            pipe.last_active = at;
        }
    }

    #[tokio::test]
    async fn put_enforces_capacity_in_fifo_order() {
        let pool = bare_pool(3, Duration::from_secs(3600));

        let mut ids = Vec::new();
        for _ in 0..5 {
            let pipe = idle_pipe();
            ids.push(pipe.id());
            pool.put(pipe).await;
        }
        assert_eq!(pool.len(), 3);

        // the two oldest entries were evicted; the rest come out in order
        for expected in &ids[2..] {
            let pipe = pool.get().await.unwrap();
            assert_eq!(pipe.id(), *expected);
        }
    }

    #[tokio::test]
    async fn cleanup_stops_at_first_young_pipe() {
        let mut pipes = VecDeque::new();
        let mut old_a = idle_pipe();
        backdate(&mut old_a, Duration::from_millis(500));
        let mut old_b = idle_pipe();
        backdate(&mut old_b, Duration::from_millis(400));
        pipes.push_back(old_a);
        pipes.push_back(old_b);
        pipes.push_back(idle_pipe());

        let expired = cleanup(&mut pipes, Duration::from_millis(100));
        assert_eq!(expired.len(), 2);
        assert_eq!(pipes.len(), 1);
        assert!(pipes[0].idle_for() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn get_dials_when_empty() {
        let pool = bare_pool(4, Duration::from_secs(3600));
        let _pipe = pool.get().await.unwrap();
        assert_eq!(pool.dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_evicts_expired_front_pipes() {
        let pool = bare_pool(4, Duration::from_millis(100));
        pool.put(idle_pipe()).await;
        {
            let mut pipes = pool.pipes.lock().unwrap();
            for pipe in pipes.iter_mut() {
                backdate(pipe, Duration::from_millis(500));
            }
        }

        let _pipe = pool.get().await.unwrap();
        // the stale entry was discarded and a fresh pipe dialed
        assert_eq!(pool.dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn gc_warms_pool_to_capacity() {
        let pool = Pool::new(4, Duration::from_millis(400), LoopDialer::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        // low-water mark is 8, capacity caps retention at 4
        assert!(pool.len() <= 4);
        assert!(!pool.is_empty());
        assert!(pool.dialer.dials.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn gc_evicts_and_refills_idle_pipes() {
        let pool = Pool::new(4, Duration::from_millis(100), LoopDialer::new());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let warmed = pool.dialer.dials.load(Ordering::SeqCst);
        assert!(warmed >= 4);

        // everything in the pool expires and gets replaced
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(pool.dialer.dials.load(Ordering::SeqCst) > warmed);
        assert!(pool.len() <= 4);
    }
}
