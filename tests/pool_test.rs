use async_trait::async_trait;
use sock_pool::{Connection, Error, Factory, Pool, PoolConfig};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Tracker {
    pub closed: AtomicUsize,
    pub expired: AtomicBool,
}

#[derive(Debug)]
pub struct MockConnection {
    pub n: usize,
    pub connected: bool,
    pub tracker: Arc<Tracker>,
}

#[async_trait]
impl Connection for MockConnection {
    type Raw = usize;
    type Error = io::Error;

    async fn open(&mut self) -> Result<(), Self::Error> {
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.tracker.closed.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }

    fn get(&self) -> Option<&usize> {
        self.connected.then_some(&self.n)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_expired(&self) -> bool {
        self.tracker.expired.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    pub created: AtomicUsize,
    pub fail_create: AtomicBool,
    pub trackers: Mutex<Vec<Arc<Tracker>>>,
}

impl Stats {
    fn tracker(&self, n: usize) -> Arc<Tracker> {
        self.trackers.lock().unwrap()[n].clone()
    }
}

#[derive(Debug, Default)]
pub struct MockFactory {
    pub stats: Arc<Stats>,
}

impl Factory for MockFactory {
    type Connection = MockConnection;
    type Options = ();

    fn create(&self, _options: &()) -> Result<MockConnection, io::Error> {
        if self.stats.fail_create.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let n = self.stats.created.fetch_add(1, Ordering::SeqCst);
        let tracker = Arc::new(Tracker::default());
        self.stats.trackers.lock().unwrap().push(tracker.clone());
        Ok(MockConnection {
            n,
            connected: false,
            tracker,
        })
    }
}

fn config() -> PoolConfig {
    PoolConfig::new().reap_expired_connections(false)
}

async fn pool_with(config: PoolConfig) -> (Pool<MockFactory>, Arc<Stats>) {
    let factory = MockFactory::default();
    let stats = factory.stats.clone();
    let pool = Pool::new(factory, (), config).await.unwrap();
    (pool, stats)
}

#[derive(Debug)]
enum TestError {
    Pool(Error<io::Error>),
    Boom,
}

impl From<Error<io::Error>> for TestError {
    fn from(e: Error<io::Error>) -> Self {
        TestError::Pool(e)
    }
}

fn explode() -> Result<(), TestError> {
    panic!("boom")
}

#[tokio::test]
async fn test_debug() {
    let (p, _) = pool_with(config().max_connections(3)).await;
    let s = format!("{:?}", p);
    assert!(s.contains("max_connections: 3"));
}

#[tokio::test]
async fn test_create_initial_connections() {
    let (p, stats) = pool_with(config().initial_connections(10)).await;
    assert_eq!(stats.created.load(Ordering::SeqCst), 10);
    assert_eq!(p.size(), 10);
    assert_eq!(p.state().idle, 10);
    assert_eq!(p.state().in_use, 0);
}

#[tokio::test]
async fn test_initial_connections_over_max() {
    let r = Pool::new(
        MockFactory::default(),
        (),
        config().max_connections(2).initial_connections(3),
    )
    .await;
    assert!(matches!(r, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_start_connection_reaper() {
    let (p, _) = pool_with(
        PoolConfig::new()
            .reap_expired_connections(true)
            .reap_interval(Duration::from_secs(3)),
    )
    .await;
    let reaper = p.reaper().unwrap();
    assert_eq!(reaper.interval(), Duration::from_secs(3));
    assert!(!reaper.is_finished());

    let (p, _) = pool_with(config()).await;
    assert!(p.reaper().is_none());
}

#[tokio::test]
async fn test_acquire_and_release() {
    let (p, _) = pool_with(config()).await;
    assert_eq!(p.size(), 0);

    let conn1 = p.acquire(10).await.unwrap();
    assert_eq!(conn1.lock().await.n, 0);
    assert_eq!(p.size(), 1);
    assert!(!p.is_idle(&conn1));
    assert!(p.is_in_use(&conn1));

    let conn2 = p.acquire(10).await.unwrap();
    assert_eq!(conn2.lock().await.n, 1);
    assert_eq!(p.size(), 2);
    assert!(p.is_in_use(&conn2));

    p.release(&conn1).unwrap();
    assert!(p.is_idle(&conn1));
    assert!(!p.is_in_use(&conn1));

    // the idle one comes back instead of a new connection
    let conn1_2 = p.acquire(10).await.unwrap();
    assert_eq!(conn1_2, conn1);
    assert_eq!(p.size(), 2);
    assert!(!p.is_idle(&conn1_2));
    assert!(p.is_in_use(&conn1_2));

    p.release(&conn2).unwrap();
    assert!(p.is_idle(&conn2));
    p.release(&conn1_2).unwrap();
    assert!(p.is_idle(&conn1_2));
    assert_eq!(p.state().idle, 2);
    assert_eq!(p.state().in_use, 0);
}

#[tokio::test]
async fn test_acquired_connection_is_open() {
    let (p, _) = pool_with(config()).await;
    let conn = p.acquire(0).await.unwrap();
    let c = conn.lock().await;
    assert!(c.is_connected());
    assert_eq!(c.get(), Some(&0));
}

#[tokio::test]
async fn test_acquire_retry() {
    let (p, _) = pool_with(config().max_connections(1)).await;
    let conn1 = p.acquire(10).await.unwrap();

    let pool = p.clone();
    let freed = conn1.clone();
    tokio::spawn(async move {
        pool.release(&freed).unwrap();
    });
    let conn = p.acquire(1).await.unwrap();
    assert_eq!(conn, conn1);
}

#[tokio::test]
async fn test_acquire_disable_retry() {
    let (p, _) = pool_with(config().max_connections(1)).await;
    let conn1 = p.acquire(10).await.unwrap();

    let pool = p.clone();
    tokio::spawn(async move {
        pool.release(&conn1).unwrap();
    });
    let err = p.acquire(0).await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { retries: 0 }));
}

#[tokio::test]
async fn test_max_connections() {
    let (p, stats) = pool_with(config().max_connections(1).retry_backoff(Duration::from_millis(1))).await;
    let _conn = p.acquire(0).await.unwrap();
    let err = p.acquire(3).await.unwrap_err();
    assert!(err.is_exhausted());
    assert!(matches!(err, Error::PoolExhausted { retries: 3 }));
    assert_eq!(stats.created.load(Ordering::SeqCst), 1);
    assert_eq!(p.size(), 1);
}

#[tokio::test]
async fn test_waits_counted_during_backoff() {
    let (p, _) = pool_with(config().max_connections(1).retry_backoff(Duration::from_millis(20))).await;
    let conn = p.acquire(0).await.unwrap();

    let pool = p.clone();
    let waiter = tokio::spawn(async move { pool.acquire(50).await.map(|c| c.id()) });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(p.state().waits, 1);

    p.release(&conn).unwrap();
    let id = waiter.await.unwrap().unwrap();
    assert_eq!(id, conn.id());
    assert_eq!(p.state().waits, 0);
}

#[tokio::test]
async fn test_release_invalid_connection() {
    let (p, _) = pool_with(config()).await;
    let (other, _) = pool_with(config()).await;
    let foreign = other.acquire(0).await.unwrap();

    let err = p.release(&foreign).unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_release_already_released_connection() {
    let (p, _) = pool_with(config()).await;
    let conn1 = p.acquire(0).await.unwrap();

    p.release(&conn1).unwrap();
    let err = p.release(&conn1).unwrap_err();
    assert!(matches!(err, Error::ConnectionNotFound));
}

#[tokio::test]
async fn test_drop() {
    let (p, stats) = pool_with(config()).await;
    let conn1 = p.acquire(0).await.unwrap();
    p.release(&conn1).unwrap();
    assert!(p.is_idle(&conn1));

    p.drop(&conn1).await.unwrap();

    assert!(!p.is_idle(&conn1));
    assert_eq!(p.size(), 0);
    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 1);
    assert!(!conn1.lock().await.is_connected());
}

#[tokio::test]
async fn test_drop_closed_connection() {
    let (p, stats) = pool_with(config()).await;
    let conn1 = p.acquire(0).await.unwrap();
    conn1.lock().await.connected = false;
    p.release(&conn1).unwrap();
    assert!(p.is_idle(&conn1));

    p.drop(&conn1).await.unwrap();

    assert!(!p.is_idle(&conn1));
    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_drop_using_connection() {
    let (p, _) = pool_with(config()).await;
    let conn1 = p.acquire(0).await.unwrap();

    let err = p.drop(&conn1).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(p.is_in_use(&conn1));
}

#[tokio::test]
async fn test_drop_invalid_connection() {
    let (p, _) = pool_with(config()).await;
    let (other, _) = pool_with(config().initial_connections(1)).await;
    let foreign = other.acquire(0).await.unwrap();
    other.release(&foreign).unwrap();

    assert!(p.drop(&foreign).await.unwrap_err().is_not_found());
    assert!(other.is_idle(&foreign));
}

#[tokio::test]
async fn test_drop_expired_connections() {
    let (p, stats) = pool_with(config().initial_connections(3)).await;
    stats.tracker(0).expired.store(true, Ordering::SeqCst);
    stats.tracker(2).expired.store(true, Ordering::SeqCst);

    let dropped = p.drop_expired().await.unwrap();

    assert_eq!(dropped, 2);
    assert_eq!(p.size(), 1);
    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 1);
    assert_eq!(stats.tracker(1).closed.load(Ordering::SeqCst), 0);
    assert_eq!(stats.tracker(2).closed.load(Ordering::SeqCst), 1);
    let left = p.acquire(0).await.unwrap();
    assert_eq!(left.lock().await.n, 1);
}

#[tokio::test]
async fn test_drop_expired_skips_in_use() {
    let (p, stats) = pool_with(config()).await;
    let conn = p.acquire(0).await.unwrap();
    stats.tracker(0).expired.store(true, Ordering::SeqCst);

    assert_eq!(p.drop_expired().await.unwrap(), 0);
    assert!(p.is_in_use(&conn));
    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_create_leaves_no_entry() {
    let (p, stats) = pool_with(config().max_connections(1)).await;
    stats.fail_create.store(true, Ordering::SeqCst);

    let err = p.acquire(0).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(p.size(), 0);
    assert_eq!(p.state().connecting, 0);

    // the reserved slot was handed back
    stats.fail_create.store(false, Ordering::SeqCst);
    let conn = p.acquire(0).await.unwrap();
    assert!(p.is_in_use(&conn));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_holds_under_contention() {
    let max = 5;
    let (p, stats) = pool_with(
        config()
            .max_connections(max)
            .retry_backoff(Duration::from_millis(1)),
    )
    .await;
    let mut handles = vec![];
    for _ in 0..20 {
        let pool = p.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                let conn = pool.acquire(10_000).await.unwrap();
                let state = pool.state();
                assert!(state.size() + state.connecting <= max);
                tokio::task::yield_now().await;
                pool.release(&conn).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(stats.created.load(Ordering::SeqCst) <= max);
    assert!(p.size() <= max);
    assert_eq!(p.state().in_use, 0);
}

#[tokio::test]
async fn test_connection_guard() {
    let (p, _) = pool_with(config()).await;
    let id = {
        let conn = p.connection().await.unwrap();
        assert!(p.is_in_use(&conn));
        assert!(conn.lock().await.is_connected());
        conn.id()
    };
    assert_eq!(p.state().in_use, 0);
    let again = p.acquire(0).await.unwrap();
    assert_eq!(again.id(), id);
}

#[tokio::test]
async fn test_connection_guard_detach() {
    let (p, _) = pool_with(config()).await;
    let conn = p.connection().await.unwrap().detach();
    assert!(p.is_in_use(&conn));
    p.release(&conn).unwrap();
    assert!(p.is_idle(&conn));
}

#[tokio::test]
async fn test_with_connection_releases_on_error() {
    let (p, _) = pool_with(config()).await;
    let r: Result<(), TestError> = p
        .with_connection(|conn| {
            Box::pin(async move {
                assert!(conn.lock().await.is_connected());
                Err(TestError::Boom)
            })
        })
        .await;
    assert!(matches!(r, Err(TestError::Boom)));
    assert_eq!(p.state().in_use, 0);
    assert_eq!(p.state().idle, 1);
}

#[tokio::test]
async fn test_with_connection_returns_value() {
    let (p, _) = pool_with(config()).await;
    let n: Result<usize, TestError> = p
        .with_connection(|conn| Box::pin(async move { Ok(conn.lock().await.n) }))
        .await;
    assert_eq!(n.unwrap(), 0);
    assert_eq!(p.state().idle, 1);
}

#[tokio::test]
async fn test_with_connection_surfaces_exhaustion() {
    let (p, _) = pool_with(config().max_connections(1).acquire_retries(0)).await;
    let _held = p.acquire(0).await.unwrap();
    let r: Result<(), TestError> = p
        .with_connection(|_conn| Box::pin(async move { Ok(()) }))
        .await;
    assert!(matches!(r, Err(TestError::Pool(Error::PoolExhausted { .. }))));
}

#[tokio::test]
async fn test_with_connection_releases_on_panic() {
    let (p, _) = pool_with(config()).await;
    let pool = p.clone();
    let handle = tokio::spawn(async move {
        let _: Result<(), TestError> = pool
            .with_connection(|_conn| Box::pin(async move { explode() }))
            .await;
    });
    assert!(handle.await.is_err());
    assert_eq!(p.state().in_use, 0);
    assert_eq!(p.state().idle, 1);
}

#[tokio::test]
async fn test_close() {
    let (p, stats) = pool_with(config().initial_connections(2)).await;
    let in_use = p.acquire(0).await.unwrap();

    p.close().await;

    assert_eq!(p.size(), 0);
    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 1);
    assert_eq!(stats.tracker(1).closed.load(Ordering::SeqCst), 1);
    assert!(!in_use.lock().await.is_connected());
    assert!(matches!(p.acquire(0).await, Err(Error::PoolClosed)));
    assert!(p.release(&in_use).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_retry_backoff() {
    let (p, _) = pool_with(config()).await;
    assert_eq!(p.get_retry_backoff(), Duration::from_millis(100));
    p.set_retry_backoff(Duration::from_millis(5));
    assert_eq!(p.get_retry_backoff(), Duration::from_millis(5));
}

#[tokio::test]
async fn test_state_display() {
    let (p, _) = pool_with(config().max_connections(4).initial_connections(1)).await;
    let _conn = p.acquire(0).await.unwrap();
    let s = p.state().to_string();
    assert_eq!(
        s,
        "{ max_connections: 4, idle: 0, in_use: 1, connecting: 0, waits: 0 }"
    );
}

#[tokio::test]
async fn test_close_busy_connection_once_unlocked() {
    let (p, stats) = pool_with(config()).await;
    let guard = p.connection().await.unwrap();
    let held = guard.lock().await;

    p.close().await;
    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 0);

    drop(held);
    drop(guard);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 1);
    assert_eq!(p.size(), 0);
}

#[tokio::test]
async fn test_dropping_pool_closes_connections() {
    let (p, stats) = pool_with(config().initial_connections(2)).await;
    let in_use = p.acquire(0).await.unwrap();

    drop(p);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(stats.tracker(0).closed.load(Ordering::SeqCst), 1);
    assert_eq!(stats.tracker(1).closed.load(Ordering::SeqCst), 1);
    assert!(!in_use.lock().await.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_expired_alongside_traffic() {
    let max = 4;
    let (p, stats) = pool_with(
        config()
            .max_connections(max)
            .retry_backoff(Duration::from_millis(1)),
    )
    .await;
    let mut handles = vec![];
    for _ in 0..8 {
        let pool = p.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..200 {
                let conn = pool.acquire(10_000).await.unwrap();
                assert!(!pool.is_idle(&conn));
                assert!(pool.is_in_use(&conn));
                assert!(pool.size() <= max);
                tokio::task::yield_now().await;
                pool.release(&conn).unwrap();
            }
        }));
    }
    let sweeper = {
        let pool = p.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            for pass in 0..200 {
                let trackers: Vec<_> = stats.trackers.lock().unwrap().clone();
                for (n, tracker) in trackers.iter().enumerate() {
                    tracker.expired.store((n + pass) % 3 == 0, Ordering::SeqCst);
                }
                pool.drop_expired().await.unwrap();
                assert!(pool.size() <= max);
                tokio::task::yield_now().await;
            }
        })
    };
    for handle in handles {
        handle.await.unwrap();
    }
    sweeper.await.unwrap();

    let state = p.state();
    assert_eq!(state.in_use, 0);
    assert_eq!(state.connecting, 0);
    assert!(state.size() <= max);
}
