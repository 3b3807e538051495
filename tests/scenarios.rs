//! Cross-recipe scenarios exercising several processes against one store.
//!
//! Each test stands up multiple connectors (one per simulated process)
//! over a shared in-memory store and drives a whole coordination protocol
//! end to end.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use trellis::BarrierConfig;
use trellis::Connector;
use trellis::CountedBarrier;
use trellis::CountedBarrierConfig;
use trellis::CounterConfig;
use trellis::DistributedBarrier;
use trellis::DistributedCounter;
use trellis::DistributedPriorityQueue;
use trellis::DoubleBarrier;
use trellis::ElectionConfig;
use trellis::LeaderSelector;
use trellis::LeadershipListener;
use trellis::MemoryStore;

struct TallyListener {
    taken: Arc<AtomicUsize>,
    relinquished: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LeadershipListener for TallyListener {
    async fn take_leadership(&self, leader_token: &str) {
        self.taken.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(leader_token.to_string());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn relinquish_leadership(&self) {
        self.relinquished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_selectors_each_complete_one_leadership_cycle() {
    let store = MemoryStore::new();
    let taken = Arc::new(AtomicUsize::new(0));
    let relinquished = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let mut selectors = Vec::new();
    for i in 0..10 {
        let client = Connector::new(store.clone(), format!("proc-{i}")).unwrap();
        let listener = Arc::new(TallyListener {
            taken: taken.clone(),
            relinquished: relinquished.clone(),
            tokens: tokens.clone(),
        });
        let selector = Arc::new(
            LeaderSelector::new(client, "/election/T", listener, ElectionConfig {
                lease_ttl: Duration::from_millis(300),
            })
            .unwrap(),
        );
        selector.start().await.unwrap();
        selectors.push(selector);
    }

    for selector in &selectors {
        assert!(
            selector.wait_on_leadership_complete(Some(Duration::from_secs(30))).await.unwrap(),
            "every contender must finish a full cycle"
        );
    }

    assert_eq!(taken.load(Ordering::SeqCst), 10);
    assert_eq!(relinquished.load(Ordering::SeqCst), 10);

    let tokens = tokens.lock().unwrap();
    let distinct: HashSet<_> = tokens.iter().collect();
    assert_eq!(distinct.len(), 10, "leadership tokens must be pairwise distinct");

    for selector in &selectors {
        selector.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thirty_counters_converge_to_zero() {
    let store = MemoryStore::new();
    let config = CounterConfig {
        retry_step: Duration::from_millis(5),
        ..Default::default()
    };

    let mut workers = Vec::new();
    for i in 0..30 {
        let client = Connector::new(store.clone(), format!("proc-{i}")).unwrap();
        let config = config.clone();
        workers.push(tokio::spawn(async move {
            let counter = DistributedCounter::new(client, "/counter2", config).await.unwrap();
            for _ in 0..25 {
                counter.increment().await.unwrap();
                counter.decrement().await.unwrap();
                counter.add(5).await.unwrap();
                counter.subtract(5).await.unwrap();
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let client = Connector::new(store, "observer").unwrap();
    let counter = DistributedCounter::new(client, "/counter2", config).await.unwrap();
    assert_eq!(counter.get().await.unwrap(), 0);
}

#[tokio::test]
async fn priority_queue_orders_by_priority_then_fifo() {
    let client = Connector::new(MemoryStore::new(), "proc-1").unwrap();
    let queue = DistributedPriorityQueue::new(client, "/pqueue").unwrap();

    queue.enqueue(b"A", 10).await.unwrap();
    queue.enqueue(b"B", 1).await.unwrap();
    queue.enqueue(b"C", 5).await.unwrap();

    assert_eq!(queue.dequeue().await.unwrap(), b"B".to_vec());
    assert_eq!(queue.dequeue().await.unwrap(), b"C".to_vec());
    assert_eq!(queue.dequeue().await.unwrap(), b"A".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counted_barrier_with_missing_member_times_out_everywhere() {
    let store = MemoryStore::new();
    let ttl = Duration::from_millis(200);

    let mut waiters = Vec::new();
    for i in 0..4 {
        let client = Connector::new(store.clone(), format!("proc-{i}")).unwrap();
        waiters.push(tokio::spawn(async move {
            let barrier = CountedBarrier::new(client.clone(), "/short-cohort", 5, CountedBarrierConfig {
                lease_ttl: ttl,
            })
            .unwrap();
            let released = barrier.wait_on_barrier(Some(Duration::from_secs(2))).await;
            (client, released)
        }));
    }

    let mut clients = Vec::new();
    for waiter in waiters {
        let (client, released) = waiter.await.unwrap();
        assert!(!released.unwrap(), "the fifth member never arrived");
        clients.push(client);
    }

    // Waiter keys were deleted promptly on timeout (and would in any case
    // expire within TTL once the waiters' keep-alives stopped).
    let observer = Connector::new(store, "observer").unwrap();
    let barrier = CountedBarrier::new(observer, "/short-cohort", 5, CountedBarrierConfig { lease_ttl: ttl }).unwrap();
    let mut empty = false;
    for _ in 0..30 {
        if barrier.waiter_count().await.unwrap() == 0 {
            empty = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(empty, "waiting/ keys must disappear within TTL after the waiters close");

    for client in clients {
        client.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_barrier_synchronizes_entry_and_exit_of_five() {
    let store = MemoryStore::new();
    let entered = Arc::new(AtomicUsize::new(0));
    let left = Arc::new(AtomicUsize::new(0));

    let mut members = Vec::new();
    for i in 0..5 {
        let client = Connector::new(store.clone(), format!("member-{i}")).unwrap();
        let entered = entered.clone();
        let left = left.clone();
        members.push(tokio::spawn(async move {
            let barrier = DoubleBarrier::new(client, "/phase", 5, CountedBarrierConfig {
                lease_ttl: Duration::from_millis(300),
            })
            .unwrap();

            assert!(barrier.enter(Some(Duration::from_secs(10))).await.unwrap());
            entered.fetch_add(1, Ordering::SeqCst);

            assert!(barrier.leave(Some(Duration::from_secs(10))).await.unwrap());
            left.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for member in members {
        member.await.unwrap();
    }

    assert_eq!(entered.load(Ordering::SeqCst), 5);
    assert_eq!(left.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barrier_waiter_released_when_holder_is_killed() {
    let store = MemoryStore::new();
    let ttl = Duration::from_millis(250);

    let holder = Connector::new(store.clone(), "p1").unwrap();
    let waiter_client = Connector::new(store, "p2").unwrap();

    let set_by = DistributedBarrier::new(holder.clone(), "/gate", BarrierConfig {
        lease_ttl: ttl,
        ..Default::default()
    })
    .unwrap();
    assert!(set_by.set_barrier().await.unwrap());

    let waiter = DistributedBarrier::new(waiter_client, "/gate", BarrierConfig {
        lease_ttl: ttl,
        ..Default::default()
    })
    .unwrap();
    let waiting = tokio::spawn(async move { waiter.wait_on_barrier(Some(ttl * 4)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Kill P1: its keep-alive stops without any explicit removal.
    set_by.close().await;

    // The waiter must release within 2x TTL of the keep-alive stopping.
    let released = tokio::time::timeout(ttl * 2 + Duration::from_millis(100), waiting)
        .await
        .expect("waiter must release within 2x TTL")
        .unwrap()
        .unwrap();
    assert!(released);
}
