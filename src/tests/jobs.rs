//! End-to-end map/reduce scenarios.
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use super::test_config;
use super::Cluster;
use crate::error::Error;
use crate::mapreduce::kernel::wc;
use crate::mapreduce::kernel::Kernel;
use crate::mapreduce::task::JobPhase;
use crate::mapreduce::JobOptions;
use crate::node::Node;
use crate::Result;

fn lines(input: &[&str]) -> Vec<(Bytes, Bytes)> {
    input
        .iter()
        .enumerate()
        .map(|(i, line)| {
            (
                Bytes::from(i.to_string()),
                Bytes::copy_from_slice(line.as_bytes()),
            )
        })
        .collect()
}

fn count(n: u64) -> Bytes {
    Bytes::copy_from_slice(&n.to_be_bytes())
}

fn expected_word_count(input: &[&str]) -> HashMap<Bytes, Bytes> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for line in input {
        for word in line.split_whitespace() {
            *counts.entry(word.to_lowercase()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(w, c)| (Bytes::from(w), count(c)))
        .collect()
}

fn job_options() -> JobOptions {
    JobOptions {
        items_per_chunk: 2,
        task_timeout_ms: 1500,
        max_attempts: 5,
        memory_cap: None,
    }
}

const WORD_COUNT_INPUT: &[&str] = &[
    "hello world",
    "hello distributed computing",
    "world of mapreduce",
];

async fn run_word_count(cluster: &Arc<Cluster>, coordinator: &Arc<Node>) -> HashMap<Bytes, Bytes> {
    let _auto = cluster.clone().spawn_auto_stabilize();
    let job = coordinator
        .submit(lines(WORD_COUNT_INPUT), "wc", job_options())
        .unwrap();
    let results = coordinator.await_results(job).await.unwrap();

    let status = coordinator.status(job).unwrap();
    assert_eq!(status.phase, JobPhase::Done);
    assert_eq!(status.tasks_done, status.tasks_total);
    assert_eq!(status.tasks_failed, 0);

    results
}

#[tokio::test]
async fn test_word_count_single_node() {
    let cluster = Cluster::start(1, test_config()).await;
    let results = run_word_count(&cluster, &cluster.node(0)).await;
    assert_eq!(results, expected_word_count(WORD_COUNT_INPUT));
    assert_eq!(results.get(&Bytes::from("hello")), Some(&count(2)));
}

#[tokio::test]
async fn test_word_count_three_nodes_any_coordinator() {
    let cluster = Cluster::start(3, test_config()).await;
    let from_first = run_word_count(&cluster, &cluster.node(0)).await;
    let from_last = run_word_count(&cluster, &cluster.node(2)).await;

    let expected = expected_word_count(WORD_COUNT_INPUT);
    assert_eq!(from_first, expected);
    assert_eq!(from_last, expected);
}

#[tokio::test]
async fn test_job_cleanup_leaves_no_keys() {
    let cluster = Cluster::start(3, test_config()).await;
    let results = run_word_count(&cluster, &cluster.node(1)).await;
    assert!(!results.is_empty());

    // finalize purges the job's whole key space
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let leftovers = cluster.node(0).dht().keys("job/").await.unwrap();
    assert!(leftovers.is_empty(), "leftover keys: {leftovers:?}");
}

static FLAKY_REMAINING: AtomicI64 = AtomicI64::new(0);

fn flaky_map(key: &[u8], value: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
    if FLAKY_REMAINING.fetch_sub(1, Ordering::SeqCst) > 0 {
        return Err(Error::KernelFailed("injected map failure".to_string()));
    }
    wc::map(key, value)
}

#[tokio::test]
async fn test_failed_task_is_retried() {
    let cluster = Cluster::start(3, test_config()).await;
    for node in cluster.nodes() {
        node.kernels().register("flaky-wc", Kernel {
            map_fn: flaky_map,
            reduce_fn: wc::reduce,
        });
    }
    FLAKY_REMAINING.store(1, Ordering::SeqCst);

    let _auto = cluster.clone().spawn_auto_stabilize();
    let coordinator = cluster.node(0);
    let job = coordinator
        .submit(lines(WORD_COUNT_INPUT), "flaky-wc", job_options())
        .unwrap();
    let results = coordinator.await_results(job).await.unwrap();

    assert_eq!(results, expected_word_count(WORD_COUNT_INPUT));
}

static PARTIAL_CALLS: AtomicUsize = AtomicUsize::new(0);

fn partial_map(key: &[u8], value: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
    // the second pair of the first attempt dies after the first pair's
    // emissions were already written; the retry must overwrite, not add
    if PARTIAL_CALLS.fetch_add(1, Ordering::SeqCst) == 1 {
        return Err(Error::KernelFailed("injected mid-chunk failure".to_string()));
    }
    wc::map(key, value)
}

#[tokio::test]
async fn test_retry_does_not_double_count() {
    let cluster = Cluster::start(3, test_config()).await;
    for node in cluster.nodes() {
        node.kernels().register("partial-wc", Kernel {
            map_fn: partial_map,
            reduce_fn: wc::reduce,
        });
    }
    PARTIAL_CALLS.store(0, Ordering::SeqCst);

    let input = ["hello hello hello", "hello hello hello"];
    let _auto = cluster.clone().spawn_auto_stabilize();
    let coordinator = cluster.node(0);
    let job = coordinator
        .submit(lines(&input), "partial-wc", job_options())
        .unwrap();
    let results = coordinator.await_results(job).await.unwrap();

    assert_eq!(results.get(&Bytes::from("hello")), Some(&count(6)));
}

static MAPS_ACTIVE: AtomicI64 = AtomicI64::new(0);
static MAPS_DONE: AtomicUsize = AtomicUsize::new(0);
static EXPECTED_MAPS: AtomicUsize = AtomicUsize::new(0);
static BARRIER_VIOLATED: AtomicBool = AtomicBool::new(false);

fn barrier_map(key: &[u8], value: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
    MAPS_ACTIVE.fetch_add(1, Ordering::SeqCst);
    let out = wc::map(key, value);
    MAPS_ACTIVE.fetch_sub(1, Ordering::SeqCst);
    MAPS_DONE.fetch_add(1, Ordering::SeqCst);
    out
}

fn barrier_reduce(key: &[u8], values: Vec<Bytes>) -> Result<Bytes> {
    if MAPS_ACTIVE.load(Ordering::SeqCst) != 0
        || MAPS_DONE.load(Ordering::SeqCst) < EXPECTED_MAPS.load(Ordering::SeqCst)
    {
        BARRIER_VIOLATED.store(true, Ordering::SeqCst);
    }
    wc::reduce(key, values)
}

#[tokio::test]
async fn test_no_reduce_before_map_barrier() {
    let cluster = Cluster::start(3, test_config()).await;
    for node in cluster.nodes() {
        node.kernels().register("barrier-wc", Kernel {
            map_fn: barrier_map,
            reduce_fn: barrier_reduce,
        });
    }
    let input = [
        "one two three",
        "two three four",
        "three four five",
        "four five six",
    ];
    MAPS_ACTIVE.store(0, Ordering::SeqCst);
    MAPS_DONE.store(0, Ordering::SeqCst);
    BARRIER_VIOLATED.store(false, Ordering::SeqCst);
    EXPECTED_MAPS.store(input.len(), Ordering::SeqCst);

    let _auto = cluster.clone().spawn_auto_stabilize();
    let coordinator = cluster.node(0);
    let job = coordinator
        .submit(lines(&input), "barrier-wc", job_options())
        .unwrap();
    let results = coordinator.await_results(job).await.unwrap();

    assert!(!BARRIER_VIOLATED.load(Ordering::SeqCst));
    assert_eq!(results, expected_word_count(&input));
}

fn slow_map(key: &[u8], value: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
    std::thread::sleep(std::time::Duration::from_millis(150));
    wc::map(key, value)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_death_mid_map_reassigns() {
    let cluster = Cluster::start(3, test_config()).await;
    for node in cluster.nodes() {
        node.kernels().register("slow-wc", Kernel {
            map_fn: slow_map,
            reduce_fn: wc::reduce,
        });
    }

    let input = [
        "hello world",
        "hello distributed computing",
        "world of mapreduce",
        "hello again world",
        "of chunks and tasks",
        "mapreduce on a ring",
    ];
    let options = JobOptions {
        items_per_chunk: 1,
        task_timeout_ms: 600,
        max_attempts: 5,
        memory_cap: None,
    };

    let _auto = cluster.clone().spawn_auto_stabilize();
    let coordinator = cluster.node(0);
    let victim = cluster.node(2);
    let job = coordinator.submit(lines(&input), "slow-wc", options).unwrap();

    // let assignments land and some map tasks start, then crash a worker
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    cluster.kill(&victim);

    let results = coordinator.await_results(job).await.unwrap();
    assert_eq!(results, expected_word_count(&input));
}

#[tokio::test]
async fn test_join_during_job() {
    let config = test_config();
    let cluster = Cluster::start(2, config.clone()).await;
    let _auto = cluster.clone().spawn_auto_stabilize();

    let input: Vec<String> = (0..64)
        .map(|i| format!("item{} shared common", i % 8))
        .collect();
    let input_refs: Vec<&str> = input.iter().map(String::as_str).collect();
    let options = JobOptions {
        items_per_chunk: 1,
        task_timeout_ms: 1500,
        max_attempts: 5,
        memory_cap: None,
    };

    let coordinator = cluster.node(0);
    let job = coordinator
        .submit(lines(&input_refs), "wc", options)
        .unwrap();

    // a third node joins while the map phase is in flight
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cluster.add_node(config).await;

    let results = coordinator.await_results(job).await.unwrap();
    assert_eq!(results, expected_word_count(&input_refs));
    assert_eq!(results.get(&Bytes::from("common")), Some(&count(64)));
}

#[tokio::test]
async fn test_skewed_reduce_completes() {
    let cluster = Cluster::start(3, test_config()).await;
    let _auto = cluster.clone().spawn_auto_stabilize();

    // one key receives ~90% of all emissions
    let mut input: Vec<&str> = vec!["hot hot hot hot hot hot hot hot hot"; 10];
    input.push("cold colder");
    let coordinator = cluster.node(1);
    let job = coordinator
        .submit(lines(&input), "wc", job_options())
        .unwrap();
    let results = coordinator.await_results(job).await.unwrap();

    assert_eq!(results.get(&Bytes::from("hot")), Some(&count(90)));
    assert_eq!(results.get(&Bytes::from("cold")), Some(&count(1)));
    assert_eq!(results.get(&Bytes::from("colder")), Some(&count(1)));
}

#[tokio::test]
async fn test_memory_cap_fails_job() {
    let cluster = Cluster::start(2, test_config()).await;
    let _auto = cluster.clone().spawn_auto_stabilize();

    let options = JobOptions {
        memory_cap: Some(8),
        ..job_options()
    };
    let coordinator = cluster.node(0);
    let job = coordinator
        .submit(lines(WORD_COUNT_INPUT), "wc", options)
        .unwrap();

    let err = coordinator.await_results(job).await.unwrap_err();
    match err {
        Error::JobFailed(reason) => assert!(reason.contains("memory cap"), "{reason}"),
        other => panic!("expected JobFailed, got {other:?}"),
    }
    assert_eq!(
        coordinator.status(job).unwrap().phase,
        JobPhase::Failed
    );
}

#[tokio::test]
async fn test_unknown_kernel_is_rejected() {
    let cluster = Cluster::start(1, test_config()).await;
    let err = cluster
        .node(0)
        .submit(lines(WORD_COUNT_INPUT), "no-such-kernel", job_options())
        .unwrap_err();
    assert!(matches!(err, Error::UnknownKernel(_)));
}

#[tokio::test]
async fn test_empty_input_completes_empty() {
    let cluster = Cluster::start(2, test_config()).await;
    let _auto = cluster.clone().spawn_auto_stabilize();

    let coordinator = cluster.node(0);
    let job = coordinator.submit(vec![], "wc", job_options()).unwrap();
    let results = coordinator.await_results(job).await.unwrap();
    assert!(results.is_empty());
}
