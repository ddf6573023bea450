//! Integration tests for cluster scheduling and completion semantics

use async_trait::async_trait;
use serde_json::json;
use specter_pool::cluster::{Cluster, JobCallback, JobRunner};
use specter_pool::config::ClusterConfig;
use specter_pool::job::{Job, JobKind, JobOptions, JobResult, Resource};
use specter_pool::page::Page;
use specter_pool::skipstate::SkipStateSet;
use specter_pool::SpecterError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn cluster_config(job_timeout_ms: u64) -> ClusterConfig {
    init_tracing();
    ClusterConfig {
        pool_size: 2,
        job_timeout_ms,
        queue_buffer_size: 16,
        max_events_per_job: 50,
        spill_path: String::new(),
    }
}

fn explore_resource(path: &str) -> Resource {
    Resource::Url(Url::parse(&format!("https://target.test/{}", path)).unwrap())
}

/// Runs jobs without a browser: sleeps, then reports one page per job
struct MockRunner {
    name: &'static str,
    delay: Duration,
    executions: Arc<Mutex<Vec<(String, &'static str)>>>,
}

impl MockRunner {
    fn pair(
        delay: Duration,
    ) -> (Vec<Arc<dyn JobRunner>>, Arc<Mutex<Vec<(String, &'static str)>>>) {
        let executions = Arc::new(Mutex::new(Vec::new()));
        let runners: Vec<Arc<dyn JobRunner>> = vec![
            Arc::new(MockRunner {
                name: "runner-a",
                delay,
                executions: Arc::clone(&executions),
            }),
            Arc::new(MockRunner {
                name: "runner-b",
                delay,
                executions: Arc::clone(&executions),
            }),
        ];
        (runners, executions)
    }
}

#[async_trait]
impl JobRunner for MockRunner {
    async fn run(&self, job: &Job, skip_states: Arc<Mutex<SkipStateSet>>) -> JobResult {
        tokio::time::sleep(self.delay).await;
        skip_states
            .lock()
            .unwrap()
            .insert(format!("visited:{}", job.id));
        self.executions
            .lock()
            .unwrap()
            .push((job.id.to_string(), self.name));

        let page = Page::new(job.resource.url().clone(), "<html><body>ok</body></html>");
        JobResult::new(job.clone()).with_pages(vec![page])
    }
}

fn collecting_callback(results: Arc<Mutex<Vec<JobResult>>>) -> JobCallback {
    Arc::new(move |result, _args, _cluster| {
        results.lock().unwrap().push(result.clone());
    })
}

#[tokio::test]
async fn test_three_jobs_spread_across_two_workers() {
    let cluster = Cluster::new_in_memory(cluster_config(5_000)).unwrap();
    let (runners, executions) = MockRunner::pair(Duration::from_millis(200));
    cluster.spawn_workers(runners);

    let results = Arc::new(Mutex::new(Vec::new()));
    for path in ["a", "b", "c"] {
        cluster
            .explore(
                explore_resource(path),
                JobOptions::default(),
                collecting_callback(Arc::clone(&results)),
            )
            .unwrap();
    }

    cluster.wait().await.unwrap();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|result| result.is_ok()));
    assert!(results.iter().all(|result| result.pages.len() == 1));

    // Both workers must have participated, not one serializing all three
    let used: HashSet<&'static str> = executions
        .lock()
        .unwrap()
        .iter()
        .map(|(_, runner)| *runner)
        .collect();
    assert_eq!(used.len(), 2);

    let stats = cluster.statistics();
    assert_eq!(stats.queued_jobs, 3);
    assert_eq!(stats.completed_jobs, 3);
    assert!(stats.seconds_per_job() > 0.0);

    cluster.shutdown(true).await;
}

#[tokio::test]
async fn test_never_ending_job_retains_callback_and_skip_states() {
    let cluster = Cluster::new_in_memory(cluster_config(5_000)).unwrap();
    let (runners, _) = MockRunner::pair(Duration::from_millis(20));
    cluster.spawn_workers(runners);

    let results = Arc::new(Mutex::new(Vec::new()));
    let job = Job::new(JobKind::Explore, explore_resource("broadcast"))
        .with_id("broadcast")
        .never_ending(true);

    cluster
        .queue(job.clone(), collecting_callback(Arc::clone(&results)))
        .unwrap();
    cluster.requeue(job.clone()).unwrap();

    cluster.wait().await.unwrap();
    assert_eq!(results.lock().unwrap().len(), 2);

    // Both dispatches completed, yet the id is not done and keeps its state
    assert!(!cluster.is_done(&job.id));
    assert!(cluster
        .skip_states_for(&job.id)
        .lock()
        .unwrap()
        .contains("visited:broadcast"));

    // Re-dispatching the same id must still be allowed
    cluster.requeue(job.clone()).unwrap();
    cluster.wait().await.unwrap();
    assert_eq!(results.lock().unwrap().len(), 3);

    cluster.shutdown(true).await;
}

#[tokio::test]
async fn test_slow_job_is_cut_off_by_the_job_timeout() {
    let cluster = Cluster::new_in_memory(cluster_config(100)).unwrap();
    let (runners, _) = MockRunner::pair(Duration::from_millis(800));
    cluster.spawn_workers(runners);

    let results = Arc::new(Mutex::new(Vec::new()));
    cluster
        .explore(
            explore_resource("slow"),
            JobOptions::default(),
            collecting_callback(Arc::clone(&results)),
        )
        .unwrap();

    cluster.wait().await.unwrap();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_ok());
    assert_eq!(results[0].error.as_deref(), Some("job timed out"));
    assert_eq!(cluster.statistics().timed_out_jobs, 1);

    cluster.shutdown(true).await;
}

#[tokio::test]
async fn test_with_browser_passes_args_through() {
    let cluster = Cluster::new_in_memory(cluster_config(5_000)).unwrap();
    let (runners, _) = MockRunner::pair(Duration::from_millis(10));
    cluster.spawn_workers(runners);

    let seen_args = Arc::new(Mutex::new(Vec::new()));
    let seen_args_in_callback = Arc::clone(&seen_args);
    cluster
        .with_browser(
            json!({ "check": "xss", "round": 2 }),
            Arc::new(move |_result, args, _cluster| {
                seen_args_in_callback.lock().unwrap().push(args.clone());
            }),
        )
        .unwrap();

    cluster.wait().await.unwrap();

    let seen_args = seen_args.lock().unwrap();
    assert_eq!(seen_args.len(), 1);
    assert_eq!(seen_args[0]["check"], "xss");
    assert_eq!(seen_args[0]["round"], 2);

    cluster.shutdown(true).await;
}

#[tokio::test]
async fn test_shutdown_discards_queued_work_and_rejects_new() {
    let cluster = Cluster::new_in_memory(cluster_config(5_000)).unwrap();
    // No workers: queued jobs stay queued until shutdown discards them
    let results = Arc::new(Mutex::new(Vec::new()));
    cluster
        .explore(
            explore_resource("never-run"),
            JobOptions::default(),
            collecting_callback(Arc::clone(&results)),
        )
        .unwrap();

    cluster.shutdown(true).await;
    cluster.shutdown(true).await;

    assert!(results.lock().unwrap().is_empty());
    assert!(matches!(
        cluster.explore(
            explore_resource("late"),
            JobOptions::default(),
            collecting_callback(results),
        ),
        Err(SpecterError::AlreadyShutdown)
    ));
}
