//! Lifecycle integration tests: registry reaping, governor reactions,
//! throttled delivery and ordered shutdown wired through `Runtime`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use warden_core::backpressure::Transport;
use warden_core::governor::{CpuUsage, MetricsSource, SystemFacts};
use warden_core::registry::Handle;
use warden_core::runtime::{Runtime, THROTTLE_QUEUE};
use warden_core::shutdown::{cleanup_window, TaskStatus, Window};
use warden_core::types::HandleId;
use warden_core::{Config, Result};

struct StaticMetrics {
    memory_mb: u64,
}

impl MetricsSource for StaticMetrics {
    fn memory_bytes(&self) -> Result<u64> {
        Ok(self.memory_mb * 1024 * 1024)
    }

    fn cpu(&self) -> Result<CpuUsage> {
        Ok(CpuUsage {
            total_time: Duration::from_millis(250),
            percent: 2.5,
        })
    }

    fn system_facts(&self) -> SystemFacts {
        SystemFacts {
            total_memory_mb: 8192.0,
            free_memory_mb: 4096.0,
            cpu_count: 4,
            uptime: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct RecordingTransport {
    batches: StdMutex<Vec<(String, Vec<Value>)>>,
    invokes: AtomicUsize,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, _channel: &str, _data: Value) -> Result<()> {
        Ok(())
    }

    async fn send_batch(&self, channel: &str, batch: Vec<Value>) -> Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push((channel.to_string(), batch));
        Ok(())
    }

    async fn invoke(&self, _channel: &str, data: &Value) -> Result<Value> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "echo": data }))
    }
}

#[derive(Default)]
struct View {
    destroyed: AtomicBool,
}

impl Handle for View {
    fn is_destroyed(&self) -> Option<Result<bool>> {
        Some(Ok(self.destroyed.load(Ordering::SeqCst)))
    }
}

impl Window for View {
    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn runtime(memory_mb: u64) -> Runtime {
    Runtime::new(Config::default(), Arc::new(StaticMetrics { memory_mb }))
}

#[tokio::test(start_paused = true)]
async fn test_reaper_and_governor_cooperate() {
    let runtime = runtime(100);
    let warned = Arc::new(AtomicUsize::new(0));
    let sink = warned.clone();
    runtime
        .governor()
        .on_handle_warning(Arc::new(move |n: usize| sink.store(n, Ordering::SeqCst)))
        .await;
    runtime.governor().set_limit("maxHandles", 2.0).await;
    tokio_test::assert_ok!(runtime.init().await);

    let views: Vec<Arc<View>> = (0..4).map(|_| Arc::new(View::default())).collect();
    {
        let mut registry = runtime.registry().lock().await;
        for view in &views {
            let handle: Arc<dyn Handle> = view.clone();
            tokio_test::assert_ok!(registry.add(HandleId::new(), handle));
        }
    }
    views[0].destroyed.store(true, Ordering::SeqCst);
    views[1].destroyed.store(true, Ordering::SeqCst);

    // First sample at 10s sees all four entries
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(warned.load(Ordering::SeqCst), 4);

    // Reaper runs at 30s; the 40s sample sees the survivors only
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(runtime.registry().lock().await.len(), 2);
    let latest = runtime.governor().metrics().await.latest.unwrap();
    assert_eq!(latest.handles, Some(2));

    let outcomes = runtime.shutdown().await.unwrap();
    assert!(outcomes.iter().all(|o| o.status == TaskStatus::Success));
    assert!(runtime.registry().lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_throttle_queue_is_probed_and_flushed() {
    let runtime = runtime(100);
    let transport = Arc::new(RecordingTransport::default());
    runtime.throttle().set_transport(transport.clone()).await;
    runtime.init().await.unwrap();

    for i in 0..3 {
        runtime
            .throttle()
            .throttle("progress", json!(i), Duration::from_secs(60))
            .await;
    }

    // The 1s batch age ceiling flushes long before the first probe at 5s
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    let metrics = runtime.governor().metrics().await;
    assert_eq!(metrics.queues.get(THROTTLE_QUEUE), Some(&0));

    let batches = transport.batches.lock().unwrap().clone();
    assert_eq!(
        batches,
        vec![("progress".to_string(), vec![json!(0), json!(1), json!(2)])]
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_emergency_cleanup_sheds_cache_and_handles() {
    let runtime = runtime(100);
    let transport = Arc::new(RecordingTransport::default());
    runtime.throttle().set_transport(transport.clone()).await;
    runtime.init().await.unwrap();

    let ttl = Duration::from_secs(5);
    let query = json!({"user": 7});
    runtime
        .throttle()
        .cached_invoke("profile", &query, ttl)
        .await
        .unwrap();
    runtime
        .throttle()
        .cached_invoke("profile", &query, ttl)
        .await
        .unwrap();
    assert_eq!(transport.invokes.load(Ordering::SeqCst), 1);

    let dead = Arc::new(View::default());
    let handle: Arc<dyn Handle> = dead.clone();
    runtime
        .registry()
        .lock()
        .await
        .add(HandleId::new(), handle)
        .unwrap();
    dead.destroyed.store(true, Ordering::SeqCst);

    assert!(runtime.governor().emergency_cleanup().await);
    assert_eq!(runtime.throttle().cache_len().await, 0);
    assert!(runtime.registry().lock().await.is_empty());

    runtime
        .throttle()
        .cached_invoke("profile", &query, ttl)
        .await
        .unwrap();
    assert_eq!(transport.invokes.load(Ordering::SeqCst), 2);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_memory_breach_reaches_host_callback() {
    let runtime = runtime(4096);
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = seen.clone();
    runtime
        .governor()
        .on_memory_warning(Arc::new(move |mb: f64| sink.lock().unwrap().push(mb)))
        .await;
    runtime.init().await.unwrap();

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(*seen.lock().unwrap(), vec![4096.0, 4096.0]);

    runtime.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_host_window_cleanup_as_shutdown_task() {
    let runtime = runtime(100);
    runtime.init().await.unwrap();

    let window = Arc::new(View::default());
    let grace = runtime.config().shutdown.window_grace;
    let target = window.clone();
    runtime
        .shutdown_orchestrator()
        .register_fn("main_window", move |_: CancellationToken| {
            let target = target.clone();
            async move {
                if cleanup_window(target.as_ref(), grace).await {
                    Ok(())
                } else {
                    Err(warden_core::Error::internal("window cleanup failed"))
                }
            }
        })
        .await;

    let outcomes = runtime.shutdown().await.unwrap();
    let last = outcomes.last().unwrap();
    assert_eq!(last.name, "main_window");
    assert_eq!(last.status, TaskStatus::Success);
    assert!(window.destroyed.load(Ordering::SeqCst));

    // A second run re-executes every task without error
    let again = runtime.shutdown().await.unwrap();
    assert_eq!(again.len(), outcomes.len());
}
