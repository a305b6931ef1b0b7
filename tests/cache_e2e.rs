//! Cache concurrency end-to-end: writer election, replay fidelity,
//! and cache-only reads after completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Barrier;

use meshql::invoke::cache::InMemoryCacheStore;
use meshql::invoke::lineage::{LineageSink, RecordingLineageSink};
use meshql::{
    BoundParameter, CancellationFlag, FactBag, InstanceStream, InvocationError,
    InvocationPipeline, Operation, OperationInvoker, PolicyDecorator, Provenance, QueryEngine,
    QuerySpec, QueryStreamEvent, Scalar, Schema, Service, TypedInstance,
};

fn quote(value: i64) -> TypedInstance {
    TypedInstance::scalar("quotes.Quote", value, Provenance::Provided)
}

/// Counts underlying calls and emits a fixed item sequence, holding
/// each call open briefly so concurrent callers overlap.
struct SlowCountingInvoker {
    calls: AtomicUsize,
    items: Vec<TypedInstance>,
}

impl SlowCountingInvoker {
    fn new(items: Vec<TypedInstance>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            items,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationInvoker for SlowCountingInvoker {
    async fn invoke(
        &self,
        _service: &Service,
        _operation: &Operation,
        _params: &[BoundParameter],
    ) -> Result<InstanceStream, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let items: Vec<_> = self.items.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

fn quote_schema() -> Schema {
    Schema::builder()
        .with_type(meshql::TypeDef::scalar("quotes.Quote"))
        .with_type(meshql::TypeDef::collection("quotes.Quotes", "quotes.Quote"))
        .with_service(Service::new(
            "quotes.QuoteService",
            "http",
            vec![Operation::new("findQuotes", vec![], "quotes.Quotes")],
        ))
        .build()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine_with(
    invoker: Arc<dyn OperationInvoker>,
    lineage: Arc<dyn LineageSink>,
) -> Arc<QueryEngine> {
    init_tracing();
    let mut invokers: HashMap<String, Arc<dyn OperationInvoker>> = HashMap::new();
    invokers.insert("http".to_string(), invoker);
    Arc::new(QueryEngine::new(
        Arc::new(quote_schema()),
        Arc::new(InvocationPipeline::new(
            invokers,
            Arc::new(InMemoryCacheStore::new()),
            lineage,
            PolicyDecorator::default(),
        )),
    ))
}

async fn run_gather(engine: &QueryEngine) -> Vec<i64> {
    let stream = engine
        .submit(
            QuerySpec::gather("quotes.Quotes"),
            FactBag::new(),
            HashMap::new(),
            CancellationFlag::new(),
        )
        .await
        .unwrap();
    stream
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .filter_map(|e| match e {
            QueryStreamEvent::Item(i) => i.as_scalar().and_then(Scalar::as_int),
            QueryStreamEvent::Summary(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn concurrent_identical_queries_invoke_once() {
    let invoker = SlowCountingInvoker::new(vec![quote(1), quote(2), quote(3)]);
    let lineage = Arc::new(RecordingLineageSink::new());
    let engine = engine_with(invoker.clone(), lineage.clone());

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            run_gather(&engine).await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(invoker.call_count(), 1);
    // Exactly one lineage event for the actual invocation.
    assert_eq!(lineage.invocation_count(), 1);
}

#[tokio::test]
async fn completed_entry_serves_later_queries_from_cache() {
    let invoker = SlowCountingInvoker::new(vec![quote(7), quote(8)]);
    let lineage = Arc::new(RecordingLineageSink::new());
    let engine = engine_with(invoker.clone(), lineage.clone());

    assert_eq!(run_gather(&engine).await, vec![7, 8]);
    assert_eq!(invoker.call_count(), 1);

    // The third query reads the cache alone: same items, same order,
    // no new invocation.
    assert_eq!(run_gather(&engine).await, vec![7, 8]);
    assert_eq!(run_gather(&engine).await, vec![7, 8]);
    assert_eq!(invoker.call_count(), 1);
    assert_eq!(lineage.invocation_count(), 1);
    assert_eq!(lineage.cache_read_count(), 2);
}

#[tokio::test]
async fn replayed_items_reference_the_replaying_query() {
    let invoker = SlowCountingInvoker::new(vec![quote(5)]);
    let lineage = Arc::new(RecordingLineageSink::new());
    let engine = engine_with(invoker.clone(), lineage.clone());

    let first = engine
        .submit(
            QuerySpec::gather("quotes.Quotes"),
            FactBag::new(),
            HashMap::new(),
            CancellationFlag::new(),
        )
        .await
        .unwrap();
    let first_items: Vec<_> = first.collect().await;
    let QueryStreamEvent::Item(written) = &first_items[0] else {
        panic!("expected an item");
    };
    assert!(matches!(written.provenance, Provenance::RemoteCall { .. }));

    let second = engine
        .submit(
            QuerySpec::gather("quotes.Quotes"),
            FactBag::new(),
            HashMap::new(),
            CancellationFlag::new(),
        )
        .await
        .unwrap();
    let second_items: Vec<_> = second.collect().await;
    let QueryStreamEvent::Item(replayed) = &second_items[0] else {
        panic!("expected an item");
    };
    assert!(matches!(
        replayed.provenance,
        Provenance::CacheReplay { .. }
    ));

    // Same value either way.
    assert_eq!(written.as_scalar(), replayed.as_scalar());
}
