//! End-to-end resolution through the query engine: known facts,
//! constrained direct invocation, and ambiguity handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use meshql::invoke::cache::InMemoryCacheStore;
use meshql::invoke::lineage::NoopLineageSink;
use meshql::{
    BoundParameter, CancellationFlag, Constraint, ConstraintOperator, FactBag, InstanceStream,
    InvocationError, InvocationPipeline, MeshError, Operation, OperationInvoker, Parameter,
    PolicyDecorator, Provenance, QueryEngine, QuerySpec, QueryStreamEvent, ResolutionError,
    Scalar, Schema, Service, TypedInstance,
};

fn order(date: &str) -> TypedInstance {
    TypedInstance::object(
        "orders.Order",
        vec![(
            "settlementDate".to_string(),
            TypedInstance::scalar("orders.SettlementDate", date, Provenance::Provided),
        )],
        Provenance::Provided,
    )
}

struct CountingInvoker {
    calls: AtomicUsize,
    captured: Mutex<Vec<Vec<BoundParameter>>>,
    items: Vec<TypedInstance>,
}

impl CountingInvoker {
    fn new(items: Vec<TypedInstance>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
            items,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationInvoker for CountingInvoker {
    async fn invoke(
        &self,
        _service: &Service,
        _operation: &Operation,
        params: &[BoundParameter],
    ) -> Result<InstanceStream, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.captured.lock().unwrap().push(params.to_vec());
        let items: Vec<_> = self.items.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

fn order_schema(operations: Vec<Operation>) -> Schema {
    Schema::builder()
        .with_type(meshql::TypeDef::scalar("orders.SettlementDate"))
        .with_type(meshql::TypeDef::object(
            "orders.Order",
            vec![("settlementDate".to_string(), "orders.SettlementDate".into())],
        ))
        .with_type(meshql::TypeDef::collection("orders.Orders", "orders.Order"))
        .with_service(Service::new("orders.OrderService", "http", operations))
        .build()
}

fn find_orders_after() -> Operation {
    Operation::new(
        "findOrdersAfter",
        vec![Parameter::new("date", "orders.SettlementDate")],
        "orders.Orders",
    )
    .with_contract(vec![Constraint::property_param(
        "orders.SettlementDate",
        ConstraintOperator::GreaterThanOrEqual,
        "date",
    )])
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine_with(schema: Schema, invoker: Arc<dyn OperationInvoker>) -> QueryEngine {
    init_tracing();
    let mut invokers: HashMap<String, Arc<dyn OperationInvoker>> = HashMap::new();
    invokers.insert("http".to_string(), invoker);
    QueryEngine::new(
        Arc::new(schema),
        Arc::new(InvocationPipeline::new(
            invokers,
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(NoopLineageSink),
            PolicyDecorator::default(),
        )),
    )
}

async fn items_of(stream: meshql::QueryStream) -> Vec<TypedInstance> {
    stream
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .filter_map(|e| match e {
            QueryStreamEvent::Item(i) => Some(i),
            QueryStreamEvent::Summary(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn known_fact_makes_zero_remote_calls() {
    let invoker = CountingInvoker::new(vec![order("2021-10-05")]);
    let engine = engine_with(order_schema(vec![find_orders_after()]), invoker.clone());

    let mut facts = FactBag::new();
    facts.add_default(order("2021-11-01"));

    let stream = engine
        .submit(
            QuerySpec::single("orders.Order"),
            facts,
            HashMap::new(),
            CancellationFlag::new(),
        )
        .await
        .unwrap();
    let items = items_of(stream).await;

    assert_eq!(items, vec![order("2021-11-01")]);
    assert_eq!(invoker.call_count(), 0);
}

#[tokio::test]
async fn constrained_find_binds_the_contract_parameter() {
    let invoker = CountingInvoker::new(vec![order("2021-10-05"), order("2021-11-01")]);
    let engine = engine_with(order_schema(vec![find_orders_after()]), invoker.clone());

    // find Orders where settlementDate >= 2021-10-01, no prior facts.
    let spec = QuerySpec::gather("orders.Orders").with_constraint(Constraint::property(
        "orders.SettlementDate",
        ConstraintOperator::GreaterThanOrEqual,
        "2021-10-01",
    ));
    let stream = engine
        .submit(spec, FactBag::new(), HashMap::new(), CancellationFlag::new())
        .await
        .unwrap();
    let items = items_of(stream).await;

    assert_eq!(items.len(), 2);
    assert_eq!(invoker.call_count(), 1);

    let captured = invoker.captured.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0][0].name, "date");
    assert_eq!(
        captured[0][0].value.as_scalar(),
        Some(&Scalar::from("2021-10-01"))
    );
}

#[tokio::test]
async fn equally_specific_operations_raise_ambiguity() {
    let second = Operation::new(
        "findOrdersSince",
        vec![Parameter::new("date", "orders.SettlementDate")],
        "orders.Orders",
    )
    .with_contract(vec![Constraint::property_param(
        "orders.SettlementDate",
        ConstraintOperator::GreaterThanOrEqual,
        "date",
    )]);
    let invoker = CountingInvoker::new(vec![order("2021-10-05")]);
    let engine = engine_with(
        order_schema(vec![find_orders_after(), second]),
        invoker.clone(),
    );

    let spec = QuerySpec::single("orders.Orders").with_constraint(Constraint::property(
        "orders.SettlementDate",
        ConstraintOperator::GreaterThanOrEqual,
        "2021-10-01",
    ));
    let Err(err) = engine
        .submit(spec, FactBag::new(), HashMap::new(), CancellationFlag::new())
        .await
    else {
        panic!("expected an ambiguity error");
    };

    assert!(matches!(
        err,
        MeshError::Resolution(ResolutionError::AmbiguousCandidate { .. })
    ));
    assert_eq!(invoker.call_count(), 0);
}

#[tokio::test]
async fn given_binding_feeds_operation_parameters() {
    let invoker = CountingInvoker::new(vec![order("2021-10-05")]);
    let engine = engine_with(order_schema(vec![find_orders_after()]), invoker.clone());

    let mut arguments = HashMap::new();
    arguments.insert("date".to_string(), Scalar::from("2021-10-01"));

    let spec = QuerySpec::gather("orders.Orders").with_given("date");
    let stream = engine
        .submit(spec, FactBag::new(), arguments, CancellationFlag::new())
        .await
        .unwrap();
    let items = items_of(stream).await;

    assert_eq!(items.len(), 1);
    let captured = invoker.captured.lock().unwrap().clone();
    assert_eq!(
        captured[0][0].value.as_scalar(),
        Some(&Scalar::from("2021-10-01"))
    );
}
