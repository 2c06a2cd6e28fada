//! Worker pool against real `corral-worker` subprocesses.
//!
//! These tests require the corral-worker binary to be built.
//! Run `cargo build -p corral-worker` first.

use std::time::Duration;

use corral_core::{
    Encoding, Error, ErrorCode, MessageSerializer, PoolConfig, ProcessBackend, SerializerConfig,
    Value, WorkerPool,
};

fn task(op: &str, fields: Vec<(&str, Value)>) -> Value {
    let data = Value::object([("op", Value::from(op))]);
    for (key, value) in fields {
        data.set_property(key, value);
    }
    data
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "Requires corral-worker binary"]
async fn test_process_pool_runs_operations() {
    for encoding in [Encoding::Json, Encoding::Bincode] {
        let backend = ProcessBackend::new().unwrap().encoding(encoding);
        let pool = WorkerPool::new(PoolConfig::default().with_pool_size(2), backend).unwrap();

        let values = Value::array(vec![Value::from(1), Value::from(2), Value::from(3.5)]);
        let sum = pool.execute(task("sum", vec![("values", values)]), None).unwrap();
        assert_eq!(sum.await.unwrap(), Value::from(6.5));

        let echo = pool
            .execute(task("echo", vec![("value", Value::from("hi"))]), None)
            .unwrap();
        assert_eq!(echo.await.unwrap(), Value::from("hi"));

        let fail = task(
            "fail",
            vec![("name", Value::from("TypeError")), ("message", Value::from("nope"))],
        );
        match pool.execute(fail, None).unwrap().await {
            Err(Error::TaskFailed(err)) => {
                assert_eq!(err.code, ErrorCode::ValidationError);
                assert_eq!(err.message, "nope");
            }
            other => panic!("expected a task failure, got {other:?}"),
        }

        pool.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "Requires corral-worker binary"]
async fn test_process_exit_is_a_crash() {
    let backend = ProcessBackend::new().unwrap();
    let pool = WorkerPool::new(PoolConfig::default().with_pool_size(1), backend).unwrap();

    let exit = pool
        .execute(task("exit", vec![("code", Value::from(3))]), None)
        .unwrap();
    match exit.await {
        Err(Error::WorkerCrash { message, .. }) => assert!(message.contains("code 3"), "{message}"),
        other => panic!("expected a crash, got {other:?}"),
    }

    assert_eq!(pool.worker_snapshots()[0].restarts, 1);
    let after = pool.execute(Value::from(42), None).unwrap();
    assert_eq!(after.await.unwrap(), Value::from(42));

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "Requires corral-worker binary"]
async fn test_process_timeout() {
    let backend = ProcessBackend::new().unwrap();
    let pool = WorkerPool::new(PoolConfig::default().with_pool_size(1), backend).unwrap();

    let slow = pool
        .execute(
            task("sleep", vec![("ms", Value::from(500)), ("value", Value::Null)]),
            Some(Duration::from_millis(20)),
        )
        .unwrap();
    assert!(matches!(slow.await, Err(Error::TaskTimeout { .. })));
    assert_eq!(pool.stats().available_workers, 1);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "Requires corral-worker binary"]
async fn test_process_preserves_types() {
    let backend = ProcessBackend::new().unwrap().preserve_types();
    let serializer = MessageSerializer::new(SerializerConfig::preserving());
    let pool = WorkerPool::with_serializer(PoolConfig::default(), backend, serializer).unwrap();

    let set = Value::set([Value::from("x"), Value::from("y")]);
    assert_eq!(pool.execute(set.clone(), None).unwrap().await.unwrap(), set);

    let regexp = Value::regexp("^a+$", "gi");
    assert_eq!(pool.execute(regexp.clone(), None).unwrap().await.unwrap(), regexp);

    pool.shutdown().await;
}
