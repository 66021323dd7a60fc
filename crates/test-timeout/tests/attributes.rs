use std::time::Duration;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test_timeout::timeout]
fn plain_sync_test_passes() {
    assert_eq!(2 + 2, 4);
}

#[test_timeout::timeout(secs = 5)]
fn sync_test_may_return_ok() -> TestResult {
    let parsed: u32 = "42".parse()?;
    assert_eq!(parsed, 42);
    Ok(())
}

#[test_timeout::timeout(millis = 200)]
#[should_panic(expected = "test timed out")]
fn sync_test_over_budget_fails() {
    std::thread::sleep(Duration::from_secs(2));
}

#[test_timeout::timeout]
#[should_panic(expected = "test returned an error")]
fn sync_error_fails_the_test() -> Result<(), String> {
    Err("nope".into())
}

#[test_timeout::tokio_timeout_test]
async fn async_test_runs_on_a_runtime() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[test_timeout::tokio_timeout_test(secs = 5, flavor = "multi_thread", worker_threads = 2)]
async fn multi_thread_flavor_can_spawn_blocking() -> TestResult {
    let value = tokio::task::spawn_blocking(|| 7).await?;
    assert_eq!(value, 7);
    Ok(())
}

#[test_timeout::tokio_timeout_test(millis = 100)]
#[should_panic(expected = "test timed out")]
async fn async_test_over_budget_fails() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}
