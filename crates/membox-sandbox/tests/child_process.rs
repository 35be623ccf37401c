//! End-to-end tests for child-process execution.
//!
//! These spawn the real `membox-worker` binary, so the workspace must be
//! built before running them (cargo builds the worker alongside the test
//! binaries).

use std::time::Duration;

use membox_sandbox::{ExecutionMode, ExecutionRequest, SandboxConfig, SandboxExecutor};
use serial_test::serial;

fn executor() -> SandboxExecutor {
    SandboxExecutor::new(SandboxConfig {
        execution_mode: ExecutionMode::ChildProcess,
        ..Default::default()
    })
}

#[tokio::test]
#[serial]
async fn simple_snippet_roundtrip() {
    let exec = executor();
    let outcome = exec
        .execute(&ExecutionRequest::new("x = 1 + 1"))
        .await
        .unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    assert_eq!(outcome.locals.unwrap()["x"], 2);
}

#[tokio::test]
#[serial]
async fn snippet_exception_returns_locals_and_error() {
    let exec = executor();
    let outcome = exec
        .execute(&ExecutionRequest::new(
            "count = 3;\nthrow new Error(\"midway\")",
        ))
        .await
        .unwrap();
    assert!(outcome.error.starts_with("Exception in sandboxed code:\n"));
    assert!(outcome.error.contains("midway"));
    assert_eq!(outcome.locals.unwrap()["count"], 3);
}

#[tokio::test]
#[serial]
async fn infinite_loop_is_killed_on_time() {
    let exec = executor();
    let request =
        ExecutionRequest::new("while (true) {}").with_timeout(Duration::from_secs(2));
    let outcome = exec.execute(&request).await.unwrap();
    assert!(outcome.is_infrastructure_failure());
    assert_eq!(
        outcome.error,
        "TimeoutError: Code execution exceeded 2 seconds."
    );
}

#[tokio::test]
#[serial]
async fn memory_capabilities_work_across_the_process_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor();
    let request = ExecutionRequest::new(
        r#"
        create_file("notes/today.md", "alpha beta");
        updated = update_file("notes/today.md", "beta", "gamma");
        content = read_file("notes/today.md");
        tree = list_files();
        removed = delete_file("notes/today.md");
        "#,
    )
    .with_import_module("memory")
    .with_allowed_root(dir.path());
    let outcome = exec.execute(&request).await.unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    let locals = outcome.locals.unwrap();
    assert_eq!(locals["updated"], true);
    assert_eq!(locals["content"], "alpha gamma");
    assert!(locals["tree"].as_str().unwrap().contains("today.md"));
    assert_eq!(locals["removed"], true);
    assert!(!dir.path().join("notes/today.md").exists());
}

#[tokio::test]
#[serial]
async fn get_size_counts_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor();
    let request = ExecutionRequest::new(
        r#"
        create_file("f.md", "12345");
        size = get_size("f.md");
        total = get_size();
        "#,
    )
    .with_import_module("memory")
    .with_allowed_root(dir.path());
    let outcome = exec.execute(&request).await.unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    let locals = outcome.locals.unwrap();
    assert_eq!(locals["size"], 5.0);
    assert_eq!(locals["total"], 5.0);
}

#[tokio::test]
#[serial]
async fn update_with_missing_needle_is_data_not_exception() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.md"), "content").unwrap();
    let exec = executor();
    let request = ExecutionRequest::new(
        "result = update_file(\"f.md\", \"no such text\", \"x\")",
    )
    .with_import_module("memory")
    .with_allowed_root(dir.path());
    let outcome = exec.execute(&request).await.unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    let result = outcome.locals.unwrap()["result"].clone();
    let msg = result.as_str().unwrap();
    assert!(msg.starts_with("Error: Could not find the exact text"), "got: {msg}");
    assert_eq!(std::fs::read_to_string(dir.path().join("f.md")).unwrap(), "content");
}

#[tokio::test]
#[serial]
async fn traversal_outside_the_root_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor();
    let request = ExecutionRequest::new("read_file(\"../../etc/passwd\")")
        .with_import_module("memory")
        .with_allowed_root(dir.path());
    let outcome = exec.execute(&request).await.unwrap();
    assert!(!outcome.is_success());
    assert!(
        outcome.error.contains("is denied by sandbox."),
        "error: {}",
        outcome.error
    );
}

#[tokio::test]
#[serial]
async fn blacklisted_function_cannot_destroy_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("keep.md"), "precious").unwrap();
    let exec = executor();
    let request = ExecutionRequest::new("delete_file(\"keep.md\")")
        .with_import_module("memory")
        .with_allowed_root(dir.path())
        .with_blacklisted("memory.delete_file");
    let outcome = exec.execute(&request).await.unwrap();
    assert!(outcome.error.contains("is not a function"), "error: {}", outcome.error);
    assert!(dir.path().join("keep.md").is_file());
}

#[tokio::test]
#[serial]
async fn oversized_file_creation_is_rejected_by_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor();
    let request =
        ExecutionRequest::new("create_file(\"big.md\", \"x\".repeat(2 * 1024 * 1024))")
            .with_import_module("memory")
            .with_allowed_root(dir.path());
    let outcome = exec.execute(&request).await.unwrap();
    assert!(!outcome.is_success());
    assert!(
        outcome.error.contains("too large to create"),
        "error: {}",
        outcome.error
    );
    assert!(!dir.path().join("big.md").exists());
}

#[tokio::test]
#[serial]
async fn nonserializable_local_survives_as_text() {
    let exec = executor();
    let outcome = exec
        .execute(&ExecutionRequest::new("f = function greet() { return 1; }"))
        .await
        .unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    let locals = outcome.locals.unwrap();
    assert!(locals["f"].as_str().unwrap().contains("function"));
}

#[tokio::test]
#[serial]
async fn exit_is_controlled_termination() {
    let exec = executor();
    let outcome = exec
        .execute(&ExecutionRequest::new("a = 1; exit(0); b = 2"))
        .await
        .unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    assert!(!outcome.locals.unwrap().contains_key("b"));

    let outcome = exec
        .execute(&ExecutionRequest::new("a = 1; exit(7)"))
        .await
        .unwrap();
    assert_eq!(outcome.error, "Sandboxed code called exit(7)");
    assert_eq!(outcome.locals.unwrap()["a"], 1);
}

#[tokio::test]
#[serial]
async fn preludes_install_into_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("helpers.js"),
        "function triple(n) { return n * 3; }",
    )
    .unwrap();
    let manifest = dir.path().join("requirements.txt");
    std::fs::write(&manifest, "helpers.js\n").unwrap();

    let exec = executor();
    let request = ExecutionRequest::new("x = triple(7)")
        .with_requirements(&manifest)
        .with_allow_installs(true);
    let outcome = exec.execute(&request).await.unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    assert_eq!(outcome.locals.unwrap()["x"], 21);
}

#[tokio::test]
#[serial]
async fn concurrent_executions_with_disjoint_roots_do_not_interfere() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let exec = executor();

    let req_a = ExecutionRequest::new("create_file(\"a.md\", \"from a\"); seen = list_files()")
        .with_import_module("memory")
        .with_allowed_root(dir_a.path());
    let req_b = ExecutionRequest::new("create_file(\"b.md\", \"from b\"); seen = list_files()")
        .with_import_module("memory")
        .with_allowed_root(dir_b.path());

    let (out_a, out_b) = tokio::join!(exec.execute(&req_a), exec.execute(&req_b));
    let out_a = out_a.unwrap();
    let out_b = out_b.unwrap();
    assert!(out_a.is_success(), "error: {}", out_a.error);
    assert!(out_b.is_success(), "error: {}", out_b.error);

    let tree_a = out_a.locals.unwrap()["seen"].as_str().unwrap().to_string();
    let tree_b = out_b.locals.unwrap()["seen"].as_str().unwrap().to_string();
    assert!(tree_a.contains("a.md") && !tree_a.contains("b.md"));
    assert!(tree_b.contains("b.md") && !tree_b.contains("a.md"));
    assert!(dir_a.path().join("a.md").is_file());
    assert!(dir_b.path().join("b.md").is_file());
}

#[tokio::test]
#[serial]
async fn bindings_and_log_flow_through_ipc() {
    let exec = executor();
    let request = ExecutionRequest::new("log(\"working\"); doubled = seed * 2")
        .with_binding("seed", serde_json::json!(21))
        .with_log(true);
    let outcome = exec.execute(&request).await.unwrap();
    assert!(outcome.is_success(), "error: {}", outcome.error);
    assert_eq!(outcome.locals.unwrap()["doubled"], 42);
}

#[tokio::test]
#[serial]
async fn worker_environment_is_scrubbed() {
    std::env::set_var("MEMBOX_TEST_SECRET", "hunter2");
    let exec = executor();
    // Deno is deleted and there is no process object; the only way a
    // snippet could see the secret is if a capability leaked it.
    let outcome = exec
        .execute(&ExecutionRequest::new(
            "leak = typeof Deno; proc = typeof process",
        ))
        .await
        .unwrap();
    std::env::remove_var("MEMBOX_TEST_SECRET");
    assert!(outcome.is_success(), "error: {}", outcome.error);
    let locals = outcome.locals.unwrap();
    assert_eq!(locals["leak"], "undefined");
    assert_eq!(locals["proc"], "undefined");
}
