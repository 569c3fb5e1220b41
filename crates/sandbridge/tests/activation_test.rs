//! Integration tests for activating a worker through a [`Bridge`].

use sandbridge::{
    ActivationOptions, Bridge, Error, FileStorage, MemoryBudget, MemoryChannel, ServerOptions,
    WorkerStatus,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Writes three lines to stderr and returns.
const STDERR_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 100) "a\nb\nc\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 100))
    (i32.store (i32.const 4) (i32.const 6))
    (drop (call $fd_write (i32.const 2) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

/// Copies stdin to stdout until EOF.
const ECHO_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start") (local $n i32)
    (loop $again
      (i32.store (i32.const 0) (i32.const 64))
      (i32.store (i32.const 4) (i32.const 1024))
      (if (i32.ne (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 16))
                  (i32.const 0))
        (then (return)))
      (local.set $n (i32.load (i32.const 16)))
      (if (i32.eqz (local.get $n)) (then (return)))
      (i32.store (i32.const 8) (i32.const 64))
      (i32.store (i32.const 12) (local.get $n))
      (drop (call $fd_write (i32.const 1) (i32.const 8) (i32.const 1) (i32.const 20)))
      (br $again))))
"#;

struct Fixture {
    modules: TempDir,
    workspace: TempDir,
    channel: MemoryChannel,
    bridge: Bridge,
}

impl Fixture {
    fn new() -> Self {
        let modules = TempDir::new().expect("Failed to create module dir");
        let workspace = TempDir::new().expect("Failed to create workspace dir");
        let channel = MemoryChannel::new();
        let bridge = Bridge::new(
            Arc::new(FileStorage::with_base(modules.path())),
            Arc::new(channel.clone()),
        );
        Self {
            modules,
            workspace,
            channel,
            bridge,
        }
    }

    fn add_module(&self, name: &str, bytes: &[u8]) {
        std::fs::write(self.modules.path().join(name), bytes).expect("Failed to write module");
    }

    fn add_wat(&self, name: &str, wat: &str) {
        self.add_module(name, &wat::parse_str(wat).expect("Failed to parse WAT"));
    }

    fn options(&self, module: &str) -> ActivationOptions {
        let mut options = ActivationOptions::new(module, self.workspace.path());
        options.memory = MemoryBudget::fixed(16, false);
        options
    }

    fn workspace(&self) -> &Path {
        self.workspace.path()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stderr_lines_reach_channel_with_prefix() {
    let fixture = Fixture::new();
    fixture.add_wat("stderr.wasm", STDERR_WAT);

    let config = fixture
        .bridge
        .activate(fixture.options("stderr.wasm"))
        .await
        .expect("Activation failed");

    // The worker exits on its own, which closes the error stream.
    config.stderr.finished().await;

    assert_eq!(
        fixture.channel.lines(),
        vec!["[wasi-stderr] a", "[wasi-stderr] b", "[wasi-stderr] c"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_module_fails_activation_once() {
    let fixture = Fixture::new();
    fixture.add_module("broken.wasm", &[0xDE, 0xAD, 0xBE, 0xEF]);

    let err = fixture
        .bridge
        .activate(fixture.options("broken.wasm"))
        .await
        .expect_err("Activation should fail");
    assert!(matches!(err, Error::Load { .. }), "{err:?}");

    let lines = fixture.channel.lines();
    assert_eq!(lines.len(), 1, "{lines:?}");
    assert!(
        lines[0].starts_with("activation failed during load: "),
        "{}",
        lines[0]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_module_fails_activation() {
    let fixture = Fixture::new();

    let err = fixture
        .bridge
        .activate(fixture.options("absent.wasm"))
        .await
        .expect_err("Activation should fail");
    assert!(matches!(err, Error::Load { .. }), "{err:?}");
    assert_eq!(fixture.channel.lines().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_budget_fails_during_resource_stage() {
    let fixture = Fixture::new();
    fixture.add_wat("echo.wasm", ECHO_WAT);

    let mut options = fixture.options("echo.wasm");
    options.memory = MemoryBudget::fixed(70000, false);
    let err = fixture
        .bridge
        .activate(options)
        .await
        .expect_err("Activation should fail");
    assert!(matches!(err, Error::Resource(_)), "{err:?}");

    let lines = fixture.channel.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("activation failed during resource: "));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transport_factory_is_single_use() {
    let fixture = Fixture::new();
    fixture.add_wat("echo.wasm", ECHO_WAT);

    let config = fixture
        .bridge
        .activate(fixture.options("echo.wasm"))
        .await
        .expect("Activation failed");

    let mut transport = config.server.connect().await.expect("First connect failed");
    let err = config
        .server
        .connect()
        .await
        .err()
        .expect("Second connect should fail");
    assert!(matches!(err, Error::TransportConsumed));

    transport.write_all(b"Content-Length: 2\r\n\r\n{}").await.expect("Failed to write");
    let mut buf = vec![0u8; 23];
    transport.read_exact(&mut buf).await.expect("Failed to read");
    assert_eq!(&buf, b"Content-Length: 2\r\n\r\n{}");

    let worker = transport.worker().expect("Transport has no worker");
    assert!(worker.trace());
    assert!(worker.is_running());
    transport.close().await.expect("Close failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_options_translate_workspace_paths() {
    let fixture = Fixture::new();
    fixture.add_wat("echo.wasm", ECHO_WAT);

    let config = fixture
        .bridge
        .activate(fixture.options("echo.wasm"))
        .await
        .expect("Activation failed");

    assert!(matches!(config.server, ServerOptions::Worker(_)));
    assert!(config.client.selects("file", "proto"));

    let translator = config
        .client
        .path_translator
        .as_ref()
        .expect("No path translator");
    let host = fixture.workspace().join("foo.proto");
    assert_eq!(
        translator.to_virtual(&host),
        Path::new("/workspace/foo.proto")
    );
    assert_eq!(translator.to_host(Path::new("/workspace/foo.proto")), host);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runtime_is_shared_between_activations() {
    let fixture = Fixture::new();
    fixture.add_wat("stderr.wasm", STDERR_WAT);

    let first = fixture
        .bridge
        .activate(fixture.options("stderr.wasm"))
        .await
        .expect("First activation failed");
    let second = fixture
        .bridge
        .activate(fixture.options("stderr.wasm"))
        .await
        .expect("Second activation failed");
    first.stderr.finished().await;
    second.stderr.finished().await;

    let runtime = fixture.bridge.runtime().await.expect("No runtime");
    assert!(runtime.is_running());
    fixture.bridge.shutdown();
    assert!(!runtime.is_running());

    assert_eq!(fixture.channel.lines().len(), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_finished_worker_cannot_be_connected() {
    let fixture = Fixture::new();
    fixture.add_wat("stderr.wasm", STDERR_WAT);

    let config = fixture
        .bridge
        .activate(fixture.options("stderr.wasm"))
        .await
        .expect("Activation failed");
    config.stderr.finished().await;

    let ServerOptions::Worker(factory) = &config.server else {
        panic!("expected a worker transport");
    };
    // Give the status a moment to settle after the streams closed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let err = factory.create().err().expect("Connect should fail");
    assert!(matches!(err, Error::NotRunning));
    assert!(factory.is_consumed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_status_visible_through_transport() {
    let fixture = Fixture::new();
    fixture.add_wat("echo.wasm", ECHO_WAT);

    let config = fixture
        .bridge
        .activate(fixture.options("echo.wasm"))
        .await
        .expect("Activation failed");
    let mut transport = config.server.connect().await.expect("Connect failed");

    AsyncWriteExt::shutdown(&mut transport)
        .await
        .expect("Failed to close worker input");
    let worker = transport.worker().expect("Transport has no worker");
    let status = worker
        .wait_timeout(Duration::from_secs(10))
        .await
        .expect("Worker did not exit");
    assert_eq!(status, WorkerStatus::Exited { exit_code: 0 });
}
