//! End-to-end proxy scenarios: a proxy routing client requests to the
//! lowest-id live server, with liveness supplied by a monitor and a
//! failure detector.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::expect_output;
use common::proxy::{client_ctx, proxy_constants, proxy_ctx, server_ctx};
use mpcal_runtime::context::{ArchetypeContext, ContextHandle};
use mpcal_runtime::error::Result;
use mpcal_runtime::monitor::{Monitor, MonitorConfig};
use mpcal_tla::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const NUM_REQUESTS: usize = 10;

async fn start_monitor() -> Arc<Monitor> {
    let monitor = Arc::new(
        Monitor::bind("127.0.0.1:0", MonitorConfig {
            window: Duration::from_secs(1),
        })
        .await
        .unwrap(),
    );
    let server = Arc::clone(&monitor);
    tokio::spawn(async move {
        server.serve().await.unwrap();
    });
    monitor
}

fn spawn_under_monitor(
    monitor: &Arc<Monitor>,
    mut ctx: ArchetypeContext,
) -> JoinHandle<Result<()>> {
    let monitor = Arc::clone(monitor);
    tokio::spawn(async move { monitor.run_archetype(&mut ctx).await })
}

fn spawn_ctx(mut ctx: ArchetypeContext) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { ctx.run().await })
}

async fn shutdown(handles: Vec<ContextHandle>, tasks: Vec<JoinHandle<Result<()>>>) {
    for handle in &handles {
        handle.close();
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

struct ClientHarness {
    input: mpsc::Sender<Value>,
    output: mpsc::Receiver<Value>,
}

impl ClientHarness {
    async fn submit_round(&mut self, expected_body: &Value) {
        for i in 0..NUM_REQUESTS {
            self.input
                .send(Value::number(i64::try_from(i).unwrap()))
                .await
                .unwrap();
        }
        for _ in 0..NUM_REQUESTS {
            let response = expect_output(&mut self.output).await;
            assert_eq!(&response.dot("body").unwrap(), expected_body);
        }
    }
}

/// Start servers with the given ids plus one proxy and one client.
async fn start_system(
    base_port: u16,
    server_ids: &[i64],
    monitor: &Arc<Monitor>,
) -> (ClientHarness, Vec<ContextHandle>, Vec<JoinHandle<Result<()>>>) {
    let constants = proxy_constants(2, 1);
    let mut handles = Vec::new();
    let mut tasks = Vec::new();

    for &sid in server_ids {
        let (ctx, handle) = server_ctx(sid, base_port, &constants);
        handles.push(handle);
        tasks.push(spawn_under_monitor(monitor, ctx));
    }

    let (proxy, proxy_handle) =
        proxy_ctx(4, base_port, monitor.local_addr().to_string(), &constants);
    handles.push(proxy_handle);
    tasks.push(spawn_ctx(proxy));

    let (input_tx, input_rx) = mpsc::channel(NUM_REQUESTS);
    let (output_tx, output_rx) = mpsc::channel(NUM_REQUESTS);
    let (client, client_handle) = client_ctx(3, base_port, input_rx, output_tx, &constants);
    handles.push(client_handle);
    tasks.push(spawn_ctx(client));

    // Let listeners bind and liveness registration settle before driving
    // traffic.
    tokio::time::sleep(Duration::from_millis(300)).await;

    (
        ClientHarness {
            input: input_tx,
            output: output_rx,
        },
        handles,
        tasks,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_all_servers_running() {
    let monitor = start_monitor().await;
    let (mut client, handles, tasks) = start_system(21100, &[1, 2], &monitor).await;

    // The proxy prefers the lowest-id live server.
    client.submit_round(&Value::number(1)).await;

    shutdown(handles, tasks).await;
    monitor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_second_server_only() {
    let monitor = start_monitor().await;
    let (mut client, handles, tasks) = start_system(21200, &[2], &monitor).await;

    // Server 1 was never started: the failure detector reports it
    // suspected and the proxy falls through to server 2.
    client.submit_round(&Value::number(2)).await;

    shutdown(handles, tasks).await;
    monitor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_no_servers() {
    let monitor = start_monitor().await;
    let (mut client, handles, tasks) = start_system(21300, &[], &monitor).await;

    // No live server: every request is answered with the FAIL constant.
    client.submit_round(&Value::number(100)).await;

    shutdown(handles, tasks).await;
    monitor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_first_server_crashing() {
    let monitor = start_monitor().await;
    let (mut client, mut handles, mut tasks) = start_system(21400, &[1, 2], &monitor).await;

    client.submit_round(&Value::number(1)).await;

    // Crash server 1 and wait for it to fully stop; the monitor drops its
    // liveness mark the moment its run ends.
    handles.remove(0).close();
    tasks.remove(0).await.unwrap().unwrap();

    // The failure detector needs at most a poll interval or two to flip;
    // in the meantime the proxy's writes to the dead server abort and
    // retry, so no request is lost.
    client.submit_round(&Value::number(2)).await;

    shutdown(handles, tasks).await;
    monitor.close();
}
