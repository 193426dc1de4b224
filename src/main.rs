#[cfg(feature = "web")]
mod healthz;
#[cfg(feature = "web")]
mod metrics;
mod settings;
mod startup;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use crate::settings::{max_web_workers, Settings};
use crate::startup::{setup_logger, setup_panic_hook};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// query-node is the compute tier of a distributed vector search cluster:
/// it ingests one collection's change stream, serves gated similarity
/// search over the segments it currently owns, and takes part in the
/// cluster's segment handoff protocol.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file, without extension (e.g. "config/config").
    #[arg(long, value_name = "PATH")]
    config_path: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::new(args.config_path.clone()).expect("Can't read config.");
    settings.validate_and_warn();

    setup_logger(&settings.log_level);
    setup_panic_hook();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Can't create runtime.");
    let runtime_handle = runtime.handle().clone();

    let node = storage::NodeLifecycle::init(
        settings.node.task_queue_capacity,
        Duration::from_secs(settings.node.graceful_stop_timeout_sec),
    );

    log::info!(
        "query node {} starting, grpc {}:{}",
        settings.node.node_id,
        settings.service.host,
        settings.service.grpc_port
    );

    // The Watch/Load handlers that populate flow graphs, shard clusters and
    // query collections arrive over the RPC surface (spec.md §6.3), which is
    // out of scope here; this binary only owns the node's own lifecycle and
    // its healthz/metrics edge.
    node.register();

    let mut handles = Vec::new();

    #[cfg(feature = "web")]
    {
        let node = node.clone();
        let settings = settings.clone();
        let handle = thread::Builder::new()
            .name("web".to_string())
            .spawn(move || run_web_server(node, settings))
            .expect("Can't spawn web thread.");
        handles.push(handle);
    }

    #[cfg(feature = "service_debug")]
    {
        use std::fmt::Write;

        use parking_lot::deadlock;

        const DEADLOCK_CHECK_PERIOD: Duration = Duration::from_secs(10);

        thread::Builder::new()
            .name("deadlock_checker".to_string())
            .spawn(move || loop {
                thread::sleep(DEADLOCK_CHECK_PERIOD);
                let deadlocks = deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }

                let mut error = format!("{} deadlocks detected\n", deadlocks.len());
                for (i, threads) in deadlocks.iter().enumerate() {
                    writeln!(error, "Deadlock #{i}").expect("fail to writeln!");
                    for t in threads {
                        writeln!(error, "Thread Id {:#?}\n{:#?}", t.thread_id(), t.backtrace())
                            .expect("fail to writeln!");
                    }
                }
                log::error!("{error}");
            })
            .expect("Can't spawn deadlock checker thread.");
    }

    runtime_handle.block_on(wait_for_shutdown_signal());
    log::info!("shutdown signal received, stopping node");
    runtime_handle.block_on(node.stop());

    for handle in handles {
        handle.join().expect("Couldn't join on a service thread.");
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl-c.");
}

#[cfg(feature = "web")]
fn run_web_server(node: Arc<storage::NodeLifecycle>, settings: Settings) {
    use actix_web::{web, App, HttpServer};

    let Some(http_port) = settings.service.http_port else {
        log::info!("HTTP healthz/metrics endpoint disabled");
        return;
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Can't create web runtime.");

    let workers = max_web_workers(&settings);
    let host = settings.service.host.clone();

    runtime.block_on(async move {
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(node.clone()))
                .configure(healthz::config_healthz_api)
                .configure(metrics::config_metrics_api)
        })
        .workers(workers)
        .bind((host.as_str(), http_port));

        match server {
            Ok(server) => {
                if let Err(err) = server.run().await {
                    log::error!("web server exited with an error: {err}");
                }
            }
            Err(err) => log::error!("failed to bind web server on {host}:{http_port}: {err}"),
        }
    });
}
