//! extask - runs a demo external task worker.
//!
//! ```text
//! extask --engine-url http://localhost:8000 --token "$TOKEN" --topic greet
//! extask --dry-run --demo-tasks 5
//! ```
//!
//! 設定は flag > 環境変数 > `.env` の順。Ctrl+C で graceful に止まる
//! （処理中の batch は report まで完了させる）。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use extask_core::impls::memory::Operation;
use extask_core::{
    BuildError, ExternalTask, ExternalTaskWorker, Handler, HandlerError, Identity, InMemoryTaskApi,
    ShutdownHandle, TaskResult, WorkerConfig, WorkerHandle,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "extask", about = "External task worker demo")]
struct Args {
    /// Engine root URL.
    #[arg(long, env = "EXTASK_ENGINE_URL", default_value = "http://localhost:8000")]
    engine_url: String,

    /// Bearer token. Omit to call the engine anonymously.
    #[arg(long, env = "EXTASK_TOKEN", hide_env_values = true)]
    token: Option<SecretString>,

    #[arg(long, env = "EXTASK_TOPIC", default_value = "greet")]
    topic: String,

    #[arg(long, env = "EXTASK_MAX_TASKS", default_value_t = 10)]
    max_tasks: u32,

    /// Long polling timeout in milliseconds.
    #[arg(long, env = "EXTASK_LONG_POLLING_TIMEOUT_MS", default_value_t = 10_000)]
    long_polling_timeout_ms: u64,

    /// Overrides EXTASK_LOCK_DURATION_MS.
    #[arg(long)]
    lock_duration_ms: Option<u64>,

    /// Overrides EXTASK_RENEWAL_BUFFER_MS.
    #[arg(long)]
    renewal_buffer_ms: Option<u64>,

    /// Fail the first N tasks to exercise service error reporting.
    #[arg(long, default_value_t = 0)]
    fail_first: u32,

    /// Run against an in-memory engine instead of HTTP.
    #[arg(long)]
    dry_run: bool,

    /// Tasks seeded into the in-memory engine with --dry-run.
    #[arg(long, default_value_t = 3)]
    demo_tasks: u32,
}

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

#[derive(Debug, Serialize)]
struct Greeting {
    message: String,
}

struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }

    /// Consume one intentional failure. Returns how many were left before this call.
    fn take_failure(&self) -> Option<u32> {
        self.remaining_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
    }
}

#[async_trait]
impl Handler<GreetPayload, Greeting> for GreetHandler {
    async fn handle(
        &self,
        task: ExternalTask<GreetPayload>,
    ) -> Result<TaskResult<Greeting>, HandlerError> {
        if let Some(left) = self.take_failure() {
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }

        if task.payload.name.trim().is_empty() {
            return Ok(TaskResult::bpmn_error("NAME_MISSING"));
        }

        info!(task_id = %task.id, name = %task.payload.name, "greeting");
        Ok(TaskResult::success(Greeting {
            message: format!("Hello, {}!", task.payload.name),
        }))
    }
}

/// Apply flag overrides on top of the environment, then validate once.
fn config_from(args: &Args, mut config: WorkerConfig) -> Result<WorkerConfig, BuildError> {
    if let Some(ms) = args.lock_duration_ms {
        config.lock_duration = Duration::from_millis(ms);
    }
    if let Some(ms) = args.renewal_buffer_ms {
        config.renewal_buffer = Duration::from_millis(ms);
    }
    config.validate()?;
    Ok(config)
}

/// Stop the worker on Ctrl+C.
fn setup_signal_handler(shutdown: ShutdownHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, finishing current batch");
                shutdown.stop();
            }
            Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
        }
    });
}

/// Stop once every seeded task has been reported.
async fn stop_when_drained(api: Arc<InMemoryTaskApi>, expected: usize, handle: WorkerHandle) {
    let shutdown = handle.shutdown_handle();
    tokio::spawn(async move {
        loop {
            let reported = [
                Operation::Finish,
                Operation::HandleBpmnError,
                Operation::HandleServiceError,
            ]
            .into_iter()
            .map(|op| api.count(op))
            .sum::<usize>();
            if reported >= expected || shutdown.is_stop_requested() {
                shutdown.stop();
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
    handle.join().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = config_from(&args, WorkerConfig::parse_env()?)?;
    let identity = match &args.token {
        Some(token) => Identity::new(token.expose_secret()),
        None => Identity::anonymous(),
    };

    let builder = ExternalTaskWorker::builder()
        .identity(identity)
        .topic(args.topic.clone())
        .max_tasks(args.max_tasks)
        .long_polling_timeout(Duration::from_millis(args.long_polling_timeout_ms))
        .config(config)
        .handler(GreetHandler::new(args.fail_first));

    if args.dry_run {
        let api = Arc::new(InMemoryTaskApi::new());
        for i in 0..args.demo_tasks {
            let name = if i % 4 == 3 { String::new() } else { format!("user-{i}") };
            api.enqueue(&args.topic, json!({ "name": name }));
        }

        let handle = builder.api(api.clone()).build()?.start();
        info!(worker_id = %handle.worker_id(), tasks = args.demo_tasks, "dry run started");
        setup_signal_handler(handle.shutdown_handle());
        stop_when_drained(api.clone(), args.demo_tasks as usize, handle).await;

        for call in api.calls() {
            info!(call = ?call.call, "engine saw");
        }
        return Ok(());
    }

    let worker = builder.engine_url(args.engine_url.clone()).build()?;
    info!(worker_id = %worker.worker_id(), engine_url = %args.engine_url, topic = %args.topic, "worker started");
    setup_signal_handler(worker.shutdown_handle());
    worker.run().await;
    info!("worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use extask_core::app::config::{ENV_LOCK_DURATION_MS, ENV_RENEWAL_BUFFER_MS};

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["extask"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn flags_override_env_before_validation() {
        let env = WorkerConfig::parse_lookup(|name: &str| {
            (name == ENV_RENEWAL_BUFFER_MS).then(|| "40000".to_string())
        })
        .unwrap();

        let config = config_from(&args(&["--lock-duration-ms", "60000"]), env).unwrap();
        assert_eq!(config.lock_duration, Duration::from_secs(60));
        assert_eq!(config.renewal_buffer, Duration::from_secs(40));
    }

    #[test]
    fn invalid_final_config_is_rejected() {
        let env = WorkerConfig::parse_lookup(|name: &str| {
            (name == ENV_LOCK_DURATION_MS).then(|| "10000".to_string())
        })
        .unwrap();

        let result = config_from(&args(&["--renewal-buffer-ms", "10000"]), env);
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_never_underflow() {
        let handler = Arc::new(GreetHandler::new(3));
        let mut joins = Vec::new();
        for _ in 0..64 {
            let handler = handler.clone();
            joins.push(tokio::spawn(async move { handler.take_failure() }));
        }

        let mut taken = 0;
        for join in joins {
            if join.await.unwrap().is_some() {
                taken += 1;
            }
        }
        assert_eq!(taken, 3);
        assert_eq!(handler.remaining_failures.load(Ordering::Acquire), 0);
        assert_eq!(handler.take_failure(), None);
    }

    #[tokio::test]
    async fn failures_come_first_then_greetings() {
        let handler = GreetHandler::new(1);
        let task = || ExternalTask::new("task-1", "greet", GreetPayload { name: "ada".into() });

        assert!(handler.handle(task()).await.is_err());
        let result = handler.handle(task()).await.unwrap();
        assert!(matches!(
            result,
            TaskResult::Success { payload: Greeting { ref message } } if message == "Hello, ada!"
        ));
    }
}
