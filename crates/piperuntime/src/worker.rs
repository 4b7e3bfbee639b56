use crate::store::StorageAdapter;
use async_trait::async_trait;
use pipecore::{Format, PipelineError, TargetError, TaskContext, Task, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};

/// Self-contained unit dispatched to a worker: the computation handle
/// plus its already-resolved dependency values and resource hints.
pub struct UnitOfWork {
    pub name: String,
    pub task: Arc<dyn Task>,
    pub ctx: TaskContext,
    pub format: Format,
    /// Adapter for worker-side reads and writes; required when
    /// `persist` is set or `fetch` is non-empty.
    pub store: Option<Arc<dyn StorageAdapter>>,
    /// Worker side performs the persisted write (storage locality =
    /// worker); otherwise the coordinator stores the returned value.
    pub persist: bool,
    /// Inputs the worker side retrieves itself (retrieval locality =
    /// worker): (dependency name, location, format).
    pub fetch: Vec<(String, String, Format)>,
    /// Per-unit execution timeout
    pub timeout: Option<Duration>,
    /// How long a cancelled unit may keep running before it is
    /// terminated; `None` lets it finish naturally.
    pub cancel_grace: Option<Duration>,
}

/// Completion report sent back to the coordinator.
pub struct UnitResult {
    pub name: String,
    pub outcome: Result<Value, TargetError>,
    /// Storage location when the worker side performed the write
    pub location: Option<String>,
    pub duration_ms: u64,
}

/// Bounded pool of executors the scheduler dispatches ready units to.
/// Completions are reported asynchronously on the shared result
/// channel handed in at construction.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn submit(&self, unit: UnitOfWork) -> Result<(), PipelineError>;

    /// Stop accepting work. Workers drain what they already pulled.
    fn shutdown(&self);
}

pub fn result_channel(capacity: usize) -> (mpsc::Sender<UnitResult>, mpsc::Receiver<UnitResult>) {
    mpsc::channel(capacity)
}

/// Run one unit to completion, honoring its timeout and cancellation
/// grace period, persisting worker-side when configured.
pub async fn run_unit(unit: UnitOfWork) -> UnitResult {
    let UnitOfWork {
        name,
        task,
        mut ctx,
        format,
        store,
        persist,
        fetch,
        timeout: limit,
        cancel_grace,
    } = unit;

    let start = Instant::now();
    let cancellation = ctx.cancellation.clone();

    let execute = async {
        for (dep, location, dep_format) in &fetch {
            let adapter = store
                .as_ref()
                .ok_or_else(|| TargetError::Storage("no adapter for worker retrieval".into()))?;
            let value = adapter
                .load(location, *dep_format)
                .await
                .map_err(|e| TargetError::Storage(e.to_string()))?;
            ctx.inputs.insert(dep.clone(), value);
        }
        let value = task.execute(ctx).await?;
        let location = if persist {
            let adapter = store
                .as_ref()
                .ok_or_else(|| TargetError::Storage("no adapter for worker storage".into()))?;
            Some(
                adapter
                    .store(&name, &value, format)
                    .await
                    .map_err(|e| TargetError::Storage(e.to_string()))?,
            )
        } else {
            None
        };
        Ok::<_, TargetError>((value, location))
    };

    let terminate = async {
        cancellation.cancelled().await;
        match cancel_grace {
            Some(grace) => sleep(grace).await,
            // Let the unit finish naturally.
            None => std::future::pending::<()>().await,
        }
    };

    let bounded = async {
        tokio::select! {
            result = execute => result,
            _ = terminate => Err(TargetError::Cancelled),
        }
    };

    let outcome = match limit {
        Some(limit) => match timeout(limit, bounded).await {
            Ok(result) => result,
            Err(_) => Err(TargetError::Timeout {
                seconds: limit.as_secs(),
            }),
        },
        None => bounded.await,
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let (outcome, location) = match outcome {
        Ok((value, location)) => (Ok(value), location),
        Err(e) => (Err(e), None),
    };

    UnitResult {
        name,
        outcome,
        location,
        duration_ms,
    }
}

/// Fixed pool launched once per run; each worker repeatedly pulls the
/// next ready unit from a shared queue until the run ends. Amortizes
/// worker startup cost.
pub struct PersistentPool {
    queue: std::sync::Mutex<Option<mpsc::Sender<UnitOfWork>>>,
}

impl PersistentPool {
    pub fn new(size: usize, results: mpsc::Sender<UnitResult>) -> Self {
        let (tx, rx) = mpsc::channel::<UnitOfWork>(size.max(1) * 2);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let results = results.clone();
            tokio::spawn(async move {
                tracing::debug!("Worker {worker} started");
                loop {
                    let unit = { rx.lock().await.recv().await };
                    let Some(unit) = unit else {
                        break;
                    };
                    tracing::debug!("Worker {worker} running {}", unit.name);
                    let result = run_unit(unit).await;
                    if results.send(result).await.is_err() {
                        break;
                    }
                }
                tracing::debug!("Worker {worker} stopped");
            });
        }

        Self {
            queue: std::sync::Mutex::new(Some(tx)),
        }
    }
}

#[async_trait]
impl WorkerPool for PersistentPool {
    async fn submit(&self, unit: UnitOfWork) -> Result<(), PipelineError> {
        let sender = self
            .queue
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PipelineError::WorkerUnavailable("pool shut down".to_string()))?;
        sender
            .send(unit)
            .await
            .map_err(|e| PipelineError::WorkerUnavailable(format!("queue closed: {e}")))
    }

    fn shutdown(&self) {
        self.queue.lock().unwrap().take();
    }
}

/// One worker per unit, torn down on completion. Higher isolation,
/// higher per-unit overhead.
pub struct TransientPool {
    results: std::sync::Mutex<Option<mpsc::Sender<UnitResult>>>,
}

impl TransientPool {
    pub fn new(results: mpsc::Sender<UnitResult>) -> Self {
        Self {
            results: std::sync::Mutex::new(Some(results)),
        }
    }
}

#[async_trait]
impl WorkerPool for TransientPool {
    async fn submit(&self, unit: UnitOfWork) -> Result<(), PipelineError> {
        let results = self
            .results
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PipelineError::WorkerUnavailable("pool shut down".to_string()))?;
        tokio::spawn(async move {
            let result = run_unit(unit).await;
            let _ = results.send(result).await;
        });
        Ok(())
    }

    fn shutdown(&self) {
        self.results.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecore::{EventEmitter, FnTask};
    use std::collections::HashMap;

    fn unit(name: &str, task: Arc<dyn Task>) -> UnitOfWork {
        UnitOfWork {
            name: name.to_string(),
            task,
            ctx: TaskContext {
                unit: name.to_string(),
                inputs: HashMap::new(),
                resources: HashMap::new(),
                events: EventEmitter::disconnected(name),
                cancellation: tokio_util::sync::CancellationToken::new(),
            },
            format: Format::Json,
            store: None,
            persist: false,
            fetch: Vec::new(),
            timeout: None,
            cancel_grace: None,
        }
    }

    #[tokio::test]
    async fn persistent_pool_completes_units() {
        let (tx, mut rx) = result_channel(8);
        let pool = PersistentPool::new(2, tx);

        for i in 0..4 {
            let task: Arc<dyn Task> = Arc::new(FnTask::new(move |_ctx| async move {
                Ok(Value::from(i as i64))
            }));
            pool.submit(unit(&format!("t{i}"), task)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let result = rx.recv().await.unwrap();
            assert!(result.outcome.is_ok());
            seen.push(result.name);
        }
        seen.sort();
        assert_eq!(seen, ["t0", "t1", "t2", "t3"]);

        pool.shutdown();
        assert!(pool.submit(unit("late", Arc::new(FnTask::new(|_ctx| async { Ok(Value::Null) })))).await.is_err());
    }

    #[tokio::test]
    async fn timeout_marks_unit_failed() {
        let task: Arc<dyn Task> = Arc::new(FnTask::new(|_ctx| async {
            sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }));
        let mut work = unit("slow", task);
        work.timeout = Some(Duration::from_millis(20));

        let result = run_unit(work).await;
        assert!(matches!(result.outcome, Err(TargetError::Timeout { .. })));
    }

    #[tokio::test]
    async fn cancelled_unit_terminates_after_grace() {
        let task: Arc<dyn Task> = Arc::new(FnTask::new(|_ctx| async {
            sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }));
        let mut work = unit("doomed", task);
        work.cancel_grace = Some(Duration::from_millis(10));
        work.ctx.cancellation.cancel();

        let result = run_unit(work).await;
        assert!(matches!(result.outcome, Err(TargetError::Cancelled)));
    }
}
