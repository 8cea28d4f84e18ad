use std::{
    collections::BTreeSet,
    future::Future,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use autoscale_core::{config::WorkerConfig, error::LaunchError, models::WorkerSpec};
use tokio::{process::Command, task::JoinHandle, time::timeout};
use tokio_util::task::TaskTracker;

/// Starts detached runner containers.
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Issue the launch and return without waiting for it to be accepted.
    fn launch(&self, spec: WorkerSpec) -> LaunchHandle;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutput {
    pub container_id: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub struct LaunchResult {
    pub worker: String,
    pub outcome: Result<LaunchOutput, LaunchError>,
}

/// Background launch task. Dropping the handle detaches it; the outcome is
/// still logged when the task finishes.
#[must_use]
pub struct LaunchHandle {
    worker: String,
    task: JoinHandle<LaunchResult>,
}

impl LaunchHandle {
    pub fn spawn<F>(worker: String, launch: F) -> Self
    where F: Future<Output = Result<LaunchOutput, LaunchError>> + Send + 'static {
        let task = tokio::spawn(report(worker.clone(), launch));
        Self { worker, task }
    }

    pub fn worker(&self) -> &str { &self.worker }

    /// Wait for the runtime to accept or reject the launch.
    pub async fn result(self) -> LaunchResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => LaunchResult {
                worker: self.worker,
                outcome: Err(LaunchError::Aborted(e.to_string())),
            },
        }
    }
}

async fn report<F>(name: String, launch: F) -> LaunchResult
where F: Future<Output = Result<LaunchOutput, LaunchError>> {
    let outcome = launch.await;
    match &outcome {
        Ok(output) => {
            tracing::info!("Worker {} started (container {})", name, output.container_id);
            if !output.stderr.is_empty() {
                tracing::warn!("Worker {} stderr: {}", name, output.stderr);
            }
        }
        Err(e) => tracing::error!("Failed to launch worker {}: {}", name, e),
    }
    LaunchResult { worker: name, outcome }
}

/// Keeps track of launches that have not been answered by the runtime yet,
/// so shutdown can wait for them.
#[derive(Clone, Default)]
pub struct LaunchTracker {
    tasks: TaskTracker,
    pending: Arc<Mutex<BTreeSet<String>>>,
}

impl LaunchTracker {
    pub fn new() -> Self { Self::default() }

    pub fn spawn<F>(&self, worker: String, launch: F) -> LaunchHandle
    where F: Future<Output = Result<LaunchOutput, LaunchError>> + Send + 'static {
        self.lock().insert(worker.clone());
        let tracker = self.clone();
        let name = worker.clone();
        let task = self.tasks.spawn(async move {
            let result = report(name, launch).await;
            tracker.lock().remove(&result.worker);
            result
        });
        LaunchHandle { worker, task }
    }

    /// Workers whose launch is still in progress.
    pub fn pending(&self) -> Vec<String> { self.lock().iter().cloned().collect() }

    /// Wait up to `grace` for launches in progress. Returns the workers that
    /// were still pending; their launch is lost once the runtime shuts down.
    pub async fn drain(&self, grace: Duration) -> Vec<String> {
        self.tasks.close();
        let pending = self.pending();
        if pending.is_empty() {
            return pending;
        }
        tracing::info!("Waiting for {} worker launches to finish", pending.len());
        if timeout(grace, self.tasks.wait()).await.is_ok() {
            return vec![];
        }
        let abandoned = self.pending();
        for worker in &abandoned {
            tracing::error!("Launch of worker {} abandoned at shutdown", worker);
        }
        abandoned
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Launches workers with `<runtime> run -d --rm`.
///
/// Name and token are passed through the child's environment so the token
/// never shows up in the process list.
#[derive(Clone)]
pub struct DockerLauncher {
    runtime: String,
    extra_args: Vec<String>,
    launch_timeout: Duration,
    tracker: LaunchTracker,
}

impl DockerLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            extra_args: config.extra_args.clone(),
            launch_timeout: config.launch_timeout(),
            tracker: LaunchTracker::new(),
        }
    }

    /// See [`LaunchTracker::drain`].
    pub async fn drain(&self, grace: Duration) -> Vec<String> { self.tracker.drain(grace).await }

    fn command(&self, spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.runtime);
        command
            .args(["run", "-d", "--rm", "--name", spec.name.as_str()])
            .args(spec.env().iter().flat_map(|(key, _)| ["-e", *key]))
            .args(&self.extra_args)
            .arg(&spec.image)
            .envs(spec.env())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl WorkerLauncher for DockerLauncher {
    fn launch(&self, spec: WorkerSpec) -> LaunchHandle {
        let command = self.command(&spec);
        let launch =
            run(command, self.runtime.clone(), spec.name.clone(), self.launch_timeout);
        self.tracker.spawn(spec.name, launch)
    }
}

async fn run(
    mut command: Command,
    runtime: String,
    name: String,
    launch_timeout: Duration,
) -> Result<LaunchOutput, LaunchError> {
    let output = match timeout(launch_timeout, command.output()).await {
        Ok(output) => output.map_err(|source| LaunchError::Spawn { runtime, source })?,
        Err(_) => {
            // The daemon may still create the container after the client is killed.
            remove_container(&runtime, &name, launch_timeout).await;
            return Err(LaunchError::Timeout(launch_timeout));
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        return Err(LaunchError::Exited { status: output.status.to_string(), stderr });
    }
    let container_id = stdout.lines().last().unwrap_or_default().to_string();
    Ok(LaunchOutput { container_id, stdout, stderr })
}

async fn remove_container(runtime: &str, name: &str, limit: Duration) {
    let mut command = Command::new(runtime);
    command.args(["rm", "-f", name]).stdin(Stdio::null()).kill_on_drop(true);
    match timeout(limit, command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            tracing::info!("Removed container {} after launch timeout", name)
        }
        Ok(Ok(output)) => tracing::warn!(
            "Could not remove container {} after launch timeout ({}): {}",
            name,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Ok(Err(e)) => tracing::warn!("Could not remove container {}: {}", name, e),
        Err(_) => tracing::warn!("Timed out removing container {}", name),
    }
}
