//! The management-API seam and the two waiting primitives built on it.
//!
//! Every mutating call on [`Hypervisor`] submits a remote task and returns
//! its [`TaskRef`]; [`wait_for_task`] blocks until that task is terminal.
//! [`poll_until`] is the underlying tick/deadline race, also used directly
//! for the guest-tools readiness wait.
//!
//! ```text
//! submit (register_vm, clone_vm, ...)  ──►  TaskRef
//!                                            │
//!                 wait_for_task ──► poll_until(tick, deadline, task_state)
//!                                            │
//!                                  Succeeded(result) | Failed(msg)
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PublishError, Result};

// ---------------------------------------------------------------------------
// Managed object references
// ---------------------------------------------------------------------------

macro_rules! object_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

object_ref!(DatacenterRef);
object_ref!(FolderRef);
object_ref!(ResourcePoolRef);
object_ref!(
    /// A virtual machine (or template) known to the hypervisor.
    VmRef
);
object_ref!(TaskRef);

/// Where a new VM lands in the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub datacenter: DatacenterRef,
    pub folder: FolderRef,
    pub resource_pool: ResourcePoolRef,
}

/// Observed state of a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    /// Finished; `result` carries the produced object id when there is one.
    Succeeded { result: Option<String> },
    Failed { message: String },
}

// ---------------------------------------------------------------------------
// The seam
// ---------------------------------------------------------------------------

/// Operations the lifecycle needs from the hypervisor's management endpoint.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn datacenter(&self, name: &str) -> Result<DatacenterRef>;
    async fn folder(&self, datacenter: &DatacenterRef, name: &str) -> Result<FolderRef>;
    /// Resolve a resource pool by name, or the root pool of `cluster`, or the
    /// datacenter's only root pool when both are `None`.
    async fn resource_pool(
        &self,
        datacenter: &DatacenterRef,
        cluster: Option<&str>,
        pool: Option<&str>,
    ) -> Result<ResourcePoolRef>;

    async fn register_vm(
        &self,
        datastore_path: &str,
        name: &str,
        placement: &Placement,
    ) -> Result<TaskRef>;
    async fn clone_vm(&self, source: &VmRef, name: &str, placement: &Placement)
    -> Result<TaskRef>;
    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef>;
    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef>;
    async fn mark_as_template(&self, vm: &VmRef) -> Result<TaskRef>;
    async fn destroy(&self, vm: &VmRef) -> Result<TaskRef>;

    async fn tools_running(&self, vm: &VmRef) -> Result<bool>;
    async fn task_state(&self, task: &TaskRef) -> Result<TaskState>;
}

// ---------------------------------------------------------------------------
// Waiting primitives
// ---------------------------------------------------------------------------

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub tick: Duration,
    /// `None` waits until the check settles.
    pub deadline: Option<Duration>,
}

impl WaitPolicy {
    pub fn unbounded(tick: Duration) -> Self {
        Self {
            tick,
            deadline: None,
        }
    }

    pub fn bounded(tick: Duration, deadline: Duration) -> Self {
        Self {
            tick,
            deadline: Some(deadline),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    DeadlineElapsed,
}

/// Call `check` once per tick until it yields a value or the deadline passes.
///
/// The first check runs immediately. The cadence is fixed. The deadline also
/// cuts short a check that is still in flight, and when it is ready together
/// with a tick the deadline wins. A check error ends the poll.
pub async fn poll_until<T, F, Fut>(policy: WaitPolicy, mut check: F) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = async {
        match policy.deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    let polling = async {
        // `interval` panics on a zero period.
        let mut ticker = tokio::time::interval(policy.tick.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(value) = check().await? {
                return Ok::<T, PublishError>(value);
            }
        }
    };

    tokio::select! {
        biased;

        _ = deadline => Ok(PollOutcome::DeadlineElapsed),
        value = polling => value.map(PollOutcome::Ready),
    }
}

/// Block until `task` reaches a terminal state.
///
/// Returns the task's result id on success. A failed task becomes
/// [`PublishError::RemoteTask`].
pub async fn wait_for_task(
    hypervisor: &dyn Hypervisor,
    task: &TaskRef,
    operation: &str,
    policy: WaitPolicy,
) -> Result<Option<String>> {
    let outcome = poll_until(policy, || async move {
        match hypervisor.task_state(task).await {
            Ok(TaskState::Queued | TaskState::Running) => {
                debug!(task = %task, operation, "Task still in progress");
                Ok(None)
            }
            Ok(TaskState::Succeeded { result }) => Ok(Some(Ok(result))),
            Ok(TaskState::Failed { message }) => Ok(Some(Err(message))),
            Err(e) => Err(e),
        }
    })
    .await?;

    match outcome {
        PollOutcome::Ready(Ok(result)) => Ok(result),
        PollOutcome::Ready(Err(message)) => Err(PublishError::RemoteTask {
            operation: operation.to_string(),
            message,
        }),
        PollOutcome::DeadlineElapsed => Err(PublishError::RemoteTask {
            operation: operation.to_string(),
            message: format!("no terminal state within {:?}", policy.deadline),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
