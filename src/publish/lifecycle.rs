//! Template lifecycle on the hypervisor.
//!
//! [`run_lifecycle`] resolves where the VM goes, then walks
//! [`LifecycleMachine`]: for each state it submits the matching remote task,
//! blocks until the task is terminal and dispatches the completion event.
//! Nothing is rolled back on failure. The only compensating action is the
//! forced power-off after the guest-tools deadline.

use std::path::Path;

use statig::prelude::*;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::PublishConfig;
use crate::error::{PublishError, Result};
use crate::publish::hypervisor::{
    Hypervisor, Placement, PollOutcome, TaskRef, VmRef, WaitPolicy, poll_until, wait_for_task,
};
use crate::publish::VmNames;
use crate::state_machine::lifecycle_sm::{LifecycleEvent, LifecycleMachine, State};

/// Final remote state of a successful lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateOutcome {
    /// Name of the VM that was marked as template.
    pub template_name: String,
    pub template: VmRef,
    /// The registered VM that was destroyed after cloning, if any.
    pub destroyed: Option<String>,
}

/// Datastore path of the uploaded descriptor, e.g. `[ds1] templates/box.vmx`.
pub fn datastore_path(config: &PublishConfig, vmx: &Path) -> String {
    let file = vmx
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("[{}] {}/{}", config.datastore, config.vm_folder, file)
}

/// Look up the datacenter, inventory folder and resource pool.
pub async fn resolve_placement(
    hypervisor: &dyn Hypervisor,
    config: &PublishConfig,
) -> Result<Placement> {
    let datacenter = hypervisor.datacenter(&config.datacenter).await?;
    let folder = hypervisor.folder(&datacenter, &config.vm_folder).await?;
    let resource_pool = hypervisor
        .resource_pool(
            &datacenter,
            config.cluster.as_deref(),
            config.resource_pool.as_deref(),
        )
        .await?;
    info!(
        datacenter = %datacenter,
        folder = %folder,
        resource_pool = %resource_pool,
        "Resolved placement"
    );
    Ok(Placement {
        datacenter,
        folder,
        resource_pool,
    })
}

/// Register the uploaded descriptor and turn it into a template.
pub async fn run_lifecycle(
    hypervisor: &dyn Hypervisor,
    config: &PublishConfig,
    names: &VmNames,
    datastore_path: &str,
) -> Result<TemplateOutcome> {
    let placement = resolve_placement(hypervisor, config).await?;
    let task_wait = WaitPolicy::unbounded(config.timeouts.task_poll);

    // Submit a task and block on it. Keeps exactly one task outstanding.
    let run = |task: TaskRef, operation: String| async move {
        info!(task = %task, operation = %operation, "Task submitted");
        let result = wait_for_task(hypervisor, &task, &operation, task_wait).await?;
        info!(operation = %operation, "Task completed");
        Ok::<_, PublishError>(result)
    };

    let mut sm = LifecycleMachine::new(names.registered.clone(), config.clone_required())
        .state_machine();

    let mut original: Option<VmRef> = None;
    let mut clone: Option<VmRef> = None;
    let mut destroyed = None;
    // The guest-tools deadline runs from the power-on request, not its completion.
    let mut tools_deadline: Option<Instant> = None;

    loop {
        let state = sm.state().clone();
        let event = match state {
            State::Registering {} => {
                let task = hypervisor
                    .register_vm(datastore_path, &names.registered, &placement)
                    .await?;
                let vm = run(task, format!("register {}", names.registered)).await?;
                original = Some(produced_vm("register", vm)?);
                LifecycleEvent::Registered
            }
            State::Cloning {} => {
                let source = expect_vm(&original, "registered")?;
                let task = hypervisor.clone_vm(source, &names.clone, &placement).await?;
                let vm = run(task, format!("clone {} to {}", names.registered, names.clone)).await?;
                clone = Some(produced_vm("clone", vm)?);
                LifecycleEvent::Cloned
            }
            State::PoweringOn {} => {
                let vm = expect_vm(&clone, "clone")?;
                tools_deadline = Some(Instant::now() + config.timeouts.guest_tools);
                let task = hypervisor.power_on(vm).await?;
                run(task, format!("power on {}", names.clone)).await?;
                LifecycleEvent::PoweredOn
            }
            State::AwaitingGuestTools {} => {
                let vm = expect_vm(&clone, "clone")?;
                let remaining = tools_deadline
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(config.timeouts.guest_tools);
                let policy = WaitPolicy::bounded(config.timeouts.guest_tools_poll, remaining);
                let outcome = poll_until(policy, || async move {
                    match hypervisor.tools_running(vm).await {
                        Ok(true) => Ok(Some(())),
                        Ok(false) => Ok(None),
                        Err(e) => Err(e),
                    }
                })
                .await?;
                match outcome {
                    PollOutcome::Ready(()) => {
                        info!(vm = %names.clone, "Guest tools running");
                        LifecycleEvent::ToolsReady
                    }
                    PollOutcome::DeadlineElapsed => LifecycleEvent::ToolsTimedOut,
                }
            }
            State::PoweringOff {} | State::ForcingPowerOff {} => {
                let vm = expect_vm(&clone, "clone")?;
                let task = hypervisor.power_off(vm).await?;
                run(task, format!("power off {}", names.clone)).await?;
                LifecycleEvent::PoweredOff
            }
            State::MarkingTemplate {} => {
                let (vm, name) = match &clone {
                    Some(vm) => (vm, &names.clone),
                    None => (expect_vm(&original, "registered")?, &names.registered),
                };
                let task = hypervisor.mark_as_template(vm).await?;
                run(task, format!("mark {name} as template")).await?;
                LifecycleEvent::MarkedTemplate
            }
            State::DestroyingOriginal {} => {
                let vm = expect_vm(&original, "registered")?;
                let task = hypervisor.destroy(vm).await?;
                run(task, format!("destroy {}", names.registered)).await?;
                destroyed = Some(names.registered.clone());
                LifecycleEvent::OriginalDestroyed
            }
            State::Done {} => {
                let (template, template_name) = match clone {
                    Some(vm) => (vm, names.clone.clone()),
                    None => (
                        expect_vm(&original, "registered")?.clone(),
                        names.registered.clone(),
                    ),
                };
                return Ok(TemplateOutcome {
                    template_name,
                    template,
                    destroyed,
                });
            }
            State::TimedOut {} => {
                warn!(
                    vm = %names.clone,
                    waited = ?config.timeouts.guest_tools,
                    "Clone left powered off after guest tools timeout"
                );
                return Err(PublishError::GuestToolsTimeout {
                    vm: names.clone.clone(),
                    waited: config.timeouts.guest_tools,
                });
            }
        };
        sm.handle(&event);
    }
}

fn produced_vm(operation: &str, result: Option<String>) -> Result<VmRef> {
    result.map(VmRef).ok_or_else(|| PublishError::RemoteTask {
        operation: operation.to_string(),
        message: "task succeeded without returning a VM".into(),
    })
}

fn expect_vm<'a>(vm: &'a Option<VmRef>, which: &str) -> Result<&'a VmRef> {
    vm.as_ref().ok_or_else(|| PublishError::NotFound {
        kind: "vm",
        name: format!("{which} VM"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
