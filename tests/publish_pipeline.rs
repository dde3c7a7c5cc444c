//! End-to-end pipeline tests against in-process fakes.
//!
//! The converter, the datastore and vCenter are replaced by fakes that record
//! every call, so the full stage sequence runs without ovftool or a network:
//!
//! - `FakeRunner` writes the files ovftool would produce
//! - `FakeUploader` records uploaded file names
//! - `FakeHypervisor` completes tasks at once unless told to stall or fail
//!   one, and scripts guest tools
//!
//! Time-dependent cases run with a paused clock.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;
use url::Url;

use vsphere_publish::artifact::{Artifact, BUILDER_ID};
use vsphere_publish::config::{PublishConfig, RawConfig};
use vsphere_publish::error::{PublishError, Result, Stage};
use vsphere_publish::publish::Publisher;
use vsphere_publish::publish::converter::{OVFTOOL, ToolRunner};
use vsphere_publish::publish::descriptor::Descriptor;
use vsphere_publish::publish::hypervisor::{
    DatacenterRef, FolderRef, Hypervisor, Placement, ResourcePoolRef, TaskRef, TaskState, VmRef,
};
use vsphere_publish::publish::upload::{DatastoreUploader, Progress};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const BUILT_VMX: &str = r#".encoding = "UTF-8"
config.version = "8"
virtualhw.version = "10"
displayName = "box"
guestOS = "other-64"
scsi0:0.present = "TRUE"
scsi0:0.fileName = "box-disk1.vmdk"
floppy0.present = "TRUE"
floppy0.fileName = "/dev/fd0"
ethernet0.present = "TRUE"
ethernet0.connectionType = "nat"
ide1:0.present = "TRUE"
ide1:0.deviceType = "cdrom-image"
"#;

fn raw_config(dir: &Path) -> RawConfig {
    RawConfig {
        datacenter: Some("dc1".into()),
        host: Some("vcenter.local".into()),
        username: Some("admin".into()),
        password: Some("secret".into()),
        datastore: Some("ds1".into()),
        vm_folder: Some("templates".into()),
        output_dir: Some(dir.join("export")),
        ..RawConfig::default()
    }
}

fn config(raw: RawConfig) -> PublishConfig {
    PublishConfig::from_raw(raw).expect("valid config")
}

fn ova_artifact(dir: &Path) -> Artifact {
    let ova = dir.join("box.ova");
    std::fs::write(&ova, b"package").unwrap();
    Artifact::new("mitchellh.virtualbox", vec![ova])
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Stands in for ovftool and the repository command.
#[derive(Default)]
struct FakeRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeRunner {
    fn programs(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    fn ovftool_runs(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == OVFTOOL)
            .count()
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[String], label: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        if program == OVFTOOL && label.starts_with("import") {
            let vmx = PathBuf::from(args.last().unwrap());
            std::fs::write(&vmx, BUILT_VMX).unwrap();
            std::fs::write(vmx.with_file_name("box-disk1.vmdk"), b"disk").unwrap();
        } else if program == OVFTOOL && label.starts_with("export") {
            std::fs::write(args.last().unwrap(), b"exported").unwrap();
        }
        Ok(format!("{label}: done\n"))
    }
}

#[derive(Default)]
struct FakeUploader {
    uploaded: Mutex<Vec<String>>,
}

#[async_trait]
impl DatastoreUploader for FakeUploader {
    async fn upload(&self, url: &Url, file: &Path, progress: Progress<'_>) -> Result<u64> {
        assert!(file.is_file(), "uploading missing file {}", file.display());
        let name = url.path_segments().unwrap().last().unwrap().to_string();
        self.uploaded.lock().unwrap().push(name);
        let size = std::fs::metadata(file).unwrap().len();
        progress(size, size);
        Ok(size)
    }
}

/// A submitted task: what it ends as and when.
struct FakeTask {
    outcome: std::result::Result<Option<String>, String>,
    done_at: Instant,
}

/// vCenter stand-in. Every task succeeds immediately unless configured
/// otherwise. Guest tools start running on the `tools_ready_on`-th query, or
/// never.
struct FakeHypervisor {
    calls: Mutex<Vec<String>>,
    tasks: Mutex<Vec<FakeTask>>,
    tools_queries: Mutex<usize>,
    tools_ready_on: Option<usize>,
    power_on_takes: Duration,
    tools_query_hangs: Option<Duration>,
    failing: Option<&'static str>,
    powered_on_at: Mutex<Option<Instant>>,
    powered_off_at: Mutex<Option<Instant>>,
}

impl FakeHypervisor {
    fn new(tools_ready_on: Option<usize>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            tools_queries: Mutex::new(0),
            tools_ready_on,
            power_on_takes: Duration::ZERO,
            tools_query_hangs: None,
            failing: None,
            powered_on_at: Mutex::new(None),
            powered_off_at: Mutex::new(None),
        }
    }

    /// Power-on tasks report `Running` for `d` before succeeding.
    fn slow_power_on(mut self, d: Duration) -> Self {
        self.power_on_takes = d;
        self
    }

    /// Every guest tools query blocks for `d` before answering.
    fn hung_tools_query(mut self, d: Duration) -> Self {
        self.tools_query_hangs = Some(d);
        self
    }

    /// Tasks of `kind` end in `Failed`.
    fn failing(mut self, kind: &'static str) -> Self {
        self.failing = Some(kind);
        self
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn task(&self, kind: &str, result: Option<&str>) -> TaskRef {
        let takes = if kind == "power_on" {
            self.power_on_takes
        } else {
            Duration::ZERO
        };
        let outcome = if self.failing == Some(kind) {
            Err(format!("{kind} rejected by host"))
        } else {
            Ok(result.map(str::to_owned))
        };
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(FakeTask {
            outcome,
            done_at: Instant::now() + takes,
        });
        TaskRef(format!("task-{}", tasks.len() - 1))
    }

    /// Calls except the task-state polls.
    fn operations(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.starts_with("task_state") && !c.starts_with("tools_running"))
            .cloned()
            .collect()
    }

    fn tools_queries(&self) -> usize {
        *self.tools_queries.lock().unwrap()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn datacenter(&self, name: &str) -> Result<DatacenterRef> {
        self.record(format!("datacenter {name}"));
        Ok(DatacenterRef("datacenter-1".into()))
    }

    async fn folder(&self, _: &DatacenterRef, name: &str) -> Result<FolderRef> {
        self.record(format!("folder {name}"));
        Ok(FolderRef("group-v1".into()))
    }

    async fn resource_pool(
        &self,
        _: &DatacenterRef,
        cluster: Option<&str>,
        pool: Option<&str>,
    ) -> Result<ResourcePoolRef> {
        self.record(format!("resource_pool {cluster:?} {pool:?}"));
        Ok(ResourcePoolRef("resgroup-1".into()))
    }

    async fn register_vm(&self, path: &str, name: &str, _: &Placement) -> Result<TaskRef> {
        self.record(format!("register {path} as {name}"));
        Ok(self.task("register", Some("vm-1")))
    }

    async fn clone_vm(&self, source: &VmRef, name: &str, _: &Placement) -> Result<TaskRef> {
        self.record(format!("clone {source} to {name}"));
        Ok(self.task("clone", Some("vm-2")))
    }

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef> {
        self.record(format!("power_on {vm}"));
        *self.powered_on_at.lock().unwrap() = Some(Instant::now());
        Ok(self.task("power_on", None))
    }

    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef> {
        self.record(format!("power_off {vm}"));
        *self.powered_off_at.lock().unwrap() = Some(Instant::now());
        Ok(self.task("power_off", None))
    }

    async fn mark_as_template(&self, vm: &VmRef) -> Result<TaskRef> {
        self.record(format!("mark_as_template {vm}"));
        Ok(self.task("mark_as_template", None))
    }

    async fn destroy(&self, vm: &VmRef) -> Result<TaskRef> {
        self.record(format!("destroy {vm}"));
        Ok(self.task("destroy", None))
    }

    async fn tools_running(&self, vm: &VmRef) -> Result<bool> {
        self.record(format!("tools_running {vm}"));
        let running = {
            let mut queries = self.tools_queries.lock().unwrap();
            *queries += 1;
            self.tools_ready_on.is_some_and(|n| *queries >= n)
        };
        if let Some(d) = self.tools_query_hangs {
            tokio::time::sleep(d).await;
        }
        Ok(running)
    }

    async fn task_state(&self, task: &TaskRef) -> Result<TaskState> {
        self.record(format!("task_state {task}"));
        let index: usize = task.0.trim_start_matches("task-").parse().unwrap();
        let tasks = self.tasks.lock().unwrap();
        let task = &tasks[index];
        if Instant::now() < task.done_at {
            return Ok(TaskState::Running);
        }
        Ok(match &task.outcome {
            Ok(result) => TaskState::Succeeded {
                result: result.clone(),
            },
            Err(message) => TaskState::Failed {
                message: message.clone(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fully_stripped_image_is_templated_without_clone() {
    let dir = TempDir::new().unwrap();
    let config = config(RawConfig {
        remove_floppy: true,
        remove_ethernet: true,
        remove_optical_drive: true,
        hardware_version: Some("13".into()),
        guest_os_type: Some("ubuntu-64".into()),
        ..raw_config(dir.path())
    });
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(Some(1));

    let published = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap();

    assert_eq!(published.builder_id, BUILDER_ID);
    assert_eq!(published.name, "box");
    assert!(published.files.is_empty());

    let vmx = Descriptor::load(&dir.path().join("box.vmx")).unwrap();
    assert_eq!(vmx.get("floppy0.present"), Some("FALSE"));
    assert_eq!(vmx.get("floppy0.fileName"), None);
    assert_eq!(vmx.get("ethernet0.present"), Some("FALSE"));
    assert_eq!(vmx.get("ethernet0.connectionType"), None);
    assert_eq!(vmx.get("ide1:0.present"), Some("FALSE"));
    assert_eq!(vmx.get("virtualhw.version"), Some("13"));
    assert_eq!(vmx.get("guestos"), Some("ubuntu-64"));

    assert_eq!(
        *uploader.uploaded.lock().unwrap(),
        vec!["box-disk1.vmdk".to_string(), "box.vmx".to_string()]
    );
    assert_eq!(
        hypervisor.operations(),
        vec![
            "datacenter dc1",
            "folder templates",
            "resource_pool None None",
            "register [ds1] templates/box.vmx as box",
            "mark_as_template vm-1",
        ]
    );
    assert_eq!(hypervisor.tools_queries(), 0);
    assert_eq!(runner.programs(), vec![OVFTOOL.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn clone_is_power_cycled_and_original_destroyed() {
    let dir = TempDir::new().unwrap();
    let config = config(RawConfig {
        template_prefix: Some("ci-".into()),
        ..raw_config(dir.path())
    });
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(Some(3));

    let published = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap();

    assert_eq!(published.name, "ci-box-template");
    assert_eq!(
        hypervisor.operations(),
        vec![
            "datacenter dc1",
            "folder templates",
            "resource_pool None None",
            "register [ds1] templates/box.vmx as ci-box",
            "clone vm-1 to ci-box-template",
            "power_on vm-2",
            "power_off vm-2",
            "mark_as_template vm-2",
            "destroy vm-1",
        ]
    );
    assert_eq!(hypervisor.tools_queries(), 3);

    // Queries at 0 ms, 500 ms and 1000 ms.
    let on = hypervisor.powered_on_at.lock().unwrap().unwrap();
    let off = hypervisor.powered_off_at.lock().unwrap().unwrap();
    assert_eq!(off - on, Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn guest_tools_timeout_forces_power_off() {
    let dir = TempDir::new().unwrap();
    let config = config(raw_config(dir.path()));
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(None);

    let err = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Lifecycle);
    match &err.source {
        PublishError::GuestToolsTimeout { vm, waited } => {
            assert_eq!(vm, "box-template");
            assert_eq!(*waited, Duration::from_secs(300));
        }
        other => panic!("unexpected error: {other}"),
    }

    let on = hypervisor.powered_on_at.lock().unwrap().unwrap();
    let off = hypervisor.powered_off_at.lock().unwrap().unwrap();
    assert_eq!(off - on, Duration::from_secs(300));

    let ops = hypervisor.operations();
    assert_eq!(ops.last().map(String::as_str), Some("power_off vm-2"));
    assert!(!ops.iter().any(|c| c.starts_with("mark_as_template")));
    assert!(!ops.iter().any(|c| c.starts_with("destroy")));
    // One query per 500 ms tick before the deadline, starting at zero.
    assert_eq!(hypervisor.tools_queries(), 600);
}

#[tokio::test(start_paused = true)]
async fn slow_power_on_counts_against_guest_tools_deadline() {
    let dir = TempDir::new().unwrap();
    let config = config(raw_config(dir.path()));
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(None).slow_power_on(Duration::from_secs(200));

    let err = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap_err();

    assert!(matches!(err.source, PublishError::GuestToolsTimeout { .. }));
    let on = hypervisor.powered_on_at.lock().unwrap().unwrap();
    let off = hypervisor.powered_off_at.lock().unwrap().unwrap();
    assert_eq!(off - on, Duration::from_secs(300));
    // Only the last 100 s are left for guest tools: one query per 500 ms.
    assert_eq!(hypervisor.tools_queries(), 200);
}

#[tokio::test(start_paused = true)]
async fn hung_tools_query_still_forces_power_off_on_time() {
    let dir = TempDir::new().unwrap();
    let config = config(raw_config(dir.path()));
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(Some(1)).hung_tools_query(Duration::from_secs(3600));

    let err = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Lifecycle);
    assert!(matches!(err.source, PublishError::GuestToolsTimeout { .. }));
    let on = hypervisor.powered_on_at.lock().unwrap().unwrap();
    let off = hypervisor.powered_off_at.lock().unwrap().unwrap();
    assert_eq!(off - on, Duration::from_secs(300));
    assert_eq!(hypervisor.tools_queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_clone_stops_the_lifecycle_and_keeps_the_registered_vm() {
    let dir = TempDir::new().unwrap();
    let config = config(raw_config(dir.path()));
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(Some(1)).failing("clone");

    let err = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Lifecycle);
    match &err.source {
        PublishError::RemoteTask { operation, message } => {
            assert_eq!(operation, "clone box to box-template");
            assert_eq!(message, "clone rejected by host");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        hypervisor.operations(),
        vec![
            "datacenter dc1",
            "folder templates",
            "resource_pool None None",
            "register [ds1] templates/box.vmx as box",
            "clone vm-1 to box-template",
        ]
    );
    assert_eq!(hypervisor.tools_queries(), 0);
    assert!(hypervisor.powered_on_at.lock().unwrap().is_none());
}

#[tokio::test]
async fn ova_output_is_exported_and_pushed() {
    let dir = TempDir::new().unwrap();
    let config = config(RawConfig {
        output: Some(vec!["ova".into()]),
        compression: Some(6),
        repository_command: Some("push-image".into()),
        repository_args: Some("--repo  images".into()),
        ..raw_config(dir.path())
    });
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(Some(1));

    let published = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap();

    let exported = dir.path().join("export").join("box.ova");
    assert!(exported.is_file());
    assert_eq!(published.files, vec![exported.clone()]);
    assert_eq!(published.name, "box.ova");

    let calls = runner.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].1.contains(&"--compress=6".to_string()));
    assert_eq!(
        calls[2],
        (
            "push-image".to_string(),
            vec![
                "--repo".to_string(),
                "images".to_string(),
                exported.display().to_string(),
            ]
        )
    );
    assert!(uploader.uploaded.lock().unwrap().is_empty());
    assert!(hypervisor.operations().is_empty());
}

#[tokio::test]
async fn direct_import_bypasses_datastore_and_api() {
    let dir = TempDir::new().unwrap();
    let config = config(RawConfig {
        import_mode: Some("direct".into()),
        cluster: Some("cluster-a".into()),
        ..raw_config(dir.path())
    });
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(Some(1));

    let published = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap();

    assert_eq!(published.name, "box");
    assert_eq!(runner.ovftool_runs(), 2);
    let calls = runner.calls.lock().unwrap().clone();
    let target = calls[1].1.last().unwrap();
    assert!(target.starts_with("vi://admin:secret@vcenter.local/dc1/host/cluster-a"));
    assert!(uploader.uploaded.lock().unwrap().is_empty());
    assert!(hypervisor.operations().is_empty());
}

#[tokio::test]
async fn vmx_artifact_skips_import() {
    let dir = TempDir::new().unwrap();
    let vmx = dir.path().join("box.vmx");
    std::fs::write(&vmx, BUILT_VMX).unwrap();
    std::fs::write(dir.path().join("box-disk1.vmdk"), b"disk").unwrap();
    let config = config(RawConfig {
        clone_policy: Some("never".into()),
        ..raw_config(dir.path())
    });
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(None);

    let published = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&Artifact::new("mitchellh.vmware", vec![vmx]))
        .await
        .unwrap();

    assert_eq!(published.name, "box");
    assert!(runner.programs().is_empty());
    assert_eq!(uploader.uploaded.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_builder_fails_before_any_work() {
    let dir = TempDir::new().unwrap();
    let config = config(raw_config(dir.path()));
    let runner = FakeRunner::default();
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(None);

    let err = Publisher::new(&config, &runner, &uploader, &hypervisor)
        .run(&Artifact::new("someone.else", vec![dir.path().join("box.ova")]))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Locate);
    assert!(matches!(err.source, PublishError::UnknownBuilder(_)));
    assert!(runner.programs().is_empty());
}

#[tokio::test]
async fn import_failure_names_the_stage() {
    struct Broken;

    #[async_trait]
    impl ToolRunner for Broken {
        async fn run(&self, program: &str, _: &[String], label: &str) -> Result<String> {
            Err(PublishError::Process {
                program: program.into(),
                label: label.into(),
                code: 1,
                output: "Error: Failed to open OVF descriptor".into(),
            })
        }
    }

    let dir = TempDir::new().unwrap();
    let config = config(raw_config(dir.path()));
    let uploader = FakeUploader::default();
    let hypervisor = FakeHypervisor::new(None);

    let err = Publisher::new(&config, &Broken, &uploader, &hypervisor)
        .run(&ova_artifact(dir.path()))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Import);
    assert!(err.to_string().contains("Failed to open OVF descriptor"));
}
