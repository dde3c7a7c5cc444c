//! [`Hypervisor`] over the vCenter Automation REST API, plus the one vim25
//! method REST lacks, called through the VI/JSON binding with the same session.
//!
//! ```text
//! POST   /api/session                                    basic auth -> session id
//! GET    /api/vcenter/{datacenter,folder,cluster,resource-pool}?names=...
//! POST   /api/vcenter/vm?action=register|clone&vmw-task=true
//! POST   /api/vcenter/vm/{vm}/power?action=start|stop&vmw-task=true
//! POST   /sdk/vim25/{release}/VirtualMachine/{vm}/MarkAsTemplate
//! DELETE /api/vcenter/vm/{vm}?vmw-task=true
//! GET    /api/vcenter/vm/{vm}/tools
//! GET    /api/cis/tasks/{task}
//! ```
//!
//! The session is created on first use and shared by every later call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use crate::config::PublishConfig;
use crate::error::{PublishError, Result};
use crate::publish::hypervisor::{
    DatacenterRef, FolderRef, Hypervisor, Placement, ResourcePoolRef, TaskRef, TaskState, VmRef,
};

const SESSION_HEADER: &str = "vmware-api-session-id";

/// Prefix of task ids for calls the server completed synchronously.
const COMPLETED_TASK: &str = "completed:";

/// vim25 release addressed by VI/JSON calls. 8.0.1.0 is the first release
/// with the binding.
const VI_JSON_RELEASE: &str = "8.0.1.0";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FolderSummary {
    folder: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ClusterSummary {
    cluster: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    resource_pool: String,
}

#[derive(Debug, Deserialize)]
struct ResourcePoolSummary {
    resource_pool: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ToolsInfo {
    run_state: String,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    status: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Map a task document to a [`TaskState`].
fn task_state(info: TaskInfo) -> TaskState {
    match info.status.as_str() {
        "PENDING" | "BLOCKED" => TaskState::Queued,
        "RUNNING" => TaskState::Running,
        "SUCCEEDED" => TaskState::Succeeded {
            result: info.result.and_then(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            }),
        },
        _ => TaskState::Failed {
            message: info
                .error
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| format!("task ended in state {}", info.status)),
        },
    }
}

/// First `default_message` in a vAPI error document.
fn error_message(error: &serde_json::Value) -> Option<String> {
    error
        .get("messages")?
        .as_array()?
        .iter()
        .find_map(|m| m.get("default_message")?.as_str())
        .map(str::to_owned)
}

/// Pick the single summary named `name`.
fn exactly_one<T>(
    kind: &'static str,
    name: &str,
    found: Vec<T>,
    matches: impl Fn(&T) -> bool,
) -> Result<T> {
    let mut hits: Vec<T> = found.into_iter().filter(|t| matches(t)).collect();
    match hits.len() {
        1 => Ok(hits.remove(0)),
        0 => Err(PublishError::NotFound {
            kind,
            name: name.to_string(),
        }),
        n => Err(PublishError::NotFound {
            kind,
            name: format!("{name} (ambiguous: {n} matches)"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// vCenter REST client.
pub struct VsphereClient {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: String,
    session: OnceCell<String>,
}

impl VsphereClient {
    pub fn new(config: &PublishConfig) -> Result<Self> {
        let base = Url::parse(&format!("https://{}/", config.host))
            .map_err(|e| PublishError::InvalidUrl(format!("management endpoint {}: {e}", config.host)))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PublishError::http(base.as_str(), e))?;
        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            session: OnceCell::new(),
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| PublishError::InvalidUrl(format!("{path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn session(&self) -> Result<&str> {
        let id = self
            .session
            .get_or_try_init(|| async {
                let url = self.endpoint("api/session", &[])?;
                let request = self
                    .http
                    .post(url)
                    .basic_auth(&self.username, Some(&self.password));
                let response = checked("create session", request).await?;
                let id: String = response
                    .json()
                    .await
                    .map_err(|e| PublishError::http("api/session", e))?;
                info!(host = %self.base, user = %self.username, "Management session created");
                Ok::<_, PublishError>(id)
            })
            .await?;
        Ok(id.as_str())
    }

    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let session = self.session().await?;
        Ok(self.http.request(method, url).header(SESSION_HEADER, session))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.endpoint(path, query)?;
        let response = checked(operation, self.request(Method::GET, url).await?).await?;
        response
            .json()
            .await
            .map_err(|e| PublishError::http(path, e))
    }

    /// Submit a mutating call as a task.
    async fn submit(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        action: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<TaskRef> {
        let mut query = Vec::new();
        if let Some(action) = action {
            query.push(("action", action));
        }
        query.push(("vmw-task", "true"));
        let url = self.endpoint(path, &query)?;
        let mut request = self.request(method, url).await?;
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = checked(operation, request).await?;
        let text = response
            .text()
            .await
            .map_err(|e| PublishError::http(path, e))?;
        let task = parse_task_id(&text)
            .unwrap_or_else(|| format!("{COMPLETED_TASK}{operation}"));
        debug!(operation, task = %task, "Submitted");
        Ok(TaskRef(task))
    }

    /// Invoke a parameterless vim25 method. The server answers once the
    /// method has finished, so the returned task is already complete.
    async fn invoke(
        &self,
        operation: &str,
        object: &str,
        id: &str,
        method: &str,
    ) -> Result<TaskRef> {
        let url = self.endpoint(&vim25_path(object, id, method), &[])?;
        checked(operation, self.request(Method::POST, url).await?).await?;
        debug!(operation, object, id, "Completed synchronously");
        Ok(TaskRef(format!("{COMPLETED_TASK}{operation}")))
    }
}

fn vim25_path(object: &str, id: &str, method: &str) -> String {
    format!("sdk/vim25/{VI_JSON_RELEASE}/{object}/{id}/{method}")
}

/// A task id as returned by a `vmw-task=true` call: a JSON string.
fn parse_task_id(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    serde_json::from_str::<String>(body)
        .ok()
        .or_else(|| Some(body.trim_matches('"').to_string()))
        .filter(|id| !id.is_empty())
}

/// Send `request` and turn a non-2xx status into [`PublishError::Api`].
async fn checked(operation: &str, request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| PublishError::http(operation, e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PublishError::Api {
        operation: operation.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn placement_body(placement: &Placement) -> serde_json::Value {
    json!({
        "folder": placement.folder.0,
        "resource_pool": placement.resource_pool.0,
    })
}

#[async_trait]
impl Hypervisor for VsphereClient {
    async fn datacenter(&self, name: &str) -> Result<DatacenterRef> {
        let found: Vec<DatacenterSummary> = self
            .get("list datacenters", "api/vcenter/datacenter", &[("names", name)])
            .await?;
        let dc = exactly_one("datacenter", name, found, |d| d.name == name)?;
        Ok(DatacenterRef(dc.datacenter))
    }

    async fn folder(&self, datacenter: &DatacenterRef, name: &str) -> Result<FolderRef> {
        let found: Vec<FolderSummary> = self
            .get(
                "list folders",
                "api/vcenter/folder",
                &[
                    ("names", name),
                    ("datacenters", datacenter.0.as_str()),
                    ("type", "VIRTUAL_MACHINE"),
                ],
            )
            .await?;
        let folder = exactly_one("folder", name, found, |f| f.name == name)?;
        Ok(FolderRef(folder.folder))
    }

    async fn resource_pool(
        &self,
        datacenter: &DatacenterRef,
        cluster: Option<&str>,
        pool: Option<&str>,
    ) -> Result<ResourcePoolRef> {
        if let Some(pool) = pool {
            let found: Vec<ResourcePoolSummary> = self
                .get(
                    "list resource pools",
                    "api/vcenter/resource-pool",
                    &[("names", pool), ("datacenters", datacenter.0.as_str())],
                )
                .await?;
            let rp = exactly_one("resource pool", pool, found, |p| p.name == pool)?;
            return Ok(ResourcePoolRef(rp.resource_pool));
        }

        if let Some(cluster) = cluster {
            let found: Vec<ClusterSummary> = self
                .get(
                    "list clusters",
                    "api/vcenter/cluster",
                    &[("names", cluster), ("datacenters", datacenter.0.as_str())],
                )
                .await?;
            let summary = exactly_one("cluster", cluster, found, |c| c.name == cluster)?;
            let info: ClusterInfo = self
                .get(
                    "get cluster",
                    &format!("api/vcenter/cluster/{}", summary.cluster),
                    &[],
                )
                .await?;
            return Ok(ResourcePoolRef(info.resource_pool));
        }

        let found: Vec<ResourcePoolSummary> = self
            .get(
                "list resource pools",
                "api/vcenter/resource-pool",
                &[("datacenters", datacenter.0.as_str())],
            )
            .await?;
        let name = format!("default in datacenter {datacenter} (set cluster or resource_pool)");
        let rp = exactly_one("resource pool", &name, found, |_| true)?;
        Ok(ResourcePoolRef(rp.resource_pool))
    }

    async fn register_vm(
        &self,
        datastore_path: &str,
        name: &str,
        placement: &Placement,
    ) -> Result<TaskRef> {
        let body = json!({
            "datastore_path": datastore_path,
            "name": name,
            "placement": placement_body(placement),
        });
        self.submit("register", Method::POST, "api/vcenter/vm", Some("register"), Some(body))
            .await
    }

    async fn clone_vm(
        &self,
        source: &VmRef,
        name: &str,
        placement: &Placement,
    ) -> Result<TaskRef> {
        let body = json!({
            "source": source.0,
            "name": name,
            "placement": placement_body(placement),
        });
        self.submit("clone", Method::POST, "api/vcenter/vm", Some("clone"), Some(body))
            .await
    }

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef> {
        let path = format!("api/vcenter/vm/{vm}/power");
        self.submit("power on", Method::POST, &path, Some("start"), None)
            .await
    }

    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef> {
        let path = format!("api/vcenter/vm/{vm}/power");
        self.submit("power off", Method::POST, &path, Some("stop"), None)
            .await
    }

    async fn mark_as_template(&self, vm: &VmRef) -> Result<TaskRef> {
        self.invoke("mark as template", "VirtualMachine", &vm.0, "MarkAsTemplate")
            .await
    }

    async fn destroy(&self, vm: &VmRef) -> Result<TaskRef> {
        let path = format!("api/vcenter/vm/{vm}");
        self.submit("destroy", Method::DELETE, &path, None, None).await
    }

    async fn tools_running(&self, vm: &VmRef) -> Result<bool> {
        let tools: ToolsInfo = self
            .get("get guest tools", &format!("api/vcenter/vm/{vm}/tools"), &[])
            .await?;
        Ok(tools.run_state == "RUNNING")
    }

    async fn task_state(&self, task: &TaskRef) -> Result<TaskState> {
        if task.0.starts_with(COMPLETED_TASK) {
            return Ok(TaskState::Succeeded { result: None });
        }
        let info: TaskInfo = self
            .get("get task", &format!("api/cis/tasks/{task}"), &[])
            .await?;
        Ok(task_state(info))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
