//! Container engine adapter
//!
//! [`ContainerEngine`] is everything the orchestrator needs from a container
//! runtime. [`DockerEngine`] implements it: daemon queries go through the
//! Docker API (bollard), while build, run, listing and interactive exec shell
//! out to the docker CLI, which already handles BuildKit output and TTY
//! plumbing.

use crate::process;
use crate::state::{Fingerprint, ObservedService, ServiceStatus};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::query_parameters::{InspectContainerOptions, LogsOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::Docker;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio::process::Child;

pub const LABEL_CHART: &str = "ftl.chart";
pub const LABEL_PROFILE: &str = "ftl.profile";
pub const LABEL_SERVICE: &str = "ftl.service";
pub const LABEL_FINGERPRINT: &str = "ftl.fingerprint";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The daemon could not be reached at all.
    #[error("{0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{op} failed: {message}")]
    Failed { op: &'static str, message: String },
}

impl EngineError {
    pub fn failed(op: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            op,
            message: message.into(),
        }
    }
}

pub type ContainerId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSource {
    /// Build `dockerfile` in `context`.
    Dockerfile {
        context: PathBuf,
        dockerfile: PathBuf,
        args: BTreeMap<String, String>,
    },
    /// Use a published image, pulling it if it is not present locally.
    Image(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Tag given to locally built images.
    pub tag: String,
    pub source: BuildSource,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    Bind {
        source: PathBuf,
        target: String,
        read_only: bool,
    },
    Volume {
        name: String,
        target: String,
        read_only: bool,
    },
}

impl MountSpec {
    fn to_flag(&self) -> String {
        match self {
            MountSpec::Bind {
                source,
                target,
                read_only,
            } => format!(
                "type=bind,source={},target={target}{}",
                source.display(),
                if *read_only { ",readonly" } else { "" }
            ),
            MountSpec::Volume {
                name,
                target,
                read_only,
            } => format!(
                "type=volume,source={name},target={target}{}",
                if *read_only { ",readonly" } else { "" }
            ),
        }
    }
}

/// Everything needed to create one service container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub network: String,
    /// Name other containers on the network reach this one by.
    pub alias: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
}

/// A container carrying a chart's label, whether or not it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledContainer {
    pub name: String,
    pub profile: Option<String>,
    pub service: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep streaming until the container stops.
    pub follow: bool,
    /// Only the last `n` lines; everything when unset.
    pub tail: Option<usize>,
}

/// A shell session inside a container, bound to the user's terminal.
#[derive(Debug)]
pub struct InteractiveSession {
    container: ContainerId,
    child: Option<Child>,
}

impl InteractiveSession {
    /// A session with nothing to wait on; used by engines without a terminal.
    pub fn detached(container: impl Into<ContainerId>) -> Self {
        Self {
            container: container.into(),
            child: None,
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Block until the user leaves the session; returns its exit code.
    pub async fn wait(self) -> std::io::Result<i32> {
        match self.child {
            Some(mut child) => {
                let status = child.wait().await?;
                Ok(status.code().unwrap_or(if status.success() { 0 } else { 1 }))
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check the engine is reachable.
    async fn ping(&self) -> Result<(), EngineError>;

    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, EngineError>;

    /// Create the network if it does not exist yet.
    async fn ensure_network(&self, network: &str, labels: &BTreeMap<String, String>) -> Result<(), EngineError>;

    /// Create named volumes and check bind sources exist.
    async fn prepare_mounts(&self, mounts: &[MountSpec], labels: &BTreeMap<String, String>) -> Result<(), EngineError>;

    /// Create and start a container from `image`.
    async fn start(&self, image: &ImageRef, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

    /// Start an existing, stopped container.
    async fn resume(&self, container: &str) -> Result<(), EngineError>;

    async fn stop(&self, container: &str) -> Result<(), EngineError>;

    /// Remove a container, stopping it first if needed. Absent is success.
    async fn remove(&self, container: &str) -> Result<(), EngineError>;

    /// Observe the container with the given name.
    async fn status(&self, name: &str) -> Result<ObservedService, EngineError>;

    /// Every container labelled as belonging to `chart`, stopped ones included.
    async fn list_by_label(&self, chart: &str) -> Result<Vec<LabelledContainer>, EngineError>;

    /// Output of a container, stdout and stderr interleaved, in chunks.
    fn logs<'a>(&'a self, container: &'a str, options: LogOptions) -> BoxStream<'a, Result<String, EngineError>>;

    async fn attach(&self, container: &str, shell: &str) -> Result<InteractiveSession, EngineError>;
}

#[derive(Debug, Clone)]
pub struct DockerEngine {
    bin: String,
    client: Option<Docker>,
    connect_error: Option<String>,
}

impl DockerEngine {
    pub fn connect(docker_bin: &str) -> Self {
        let (client, connect_error) = match Docker::connect_with_defaults() {
            Ok(client) => (Some(client), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            bin: docker_bin.to_string(),
            client,
            connect_error,
        }
    }

    fn client(&self) -> Result<&Docker, EngineError> {
        self.client.as_ref().ok_or_else(|| {
            EngineError::Unavailable(
                self.connect_error
                    .clone()
                    .unwrap_or_else(|| "no docker client".to_string()),
            )
        })
    }

    async fn cli(&self, op: &'static str, args: Vec<String>) -> Result<process::Captured, EngineError> {
        let out = process::run(&self.bin, &args).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Unavailable(format!("{} not found: {e}", self.bin))
            } else {
                EngineError::failed(op, e.to_string())
            }
        })?;
        if out.success() {
            return Ok(out);
        }
        let stderr = out.stderr();
        if daemon_unreachable(&stderr) {
            Err(EngineError::Unavailable(stderr))
        } else {
            Err(EngineError::failed(op, stderr))
        }
    }
}

fn daemon_unreachable(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("cannot connect to the docker daemon")
        || s.contains("error during connect")
        || s.contains("is the docker daemon running")
}

fn classify(op: &'static str, e: BollardError) -> EngineError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError { message, .. } => EngineError::failed(op, message),
        other => EngineError::Unavailable(other.to_string()),
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl PsRow {
    fn into_labelled(self) -> LabelledContainer {
        // Labels come as `k=v,k=v`; ftl's own values never contain commas.
        let labels: BTreeMap<&str, &str> = self
            .labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let name = self
            .names
            .split(',')
            .next()
            .unwrap_or("")
            .trim()
            .trim_start_matches('/')
            .to_string();
        LabelledContainer {
            name,
            profile: labels.get(LABEL_PROFILE).map(|v| v.to_string()),
            service: labels.get(LABEL_SERVICE).map(|v| v.to_string()),
            running: self.state.eq_ignore_ascii_case("running"),
        }
    }
}

fn parse_ps(stdout: &str) -> Vec<LabelledContainer> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str::<PsRow>(line) {
            Ok(row) => Some(row.into_labelled()),
            Err(e) => {
                tracing::debug!(error = %e, line, "skipping unparsable docker ps row");
                None
            }
        })
        .collect()
}

fn label_args(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{k}={v}")])
        .collect()
}

/// Arguments for `docker run` (after the `run` verb).
fn run_args(image: &ImageRef, spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--network-alias".to_string(),
        spec.alias.clone(),
    ];
    args.extend(label_args(&spec.labels));
    for (k, v) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }
    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    for mount in &spec.mounts {
        args.push("--mount".to_string());
        args.push(mount.to_flag());
    }

    // docker takes a single --entrypoint; further words lead the command.
    let mut trailing = Vec::new();
    if let Some((first, rest)) = spec.entrypoint.as_deref().and_then(|e| e.split_first()) {
        args.push("--entrypoint".to_string());
        args.push(first.clone());
        trailing.extend(rest.iter().cloned());
    }
    args.push(image.0.clone());
    args.extend(trailing);
    if let Some(command) = &spec.command {
        args.extend(command.iter().cloned());
    }
    args
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.client()?
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| classify("ping", e))
    }

    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, EngineError> {
        match &request.source {
            BuildSource::Image(image) => {
                let present = self
                    .cli("image inspect", vec!["image".into(), "inspect".into(), image.clone()])
                    .await;
                match present {
                    Ok(_) => {}
                    Err(EngineError::Failed { .. }) => {
                        self.cli("pull", vec!["pull".into(), image.clone()]).await?;
                    }
                    Err(e) => return Err(e),
                }
                Ok(ImageRef(image.clone()))
            }
            BuildSource::Dockerfile {
                context,
                dockerfile,
                args,
            } => {
                let mut cmd = vec![
                    "build".to_string(),
                    "--progress=plain".to_string(),
                    "-t".to_string(),
                    request.tag.clone(),
                    "-f".to_string(),
                    dockerfile.display().to_string(),
                ];
                for (k, v) in args {
                    cmd.push("--build-arg".to_string());
                    cmd.push(format!("{k}={v}"));
                }
                cmd.extend(label_args(&request.labels));
                cmd.push(context.display().to_string());
                self.cli("build", cmd).await?;
                Ok(ImageRef(request.tag.clone()))
            }
        }
    }

    async fn ensure_network(&self, network: &str, labels: &BTreeMap<String, String>) -> Result<(), EngineError> {
        let exists = self
            .cli("network inspect", vec!["network".into(), "inspect".into(), network.into()])
            .await;
        match exists {
            Ok(_) => return Ok(()),
            Err(EngineError::Failed { .. }) => {}
            Err(e) => return Err(e),
        }
        let mut args = vec!["network".to_string(), "create".to_string()];
        args.extend(label_args(labels));
        args.push(network.to_string());
        match self.cli("network create", args).await {
            Ok(_) => Ok(()),
            // Lost a race with a concurrent run.
            Err(EngineError::Failed { message, .. }) if message.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn prepare_mounts(&self, mounts: &[MountSpec], labels: &BTreeMap<String, String>) -> Result<(), EngineError> {
        for mount in mounts {
            match mount {
                MountSpec::Bind { source, .. } => {
                    if !source.exists() {
                        return Err(EngineError::failed(
                            "mount",
                            format!("bind source {} does not exist", source.display()),
                        ));
                    }
                }
                MountSpec::Volume { name, .. } => {
                    let mut args = vec!["volume".to_string(), "create".to_string()];
                    args.extend(label_args(labels));
                    args.push(name.clone());
                    self.cli("volume create", args).await?;
                }
            }
        }
        Ok(())
    }

    async fn start(&self, image: &ImageRef, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let mut args = vec!["run".to_string()];
        args.extend(run_args(image, spec));
        let out = self.cli("run", args).await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn resume(&self, container: &str) -> Result<(), EngineError> {
        self.cli("start", vec!["start".into(), container.into()]).await?;
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<(), EngineError> {
        match self
            .client()?
            .stop_container(container, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(classify("stop", e)),
        }
    }

    async fn remove(&self, container: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client()?.remove_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) => match classify("remove", e) {
                EngineError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn status(&self, name: &str) -> Result<ObservedService, EngineError> {
        let info = match self
            .client()?
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                return match classify("inspect", e) {
                    EngineError::NotFound(_) => Ok(ObservedService::absent()),
                    other => Err(other),
                }
            }
        };

        let running = info.state.as_ref().and_then(|s| s.running).unwrap_or(false);
        let fingerprint = info
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(LABEL_FINGERPRINT))
            .map(|v| Fingerprint::from_label(v.clone()));
        Ok(ObservedService {
            status: if running {
                ServiceStatus::Running
            } else {
                ServiceStatus::Stopped
            },
            container: Some(info.id.unwrap_or_else(|| name.to_string())),
            fingerprint,
        })
    }

    async fn list_by_label(&self, chart: &str) -> Result<Vec<LabelledContainer>, EngineError> {
        let out = self
            .cli(
                "ps",
                vec![
                    "ps".into(),
                    "-a".into(),
                    "--no-trunc".into(),
                    "--filter".into(),
                    format!("label={LABEL_CHART}={chart}"),
                    "--format".into(),
                    "{{json .}}".into(),
                ],
            )
            .await?;
        Ok(parse_ps(&out.stdout))
    }

    fn logs<'a>(&'a self, container: &'a str, options: LogOptions) -> BoxStream<'a, Result<String, EngineError>> {
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => return stream::iter(vec![Err(e)]).boxed(),
        };
        let options = LogsOptions {
            follow: options.follow,
            stdout: true,
            stderr: true,
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        client
            .logs(container, Some(options))
            .map(|chunk| {
                chunk
                    .map(|output| output.to_string())
                    .map_err(|e| classify("logs", e))
            })
            .boxed()
    }

    async fn attach(&self, container: &str, shell: &str) -> Result<InteractiveSession, EngineError> {
        let mut args = vec!["exec".to_string()];
        if std::io::stdin().is_terminal() {
            args.push("-it".to_string());
        } else {
            args.push("-i".to_string());
        }
        if let Ok(term) = std::env::var("TERM") {
            args.push("-e".to_string());
            args.push(format!("TERM={term}"));
        }
        args.push(container.to_string());
        args.push(shell.to_string());

        let child = process::spawn_interactive(&self.bin, &args)
            .map_err(|e| EngineError::failed("exec", e.to_string()))?;
        Ok(InteractiveSession {
            container: container.to_string(),
            child: Some(child),
        })
    }
}
