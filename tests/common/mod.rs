#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use ftl::config::Settings;
use ftl::docker::{
    BuildRequest, BuildSource, ContainerEngine, ContainerSpec, EngineError, ImageRef, InteractiveSession,
    LabelledContainer, LogOptions, MountSpec, LABEL_CHART, LABEL_FINGERPRINT, LABEL_PROFILE, LABEL_SERVICE,
};
use ftl::manifest::{self, Manifest};
use ftl::registry::{Chart, Registry};
use ftl::resolver::{self, ResolvedPlan};
use ftl::state::{Fingerprint, ObservedService, ServiceStatus};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const SHOP: &str = r#"
name: shop
profiles:
  - name: db
    description: Postgres only
    volumes: [pgdata]
    services:
      - name: postgres
        image: postgres:16
        mounts: ["pgdata:/var/lib/postgresql/data"]
  - name: full
    description: Everything
    depends_on: [db]
    services:
      - name: api
        image: shop-api:dev
        command: ["serve"]
      - name: web
        image: shop-web:dev
        entry: true
        shell: /bin/bash
      - name: worker
        image: shop-worker:dev
"#;

/// Write `manifest` as `<parent>/<name>/ftl.yaml` and return the chart root.
pub fn write_chart(parent: &Path, name: &str, manifest: &str) -> PathBuf {
    let root = parent.join(name);
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("ftl.yaml"), manifest).unwrap();
    root
}

pub fn chart_at(root: &Path) -> Chart {
    Registry::new().register(root).unwrap()
}

pub fn plan(chart: &Chart, profile: &str) -> (Manifest, ResolvedPlan) {
    let manifest = manifest::load(chart).unwrap();
    let plan = resolver::resolve(&manifest, profile).unwrap();
    (manifest, plan)
}

pub fn settings(home: &Path) -> Settings {
    Settings {
        home: home.to_path_buf(),
        docker_bin: "docker".into(),
        build_timeout: Duration::from_secs(5),
        start_timeout: Duration::from_secs(5),
        attach_timeout: Duration::from_secs(5),
        wait_timeout: Duration::from_secs(5),
        retry_backoff: Duration::from_millis(1),
        shell: "/bin/sh".into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Build,
    Network,
    Mount,
    Start,
    Resume,
    Stop,
    Remove,
    Status,
    List,
    Logs,
    Attach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    /// Image tag or published image name.
    Build(String),
    Network(String),
    Mounts(Vec<String>),
    Start(String),
    Resume(String),
    Stop(String),
    Remove(String),
    Status(String),
    List(String),
    Logs(String),
    Attach(String, String),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub running: bool,
    pub fingerprint: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<Call>,
    failures: Vec<(Op, String, String)>,
    unavailable: usize,
    unavailable_ops: Vec<(Op, usize)>,
    crash_on_start: Vec<String>,
    logs: BTreeMap<String, Vec<String>>,
    build_delay: Option<Duration>,
}

/// In-memory engine. Container ids are the container names.
#[derive(Default)]
pub struct FakeEngine {
    inner: Mutex<Inner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `op` for any target containing `target`.
    pub fn fail(&self, op: Op, target: &str, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((op, target.to_string(), message.to_string()));
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    /// Answer the next `n` calls of any kind with `Unavailable`.
    pub fn go_offline(&self, n: usize) {
        self.inner.lock().unwrap().unavailable = n;
    }

    /// Answer the next `n` calls of `op` with `Unavailable`.
    pub fn go_offline_at(&self, op: Op, n: usize) {
        self.inner.lock().unwrap().unavailable_ops.push((op, n));
    }

    /// Containers whose name contains `target` exit as soon as they start.
    pub fn crash_on_start(&self, target: &str) {
        self.inner.lock().unwrap().crash_on_start.push(target.to_string());
    }

    pub fn set_logs(&self, container: &str, lines: &[&str]) {
        self.inner.lock().unwrap().logs.insert(
            container.to_string(),
            lines.iter().map(|l| format!("{l}\n")).collect(),
        );
    }

    pub fn slow_builds(&self, delay: Duration) {
        self.inner.lock().unwrap().build_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn builds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build(target) => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn starts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Start(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.inner.lock().unwrap().containers.get(name).cloned()
    }

    /// Stop a container behind ftl's back.
    pub fn stop_externally(&self, name: &str) {
        if let Some(c) = self.inner.lock().unwrap().containers.get_mut(name) {
            c.running = false;
        }
    }

    fn enter(&self, op: Option<Op>, target: &str, call: Call) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        if inner.unavailable > 0 {
            inner.unavailable -= 1;
            return Err(EngineError::Unavailable("Cannot connect to the Docker daemon".into()));
        }
        if let Some((_, left)) = inner
            .unavailable_ops
            .iter_mut()
            .find(|(o, left)| Some(*o) == op && *left > 0)
        {
            *left -= 1;
            return Err(EngineError::Unavailable("Cannot connect to the Docker daemon".into()));
        }
        if let Some(op) = op {
            if let Some((_, _, message)) = inner
                .failures
                .iter()
                .find(|(o, t, _)| *o == op && target.contains(t.as_str()))
            {
                return Err(EngineError::failed("fake", message.clone()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.enter(None, "", Call::Ping)
    }

    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, EngineError> {
        let target = match &request.source {
            BuildSource::Image(image) => image.clone(),
            BuildSource::Dockerfile { .. } => request.tag.clone(),
        };
        self.enter(Some(Op::Build), &target, Call::Build(target.clone()))?;
        let delay = self.inner.lock().unwrap().build_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ImageRef(target))
    }

    async fn ensure_network(&self, network: &str, _labels: &BTreeMap<String, String>) -> Result<(), EngineError> {
        self.enter(Some(Op::Network), network, Call::Network(network.to_string()))
    }

    async fn prepare_mounts(&self, mounts: &[MountSpec], _labels: &BTreeMap<String, String>) -> Result<(), EngineError> {
        let names: Vec<String> = mounts
            .iter()
            .map(|m| match m {
                MountSpec::Bind { source, .. } => source.display().to_string(),
                MountSpec::Volume { name, .. } => name.clone(),
            })
            .collect();
        self.enter(Some(Op::Mount), &names.join(","), Call::Mounts(names.clone()))
    }

    async fn start(&self, _image: &ImageRef, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.enter(Some(Op::Start), &spec.name, Call::Start(spec.name.clone()))?;
        let mut inner = self.inner.lock().unwrap();
        let crashes = inner.crash_on_start.iter().any(|t| spec.name.contains(t.as_str()));
        inner.containers.insert(
            spec.name.clone(),
            FakeContainer {
                running: !crashes,
                fingerprint: spec.labels.get(LABEL_FINGERPRINT).cloned(),
                labels: spec.labels.clone(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn resume(&self, container: &str) -> Result<(), EngineError> {
        self.enter(Some(Op::Resume), container, Call::Resume(container.to_string()))?;
        match self.inner.lock().unwrap().containers.get_mut(container) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(container.to_string())),
        }
    }

    async fn stop(&self, container: &str) -> Result<(), EngineError> {
        self.enter(Some(Op::Stop), container, Call::Stop(container.to_string()))?;
        if let Some(c) = self.inner.lock().unwrap().containers.get_mut(container) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<(), EngineError> {
        self.enter(Some(Op::Remove), container, Call::Remove(container.to_string()))?;
        self.inner.lock().unwrap().containers.remove(container);
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ObservedService, EngineError> {
        self.enter(Some(Op::Status), name, Call::Status(name.to_string()))?;
        Ok(match self.inner.lock().unwrap().containers.get(name) {
            Some(c) => ObservedService {
                status: if c.running {
                    ServiceStatus::Running
                } else {
                    ServiceStatus::Stopped
                },
                container: Some(name.to_string()),
                fingerprint: c.fingerprint.clone().map(Fingerprint::from_label),
            },
            None => ObservedService::absent(),
        })
    }

    async fn list_by_label(&self, chart: &str) -> Result<Vec<LabelledContainer>, EngineError> {
        self.enter(Some(Op::List), chart, Call::List(chart.to_string()))?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(LABEL_CHART).map(String::as_str) == Some(chart))
            .map(|(name, c)| LabelledContainer {
                name: name.clone(),
                profile: c.labels.get(LABEL_PROFILE).cloned(),
                service: c.labels.get(LABEL_SERVICE).cloned(),
                running: c.running,
            })
            .collect())
    }

    fn logs<'a>(&'a self, container: &'a str, options: LogOptions) -> BoxStream<'a, Result<String, EngineError>> {
        if let Err(e) = self.enter(Some(Op::Logs), container, Call::Logs(container.to_string())) {
            return stream::iter(vec![Err(e)]).boxed();
        }
        let mut lines = self
            .inner
            .lock()
            .unwrap()
            .logs
            .get(container)
            .cloned()
            .unwrap_or_default();
        if let Some(n) = options.tail {
            lines = lines.split_off(lines.len().saturating_sub(n));
        }
        stream::iter(lines.into_iter().map(Ok)).boxed()
    }

    async fn attach(&self, container: &str, shell: &str) -> Result<InteractiveSession, EngineError> {
        self.enter(
            Some(Op::Attach),
            container,
            Call::Attach(container.to_string(), shell.to_string()),
        )?;
        Ok(InteractiveSession::detached(container))
    }
}
