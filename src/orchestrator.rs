//! Lifecycle orchestration
//!
//! Brings a resolved plan up profile by profile against whatever the engine
//! currently reports, tears it down in reverse, and reports per-service
//! outcomes. No environment state is kept between runs: every decision is
//! made from a fresh observation plus the labels on each container, so an
//! interrupted run is resumed by running it again. Containers labelled with
//! the chart but absent from the plan are removed on `jump` and `gc`, and
//! stopped on `stop`.

use crate::config::Settings;
use crate::docker::{
    BuildRequest, BuildSource, ContainerEngine, ContainerSpec, EngineError, ImageRef, InteractiveSession,
    LabelledContainer, LogOptions, MountSpec, LABEL_CHART, LABEL_FINGERPRINT, LABEL_PROFILE, LABEL_SERVICE,
};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, MountSource, Profile, Service, ServiceSource, Wait};
use crate::reconcile::{reconcile, Action, DesiredService, Planned};
use crate::registry::ChartId;
use crate::resolver::ResolvedPlan;
use crate::state::{EnvironmentState, Fingerprint, ObservedService, ServiceStatus, Step};
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tokio::net::TcpStream;

/// Interval between readiness connection attempts.
const WAIT_POLL: Duration = Duration::from_millis(100);

pub fn container_name(chart: &ChartId, profile: &str, service: &str) -> String {
    format!("{chart}_{profile}_{service}")
}

pub fn network_name(chart: &ChartId) -> String {
    chart.to_string()
}

pub fn volume_name(chart: &ChartId, volume: &str) -> String {
    format!("{chart}_{volume}")
}

pub fn image_tag(chart: &ChartId, profile: &str, service: &str) -> String {
    format!("ftl/{chart}/{service}:{profile}").to_lowercase()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JumpOptions {
    /// Treat every existing container as drifted.
    pub rebuild: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Already running with the desired configuration.
    Unchanged,
    Resumed,
    Created,
    /// Drifted container replaced.
    Recreated,
    Failed { step: Step, message: String },
    /// Not attempted because a profile it depends on failed.
    Skipped { reason: String },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. } | Outcome::Skipped { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    pub service: String,
    pub container: String,
    pub status: ServiceStatus,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileReport {
    pub profile: String,
    pub services: Vec<ServiceReport>,
}

impl ProfileReport {
    pub fn failed(&self) -> bool {
        self.services.iter().any(|s| s.outcome.is_failure())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub container: String,
    pub message: String,
}

/// Containers of the chart that the plan no longer accounts for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failures: Vec<CleanupFailure>,
}

/// Result of one `jump` pass over the whole plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentReport {
    /// Leftover containers removed before anything was brought up.
    pub cleanup: CleanupReport,
    pub profiles: Vec<ProfileReport>,
}

impl EnvironmentReport {
    pub fn succeeded(&self) -> bool {
        !self.profiles.iter().any(ProfileReport::failed)
    }

    /// First profile that did not fully come up.
    pub fn first_failed(&self) -> Option<&ProfileReport> {
        self.profiles.iter().find(|p| p.failed())
    }

    pub fn failure_summary(&self) -> String {
        self.profiles
            .iter()
            .flat_map(|p| {
                p.services.iter().filter_map(move |s| match &s.outcome {
                    Outcome::Failed { step, message } => {
                        Some(format!("{}/{} failed at {step}: {message}", p.profile, s.service))
                    }
                    Outcome::Skipped { reason } => Some(format!("{}/{} skipped: {reason}", p.profile, s.service)),
                    _ => None,
                })
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopFailure {
    pub profile: String,
    pub service: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// `(profile, service)` pairs stopped by this run, in teardown order.
    pub stopped: Vec<(String, String)>,
    pub failures: Vec<StopFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub profile: String,
    pub service: String,
    pub container: String,
    pub observed: ObservedService,
    /// Container exists but was created from another configuration.
    pub drifted: bool,
}

/// Why a service stopped short of running.
enum Halt {
    Step(Step, String),
    Unavailable(String),
}

type Applied = std::result::Result<Outcome, Halt>;

pub struct Orchestrator<'a> {
    engine: &'a dyn ContainerEngine,
    settings: &'a Settings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, settings: &'a Settings) -> Self {
        Self { engine, settings }
    }

    /// Run an engine call under `limit`, retrying once after the configured
    /// backoff if the engine is unreachable.
    async fn call<T, F, Fut>(&self, step: Step, limit: Duration, op: F) -> std::result::Result<T, Halt>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, EngineError>>,
    {
        let mut retried = false;
        loop {
            let result = match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(Halt::Step(
                        step,
                        format!("timed out after {}", humanize(limit)),
                    ))
                }
            };
            match result {
                Ok(value) => return Ok(value),
                Err(EngineError::Unavailable(message)) if !retried => {
                    tracing::warn!(%step, %message, "container engine unavailable, retrying");
                    tokio::time::sleep(self.settings.retry_backoff).await;
                    retried = true;
                }
                Err(EngineError::Unavailable(message)) => return Err(Halt::Unavailable(message)),
                Err(e) => return Err(Halt::Step(step, e.to_string())),
            }
        }
    }

    async fn ensure_reachable(&self) -> Result<()> {
        match self
            .call(Step::Observe, self.settings.start_timeout, || self.engine.ping())
            .await
        {
            Ok(()) => Ok(()),
            Err(Halt::Unavailable(message)) | Err(Halt::Step(_, message)) => Err(Error::EngineUnavailable(message)),
        }
    }

    /// Query every service of `profile` concurrently.
    async fn observe(&self, chart: &ChartId, profile: &Profile) -> Vec<(String, std::result::Result<ObservedService, Halt>)> {
        let queries = profile.services.iter().map(|service| {
            let name = container_name(chart, &profile.name, &service.name);
            async move {
                let observed = self
                    .call(Step::Observe, self.settings.start_timeout, || self.engine.status(&name))
                    .await;
                (service.name.clone(), observed)
            }
        });
        join_all(queries).await
    }

    /// Bring every profile in `plan` up, in order.
    ///
    /// Failures inside a profile do not stop its remaining services from
    /// being attempted; profiles depending on a failed one are skipped.
    /// Only an engine that stays unreachable aborts the run.
    pub async fn jump(&self, manifest: &Manifest, plan: &ResolvedPlan, options: JumpOptions) -> Result<EnvironmentReport> {
        self.ensure_reachable().await?;

        let mut failed: HashSet<&str> = HashSet::new();
        let mut report = EnvironmentReport {
            cleanup: self.remove_orphans(&manifest.chart, plan).await?,
            ..Default::default()
        };

        for profile in &plan.profiles {
            let blocked: Vec<&str> = profile
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| failed.contains(dep))
                .collect();
            let profile_report = if blocked.is_empty() {
                self.bring_up_profile(&manifest.chart, profile, options).await?
            } else {
                let reason = format!("depends on failed profile {}", blocked.join(", "));
                tracing::warn!(profile = %profile.name, %reason, "skipping profile");
                skipped(&manifest.chart, profile, &reason)
            };
            if profile_report.failed() {
                failed.insert(profile.name.as_str());
            }
            report.profiles.push(profile_report);
        }
        Ok(report)
    }

    async fn bring_up_profile(&self, chart: &ChartId, profile: &Profile, options: JumpOptions) -> Result<ProfileReport> {
        let mut state = EnvironmentState::new();
        let mut services = Vec::with_capacity(profile.services.len());
        let mut unobserved = HashSet::new();

        for (service, observed) in self.observe(chart, profile).await {
            match observed {
                Ok(observed) => state.insert(service, observed),
                Err(Halt::Unavailable(message)) => return Err(Error::EngineUnavailable(message)),
                Err(Halt::Step(step, message)) => {
                    unobserved.insert(service.clone());
                    services.push(ServiceReport {
                        container: container_name(chart, &profile.name, &service),
                        service,
                        status: ServiceStatus::Failed,
                        outcome: Outcome::Failed { step, message },
                    });
                }
            }
        }

        let desired: Vec<DesiredService> = DesiredService::for_profile(profile)
            .into_iter()
            .filter(|d| !unobserved.contains(&d.name))
            .collect();
        let planned = reconcile(&desired, &state, options.rebuild);
        tracing::debug!(profile = %profile.name, ?planned, "reconciled");

        for step in planned {
            let Some(service) = profile.services.iter().find(|s| s.name == step.service) else {
                continue;
            };
            let name = container_name(chart, &profile.name, &service.name);
            let report = match self.apply(chart, profile, service, &step).await {
                Ok(outcome) => ServiceReport {
                    service: service.name.clone(),
                    container: name,
                    status: ServiceStatus::Running,
                    outcome,
                },
                Err(Halt::Step(step, message)) => {
                    tracing::warn!(profile = %profile.name, service = %service.name, %step, %message, "service failed");
                    transition(profile, service, ServiceStatus::Failed);
                    ServiceReport {
                        service: service.name.clone(),
                        container: name,
                        status: ServiceStatus::Failed,
                        outcome: Outcome::Failed { step, message },
                    }
                }
                Err(Halt::Unavailable(message)) => return Err(Error::EngineUnavailable(message)),
            };
            services.push(report);
        }

        // Keep declaration order regardless of which services failed to observe.
        services.sort_by_key(|r| profile.services.iter().position(|s| s.name == r.service));
        Ok(ProfileReport {
            profile: profile.name.clone(),
            services,
        })
    }

    async fn apply(&self, chart: &ChartId, profile: &Profile, service: &Service, planned: &Planned) -> Applied {
        let limit = self.settings.start_timeout;
        match &planned.action {
            Action::Keep { container } => {
                tracing::debug!(profile = %profile.name, service = %service.name, %container, "up to date");
                Ok(Outcome::Unchanged)
            }
            Action::Resume { container } => {
                let spec = container_spec(chart, profile, service, &planned.fingerprint);
                let labels = chart_labels(chart);
                transition(profile, service, ServiceStatus::Starting);
                self.call(Step::Network, limit, || self.engine.ensure_network(&spec.network, &labels))
                    .await?;
                self.call(Step::Mount, limit, || self.engine.prepare_mounts(&spec.mounts, &labels))
                    .await?;
                self.call(Step::Process, limit, || self.engine.resume(container))
                    .await?;
                self.await_ready(service, &spec.name).await?;
                transition(profile, service, ServiceStatus::Running);
                Ok(Outcome::Resumed)
            }
            Action::Create => {
                self.create(chart, profile, service, &planned.fingerprint).await?;
                Ok(Outcome::Created)
            }
            Action::Recreate { container } => {
                tracing::warn!(
                    profile = %profile.name,
                    service = %service.name,
                    fingerprint = planned.fingerprint.short(),
                    "replacing container"
                );
                self.call(Step::Replace, limit, || self.engine.remove(container))
                    .await?;
                self.create(chart, profile, service, &planned.fingerprint).await?;
                Ok(Outcome::Recreated)
            }
        }
    }

    /// Build, then start: network, mounts, process.
    async fn create(
        &self,
        chart: &ChartId,
        profile: &Profile,
        service: &Service,
        fingerprint: &Fingerprint,
    ) -> std::result::Result<(), Halt> {
        let request = build_request(chart, profile, service);
        transition(profile, service, ServiceStatus::Building);
        let image: ImageRef = self
            .call(Step::Build, self.settings.build_timeout, || self.engine.build(&request))
            .await?;
        transition(profile, service, ServiceStatus::Built);

        let spec = container_spec(chart, profile, service, fingerprint);
        let labels = chart_labels(chart);
        let limit = self.settings.start_timeout;
        transition(profile, service, ServiceStatus::Starting);
        self.call(Step::Network, limit, || self.engine.ensure_network(&spec.network, &labels))
            .await?;
        self.call(Step::Mount, limit, || self.engine.prepare_mounts(&spec.mounts, &labels))
            .await?;
        let id = self
            .call(Step::Process, limit, || self.engine.start(&image, &spec))
            .await?;
        tracing::debug!(container = %id, name = %spec.name, "container started");
        self.await_ready(service, &spec.name).await?;
        transition(profile, service, ServiceStatus::Running);
        Ok(())
    }

    /// Run the service's waits in order, all within `wait_timeout`. A
    /// container that stops while being waited on fails immediately.
    async fn await_ready(&self, service: &Service, container: &str) -> std::result::Result<(), Halt> {
        if service.waits.is_empty() {
            return Ok(());
        }
        let limit = self.settings.wait_timeout;
        let waits = async {
            for wait in &service.waits {
                tracing::info!(service = %service.name, %wait, "waiting");
                match wait {
                    Wait::Time(delay) => tokio::time::sleep(*delay).await,
                    Wait::Tcp { address, .. } => loop {
                        if TcpStream::connect(address.as_str()).await.is_ok() {
                            break;
                        }
                        let observed = self
                            .call(Step::Wait, self.settings.start_timeout, || self.engine.status(container))
                            .await?;
                        if observed.status != ServiceStatus::Running {
                            return Err(Halt::Step(
                                Step::Wait,
                                format!("container stopped while waiting for {wait}"),
                            ));
                        }
                        tokio::time::sleep(WAIT_POLL).await;
                    },
                }
            }
            Ok::<(), Halt>(())
        };
        match tokio::time::timeout(limit, waits).await {
            Ok(result) => result,
            Err(_) => Err(Halt::Step(Step::Wait, format!("not ready after {}", humanize(limit)))),
        }
    }

    /// Containers labelled with `chart` that are not part of `plan`.
    async fn orphans(&self, chart: &ChartId, plan: &ResolvedPlan) -> std::result::Result<Vec<LabelledContainer>, Halt> {
        let wanted: HashSet<String> = plan
            .profiles
            .iter()
            .flat_map(|p| p.services.iter().map(move |s| container_name(chart, &p.name, &s.name)))
            .collect();
        let listed = self
            .call(Step::Observe, self.settings.start_timeout, || {
                self.engine.list_by_label(chart.as_str())
            })
            .await?;
        Ok(listed.into_iter().filter(|c| !wanted.contains(&c.name)).collect())
    }

    /// Remove every container of the chart the plan does not account for:
    /// services deleted from the manifest and profiles outside the plan.
    async fn remove_orphans(&self, chart: &ChartId, plan: &ResolvedPlan) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let orphans = match self.orphans(chart, plan).await {
            Ok(orphans) => orphans,
            Err(Halt::Unavailable(message)) => return Err(Error::EngineUnavailable(message)),
            Err(Halt::Step(_, message)) => {
                tracing::warn!(%chart, %message, "could not list the chart's containers");
                report.failures.push(CleanupFailure {
                    container: format!("{chart}_*"),
                    message,
                });
                return Ok(report);
            }
        };

        for orphan in orphans {
            let removed = self
                .call(Step::Replace, self.settings.start_timeout, || self.engine.remove(&orphan.name))
                .await;
            match removed {
                Ok(()) => {
                    tracing::info!(container = %orphan.name, "removed leftover container");
                    report.removed.push(orphan.name);
                }
                Err(Halt::Unavailable(message)) => return Err(Error::EngineUnavailable(message)),
                Err(Halt::Step(_, message)) => {
                    tracing::warn!(container = %orphan.name, %message, "could not remove leftover container");
                    report.failures.push(CleanupFailure {
                        container: orphan.name,
                        message,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Remove the chart's containers that are not part of `plan`.
    pub async fn gc(&self, manifest: &Manifest, plan: &ResolvedPlan) -> Result<CleanupReport> {
        self.ensure_reachable().await?;
        self.remove_orphans(&manifest.chart, plan).await
    }

    /// Stop every running service of the plan, dependents first. Running
    /// containers of the chart outside the plan are stopped before those.
    ///
    /// Every service is attempted; failures are collected, not fatal.
    pub async fn stop(&self, manifest: &Manifest, plan: &ResolvedPlan) -> Result<StopReport> {
        self.ensure_reachable().await?;
        let chart = &manifest.chart;
        let mut report = StopReport::default();

        match self.orphans(chart, plan).await {
            Ok(orphans) => {
                for orphan in orphans.into_iter().filter(|o| o.running) {
                    let profile = orphan.profile.clone().unwrap_or_else(|| "-".to_string());
                    let service = orphan.service.clone().unwrap_or_else(|| orphan.name.clone());
                    let stopped = self
                        .call(Step::Process, self.settings.start_timeout, || self.engine.stop(&orphan.name))
                        .await;
                    match stopped {
                        Ok(()) => {
                            tracing::info!(%profile, %service, "stopped container outside the plan");
                            report.stopped.push((profile, service));
                        }
                        Err(Halt::Step(_, message)) | Err(Halt::Unavailable(message)) => {
                            tracing::warn!(%profile, %service, %message, "stop failed");
                            report.failures.push(StopFailure {
                                profile,
                                service,
                                message,
                            });
                        }
                    }
                }
            }
            Err(Halt::Step(_, message)) | Err(Halt::Unavailable(message)) => {
                tracing::warn!(%chart, %message, "could not list the chart's containers");
                report.failures.push(StopFailure {
                    profile: "-".to_string(),
                    service: format!("{chart}_*"),
                    message,
                });
            }
        }

        for profile in plan.profiles.iter().rev() {
            for service in profile.services.iter().rev() {
                let name = container_name(chart, &profile.name, &service.name);
                let result = self.stop_one(&name).await;

                match result {
                    Ok(true) => {
                        tracing::info!(profile = %profile.name, service = %service.name, "stopped");
                        report.stopped.push((profile.name.clone(), service.name.clone()));
                    }
                    Ok(false) => {}
                    Err(Halt::Step(_, message)) | Err(Halt::Unavailable(message)) => {
                        tracing::warn!(profile = %profile.name, service = %service.name, %message, "stop failed");
                        report.failures.push(StopFailure {
                            profile: profile.name.clone(),
                            service: service.name.clone(),
                            message,
                        });
                    }
                }
            }
        }
        Ok(report)
    }

    async fn stop_one(&self, name: &str) -> std::result::Result<bool, Halt> {
        let limit = self.settings.start_timeout;
        let observed = self
            .call(Step::Observe, limit, || self.engine.status(name))
            .await?;
        match (observed.status, observed.container) {
            (ServiceStatus::Running, Some(container)) => {
                self.call(Step::Process, limit, || self.engine.stop(&container))
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Observe every service of the plan.
    pub async fn status(&self, manifest: &Manifest, plan: &ResolvedPlan) -> Result<Vec<StatusRow>> {
        self.ensure_reachable().await?;
        let chart = &manifest.chart;
        let mut rows = Vec::new();
        for profile in &plan.profiles {
            for (service_name, observed) in self.observe(chart, profile).await {
                let observed = match observed {
                    Ok(observed) => observed,
                    Err(Halt::Unavailable(message)) => return Err(Error::EngineUnavailable(message)),
                    Err(Halt::Step(_, message)) => {
                        tracing::warn!(profile = %profile.name, service = %service_name, %message, "status failed");
                        ObservedService {
                            status: ServiceStatus::Failed,
                            container: None,
                            fingerprint: None,
                        }
                    }
                };
                let drifted = match (&observed.container, profile.services.iter().find(|s| s.name == service_name)) {
                    (Some(_), Some(service)) => observed.fingerprint.as_ref() != Some(&Fingerprint::of(service)),
                    _ => false,
                };
                rows.push(StatusRow {
                    container: container_name(chart, &profile.name, &service_name),
                    profile: profile.name.clone(),
                    service: service_name,
                    observed,
                    drifted,
                });
            }
        }
        Ok(rows)
    }

    /// Open a shell in the target profile's entry service.
    pub async fn attach(&self, manifest: &Manifest, plan: &ResolvedPlan) -> Result<InteractiveSession> {
        self.attach_to(manifest, plan, None, None).await
    }

    /// Open a shell in `service` (the entry service when `None`), which must
    /// already be running. `shell` overrides the service's own.
    ///
    /// The timeout bounds establishing the session only, not its lifetime.
    pub async fn attach_to(
        &self,
        manifest: &Manifest,
        plan: &ResolvedPlan,
        service: Option<&str>,
        shell: Option<&str>,
    ) -> Result<InteractiveSession> {
        let (profile, service) = match service {
            Some(query) => locate(plan, query)?,
            None => {
                let target = plan.target();
                let entry = target.entry_service().ok_or_else(|| Error::AttachFailed {
                    service: target.name.clone(),
                    message: format!("profile {} has no services", target.name),
                })?;
                (target, entry)
            }
        };
        let name = container_name(&manifest.chart, &profile.name, &service.name);
        let shell = shell
            .or(service.shell.as_deref())
            .unwrap_or(&self.settings.shell);
        let attach_failed = |halt: Halt| Error::AttachFailed {
            service: service.name.clone(),
            message: match halt {
                Halt::Step(_, message) | Halt::Unavailable(message) => message,
            },
        };

        let observed = self
            .call(Step::Observe, self.settings.attach_timeout, || self.engine.status(&name))
            .await
            .map_err(attach_failed)?;
        if observed.status != ServiceStatus::Running {
            return Err(Error::NotRunning {
                service: format!("{}/{}", profile.name, service.name),
            });
        }

        tracing::info!(profile = %profile.name, service = %service.name, shell, "attaching");
        self.call(Step::Process, self.settings.attach_timeout, || self.engine.attach(&name, shell))
            .await
            .map_err(attach_failed)
    }

    /// Copy a service's container output to `out`, following it if asked.
    /// Stopped containers still have logs; absent ones are an error.
    pub async fn logs<W: Write>(
        &self,
        manifest: &Manifest,
        plan: &ResolvedPlan,
        service: &str,
        options: LogOptions,
        out: &mut W,
    ) -> Result<()> {
        self.ensure_reachable().await?;
        let (profile, service) = locate(plan, service)?;
        let label = format!("{}/{}", profile.name, service.name);
        let name = container_name(&manifest.chart, &profile.name, &service.name);

        let observed = match self
            .call(Step::Observe, self.settings.start_timeout, || self.engine.status(&name))
            .await
        {
            Ok(observed) => observed,
            Err(Halt::Unavailable(message)) => return Err(Error::EngineUnavailable(message)),
            Err(Halt::Step(_, message)) => return Err(Error::LogsFailed { service: label, message }),
        };
        if observed.container.is_none() {
            return Err(Error::NoContainer { service: label });
        }

        let mut chunks = self.engine.logs(&name, options);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) => out
                    .write_all(text.as_bytes())
                    .and_then(|()| out.flush())
                    .map_err(|e| Error::io("<stdout>", e))?,
                Err(EngineError::Unavailable(message)) => return Err(Error::EngineUnavailable(message)),
                Err(e) => {
                    return Err(Error::LogsFailed {
                        service: label,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Find a service of the plan by `profile/service`, or by bare name,
/// searching from the target profile back through its dependencies.
fn locate<'p>(plan: &'p ResolvedPlan, query: &str) -> Result<(&'p Profile, &'p Service)> {
    let (profile_name, service_name) = match query.split_once('/') {
        Some((profile, service)) => (Some(profile), service),
        None => (None, query),
    };
    plan.profiles
        .iter()
        .rev()
        .filter(|p| profile_name.map_or(true, |name| p.name == name))
        .find_map(|p| {
            p.services
                .iter()
                .find(|s| s.name == service_name)
                .map(|s| (p, s))
        })
        .ok_or_else(|| Error::UnknownService {
            profile: plan.target().name.clone(),
            name: query.to_string(),
        })
}

fn transition(profile: &Profile, service: &Service, to: ServiceStatus) {
    tracing::info!(profile = %profile.name, service = %service.name, status = %to, "transition");
}

fn skipped(chart: &ChartId, profile: &Profile, reason: &str) -> ProfileReport {
    ProfileReport {
        profile: profile.name.clone(),
        services: profile
            .services
            .iter()
            .map(|s| ServiceReport {
                service: s.name.clone(),
                container: container_name(chart, &profile.name, &s.name),
                status: ServiceStatus::Absent,
                outcome: Outcome::Skipped {
                    reason: reason.to_string(),
                },
            })
            .collect(),
    }
}

fn chart_labels(chart: &ChartId) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_CHART.to_string(), chart.to_string())])
}

pub fn build_request(chart: &ChartId, profile: &Profile, service: &Service) -> BuildRequest {
    let source = match &service.source {
        ServiceSource::Image(image) => BuildSource::Image(image.clone()),
        ServiceSource::Build(spec) => BuildSource::Dockerfile {
            context: spec.context.clone(),
            dockerfile: spec.dockerfile.clone(),
            args: spec.args.clone(),
        },
    };
    BuildRequest {
        tag: image_tag(chart, &profile.name, &service.name),
        source,
        labels: chart_labels(chart),
    }
}

pub fn container_spec(chart: &ChartId, profile: &Profile, service: &Service, fingerprint: &Fingerprint) -> ContainerSpec {
    let labels = BTreeMap::from([
        (LABEL_CHART.to_string(), chart.to_string()),
        (LABEL_PROFILE.to_string(), profile.name.clone()),
        (LABEL_SERVICE.to_string(), service.name.clone()),
        (LABEL_FINGERPRINT.to_string(), fingerprint.to_string()),
    ]);
    let mounts = service
        .mounts
        .iter()
        .map(|m| match &m.source {
            MountSource::Bind(path) => MountSpec::Bind {
                source: path.clone(),
                target: m.target.clone(),
                read_only: m.read_only,
            },
            MountSource::Volume(volume) => MountSpec::Volume {
                name: volume_name(chart, volume),
                target: m.target.clone(),
                read_only: m.read_only,
            },
        })
        .collect();

    ContainerSpec {
        name: container_name(chart, &profile.name, &service.name),
        network: network_name(chart),
        alias: service.name.clone(),
        labels,
        env: service.env.clone(),
        ports: service.ports.iter().map(ToString::to_string).collect(),
        mounts,
        entrypoint: service.entrypoint.clone(),
        command: service.command.clone(),
    }
}

fn humanize(d: Duration) -> String {
    if d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
