//! Command handlers
//!
//! Each handler receives the [`Context`] explicitly and writes its user-facing
//! output to the given writer. Logging goes through `tracing` to stderr.

use crate::config::{self, Settings};
use crate::docker::{ContainerEngine, LogOptions};
use crate::error::{Error, Result};
use crate::manifest;
use crate::orchestrator::{CleanupReport, EnvironmentReport, JumpOptions, Orchestrator, Outcome, StopReport};
use crate::registry::{Chart, RegistryStore};
use crate::resolver;
use crossterm::style::Stylize;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct Context {
    pub store: RegistryStore,
    pub settings: Settings,
    /// `--chart` override.
    pub chart: Option<String>,
    pub cwd: PathBuf,
    /// Colorize output.
    pub color: bool,
}

impl Context {
    pub fn new(settings: Settings, chart: Option<String>, cwd: PathBuf) -> Self {
        Self {
            store: RegistryStore::new(settings.home.clone()),
            settings,
            chart,
            cwd,
            color: false,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// The chart commands operate on: `--chart`, else the registered chart
    /// enclosing the working directory, else the most recently added one.
    pub fn current_chart(&self) -> Result<Chart> {
        let registry = self.store.read()?;
        if let Some(wanted) = &self.chart {
            return registry.resolve(wanted).cloned();
        }
        let nearest = config::find_chart_root(&self.cwd)
            .and_then(|root| registry.resolve(&root.to_string_lossy()).ok());
        if let Some(chart) = nearest.or_else(|| registry.containing(&self.cwd)) {
            return Ok(chart.clone());
        }
        registry
            .home()
            .cloned()
            .ok_or_else(|| Error::UnknownChart("none registered; run `ftl chart add <path>`".to_string()))
    }

    fn paint(&self, text: &str, outcome: &Outcome) -> String {
        if !self.color {
            return text.to_string();
        }
        match outcome {
            Outcome::Failed { .. } => text.red().bold().to_string(),
            Outcome::Skipped { .. } => text.yellow().to_string(),
            Outcome::Unchanged => text.dark_grey().to_string(),
            _ => text.green().to_string(),
        }
    }
}

fn io_err(e: std::io::Error) -> Error {
    Error::io("<stdout>", e)
}

pub fn chart_add(ctx: &Context, path: &Path, out: &mut impl Write) -> Result<()> {
    let chart = ctx.store.register(path)?;
    tracing::info!(chart = %chart.id, root = %chart.root.display(), "chart registered");
    writeln!(out, "Charted {} ({})", chart.root.display(), chart.id).map_err(io_err)
}

pub fn chart_list(ctx: &Context, out: &mut impl Write) -> Result<()> {
    let registry = ctx.store.read()?;
    let home = registry.home().map(|c| c.id.clone());
    let width = registry
        .list()
        .iter()
        .map(|c| c.id.as_str().len())
        .max()
        .unwrap_or(0)
        .max("CHART".len());

    writeln!(out, "  {:<width$}  {:<10}  PATH", "CHART", "PROFILE").map_err(io_err)?;
    for chart in registry.list() {
        let marker = if Some(&chart.id) == home.as_ref() { "*" } else { " " };
        let profile = registry
            .active_profile(&chart.id)
            .map(|r| r.profile.as_str())
            .unwrap_or("-");
        writeln!(
            out,
            "{marker} {:<width$}  {:<10}  {}",
            chart.id.as_str(),
            profile,
            chart.root.display()
        )
        .map_err(io_err)?;
    }
    Ok(())
}

pub fn chart_remove(ctx: &Context, id_or_path: &str, out: &mut impl Write) -> Result<()> {
    let written = match ctx.store.remove(id_or_path)? {
        Some(chart) => writeln!(out, "Removed {} ({})", chart.id, chart.root.display()),
        None => writeln!(out, "Removed leftover state for {id_or_path}"),
    };
    written.map_err(io_err)
}

pub fn list_profiles(ctx: &Context, verbose: bool, out: &mut impl Write) -> Result<()> {
    let chart = ctx.current_chart()?;
    let manifest = manifest::load(&chart)?;

    if !verbose {
        for name in manifest.profile_names() {
            writeln!(out, "{name}").map_err(io_err)?;
        }
        return Ok(());
    }

    let width = manifest
        .profiles
        .iter()
        .map(|p| p.name.len())
        .max()
        .unwrap_or(0)
        .max("PROFILE".len());
    writeln!(out, "{:<width$}  DESCRIPTION", "PROFILE").map_err(io_err)?;
    for profile in &manifest.profiles {
        writeln!(
            out,
            "{:<width$}  {}",
            profile.name,
            profile.description.as_deref().unwrap_or("")
        )
        .map_err(io_err)?;
    }
    Ok(())
}

/// Select `name` as the active profile, or show the current one.
pub fn profile(ctx: &Context, name: Option<&str>, out: &mut impl Write) -> Result<()> {
    let chart = ctx.current_chart()?;
    match name {
        Some(name) => {
            let plan = resolver::activate(&ctx.store, &chart, name)?;
            writeln!(out, "Active profile: {name}").map_err(io_err)?;
            if plan.profiles.len() > 1 {
                writeln!(out, "Brings up: {}", plan.names().join(" -> ")).map_err(io_err)?;
            }
            Ok(())
        }
        None => match resolver::active_plan(&ctx.store, &chart) {
            Ok((_, plan)) => {
                writeln!(out, "{}", plan.target().name).map_err(io_err)?;
                if plan.profiles.len() > 1 {
                    writeln!(out, "Brings up: {}", plan.names().join(" -> ")).map_err(io_err)?;
                }
                Ok(())
            }
            Err(e @ Error::NoActiveProfile { .. }) => writeln!(out, "{e}").map_err(io_err),
            Err(e) => Err(e),
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JumpArgs {
    pub rebuild: bool,
    pub attach: bool,
}

/// Bring the active profile up and attach to its entry service.
pub async fn jump(ctx: &Context, engine: &dyn ContainerEngine, args: JumpArgs, out: &mut impl Write) -> Result<()> {
    let chart = ctx.current_chart()?;
    let (manifest, plan) = resolver::active_plan(&ctx.store, &chart)?;
    let orchestrator = Orchestrator::new(engine, &ctx.settings);

    let report = orchestrator
        .jump(&manifest, &plan, JumpOptions { rebuild: args.rebuild })
        .await?;
    render_report(ctx, &report, out)?;

    if let Some(failed) = report.first_failed() {
        return Err(Error::PlanFailed {
            profile: failed.profile.clone(),
            summary: report.failure_summary(),
        });
    }
    if !args.attach {
        return Ok(());
    }

    out.flush().map_err(io_err)?;
    let session = orchestrator.attach(&manifest, &plan).await?;
    let code = session.wait().await.map_err(|e| Error::AttachFailed {
        service: plan.target().name.clone(),
        message: e.to_string(),
    })?;
    tracing::debug!(code, "session ended");
    Ok(())
}

fn render_report(ctx: &Context, report: &EnvironmentReport, out: &mut impl Write) -> Result<()> {
    render_cleanup(&report.cleanup, out)?;
    for profile in &report.profiles {
        writeln!(out, "{}", profile.profile).map_err(io_err)?;
        for service in &profile.services {
            let detail = match &service.outcome {
                Outcome::Unchanged => "up to date".to_string(),
                Outcome::Resumed => "started".to_string(),
                Outcome::Created => "created".to_string(),
                Outcome::Recreated => "rebuilt".to_string(),
                Outcome::Failed { step, message } => format!("failed at {step}: {message}"),
                Outcome::Skipped { reason } => format!("skipped ({reason})"),
            };
            writeln!(
                out,
                "  {:<20} {}",
                service.service,
                ctx.paint(&detail, &service.outcome)
            )
            .map_err(io_err)?;
        }
    }
    Ok(())
}

/// Stop the active plan, dependents first.
pub async fn stop(ctx: &Context, engine: &dyn ContainerEngine, out: &mut impl Write) -> Result<()> {
    let chart = ctx.current_chart()?;
    let (manifest, plan) = resolver::active_plan(&ctx.store, &chart)?;
    let report = Orchestrator::new(engine, &ctx.settings)
        .stop(&manifest, &plan)
        .await?;
    render_stop(&report, out)?;

    if report.failures.is_empty() {
        Ok(())
    } else {
        Err(Error::StopFailed {
            failed: report.failures.len(),
            summary: report
                .failures
                .iter()
                .map(|f| format!("{}/{}: {}", f.profile, f.service, f.message))
                .collect::<Vec<_>>()
                .join("; "),
        })
    }
}

fn render_stop(report: &StopReport, out: &mut impl Write) -> Result<()> {
    if report.stopped.is_empty() && report.failures.is_empty() {
        return writeln!(out, "Nothing running").map_err(io_err);
    }
    for (profile, service) in &report.stopped {
        writeln!(out, "Stopped {profile}/{service}").map_err(io_err)?;
    }
    Ok(())
}

fn render_cleanup(report: &CleanupReport, out: &mut impl Write) -> Result<()> {
    for container in &report.removed {
        writeln!(out, "Removed {container}").map_err(io_err)?;
    }
    for failure in &report.failures {
        writeln!(out, "Could not remove {}: {}", failure.container, failure.message).map_err(io_err)?;
    }
    Ok(())
}

/// Remove the current chart's containers that the active plan does not use.
pub async fn gc(ctx: &Context, engine: &dyn ContainerEngine, out: &mut impl Write) -> Result<()> {
    let chart = ctx.current_chart()?;
    let (manifest, plan) = resolver::active_plan(&ctx.store, &chart)?;
    let report = Orchestrator::new(engine, &ctx.settings)
        .gc(&manifest, &plan)
        .await?;

    if report.removed.is_empty() && report.failures.is_empty() {
        return writeln!(out, "Nothing to clean up").map_err(io_err);
    }
    render_cleanup(&report, out)?;
    if report.failures.is_empty() {
        Ok(())
    } else {
        Err(Error::CleanupFailed {
            failed: report.failures.len(),
            summary: report
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.container, f.message))
                .collect::<Vec<_>>()
                .join("; "),
        })
    }
}

/// Print a service's container output.
pub async fn logs(
    ctx: &Context,
    engine: &dyn ContainerEngine,
    service: &str,
    options: LogOptions,
    out: &mut impl Write,
) -> Result<()> {
    let chart = ctx.current_chart()?;
    let (manifest, plan) = resolver::active_plan(&ctx.store, &chart)?;
    Orchestrator::new(engine, &ctx.settings)
        .logs(&manifest, &plan, service, options, out)
        .await
}

/// Open a shell in a running service and wait for it; returns its exit code.
pub async fn attach(
    ctx: &Context,
    engine: &dyn ContainerEngine,
    service: Option<&str>,
    shell: Option<&str>,
) -> Result<i32> {
    let chart = ctx.current_chart()?;
    let (manifest, plan) = resolver::active_plan(&ctx.store, &chart)?;
    let session = Orchestrator::new(engine, &ctx.settings)
        .attach_to(&manifest, &plan, service, shell)
        .await?;
    let container = session.container().to_string();
    session.wait().await.map_err(|e| Error::AttachFailed {
        service: container,
        message: e.to_string(),
    })
}

pub async fn status(ctx: &Context, engine: &dyn ContainerEngine, out: &mut impl Write) -> Result<()> {
    let chart = ctx.current_chart()?;
    let (manifest, plan) = resolver::active_plan(&ctx.store, &chart)?;
    let rows = Orchestrator::new(engine, &ctx.settings)
        .status(&manifest, &plan)
        .await?;

    writeln!(out, "{:<12} {:<20} {:<10} CONTAINER", "PROFILE", "SERVICE", "STATUS").map_err(io_err)?;
    for row in rows {
        let status = if row.drifted {
            format!("{} (drifted)", row.observed.status)
        } else {
            row.observed.status.to_string()
        };
        writeln!(
            out,
            "{:<12} {:<20} {:<10} {}",
            row.profile, row.service, status, row.container
        )
        .map_err(io_err)?;
    }
    Ok(())
}
