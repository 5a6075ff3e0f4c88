//! Profile resolution
//!
//! Turns a requested profile into the ordered list of profiles that must be
//! brought up for it: dependencies first, the requested profile last.

use crate::error::{Error, Result};
use crate::manifest::{self, Manifest, Profile};
use crate::registry::{Chart, RegistryStore};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Profiles in dependency order, ending with the requested one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    pub profiles: Vec<Profile>,
}

impl ResolvedPlan {
    /// The profile that was asked for.
    pub fn target(&self) -> &Profile {
        self.profiles
            .last()
            .expect("a resolved plan always contains the requested profile")
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Resolve `name` against the manifest into a topologically ordered plan.
///
/// Depth-first with an explicit stack and tri-color marking. Dependencies are
/// visited in manifest declaration order so the same manifest always yields
/// the same plan.
pub fn resolve(manifest: &Manifest, name: &str) -> Result<ResolvedPlan> {
    let index: HashMap<&str, usize> = manifest
        .profiles
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    let root = *index.get(name).ok_or_else(|| Error::UnknownProfile {
        chart: manifest.chart.to_string(),
        name: name.to_string(),
    })?;

    // Each profile's dependencies as manifest indices, in declaration order.
    let deps_of = |i: usize| -> Result<Vec<usize>> {
        let profile = &manifest.profiles[i];
        let mut deps = profile
            .depends_on
            .iter()
            .map(|dep| {
                index
                    .get(dep.as_str())
                    .copied()
                    .ok_or_else(|| Error::UnknownProfileDependency {
                        profile: profile.name.clone(),
                        dependency: dep.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        deps.sort_unstable();
        deps.dedup();
        Ok(deps)
    };

    let mut marks: HashMap<usize, Mark> = HashMap::new();
    let mut order = Vec::new();
    // (node, its dependencies, next dependency to visit)
    let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(root, deps_of(root)?, 0)];
    marks.insert(root, Mark::InProgress);

    while let Some((node, deps, next)) = stack.last_mut() {
        let Some(&dep) = deps.get(*next) else {
            let node = *node;
            marks.insert(node, Mark::Done);
            order.push(node);
            stack.pop();
            continue;
        };
        *next += 1;

        match marks.get(&dep) {
            Some(Mark::Done) => {}
            Some(Mark::InProgress) => {
                let start = stack
                    .iter()
                    .position(|(n, _, _)| *n == dep)
                    .unwrap_or_default();
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|(n, _, _)| manifest.profiles[*n].name.clone())
                    .collect();
                cycle.push(manifest.profiles[dep].name.clone());
                return Err(Error::CyclicDependency { cycle });
            }
            None => {
                marks.insert(dep, Mark::InProgress);
                let dep_deps = deps_of(dep)?;
                stack.push((dep, dep_deps, 0));
            }
        }
    }

    let profiles = order
        .into_iter()
        .map(|i| manifest.profiles[i].clone())
        .collect();
    Ok(ResolvedPlan { profiles })
}

/// Select `name` as the chart's active profile.
///
/// The manifest is loaded and the profile fully resolved first, so a cycle
/// or missing dependency fails before anything is persisted.
pub fn activate(store: &RegistryStore, chart: &Chart, name: &str) -> Result<ResolvedPlan> {
    let manifest = manifest::load(chart)?;
    let plan = resolve(&manifest, name)?;
    store.set_active_profile(&chart.id, name)?;
    tracing::info!(chart = %chart.id, profile = name, "active profile set");
    Ok(plan)
}

/// Load the chart's manifest and resolve its active profile.
pub fn active_plan(store: &RegistryStore, chart: &Chart) -> Result<(Manifest, ResolvedPlan)> {
    let record = store
        .read()?
        .active_profile(&chart.id)
        .cloned()
        .ok_or_else(|| Error::NoActiveProfile {
            chart: chart.id.to_string(),
        })?;
    let manifest = manifest::load(chart)?;
    let plan = resolve(&manifest, &record.profile)?;
    Ok((manifest, plan))
}
