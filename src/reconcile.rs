use crate::manifest::Profile;
use crate::state::{EnvironmentState, Fingerprint, ServiceStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredService {
    pub name: String,
    pub fingerprint: Fingerprint,
}

impl DesiredService {
    pub fn for_profile(profile: &Profile) -> Vec<DesiredService> {
        profile
            .services
            .iter()
            .map(|s| DesiredService {
                name: s.name.clone(),
                fingerprint: Fingerprint::of(s),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Already running with the desired configuration.
    Keep { container: String },
    /// Stopped but otherwise current: start the existing container.
    Resume { container: String },
    /// Nothing there: build and start.
    Create,
    /// Present with another configuration: remove, then build and start.
    Recreate { container: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Planned {
    pub service: String,
    pub fingerprint: Fingerprint,
    pub action: Action,
}

/// Decide what to do for each desired service given what the engine reports.
/// Output follows `desired` order. `force` treats every existing container as
/// drifted.
pub fn reconcile(desired: &[DesiredService], observed: &EnvironmentState, force: bool) -> Vec<Planned> {
    desired
        .iter()
        .map(|want| {
            let seen = observed.get(&want.name);
            let current = seen.fingerprint.as_ref() == Some(&want.fingerprint) && !force;
            let action = match (seen.container, seen.status) {
                (None, _) | (_, ServiceStatus::Absent) => Action::Create,
                (Some(container), _) if !current => Action::Recreate { container },
                (Some(container), ServiceStatus::Running) => Action::Keep { container },
                (Some(container), _) => Action::Resume { container },
            };
            Planned {
                service: want.name.clone(),
                fingerprint: want.fingerprint.clone(),
                action,
            }
        })
        .collect()
}
