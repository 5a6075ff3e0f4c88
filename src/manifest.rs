//! Manifest loading
//!
//! A chart's manifest is `ftl.yaml` at its root, optionally extended by one
//! profile per file under `profiles/`. Loading is a pure function of what is
//! on disk right now: nothing is cached between invocations.

use crate::config::{self, PROFILES_DIR};
use crate::env::Vars;
use crate::error::{Error, Location, Result};
use crate::registry::{Chart, ChartId};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static pattern"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub chart: ChartId,
    pub root: PathBuf,
    /// Project name, from `name:` or the chart directory.
    pub project: String,
    /// Profiles in declaration order.
    pub profiles: Vec<Profile>,
}

impl Manifest {
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub description: Option<String>,
    /// Profiles that must be running before this one, in declaration order.
    pub depends_on: Vec<String>,
    pub services: Vec<Service>,
    /// Named volumes this profile declares.
    pub volumes: Vec<String>,
    /// Build arguments applied to every service built in this profile.
    pub build_args: BTreeMap<String, String>,
    /// Environment shared by every service in this profile, interpolated.
    pub env: BTreeMap<String, String>,
    /// File the profile was declared in.
    pub source: PathBuf,
}

impl Profile {
    /// The service `jump` attaches to: the one marked `entry`, else the first.
    pub fn entry_service(&self) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.entry)
            .or_else(|| self.services.first())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub name: String,
    pub source: ServiceSource,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<Mount>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// Profile environment merged with the service's own, interpolated.
    pub env: BTreeMap<String, String>,
    #[serde(skip)]
    pub entry: bool,
    #[serde(skip)]
    pub shell: Option<String>,
    /// Readiness checks, run in order once the container is up.
    #[serde(skip)]
    pub waits: Vec<Wait>,
}

/// A condition a freshly started service must meet before the next
/// service or profile is brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait {
    /// Something accepts TCP connections on the host side of a published port.
    Tcp { port: u16, address: String },
    /// A fixed delay.
    Time(Duration),
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wait::Tcp { port, address } => write!(f, "tcp port {port} ({address})"),
            Wait::Time(delay) => write!(f, "{}s", delay.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSource {
    Build(BuildSpec),
    Image(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSpec {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    /// Profile `build_args` overlaid with the service's own.
    pub args: BTreeMap<String, String>,
    /// sha256 of the Dockerfile contents, when it could be read.
    pub dockerfile_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    Bind(PathBuf),
    Volume(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host: Option<u16>,
    pub container: u16,
    pub protocol: String,
}

impl fmt::Display for PortBinding {
    /// Formats in `docker run -p` syntax.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{ip}:")?;
        }
        match self.host {
            Some(host) => write!(f, "{host}:{}/{}", self.container, self.protocol),
            None => write!(f, "{}/{}", self.container, self.protocol),
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    name: Option<String>,
    #[serde(default)]
    profiles: Vec<RawProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    services: Vec<RawService>,
    #[serde(default, deserialize_with = "scalar_map")]
    build_args: BTreeMap<String, String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default, deserialize_with = "scalar_map")]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    name: String,
    image: Option<String>,
    build: Option<RawBuild>,
    #[serde(default)]
    ports: Vec<PortSpec>,
    #[serde(default)]
    mounts: Vec<String>,
    command: Option<RawCommand>,
    entrypoint: Option<RawCommand>,
    #[serde(default, deserialize_with = "scalar_map")]
    env: BTreeMap<String, String>,
    #[serde(default)]
    entry: bool,
    shell: Option<String>,
    #[serde(default)]
    waits: Vec<RawWait>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawWait {
    Tcp { port: u16 },
    Time { seconds: u64 },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBuild {
    Context(String),
    Full {
        #[serde(default = "default_context")]
        context: String,
        dockerfile: Option<String>,
        #[serde(default, deserialize_with = "scalar_map")]
        args: BTreeMap<String, String>,
    },
}

fn default_context() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Shell(String),
    Exec(Vec<String>),
}

impl RawCommand {
    fn into_argv(self) -> Vec<String> {
        match self {
            RawCommand::Shell(line) => vec!["/bin/sh".into(), "-c".into(), line],
            RawCommand::Exec(argv) => argv,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Number(u16),
    Text(String),
}

/// Accept YAML scalars of any type as string values (`PORT: 5432`).
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    use serde_yaml::Value;

    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    raw.into_iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => String::new(),
                other => {
                    return Err(D::Error::custom(format!(
                        "value for {k} must be a scalar, found {other:?}"
                    )))
                }
            };
            Ok((k, s))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse the chart's manifest (and `profiles/*.yaml`) into profile definitions.
pub fn load(chart: &Chart) -> Result<Manifest> {
    let manifest_path = config::manifest_in(&chart.root).unwrap_or_else(|| chart.manifest.clone());
    let content = fs::read_to_string(&manifest_path).map_err(|e| Error::io(&manifest_path, e))?;
    let raw: RawManifest = parse_document(&manifest_path, &content)?.unwrap_or_default();

    let mut declared: Vec<(PathBuf, RawProfile)> = Vec::new();
    for (idx, profile) in raw.profiles.into_iter().enumerate() {
        if profile.name.is_none() {
            return Err(Error::schema(
                &manifest_path,
                format!("profiles[{idx}]: missing field `name`"),
            ));
        }
        declared.push((manifest_path.clone(), profile));
    }
    declared.extend(load_profile_dir(&chart.root)?);

    let project = raw.name.unwrap_or_else(|| {
        chart
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| chart.id.to_string())
    });

    let declared_volumes: HashSet<String> = declared
        .iter()
        .flat_map(|(_, p)| p.volumes.iter().cloned())
        .collect();

    let mut seen = HashSet::new();
    let mut profiles = Vec::with_capacity(declared.len());
    for (source, raw_profile) in declared {
        let profile = build_profile(&chart.root, source, raw_profile, &declared_volumes)?;
        if !seen.insert(profile.name.clone()) {
            return Err(Error::DuplicateProfile {
                path: profile.source,
                name: profile.name,
            });
        }
        profiles.push(profile);
    }

    tracing::debug!(chart = %chart.id, profiles = profiles.len(), "manifest loaded");
    Ok(Manifest {
        chart: chart.id.clone(),
        root: chart.root.clone(),
        project,
        profiles,
    })
}

/// Two-pass parse: first as untyped YAML so malformed input is reported as a
/// syntax error, then into the typed shape so missing or mistyped fields are
/// reported as schema errors. Both carry a location where serde_yaml has one.
fn parse_document<T>(path: &Path, content: &str) -> Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let value: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| Error::ManifestSyntax {
            path: path.to_path_buf(),
            location: e.location().map(Location::from),
            message: strip_location(&e.to_string()),
        })?;
    if value.is_null() {
        return Ok(None);
    }
    serde_yaml::from_str(content)
        .map(Some)
        .map_err(|e| Error::ManifestSchema {
            path: path.to_path_buf(),
            location: e.location().map(Location::from),
            message: strip_location(&e.to_string()),
        })
}

/// serde_yaml appends " at line X column Y"; the location is reported separately.
fn strip_location(message: &str) -> String {
    match message.find(" at line ") {
        Some(idx) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

fn load_profile_dir(root: &Path) -> Result<Vec<(PathBuf, RawProfile)>> {
    let dir = root.join(PROFILES_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(&dir)
        .map_err(|e| Error::io(&dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    files.sort();

    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let mut profile: RawProfile = parse_document(&path, &content)?.unwrap_or_default();
        if profile.name.is_none() {
            profile.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string());
        }
        out.push((path, profile));
    }
    Ok(out)
}

fn check_name(path: &Path, what: &str, name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::schema(
            path,
            format!("{what} name {name:?} must match [A-Za-z0-9][A-Za-z0-9_.-]*"),
        ))
    }
}

fn build_profile(
    root: &Path,
    source: PathBuf,
    raw: RawProfile,
    declared_volumes: &HashSet<String>,
) -> Result<Profile> {
    let name = raw.name.unwrap_or_default();
    check_name(&source, "profile", &name)?;
    for volume in &raw.volumes {
        check_name(&source, "volume", volume)?;
    }

    let vars = Vars::load(root, Some(&name))?;
    if !vars.loaded_files().is_empty() {
        tracing::debug!(profile = %name, files = ?vars.loaded_files(), "env files loaded");
    }
    let profile_env = vars.expand_map(&raw.env);

    let mut service_names = HashSet::new();
    let mut entries = 0;
    let mut services = Vec::with_capacity(raw.services.len());
    for raw_service in raw.services {
        let ctx = format!("profile {name}, service {}", raw_service.name);
        check_name(&source, "service", &raw_service.name)?;
        if !service_names.insert(raw_service.name.clone()) {
            return Err(Error::schema(
                &source,
                format!("profile {name} declares service {} twice", raw_service.name),
            ));
        }
        if raw_service.entry {
            entries += 1;
        }
        let service = build_service(
            root,
            &source,
            &ctx,
            raw_service,
            &raw.build_args,
            &profile_env,
            &vars,
            declared_volumes,
        )?;
        services.push(service);
    }
    if entries > 1 {
        return Err(Error::schema(
            &source,
            format!("profile {name} marks more than one service as entry"),
        ));
    }

    Ok(Profile {
        name,
        description: raw.description,
        depends_on: raw.depends_on,
        services,
        volumes: raw.volumes,
        build_args: vars.expand_map(&raw.build_args),
        env: profile_env,
        source,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_service(
    root: &Path,
    source: &Path,
    ctx: &str,
    raw: RawService,
    profile_build_args: &BTreeMap<String, String>,
    profile_env: &BTreeMap<String, String>,
    vars: &Vars,
    declared_volumes: &HashSet<String>,
) -> Result<Service> {
    let image_source = match (raw.image, raw.build) {
        (Some(image), None) => ServiceSource::Image(vars.expand(&image)),
        (None, Some(build)) => ServiceSource::Build(build_spec(root, build, profile_build_args, vars)),
        (Some(_), Some(_)) => {
            return Err(Error::schema(source, format!("{ctx}: set either `image` or `build`, not both")))
        }
        (None, None) => {
            return Err(Error::schema(source, format!("{ctx}: one of `image` or `build` is required")))
        }
    };

    let mounts = raw
        .mounts
        .iter()
        .map(|m| parse_mount(root, vars, m))
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(|msg| Error::schema(source, format!("{ctx}: {msg}")))?;
    for mount in &mounts {
        if let MountSource::Volume(name) = &mount.source {
            if !declared_volumes.contains(name) {
                return Err(Error::schema(
                    source,
                    format!("{ctx}: named volume {name} is not declared in any profile's `volumes`"),
                ));
            }
        }
    }

    let ports = raw
        .ports
        .into_iter()
        .map(parse_port)
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(|msg| Error::schema(source, format!("{ctx}: {msg}")))?;

    let waits = raw
        .waits
        .into_iter()
        .map(|w| resolve_wait(w, &ports))
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(|msg| Error::schema(source, format!("{ctx}: {msg}")))?;

    let mut env = profile_env.clone();
    env.extend(vars.expand_map(&raw.env));

    Ok(Service {
        name: raw.name,
        source: image_source,
        ports,
        mounts,
        command: raw.command.map(RawCommand::into_argv),
        entrypoint: raw.entrypoint.map(RawCommand::into_argv),
        env,
        entry: raw.entry,
        shell: raw.shell,
        waits,
    })
}

/// TCP waits connect to the host side of the matching published port.
fn resolve_wait(raw: RawWait, ports: &[PortBinding]) -> std::result::Result<Wait, String> {
    match raw {
        RawWait::Time { seconds } => Ok(Wait::Time(Duration::from_secs(seconds))),
        RawWait::Tcp { port } => {
            let published = ports
                .iter()
                .find(|p| p.container == port && p.protocol == "tcp")
                .and_then(|p| p.host.map(|host| (p.host_ip.as_deref(), host)));
            let Some((ip, host)) = published else {
                return Err(format!("waits on port {port}, which is not published to a host port"));
            };
            let address = match ip {
                None | Some("") | Some("0.0.0.0") => format!("127.0.0.1:{host}"),
                Some("::") => format!("[::1]:{host}"),
                Some(ip) if ip.contains(':') => format!("[{ip}]:{host}"),
                Some(ip) => format!("{ip}:{host}"),
            };
            Ok(Wait::Tcp { port, address })
        }
    }
}

fn build_spec(
    root: &Path,
    raw: RawBuild,
    profile_build_args: &BTreeMap<String, String>,
    vars: &Vars,
) -> BuildSpec {
    let (context, dockerfile, args) = match raw {
        RawBuild::Context(context) => (context, None, BTreeMap::new()),
        RawBuild::Full {
            context,
            dockerfile,
            args,
        } => (context, dockerfile, args),
    };
    let context = resolve_host_path(root, &vars.expand(&context));
    let dockerfile = match dockerfile {
        Some(df) => context.join(vars.expand(&df)),
        None => context.join("Dockerfile"),
    };
    let dockerfile_digest = fs::read(&dockerfile)
        .ok()
        .map(|bytes| format!("{:x}", Sha256::digest(&bytes)));

    let mut merged = vars.expand_map(profile_build_args);
    merged.extend(vars.expand_map(&args));

    BuildSpec {
        context,
        dockerfile,
        args: merged,
        dockerfile_digest,
    }
}

fn resolve_host_path(root: &Path, raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        let joined = root.join(path);
        // Drop `.` components so equal configurations fingerprint equally.
        joined.components().filter(|c| !matches!(c, std::path::Component::CurDir)).collect()
    }
}

fn parse_mount(root: &Path, vars: &Vars, raw: &str) -> std::result::Result<Mount, String> {
    let expanded = vars.expand(raw);
    let parts: Vec<&str> = expanded.split(':').collect();
    let (src, target, mode) = match parts.as_slice() {
        [src, target] => (*src, *target, None),
        [src, target, mode] => (*src, *target, Some(*mode)),
        _ => return Err(format!("mount {raw:?} must be source:target[:ro|:rw]")),
    };
    if src.is_empty() || !target.starts_with('/') {
        return Err(format!("mount {raw:?} needs a source and an absolute target"));
    }
    let read_only = match mode {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => return Err(format!("mount {raw:?} has unknown mode {other:?}")),
    };
    let is_bind = src.contains('/') || src.starts_with('.') || src.starts_with('~');
    let source = if is_bind {
        MountSource::Bind(resolve_host_path(root, src))
    } else {
        if !name_pattern().is_match(src) {
            return Err(format!("mount {raw:?} has an invalid volume name"));
        }
        MountSource::Volume(src.to_string())
    };
    Ok(Mount {
        source,
        target: target.to_string(),
        read_only,
    })
}

fn parse_port(spec: PortSpec) -> std::result::Result<PortBinding, String> {
    let text = match spec {
        PortSpec::Number(n) => n.to_string(),
        PortSpec::Text(t) => t,
    };
    let (addr, protocol) = match text.split_once('/') {
        Some((addr, proto @ ("tcp" | "udp" | "sctp"))) => (addr, proto.to_string()),
        Some(_) => return Err(format!("port {text:?} has an unknown protocol")),
        None => (text.as_str(), "tcp".to_string()),
    };
    let port = |s: &str| {
        s.parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| format!("port {text:?} is not a valid port number"))
    };
    let parts: Vec<&str> = addr.split(':').collect();
    let (host_ip, host, container) = match parts.as_slice() {
        [container] => (None, None, port(container)?),
        [host, container] => (None, Some(port(host)?), port(container)?),
        [ip, host, container] => (Some(ip.to_string()), Some(port(host)?), port(container)?),
        _ => return Err(format!("port {text:?} must be [ip:]host:container or container")),
    };
    Ok(PortBinding {
        host_ip,
        host,
        container,
        protocol,
    })
}
