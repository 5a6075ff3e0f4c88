use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

const STDERR_TAIL: usize = 20;

#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    /// Last lines written to stderr, for error messages.
    pub stderr_tail: Vec<String>,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stderr(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

#[cfg(unix)]
fn grouped(bin: &str, args: &[String]) -> Command {
    let mut c = Command::new(bin);
    c.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group: a terminal Ctrl-C reaches ftl only, and ftl decides
    // when to tear the child (and anything it spawned) down.
    unsafe {
        c.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok(())
        });
    }
    c
}

#[cfg(not(unix))]
fn grouped(bin: &str, args: &[String]) -> Command {
    let mut c = Command::new(bin);
    c.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    c
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(-(pid as i32)),
        nix::sys::signal::Signal::SIGTERM,
    );
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {
    // kill_on_drop covers the direct child; Windows would need Job Objects for the tree.
}

/// Terminates the process group on drop unless disarmed, so a timed-out or
/// cancelled call never leaves a docker client running.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            tracing::debug!(pid, "terminating process group");
            kill_process_group(pid);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Out,
    Err,
}

/// Run `bin args...`, streaming its output lines to the debug log.
pub async fn run(bin: &str, args: &[String]) -> std::io::Result<Captured> {
    tracing::debug!(cmd = %format!("{bin} {}", args.join(" ")), "exec");
    let mut child = grouped(bin, args).spawn()?;
    let mut guard = GroupGuard { pid: child.id() };

    let (tx, mut rx) = mpsc::unbounded_channel::<(Stream, String)>();

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut r = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = r.next_line().await {
                let _ = tx.send((Stream::Out, line));
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut r = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = r.next_line().await {
                let _ = tx.send((Stream::Err, line));
            }
        });
    }
    drop(tx);

    let mut stdout = String::new();
    let mut tail: VecDeque<String> = VecDeque::new();
    while let Some((stream, line)) = rx.recv().await {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(target: "ftl::docker", "{line}");
        match stream {
            Stream::Out => {
                stdout.push_str(&line);
                stdout.push('\n');
            }
            Stream::Err => {
                tail.push_back(line);
                while tail.len() > STDERR_TAIL {
                    tail.pop_front();
                }
            }
        }
    }

    let status = child.wait().await?;
    guard.disarm();
    Ok(Captured {
        status,
        stdout,
        stderr_tail: tail.into(),
    })
}

/// Spawn an interactive command sharing ftl's terminal.
pub fn spawn_interactive(bin: &str, args: &[String]) -> std::io::Result<Child> {
    tracing::debug!(cmd = %format!("{bin} {}", args.join(" ")), "exec interactive");
    Command::new(bin)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
}
