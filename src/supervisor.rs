use crate::config::{DEFAULT_GRACE_PERIOD, DEFAULT_SHELL, MAX_GRACE_PERIOD, UPSTREAM_HOST};
use crate::core::models::{instance_label, InstanceState, ProcessSpec, RunningInstance};
use crate::core::ports::{PortPlan, ProxyPlan};
use crate::environment::ResolvedEnvironment;
use crate::error::SpawnError;
use crate::platform::{self, ProcessSignal};
use chrono::Local;
use colored::{Color, Colorize};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long to wait for reaping after SIGKILL before giving up on a child.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

const LABEL_COLORS: [Color; 6] = [
    Color::Cyan,
    Color::Yellow,
    Color::Green,
    Color::Magenta,
    Color::Blue,
    Color::BrightRed,
];

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Shell used to run Procfile commands (`<shell> -c <command>`).
    pub shell: PathBuf,
    /// Working directory of every child.
    pub directory: PathBuf,
    pub grace_period: Duration,
    /// Executable started as `<program> proxy ...` when a proxy is needed.
    pub proxy_program: PathBuf,
    pub upstream_host: String,
    /// Mirror child stdout/stderr with a `HH:MM:SS web.1 |` prefix; discarded otherwise.
    pub mirror_output: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            directory: PathBuf::from("."),
            grace_period: DEFAULT_GRACE_PERIOD,
            proxy_program: PathBuf::from("restcoder"),
            upstream_host: UPSTREAM_HOST.to_string(),
            mirror_output: true,
        }
    }
}

/// Runtime record of the proxy child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyProcess {
    pub process: String,
    pub listen_port: u16,
    pub upstream_ports: Vec<u16>,
    pub pid: Option<u32>,
    pub state: InstanceState,
    pub exit_code: Option<i32>,
}

impl ProxyProcess {
    fn starting(plan: &ProxyPlan) -> Self {
        Self {
            process: plan.process.clone(),
            listen_port: plan.listen_port,
            upstream_ports: plan.upstream_ports.clone(),
            pid: None,
            state: InstanceState::Starting,
            exit_code: None,
        }
    }

    fn upstream_range(&self) -> String {
        match (self.upstream_ports.first(), self.upstream_ports.last()) {
            (Some(first), Some(last)) => format!("{first}-{last}"),
            _ => String::from("-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Instance(usize),
    Proxy,
}

struct ExitEvent {
    slot: Slot,
    status: io::Result<ExitStatus>,
}

/// Owns every child of one `start` invocation.
///
/// Children are never waited on directly: a waiter task per child reports
/// its exit over a channel and the supervisor applies the state change.
pub struct ProcessSupervisor {
    options: SupervisorOptions,
    instances: Vec<RunningInstance>,
    proxy: Option<ProxyProcess>,
    events_tx: mpsc::UnboundedSender<ExitEvent>,
    events: mpsc::UnboundedReceiver<ExitEvent>,
    tasks: Vec<JoinHandle<()>>,
    label_width: usize,
    stopping: bool,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            options,
            instances: Vec::new(),
            proxy: None,
            events_tx,
            events,
            tasks: Vec::new(),
            label_width: 0,
            stopping: false,
        }
    }

    pub fn instances(&self) -> &[RunningInstance] {
        &self.instances
    }

    pub fn proxy(&self) -> Option<&ProxyProcess> {
        self.proxy.as_ref()
    }

    /// `(label, port, state)` of every instance in spawn order.
    pub fn snapshot(&self) -> Vec<(String, u16, InstanceState)> {
        self.instances
            .iter()
            .map(|instance| (instance.label(), instance.port, instance.state))
            .collect()
    }

    pub fn any_alive(&self) -> bool {
        self.instances.iter().any(|instance| instance.state.is_alive())
            || self
                .proxy
                .as_ref()
                .is_some_and(|proxy| proxy.state.is_alive())
    }

    /// Spawns every planned instance, then the proxy if the plan has one.
    ///
    /// Ports come from `plan`, so spawn order carries no meaning. On the
    /// first spawn failure nothing else is started, everything already
    /// running is stopped and the error is returned.
    pub async fn launch(
        &mut self,
        processes: &[ProcessSpec],
        plan: &PortPlan,
        env: &ResolvedEnvironment,
    ) -> Result<(), SpawnError> {
        self.label_width = plan
            .instances
            .iter()
            .map(|entry| instance_label(&entry.process, entry.instance_index).len())
            .chain(plan.proxy.iter().map(|_| "proxy".len()))
            .max()
            .unwrap_or(0);

        match &plan.proxy {
            Some(proxy) => alert(format!(
                "Starting Proxy Server [{}] {} -> ({}-{})",
                proxy.process,
                proxy.listen_port,
                proxy.first_upstream(),
                proxy.last_upstream()
            )),
            None => {
                for entry in plan.instances.iter().filter(|entry| entry.port == plan.base_port) {
                    alert(format!("Starting [{}] {}", entry.process, entry.port));
                }
            }
        }

        for entry in &plan.instances {
            let label = instance_label(&entry.process, entry.instance_index);
            let Some(command_line) = processes
                .iter()
                .find(|spec| spec.name == entry.process)
                .map(|spec| spec.command.clone())
            else {
                let source = io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no Procfile command for \"{}\"", entry.process),
                );
                return Err(self.abort(label, source).await);
            };

            let index = self.instances.len();
            self.instances.push(RunningInstance::starting(
                entry.process.clone(),
                entry.instance_index,
                entry.port,
            ));

            let mut command = Command::new(&self.options.shell);
            command.arg("-c").arg(&command_line);
            for (key, value) in env.child_vars() {
                command.env(key, value);
            }
            command.env("PORT", entry.port.to_string());

            match self.spawn(command, &label, Slot::Instance(index)) {
                Ok(pid) => {
                    let instance = &mut self.instances[index];
                    instance.pid = Some(pid);
                    instance.state = InstanceState::Running;
                    debug!(label = %label, pid, port = entry.port, command = %command_line, "Instance started");
                }
                Err(source) => {
                    self.instances[index].state = InstanceState::Failed;
                    return Err(self.abort(label, source).await);
                }
            }
        }

        if let Some(plan) = &plan.proxy {
            self.proxy = Some(ProxyProcess::starting(plan));
            let mut command = Command::new(&self.options.proxy_program);
            command
                .arg("proxy")
                .arg("--port")
                .arg(plan.listen_port.to_string())
                .arg("--upstream-host")
                .arg(&self.options.upstream_host)
                .arg("--upstream-port")
                .arg(plan.first_upstream().to_string())
                .arg("--upstream-size")
                .arg(plan.pool_size().to_string());

            match self.spawn(command, "proxy", Slot::Proxy) {
                Ok(pid) => {
                    if let Some(proxy) = self.proxy.as_mut() {
                        proxy.pid = Some(pid);
                        proxy.state = InstanceState::Running;
                    }
                    debug!(pid, port = plan.listen_port, "Proxy started");
                }
                Err(source) => {
                    if let Some(proxy) = self.proxy.as_mut() {
                        proxy.state = InstanceState::Failed;
                    }
                    return Err(self.abort("proxy".to_string(), source).await);
                }
            }
        }

        info!(
            instances = self.instances.len(),
            proxy = self.proxy.is_some(),
            "All processes started"
        );
        Ok(())
    }

    async fn abort(&mut self, label: String, source: io::Error) -> SpawnError {
        error!(label = %label, error = %source, "Spawn failed, stopping everything already started");
        self.shutdown().await;
        SpawnError { label, source }
    }

    fn spawn(&mut self, mut command: Command, label: &str, slot: Slot) -> io::Result<u32> {
        command
            .current_dir(&self.options.directory)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.options.mirror_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        platform::prepare_command(&mut command);

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("Failed to get child PID"))?;

        if self.options.mirror_output {
            let color = match slot {
                Slot::Instance(index) => LABEL_COLORS[index % LABEL_COLORS.len()],
                Slot::Proxy => Color::White,
            };
            let prefix = format!("{:<width$}", label, width = self.label_width);
            if let Some(stdout) = child.stdout.take() {
                self.tasks
                    .push(tokio::spawn(mirror_lines(stdout, prefix.clone(), color)));
            }
            if let Some(stderr) = child.stderr.take() {
                self.tasks.push(tokio::spawn(mirror_lines(stderr, prefix, color)));
            }
        }

        self.tasks.push(tokio::spawn(wait_for_exit(
            child,
            slot,
            self.events_tx.clone(),
        )));
        Ok(pid)
    }

    /// Processes exit notifications until `shutdown` resolves, then stops
    /// the whole topology.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events.recv() => {
                    self.record_exit(event);
                    if !self.any_alive() {
                        warn!("All processes have exited. Press Ctrl-C to stop.");
                    }
                }
            }
        }
        self.shutdown().await;
    }

    fn record_exit(&mut self, event: ExitEvent) {
        let (success, code, description) = match &event.status {
            Ok(status) => (status.success(), status.code(), describe_status(status)),
            Err(err) => (false, None, format!("could not be waited on: {err}")),
        };
        // Exits caused by our own termination request are not failures.
        let state = if self.stopping || success {
            InstanceState::Exited
        } else {
            InstanceState::Failed
        };

        match event.slot {
            Slot::Instance(index) => {
                let Some(instance) = self.instances.get_mut(index) else {
                    return;
                };
                instance.state = state;
                instance.exit_code = code;
                let label = instance.label();
                if self.stopping {
                    debug!(label = %label, "{}", description);
                } else if success {
                    info!(label = %label, port = instance.port, "Instance {}", description);
                } else {
                    warn!(label = %label, port = instance.port, "Instance {}", description);
                }
            }
            Slot::Proxy => {
                let Some(proxy) = self.proxy.as_mut() else {
                    return;
                };
                proxy.state = state;
                proxy.exit_code = code;
                if self.stopping {
                    debug!("Proxy {}", description);
                    return;
                }
                let range = proxy.upstream_range();
                error!(
                    port = proxy.listen_port,
                    upstreams = %range,
                    "Proxy server {}; public port is unreachable",
                    description
                );
                alert(
                    format!(
                        "Proxy Server [{}] {} {}. Port {} is unreachable; instances keep serving on {}.",
                        proxy.process, proxy.listen_port, description, proxy.listen_port, range
                    )
                    .red()
                    .bold()
                    .to_string(),
                );
            }
        }
    }

    fn live_pids(&self) -> Vec<u32> {
        self.instances
            .iter()
            .filter(|instance| instance.state.is_alive())
            .filter_map(|instance| instance.pid)
            .chain(
                self.proxy
                    .iter()
                    .filter(|proxy| proxy.state.is_alive())
                    .filter_map(|proxy| proxy.pid),
            )
            .collect()
    }

    /// Applies exit notifications that are already queued, without waiting.
    ///
    /// A child whose exit is still in the channel has been reaped, so its pid
    /// must not be signalled again.
    pub fn apply_pending_exits(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.record_exit(event);
        }
    }

    /// Terminates every tracked child and the proxy, force-killing whatever
    /// is still alive once the grace period has elapsed.
    pub async fn shutdown(&mut self) {
        self.apply_pending_exits();
        self.stopping = true;

        let pids = self.live_pids();
        if !pids.is_empty() {
            info!(count = pids.len(), grace = ?self.options.grace_period, "Stopping processes");
            for pid in &pids {
                platform::signal_group(*pid, ProcessSignal::Terminate);
            }
            self.drain_events(deadline_after(self.options.grace_period))
                .await;

            self.apply_pending_exits();
            let stubborn = self.live_pids();
            if !stubborn.is_empty() {
                warn!(
                    count = stubborn.len(),
                    "Processes still alive after grace period, killing"
                );
                for pid in &stubborn {
                    platform::signal_group(*pid, ProcessSignal::Kill);
                }
                self.drain_events(deadline_after(KILL_REAP_TIMEOUT)).await;
            }
        }

        // Dropping a waiter's `Child` kills it as a last resort.
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for instance in self.instances.iter_mut() {
            if instance.state.is_alive() {
                instance.state = InstanceState::Exited;
            }
        }
        if let Some(proxy) = self.proxy.as_mut() {
            if proxy.state.is_alive() {
                proxy.state = InstanceState::Exited;
            }
        }

        for (label, port, state) in self.snapshot() {
            info!(label = %label, port, state = %state, "Stopped");
        }
    }

    async fn drain_events(&mut self, deadline: Instant) {
        while self.any_alive_with_pid() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.record_exit(event),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn any_alive_with_pid(&self) -> bool {
        !self.live_pids().is_empty()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.apply_pending_exits();
        for pid in self.live_pids() {
            platform::signal_group(pid, ProcessSignal::Kill);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait).unwrap_or_else(|| now + MAX_GRACE_PERIOD)
}

async fn wait_for_exit(mut child: Child, slot: Slot, events: mpsc::UnboundedSender<ExitEvent>) {
    let status = child.wait().await;
    let _ = events.send(ExitEvent { slot, status });
}

async fn mirror_lines<R>(reader: R, prefix: String, color: Color)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                println!(
                    "{} {} | {}",
                    Local::now().format("%H:%M:%S"),
                    prefix.color(color),
                    text.trim_end_matches(['\r', '\n'])
                );
            }
            Err(err) => {
                debug!(prefix = %prefix.trim_end(), error = %err, "Output stream closed");
                break;
            }
        }
    }
}

fn alert(message: String) {
    println!(
        "{} {} | {}",
        Local::now().format("%H:%M:%S"),
        "restcoder".bold(),
        message
    );
}

fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was terminated by signal {signal}");
        }
    }
    "exited".to_string()
}
