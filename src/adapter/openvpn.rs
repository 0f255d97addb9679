use crate::adapter::{cfg_str, dial_tcp, BoxedStream, Outbound, OutboundType};
use crate::proxy::error::TransportError;
use crate::proxy::NetworkAddr;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const READY_MARKER: &str = "Initialization Sequence Completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    Idle,
    Spawning,
    WaitingInit,
    Ready,
    Terminating,
    Exited,
}

struct TunnelShared {
    phase: watch::Sender<TunnelPhase>,
    ready: AtomicBool,
    pid: AtomicU32,
    tun_ip: Mutex<Option<IpAddr>>,
}

impl TunnelShared {
    fn new() -> Self {
        let (phase, _) = watch::channel(TunnelPhase::Idle);
        Self {
            phase,
            ready: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            tun_ip: Mutex::new(None),
        }
    }

    fn set_phase(&self, phase: TunnelPhase) {
        self.phase.send_replace(phase);
    }

    fn phase(&self) -> TunnelPhase {
        *self.phase.borrow()
    }
}

/// Egress through an external OpenVPN tunnel process. The transport
/// supervises the child; once the tunnel reports ready, connects are plain
/// TCP dials that the OS route table steers through the tunnel interface.
pub struct OpenVpnOutbound {
    name: String,
    config_path: PathBuf,
    processed_config_path: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
    shared: Arc<TunnelShared>,
    started: tokio::sync::Mutex<bool>,
}

impl OpenVpnOutbound {
    pub fn new(name: &str, config: &HashMap<String, serde_json::Value>) -> Self {
        Self {
            name: name.to_string(),
            config_path: PathBuf::from(cfg_str(config, "config_path").unwrap_or_default()),
            processed_config_path: cfg_str(config, "processed_config_path").map(PathBuf::from),
            username: cfg_str(config, "username").map(str::to_string),
            password: cfg_str(config, "password").map(str::to_string),
            shared: Arc::new(TunnelShared::new()),
            started: tokio::sync::Mutex::new(false),
        }
    }

    /// The privileged helper may have rewritten the config; its output wins.
    fn effective_config(&self) -> &Path {
        self.processed_config_path
            .as_deref()
            .unwrap_or(&self.config_path)
    }

    async fn ensure_started(&self) -> Result<(), TransportError> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }
        self.spawn_tunnel().await?;
        *started = true;
        Ok(())
    }

    async fn spawn_tunnel(&self) -> Result<(), TransportError> {
        let config_path = self.effective_config().to_path_buf();
        let work_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.shared.set_phase(TunnelPhase::Spawning);

        let mut cmd = Command::new("openvpn");
        cmd.arg("--config")
            .arg(&config_path)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            let auth_path = work_dir.join("auth.txt");
            tokio::fs::write(&auth_path, format!("{}\n{}\n", user, pass))
                .await
                .map_err(TransportError::SpawnFailed)?;
            cmd.arg("--auth-user-pass").arg(&auth_path);
        }

        let mut child = cmd.spawn().map_err(|err| {
            self.shared.set_phase(TunnelPhase::Exited);
            TransportError::SpawnFailed(err)
        })?;
        if let Some(pid) = child.id() {
            self.shared.pid.store(pid, Ordering::Relaxed);
        }
        self.shared.set_phase(TunnelPhase::WaitingInit);
        tracing::info!("[OpenVPN:{}] tunnel process spawned", self.name);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::scan_output(
                self.shared.clone(),
                self.name.clone(),
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::scan_output(
                self.shared.clone(),
                self.name.clone(),
                stderr,
            ));
        }
        tokio::spawn(Self::supervise(self.shared.clone(), self.name.clone(), child));
        Ok(())
    }

    async fn scan_output<R>(shared: Arc<TunnelShared>, name: String, pipe: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("[OpenVPN:{}] {}", name, line);
            if line.contains("ifconfig") && line.contains("pointopoint") {
                if let Some(ip) = parse_pointopoint_ip(&line) {
                    *shared.tun_ip.lock().unwrap() = Some(ip);
                    tracing::info!("[OpenVPN:{}] tunnel interface address {}", name, ip);
                }
            }
            if line.contains(READY_MARKER) {
                shared.ready.store(true, Ordering::Release);
                shared.set_phase(TunnelPhase::Ready);
                tracing::info!("[OpenVPN:{}] tunnel ready", name);
                if shared.tun_ip.lock().unwrap().is_none() {
                    tokio::spawn(query_tun_ip_from_system(shared.clone(), name.clone()));
                }
            }
        }
    }

    async fn supervise(shared: Arc<TunnelShared>, name: String, mut child: Child) {
        let status = child.wait().await;
        shared.ready.store(false, Ordering::Release);
        shared.set_phase(TunnelPhase::Exited);
        match status {
            Ok(status) => tracing::info!("[OpenVPN:{}] tunnel process exited: {}", name, status),
            Err(err) => tracing::warn!("[OpenVPN:{}] tunnel process wait failed: {}", name, err),
        }
    }

    async fn wait_ready(&self) -> Result<(), TransportError> {
        if self.shared.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut rx = self.shared.phase.subscribe();
        let wait = async {
            loop {
                let phase = *rx.borrow();
                match phase {
                    TunnelPhase::Ready => return Ok(()),
                    TunnelPhase::Terminating | TunnelPhase::Exited => {
                        return Err(TransportError::TunnelNotReady)
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::TunnelNotReady);
                }
            }
        };
        tokio::time::timeout(STARTUP_TIMEOUT, wait)
            .await
            .map_err(|_| TransportError::TunnelTimeout)?
    }
}

#[async_trait]
impl Outbound for OpenVpnOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound_type(&self) -> OutboundType {
        OutboundType::Openvpn
    }

    fn is_running(&self) -> bool {
        matches!(
            self.shared.phase(),
            TunnelPhase::Spawning | TunnelPhase::WaitingInit | TunnelPhase::Ready
        )
    }

    async fn connect(&self, dst: &NetworkAddr) -> Result<BoxedStream, TransportError> {
        self.ensure_started().await?;
        self.wait_ready().await?;
        let stream = dial_tcp(dst, TUNNEL_DIAL_TIMEOUT).await?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        let phase = self.shared.phase();
        if matches!(phase, TunnelPhase::Idle | TunnelPhase::Exited) {
            return;
        }
        self.shared.set_phase(TunnelPhase::Terminating);
        self.shared.ready.store(false, Ordering::Release);
        let pid = self.shared.pid.load(Ordering::Relaxed);
        if pid == 0 {
            return;
        }
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let mut rx = self.shared.phase.subscribe();
        let wait_exit = async {
            loop {
                if *rx.borrow() == TunnelPhase::Exited {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(TERMINATE_GRACE, wait_exit).await.is_err() {
            tracing::warn!(
                "[OpenVPN:{}] tunnel process did not exit in time, killing",
                self.name
            );
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

/// In `/sbin/ifconfig tun0 10.8.0.6 pointopoint 10.8.0.5 mtu 1500` the local
/// tunnel address is the token before `pointopoint`.
fn parse_pointopoint_ip(line: &str) -> Option<IpAddr> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let pos = tokens.iter().position(|t| *t == "pointopoint")?;
    if pos == 0 {
        return None;
    }
    tokens[pos - 1].parse().ok()
}

/// Fallback when the log never carried an ifconfig line: ask the OS once the
/// interface is up.
async fn query_tun_ip_from_system(shared: Arc<TunnelShared>, name: String) {
    tokio::time::sleep(Duration::from_secs(2)).await;
    let output = if cfg!(target_os = "macos") {
        Command::new("ifconfig").output().await
    } else {
        Command::new("ip").arg("addr").output().await
    };
    let Ok(output) = output else {
        return;
    };
    let text = String::from_utf8_lossy(&output.stdout);
    if let Some(ip) = find_tun_inet(&text) {
        *shared.tun_ip.lock().unwrap() = Some(ip);
        tracing::info!("[OpenVPN:{}] tunnel interface address {} (queried)", name, ip);
    }
}

fn find_tun_inet(text: &str) -> Option<IpAddr> {
    for line in text.lines() {
        if !(line.contains("tun") && line.contains("inet")) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let Some(pos) = fields.iter().position(|f| *f == "inet") {
            if let Some(raw) = fields.get(pos + 1) {
                let candidate = raw.split('/').next().unwrap_or(raw);
                if let Ok(ip) = candidate.parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }
    None
}
