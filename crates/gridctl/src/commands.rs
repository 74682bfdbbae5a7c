use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;

use gridctl_config::StackConfig;
use gridctl_core::GatewayError;
use gridctl_core::logbuf::LogBuffer;
use gridctl_gateway::Gateway;

/// Command failures split by exit code: configuration problems exit 2,
/// everything else exits 1.
#[derive(Debug)]
pub enum CliError {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

impl From<anyhow::Error> for CliError {
    fn from(error: anyhow::Error) -> Self {
        Self::Runtime(error)
    }
}

pub async fn up(stack_path: PathBuf, detach: bool, logs: Arc<LogBuffer>) -> Result<(), CliError> {
    if detach {
        let pid = spawn_background(&stack_path)?;
        println!("gridctl started in background (pid={pid})");
        return Ok(());
    }

    let stack = StackConfig::load(&stack_path).map_err(CliError::Config)?;
    let stack_name = if stack.name.is_empty() {
        "default".to_string()
    } else {
        stack.name.clone()
    };

    let lock = gridctl_lock::acquire(&gridctl_lock::default_runtime_dir(), &stack_name)
        .map_err(CliError::Runtime)?;

    let bind = format!("{}:{}", stack.gateway.bind, stack.gateway.port);
    let gateway = Gateway::build(stack, Some(stack_path), logs)
        .await
        .map_err(|error| match error {
            GatewayError::Configuration(_) => CliError::Config(anyhow::Error::new(error)),
            other => CliError::Runtime(anyhow::Error::new(other)),
        })?;

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind gateway at {bind}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve gateway address")?;
    println!("gridctl gateway listening on http://{local_addr}");

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    gateway
        .run(listener)
        .await
        .map_err(|error| CliError::Runtime(anyhow::Error::new(error)))?;

    drop(lock);
    Ok(())
}

pub async fn down() -> Result<(), CliError> {
    let runtime_dir = gridctl_lock::default_runtime_dir();
    match gridctl_lock::read_diagnostic(&runtime_dir).map_err(CliError::Runtime)? {
        Some(diagnostic) => {
            send_sigterm(diagnostic.pid)?;
            println!(
                "sent shutdown signal to gridctl (pid={}, stack '{}')",
                diagnostic.pid, diagnostic.stack
            );
            Ok(())
        }
        None => {
            println!("gridctl is not running");
            Ok(())
        }
    }
}

fn send_sigterm(pid: u32) -> Result<(), CliError> {
    // SAFETY: `kill` with SIGTERM has no preconditions; the return value
    // is checked.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        return Err(CliError::Runtime(anyhow::anyhow!(
            "failed to signal pid {pid}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

pub async fn status(url: &str) -> Result<(), CliError> {
    let body = api_request(url, "/api/status", reqwest::Method::GET).await?;
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    Ok(())
}

pub async fn reload(url: &str) -> Result<(), CliError> {
    let body = api_request(url, "/api/reload", reqwest::Method::POST).await?;
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    Ok(())
}

async fn api_request(
    base: &str,
    path: &str,
    method: reqwest::Method,
) -> Result<serde_json::Value, CliError> {
    let url = format!("{}{path}", base.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let mut request = client.request(method, &url);
    if let Ok(token) = std::env::var("GRIDCTL_API_KEY") {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("is gridctl running? request to {url} failed"))?;
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("invalid response from {url}"))?;

    if !status.is_success() {
        return Err(CliError::Runtime(anyhow::anyhow!(
            "{url} returned {status}: {body}"
        )));
    }
    Ok(body)
}

pub fn validate(stack_path: &Path) -> Result<(), CliError> {
    let stack = StackConfig::load(stack_path).map_err(CliError::Config)?;

    println!(
        "stack '{}' is valid: {} mcp server(s), {} agent(s)",
        if stack.name.is_empty() { "unnamed" } else { &stack.name },
        stack.mcp_servers.len(),
        stack.agents.len()
    );
    for server in &stack.mcp_servers {
        println!("  - {} ({})", server.name, server.transport.label());
    }
    for agent in &stack.agents {
        println!(
            "  - agent {} ({} selector(s){})",
            agent.name,
            agent.uses.len(),
            if agent.a2a.enabled { ", a2a" } else { "" }
        );
    }
    Ok(())
}

fn spawn_background(stack_path: &Path) -> Result<u32, CliError> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("up").arg("--stack").arg(stack_path);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

    let child = cmd
        .spawn()
        .context("failed to spawn background gridctl")?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_stack(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("gridctl.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn validate_accepts_a_good_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stack(
            dir.path(),
            "name: ok\nmcp_servers:\n  - name: local\n    command: [\"srv\"]\n",
        );
        assert!(validate(&path).is_ok());
    }

    #[test]
    fn validate_classifies_bad_stacks_as_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stack(
            dir.path(),
            "mcp_servers:\n  - name: bad\n    url: x\n    transport: websocket\n",
        );
        match validate(&path) {
            Err(CliError::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn missing_stack_file_is_a_config_error() {
        match validate(Path::new("/nonexistent/gridctl.yaml")) {
            Err(CliError::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
