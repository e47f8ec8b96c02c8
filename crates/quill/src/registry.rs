//! Tool server discovery and routing.
//!
//! Tool servers are spawned as child processes from a JSON config file and
//! spoken to over stdio. Discovery retries a few times; the servers share a
//! local coordination port, and a stale holder of that port is killed
//! between attempts so a restart can bind it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParams, Tool},
    service::RunningService,
    transport::TokioChildProcess,
    RoleClient, ServiceExt,
};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info, instrument, warn};

use crate::error::{Error, Result};

const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Server launch config, in the conventional `mcpServers` JSON shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ServersConfig {
    #[serde(rename = "mcpServers")]
    pub servers: HashMap<String, ServerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServersConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid server config {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Discovering,
    Loaded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DiscoveryStatus {
    pub state: RegistryState,
    pub status: String,
    pub attempts: u32,
}

/// What the rest of the engine needs from the tool layer.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    fn is_loaded(&self) -> bool;
    async fn tools(&self) -> Vec<Tool>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String>;
}

/// Frees the coordination port between discovery attempts.
#[async_trait]
pub trait PortKiller: Send + Sync {
    async fn kill_port(&self, port: u16);
}

pub struct SystemPortKiller;

#[async_trait]
impl PortKiller for SystemPortKiller {
    #[cfg(unix)]
    async fn kill_port(&self, port: u16) {
        let output = Command::new("lsof")
            .args(["-ti", &format!("tcp:{port}")])
            .output()
            .await;
        let pids = match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
            Err(e) => {
                warn!("lsof failed while freeing port {port}: {e}");
                return;
            }
        };
        for pid in pids.split_whitespace() {
            info!(pid, port, "killing stale holder of coordination port");
            if let Err(e) = Command::new("kill").args(["-9", pid]).output().await {
                warn!("failed to kill pid {pid}: {e}");
            }
        }
    }

    #[cfg(windows)]
    async fn kill_port(&self, port: u16) {
        let output = Command::new("netstat").args(["-ano"]).output().await;
        let listing = match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
            Err(e) => {
                warn!("netstat failed while freeing port {port}: {e}");
                return;
            }
        };
        let needle = format!(":{port}");
        for line in listing.lines().filter(|l| l.contains(&needle)) {
            if let Some(pid) = line.split_whitespace().last() {
                info!(pid, port, "killing stale holder of coordination port");
                if let Err(e) = Command::new("taskkill")
                    .args(["/PID", pid, "/F"])
                    .output()
                    .await
                {
                    warn!("failed to kill pid {pid}: {e}");
                }
            }
        }
    }
}

/// A connection to one tool server over stdio.
struct ToolServerConnection {
    name: String,
    service: RunningService<RoleClient, ()>,
}

impl ToolServerConnection {
    #[instrument(skip(entry), fields(server = %name, command = %entry.command))]
    async fn connect(name: &str, entry: &ServerEntry) -> Result<Self> {
        info!("connecting to tool server");

        let command = shellexpand::tilde(&entry.command).to_string();
        let mut cmd = Command::new(command);
        cmd.args(&entry.args);
        for (key, value) in &entry.env {
            cmd.env(key, value);
        }

        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| Error::ToolServer(format!("failed to spawn '{name}': {e}")))?;
        let service = ()
            .serve(transport)
            .await
            .map_err(|e| Error::ToolServer(format!("failed to connect to '{name}': {e}")))?;

        Ok(ToolServerConnection {
            name: name.to_string(),
            service,
        })
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.service
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| Error::ToolServer(format!("failed to list tools from '{}': {e}", self.name)))
    }

    #[instrument(skip(self, arguments), fields(server = %self.name, tool = %name))]
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments: Some(arguments),
            meta: None,
            task: None,
        };
        let result = self.service.peer().call_tool(params).await.map_err(|e| {
            error!(error = %e, "tool call failed");
            Error::ToolServer(format!("tool '{name}' failed on '{}': {e}", self.name))
        })?;

        let content = result
            .content
            .into_iter()
            .map(|c| serde_json::to_string(&c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(content)
    }
}

#[derive(Default)]
struct Catalog {
    connections: Vec<ToolServerConnection>,
    tools: Vec<Tool>,
    /// Tool name to index into `connections`.
    routes: HashMap<String, usize>,
}

pub struct ToolRegistry {
    config_path: PathBuf,
    coordination_port: u16,
    retry_backoff: Duration,
    status: parking_lot::RwLock<DiscoveryStatus>,
    inner: tokio::sync::RwLock<Catalog>,
    killer: Arc<dyn PortKiller>,
}

impl ToolRegistry {
    pub fn new(config_path: PathBuf, coordination_port: u16) -> Self {
        Self::with_killer(
            config_path,
            coordination_port,
            Arc::new(SystemPortKiller),
            DEFAULT_RETRY_BACKOFF,
        )
    }

    pub fn with_killer(
        config_path: PathBuf,
        coordination_port: u16,
        killer: Arc<dyn PortKiller>,
        retry_backoff: Duration,
    ) -> Self {
        ToolRegistry {
            config_path,
            coordination_port,
            retry_backoff,
            status: parking_lot::RwLock::new(DiscoveryStatus {
                state: RegistryState::Discovering,
                status: "Connecting to tool servers...".to_string(),
                attempts: 0,
            }),
            inner: tokio::sync::RwLock::new(Catalog::default()),
            killer,
        }
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status.read().clone()
    }

    /// Run discovery in the background so the rest of startup is not
    /// blocked on tool servers coming up.
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = registry.discover().await {
                error!("tool discovery failed: {e}");
            }
        });
    }

    /// Connect every configured server and collect its tools, retrying up
    /// to [`MAX_ATTEMPTS`] times. The config file is re-read on every
    /// attempt so an edit between retries is picked up.
    pub async fn discover(&self) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            {
                let mut status = self.status.write();
                status.state = RegistryState::Discovering;
                status.attempts = attempt;
                status.status = if attempt == 1 {
                    "Connecting to tool servers...".to_string()
                } else {
                    format!("Retrying connection (attempt {attempt})...")
                };
            }

            match self.try_discover().await {
                Ok(count) => {
                    let mut status = self.status.write();
                    status.state = RegistryState::Loaded;
                    status.status = format!("{count} tools available");
                    info!(tools = count, attempt, "tool discovery complete");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, "tool discovery attempt failed: {e}");
                    last_error = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        self.killer.kill_port(self.coordination_port).await;
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
            }
        }

        let e = last_error
            .unwrap_or_else(|| Error::ToolServer("no tool servers configured".to_string()));
        let message = format!("Error after {MAX_ATTEMPTS} attempts: {e}");
        {
            let mut status = self.status.write();
            status.state = RegistryState::Failed;
            status.status = message;
        }
        Err(e)
    }

    async fn try_discover(&self) -> Result<usize> {
        let config = ServersConfig::load(&self.config_path)?;
        if config.servers.is_empty() {
            return Err(Error::ToolServer(format!(
                "no servers defined in {}",
                self.config_path.display()
            )));
        }

        let mut catalog = Catalog::default();
        let mut names: Vec<_> = config.servers.keys().cloned().collect();
        names.sort();
        for name in names {
            let entry = &config.servers[&name];
            let connection = ToolServerConnection::connect(&name, entry).await?;
            let tools = connection.list_tools().await?;
            let index = catalog.connections.len();
            for tool in tools {
                catalog.routes.insert(tool.name.to_string(), index);
                catalog.tools.push(tool);
            }
            catalog.connections.push(connection);
        }

        let count = catalog.tools.len();
        *self.inner.write().await = catalog;
        Ok(count)
    }

    /// Drop all connections and discover again.
    pub async fn refresh(&self) -> Result<()> {
        *self.inner.write().await = Catalog::default();
        self.discover().await
    }
}

#[async_trait]
impl ToolCatalog for ToolRegistry {
    fn is_loaded(&self) -> bool {
        self.status.read().state == RegistryState::Loaded
    }

    async fn tools(&self) -> Vec<Tool> {
        self.inner.read().await.tools.clone()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let catalog = self.inner.read().await;
        let index = *catalog
            .routes
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;
        catalog.connections[index].call_tool(name, arguments).await
    }
}

/// In-memory catalog for tests: a fixed tool list with canned results.
pub mod fixture {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct StaticCatalog {
        loaded: AtomicBool,
        tools: Vec<Tool>,
        results: HashMap<String, String>,
        failing: HashSet<String>,
        calls: Mutex<Vec<(String, serde_json::Map<String, serde_json::Value>)>>,
    }

    impl StaticCatalog {
        pub fn loaded(tools: Vec<Tool>) -> Self {
            StaticCatalog {
                loaded: AtomicBool::new(true),
                tools,
                ..Self::default()
            }
        }

        pub fn not_loaded() -> Self {
            Self::default()
        }

        pub fn with_result(mut self, tool: &str, result: &str) -> Self {
            self.results.insert(tool.to_string(), result.to_string());
            self
        }

        pub fn with_failure(mut self, tool: &str) -> Self {
            self.failing.insert(tool.to_string());
            self
        }

        pub fn calls(&self) -> Vec<(String, serde_json::Map<String, serde_json::Value>)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ToolCatalog for StaticCatalog {
        fn is_loaded(&self) -> bool {
            self.loaded.load(Ordering::SeqCst)
        }

        async fn tools(&self) -> Vec<Tool> {
            self.tools.clone()
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Map<String, serde_json::Value>,
        ) -> Result<String> {
            self.calls.lock().push((name.to_string(), arguments));
            if self.failing.contains(name) {
                return Err(Error::ToolServer(format!("'{name}' is down")));
            }
            match self.results.get(name) {
                Some(result) => Ok(result.clone()),
                None => Ok("ok".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn parses_servers_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{
                "mcpServers": {
                    "writer": {
                        "command": "office-writer-tools",
                        "args": ["--stdio"],
                        "env": {"OFFICE_PORT": "8765"}
                    }
                }
            }"#,
        )
        .unwrap();

        let config = ServersConfig::load(&path).unwrap();
        let entry = &config.servers["writer"];
        assert_eq!(entry.command, "office-writer-tools");
        assert_eq!(entry.args, vec!["--stdio"]);
        assert_eq!(entry.env["OFFICE_PORT"], "8765");
    }

    struct CountingKiller {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PortKiller for CountingKiller {
        async fn kill_port(&self, _port: u16) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn discovery_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{"mcpServers": {"broken": {"command": "/nonexistent/tool-server"}}}"#,
        )
        .unwrap();

        let killer = Arc::new(CountingKiller {
            calls: AtomicU32::new(0),
        });
        let registry =
            ToolRegistry::with_killer(path, 8765, killer.clone(), Duration::from_millis(0));

        let err = registry.discover().await.unwrap_err();
        assert!(matches!(err, Error::ToolServer(_)));

        let status = registry.status();
        assert_eq!(status.state, RegistryState::Failed);
        assert_eq!(status.attempts, 3);
        assert!(status.status.starts_with("Error after 3 attempts:"));
        // Port freed between attempts, not after the last one.
        assert_eq!(killer.calls.load(Ordering::SeqCst), 2);
        assert!(!registry.is_loaded());
    }

    #[tokio::test]
    async fn missing_config_is_a_config_error() {
        let registry = ToolRegistry::with_killer(
            PathBuf::from("/nonexistent/servers.json"),
            8765,
            Arc::new(CountingKiller {
                calls: AtomicU32::new(0),
            }),
            Duration::from_millis(0),
        );
        let err = registry.discover().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
