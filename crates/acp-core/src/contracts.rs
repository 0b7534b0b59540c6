use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Starting,
    StartTimeout,
    StartError,
    Ready,
    ShuttingDown,
    ShutdownTimeout,
    ShutdownError,
    Off,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 9] = [
        LifecycleState::Created,
        LifecycleState::Starting,
        LifecycleState::StartTimeout,
        LifecycleState::StartError,
        LifecycleState::Ready,
        LifecycleState::ShuttingDown,
        LifecycleState::ShutdownTimeout,
        LifecycleState::ShutdownError,
        LifecycleState::Off,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::StartTimeout => "start_timeout",
            LifecycleState::StartError => "start_error",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::ShutdownTimeout => "shutdown_timeout",
            LifecycleState::ShutdownError => "shutdown_error",
            LifecycleState::Off => "off",
        }
    }

    /// True while the agent is still expected to push startup output.
    pub fn is_starting(&self) -> bool {
        matches!(self, LifecycleState::Created | LifecycleState::Starting)
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Created
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == input)
            .ok_or_else(|| format!("Unknown lifecycle state: {input:?}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connecting,
    Connected,
    Disconnected,
    Timeout,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Connecting => "connecting",
            AgentStatus::Connected => "connected",
            AgentStatus::Disconnected => "disconnected",
            AgentStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppHealth {
    Disabled,
    Initializing,
    Healthy,
    Unhealthy,
}

impl AppHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppHealth::Disabled => "disabled",
            AppHealth::Initializing => "initializing",
            AppHealth::Healthy => "healthy",
            AppHealth::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for AppHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppHealth {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "disabled" => Ok(AppHealth::Disabled),
            "initializing" => Ok(AppHealth::Initializing),
            "healthy" => Ok(AppHealth::Healthy),
            "unhealthy" => Ok(AppHealth::Unhealthy),
            other => Err(format!("Unknown app health: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Subsystem {
    #[serde(rename = "")]
    None,
    #[serde(rename = "envbox")]
    Envbox,
    #[serde(rename = "envbuilder")]
    Envbuilder,
    #[serde(rename = "exectrace")]
    Exectrace,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::None => "",
            Subsystem::Envbox => "envbox",
            Subsystem::Envbuilder => "envbuilder",
            Subsystem::Exectrace => "exectrace",
        }
    }
}

impl Default for Subsystem {
    fn default() -> Self {
        Self::None
    }
}

impl FromStr for Subsystem {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "" => Ok(Subsystem::None),
            "envbox" => Ok(Subsystem::Envbox),
            "envbuilder" => Ok(Subsystem::Envbuilder),
            "exectrace" => Ok(Subsystem::Exectrace),
            other => Err(format!("Unknown subsystem: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    /// Agents send an empty level for plain output lines.
    #[serde(alias = "")]
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// A log line as pushed by the agent, before the hub assigns it an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartupLog {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartupLogEntry {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub output: String,
    pub level: LogLevel,
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchLogsRequest {
    #[serde(default)]
    pub logs: Vec<StartupLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataDescriptor {
    pub key: String,
    pub display_name: String,
    pub script: String,
    /// Collection interval in seconds.
    pub interval: u64,
    /// Script timeout in seconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataResult {
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataItem {
    pub description: MetadataDescriptor,
    pub result: MetadataResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub revision: u64,
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Healthcheck {
    pub url: String,
    /// Seconds between probes.
    pub interval: u32,
    /// Consecutive failures before the app is reported unhealthy.
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppSpec {
    pub id: Uuid,
    pub slug: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestApp {
    #[serde(flatten)]
    pub app: AppSpec,
    pub health: AppHealth,
}

/// Agent declaration handed over by provisioning when a build is realized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSpec {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub auth_token: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub connection_timeout_seconds: u32,
    #[serde(default)]
    pub troubleshooting_url: String,
    #[serde(default)]
    pub metadata: Vec<MetadataDescriptor>,
    #[serde(default)]
    pub apps: Vec<AppSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildSpec {
    pub workspace_id: Uuid,
    pub build_id: Uuid,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentManifest {
    pub agent_id: Uuid,
    pub workspace_id: Uuid,
    pub build_id: Uuid,
    pub directory: String,
    pub connection_timeout_seconds: u32,
    pub troubleshooting_url: String,
    pub metadata: Vec<MetadataDescriptor>,
    pub apps: Vec<ManifestApp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentView {
    pub id: Uuid,
    pub name: String,
    pub workspace_id: Uuid,
    pub build_id: Uuid,
    pub status: AgentStatus,
    pub lifecycle_state: LifecycleState,
    pub lifecycle_changed_at: DateTime<Utc>,
    pub version: String,
    pub directory: String,
    pub expanded_directory: String,
    pub subsystem: Subsystem,
    pub troubleshooting_url: String,
    pub connection_timeout_seconds: u32,
    pub startup_logs_length: u64,
    pub startup_logs_overflowed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub first_connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub apps: Vec<ManifestApp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    pub workspace_id: Uuid,
    pub latest_build_id: Uuid,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub agents: Vec<AgentView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostLifecycleRequest {
    #[serde(default)]
    pub state: String,
}

/// Health values stay raw strings here so an unknown value is reported as a
/// validation failure instead of a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostAppHealthRequest {
    #[serde(default)]
    pub healths: HashMap<Uuid, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostStartupRequest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub expanded_directory: String,
    #[serde(default)]
    pub subsystem: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    #[serde(default)]
    pub connections_by_proto: HashMap<String, i64>,
    #[serde(default)]
    pub connection_count: i64,
    #[serde(default)]
    pub connection_median_latency_ms: f64,
    #[serde(default)]
    pub rx_packets: i64,
    #[serde(default)]
    pub rx_bytes: i64,
    #[serde(default)]
    pub tx_packets: i64,
    #[serde(default)]
    pub tx_bytes: i64,
    #[serde(default)]
    pub session_count_vscode: i64,
    #[serde(default)]
    pub session_count_jetbrains: i64,
    #[serde(default)]
    pub session_count_reconnecting_pty: i64,
    #[serde(default)]
    pub session_count_ssh: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub report_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListeningPort {
    pub network: String,
    pub port: u16,
    #[serde(default)]
    pub process_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListeningPortsResponse {
    #[serde(default)]
    pub ports: Vec<ListeningPort>,
}

/// Frames pushed to watchers over a streaming connection. Every stream ends
/// with an explicit `End` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WatchFrame {
    Logs(Vec<StartupLogEntry>),
    Metadata(MetadataSnapshot),
    Workspace(WorkspaceSnapshot),
    End(EndPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndPayload {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_tokens_parse_exactly() {
        for state in LifecycleState::ALL {
            assert_eq!(state.as_str().parse::<LifecycleState>(), Ok(state));
            let encoded = serde_json::to_value(state).expect("encode");
            assert_eq!(encoded, serde_json::json!(state.as_str()));
        }
        assert!("".parse::<LifecycleState>().is_err());
        assert!("nonexistent_state".parse::<LifecycleState>().is_err());
        assert!("Ready".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn subsystem_none_encodes_as_empty_string() {
        let encoded = serde_json::to_value(Subsystem::None).expect("encode");
        assert_eq!(encoded, serde_json::json!(""));
        let decoded: Subsystem = serde_json::from_str("\"envbox\"").expect("decode");
        assert_eq!(decoded, Subsystem::Envbox);
        assert!("docker".parse::<Subsystem>().is_err());
    }

    #[test]
    fn empty_log_level_reads_as_info() {
        let log: StartupLog = serde_json::from_str(
            r#"{"created_at":"2026-02-07T21:00:00Z","output":"hi","level":""}"#,
        )
        .expect("decode");
        assert_eq!(log.level, LogLevel::Info);
        let encoded = serde_json::to_value(log.level).expect("encode");
        assert_eq!(encoded, serde_json::json!("info"));
        assert!(serde_json::from_str::<LogLevel>("\"verbose\"").is_err());
    }

    #[test]
    fn startup_log_defaults_level_and_eof() {
        let log: StartupLog =
            serde_json::from_str(r#"{"created_at":"2026-02-07T21:00:00Z","output":"hi"}"#)
                .expect("decode");
        assert_eq!(log.level, LogLevel::Info);
        assert!(!log.eof);
    }

    #[test]
    fn watch_frame_is_tagged() {
        let frame = WatchFrame::End(EndPayload {
            reason: "eof".to_string(),
        });
        let encoded = serde_json::to_value(&frame).expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({"type": "end", "payload": {"reason": "eof"}})
        );
    }
}
