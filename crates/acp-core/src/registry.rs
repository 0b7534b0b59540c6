use crate::app_health::AppHealthMap;
use crate::config::RegistryConfig;
use crate::contracts::{
    AgentManifest, AgentSpec, AgentStats, AgentView, BuildSpec, LifecycleState, ListeningPort,
    MetadataResult, MetadataSnapshot, PostStartupRequest, StartupLog, StartupLogEntry,
    StatsResponse, Subsystem, WorkspaceSnapshot,
};
use crate::debounce::Debouncer;
use crate::dial::{AgentConn, AgentDialer, DialError};
use crate::error::AgentApiError;
use crate::fanout::Fanout;
use crate::lifecycle::LifecycleTracker;
use crate::log_buffer::StartupLogBuffer;
use crate::metadata::MetadataStore;
use crate::ports::{app_target_ports, filter_ports, PortScanError};
use crate::watch::{LogFollower, MetadataWatch, WorkspaceWatch};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tokens are only ever kept as this digest.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Requires a leading `v` followed by a semantic version, e.g. `v1.2.3`.
pub fn parse_agent_version(raw: &str) -> Result<semver::Version, AgentApiError> {
    let Some(rest) = raw.strip_prefix('v') else {
        return Err(AgentApiError::BadRequest(format!(
            "version {raw:?} must be a semantic version prefixed with 'v'"
        )));
    };
    semver::Version::parse(rest)
        .map_err(|err| AgentApiError::BadRequest(format!("invalid version {raw:?}: {err}")))
}

struct AgentState {
    lifecycle: LifecycleTracker,
    version: String,
    expanded_directory: String,
    subsystem: Subsystem,
    logs: StartupLogBuffer,
    metadata: MetadataStore,
    health: AppHealthMap,
}

struct AgentHandle {
    id: Uuid,
    workspace_id: Uuid,
    build_id: Uuid,
    spec: AgentSpec,
    token_digest: String,
    state: Mutex<AgentState>,
    logs: Fanout<Vec<StartupLogEntry>>,
    metadata_updates: Fanout<MetadataSnapshot>,
    debouncer: Debouncer,
    watchdog: std::sync::Mutex<Option<JoinHandle<()>>>,
    port_cache: Mutex<Option<(Instant, Vec<ListeningPort>)>>,
}

impl AgentHandle {
    fn new(
        mut spec: AgentSpec,
        workspace_id: Uuid,
        build_id: Uuid,
        config: &RegistryConfig,
        now: DateTime<Utc>,
    ) -> Arc<Self> {
        let token_digest = token_digest(&spec.auth_token);
        spec.auth_token.clear();
        let state = AgentState {
            lifecycle: LifecycleTracker::new(now),
            version: String::new(),
            expanded_directory: String::new(),
            subsystem: Subsystem::None,
            logs: StartupLogBuffer::new(config.log_ceiling_bytes),
            metadata: MetadataStore::new(spec.metadata.clone(), config.metadata_value_cap),
            health: AppHealthMap::new(spec.apps.clone()),
        };
        let id = spec.id;
        Arc::new_cyclic(|owner: &Weak<AgentHandle>| {
            let owner = owner.clone();
            let debouncer = Debouncer::spawn(
                config.debounce_window,
                config.debounce_max_delay,
                move || {
                    let owner = owner.clone();
                    async move {
                        let Some(handle) = owner.upgrade() else {
                            return false;
                        };
                        handle.emit_metadata().await
                    }
                },
            );
            AgentHandle {
                id,
                workspace_id,
                build_id,
                spec,
                token_digest,
                state: Mutex::new(state),
                logs: Fanout::new(format!("logs:{id}"), config.watcher_capacity),
                metadata_updates: Fanout::new(format!("metadata:{id}"), config.watcher_capacity),
                debouncer,
                watchdog: std::sync::Mutex::new(None),
                port_cache: Mutex::new(None),
            }
        })
    }

    /// Publishes one consistent snapshot. Returns `false` once the topic is
    /// closed so the debouncer can stop.
    async fn emit_metadata(&self) -> bool {
        if self.metadata_updates.is_closed() {
            return false;
        }
        let state = self.state.lock().await;
        let snapshot = state.metadata.snapshot();
        let watchers = self.metadata_updates.publish(&snapshot);
        debug!(
            event = "metadata_broadcast",
            agent_id = %self.id,
            revision = snapshot.revision,
            watchers = watchers
        );
        true
    }

    fn view(&self, state: &AgentState, config: &RegistryConfig, now: DateTime<Utc>) -> AgentView {
        let connection_timeout = Duration::from_secs(u64::from(self.spec.connection_timeout_seconds));
        let troubleshooting_url = self.troubleshooting_url(config);
        AgentView {
            id: self.id,
            name: self.spec.name.clone(),
            workspace_id: self.workspace_id,
            build_id: self.build_id,
            status: state
                .lifecycle
                .status(now, connection_timeout, config.inactivity_window),
            lifecycle_state: state.lifecycle.state(),
            lifecycle_changed_at: state.lifecycle.changed_at(),
            version: state.version.clone(),
            directory: self.spec.directory.clone(),
            expanded_directory: state.expanded_directory.clone(),
            subsystem: state.subsystem,
            troubleshooting_url,
            connection_timeout_seconds: self.spec.connection_timeout_seconds,
            startup_logs_length: state.logs.total_bytes(),
            startup_logs_overflowed: state.logs.is_overflowed(),
            created_at: state.lifecycle.created_at(),
            first_connected_at: state.lifecycle.first_connected_at(),
            last_connected_at: state.lifecycle.last_connected_at(),
            disconnected_at: state.lifecycle.disconnected_at(),
            apps: state.health.manifest_apps(),
        }
    }

    fn troubleshooting_url(&self, config: &RegistryConfig) -> String {
        if self.spec.troubleshooting_url.trim().is_empty() {
            config.default_troubleshooting_url.clone()
        } else {
            self.spec.troubleshooting_url.clone()
        }
    }

    fn shutdown(&self) {
        if let Some(task) = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.logs.close();
        self.metadata_updates.close();
    }
}

struct BuildRecord {
    workspace_id: Uuid,
    agent_ids: Vec<Uuid>,
}

struct WorkspaceState {
    latest_build_id: Uuid,
    last_used_at: DateTime<Utc>,
}

struct WorkspaceRecord {
    id: Uuid,
    state: Mutex<WorkspaceState>,
    updates: Fanout<WorkspaceSnapshot>,
    /// Serializes snapshot-and-publish so watchers see snapshots in order.
    broadcast_lock: Mutex<()>,
}

/// Owns every agent and its telemetry. Each agent's state sits behind its
/// own lock; no operation holds two agents' locks at once.
///
/// Lock order for the maps: `agents`, `tokens`, `builds`, `workspaces`.
pub struct Registry {
    config: RegistryConfig,
    dialer: Arc<dyn AgentDialer>,
    me: Weak<Registry>,
    agents: RwLock<HashMap<Uuid, Arc<AgentHandle>>>,
    tokens: RwLock<HashMap<String, Uuid>>,
    builds: RwLock<HashMap<Uuid, BuildRecord>>,
    workspaces: RwLock<HashMap<Uuid, Arc<WorkspaceRecord>>>,
}

impl Registry {
    pub fn new(config: RegistryConfig, dialer: Arc<dyn AgentDialer>) -> Arc<Self> {
        Arc::new_cyclic(|me| Registry {
            config,
            dialer,
            me: me.clone(),
            agents: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            builds: RwLock::new(HashMap::new()),
            workspaces: RwLock::new(HashMap::new()),
        })
    }

    /// Realizes a build: creates its agents, makes it the workspace's latest
    /// build and arms each agent's connection watchdog.
    pub async fn register_build(&self, build: BuildSpec) -> Result<(), AgentApiError> {
        validate_build(&build)?;
        let now = Utc::now();
        let workspace_id = build.workspace_id;
        let build_id = build.build_id;

        let created = {
            let mut agents = self.agents.write().await;
            let mut tokens = self.tokens.write().await;
            let mut builds = self.builds.write().await;
            let mut workspaces = self.workspaces.write().await;

            if builds.contains_key(&build_id) {
                return Err(AgentApiError::Conflict(format!(
                    "build {build_id} is already registered"
                )));
            }
            for agent in &build.agents {
                if agents.contains_key(&agent.id) {
                    return Err(AgentApiError::Conflict(format!(
                        "agent {} is already registered",
                        agent.id
                    )));
                }
                if tokens.contains_key(&token_digest(&agent.auth_token)) {
                    return Err(AgentApiError::Conflict(format!(
                        "token of agent {} is already in use",
                        agent.id
                    )));
                }
            }

            let mut created = Vec::with_capacity(build.agents.len());
            for spec in build.agents {
                let handle = AgentHandle::new(spec, workspace_id, build_id, &self.config, now);
                tokens.insert(handle.token_digest.clone(), handle.id);
                agents.insert(handle.id, handle.clone());
                created.push(handle);
            }
            builds.insert(
                build_id,
                BuildRecord {
                    workspace_id,
                    agent_ids: created.iter().map(|handle| handle.id).collect(),
                },
            );
            match workspaces.get(&workspace_id) {
                Some(record) => record.state.lock().await.latest_build_id = build_id,
                None => {
                    workspaces.insert(
                        workspace_id,
                        Arc::new(WorkspaceRecord {
                            id: workspace_id,
                            state: Mutex::new(WorkspaceState {
                                latest_build_id: build_id,
                                last_used_at: now,
                            }),
                            updates: Fanout::new(
                                format!("workspace:{workspace_id}"),
                                self.config.watcher_capacity,
                            ),
                            broadcast_lock: Mutex::new(()),
                        }),
                    );
                }
            }
            created
        };

        for handle in &created {
            self.arm_watchdog(handle);
        }
        info!(
            event = "build_registered",
            workspace_id = %workspace_id,
            build_id = %build_id,
            agents = created.len()
        );
        self.broadcast_workspace(workspace_id).await;
        Ok(())
    }

    /// Removes a build's agents and ends every stream they feed. The
    /// workspace goes with its last build.
    pub async fn destroy_build(&self, build_id: Uuid) -> Result<(), AgentApiError> {
        let (record, removed, orphaned) = {
            let mut agents = self.agents.write().await;
            let mut tokens = self.tokens.write().await;
            let mut builds = self.builds.write().await;
            let mut workspaces = self.workspaces.write().await;
            let record = builds
                .remove(&build_id)
                .ok_or_else(|| AgentApiError::NotFound(format!("build {build_id}")))?;
            let removed: Vec<Arc<AgentHandle>> = record
                .agent_ids
                .iter()
                .filter_map(|id| agents.remove(id))
                .collect();
            for handle in &removed {
                tokens.remove(&handle.token_digest);
            }
            let orphaned = if builds
                .values()
                .any(|build| build.workspace_id == record.workspace_id)
            {
                None
            } else {
                workspaces.remove(&record.workspace_id)
            };
            (record, removed, orphaned)
        };

        for handle in &removed {
            handle.shutdown();
        }
        info!(
            event = "build_destroyed",
            workspace_id = %record.workspace_id,
            build_id = %build_id,
            agents = removed.len()
        );
        match orphaned {
            Some(workspace) => {
                let _guard = workspace.broadcast_lock.lock().await;
                workspace.updates.close();
                info!(event = "workspace_removed", workspace_id = %workspace.id);
            }
            None => self.broadcast_workspace(record.workspace_id).await,
        }
        Ok(())
    }

    /// Resolves a bearer token to its agent. Agents of a superseded build are
    /// refused with a conflict.
    pub async fn authenticate(&self, token: &str) -> Result<Uuid, AgentApiError> {
        if token.trim().is_empty() {
            return Err(AgentApiError::Unauthorized("missing agent token".to_string()));
        }
        let agent_id = self.tokens.read().await.get(&token_digest(token)).copied();
        let Some(agent_id) = agent_id else {
            warn!(event = "agent_auth_failed");
            return Err(AgentApiError::Unauthorized("unknown agent token".to_string()));
        };
        let handle = self.handle(agent_id).await?;
        let latest = self.latest_build(handle.workspace_id).await;
        if latest != Some(handle.build_id) {
            warn!(
                event = "stale_build_rejected",
                agent_id = %agent_id,
                build_id = %handle.build_id
            );
            return Err(AgentApiError::outdated_build());
        }
        Ok(agent_id)
    }

    pub async fn manifest(&self, agent_id: Uuid) -> Result<AgentManifest, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let state = handle.state.lock().await;
        Ok(AgentManifest {
            agent_id: handle.id,
            workspace_id: handle.workspace_id,
            build_id: handle.build_id,
            directory: handle.spec.directory.clone(),
            connection_timeout_seconds: handle.spec.connection_timeout_seconds,
            troubleshooting_url: handle.troubleshooting_url(&self.config),
            metadata: handle.spec.metadata.clone(),
            apps: state.health.manifest_apps(),
        })
    }

    /// Appends a batch to the agent's startup logs and forwards whatever was
    /// stored to followers, including the lone EOF of a rejected oversized
    /// batch.
    pub async fn append_logs(
        &self,
        agent_id: Uuid,
        logs: Vec<StartupLog>,
    ) -> Result<Vec<StartupLogEntry>, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let (outcome, overflow_started) = {
            let mut state = handle.state.lock().await;
            let was_overflowed = state.logs.is_overflowed();
            let outcome = state.logs.append(logs);
            let forwarded = match &outcome {
                Ok(stored) => stored.as_slice(),
                Err(rejection) => rejection.admitted.as_slice(),
            };
            if !forwarded.is_empty() {
                handle.logs.publish(&forwarded.to_vec());
            }
            (outcome, !was_overflowed && state.logs.is_overflowed())
        };

        if overflow_started {
            warn!(
                event = "startup_logs_overflowed",
                agent_id = %agent_id,
                limit = self.config.log_ceiling_bytes
            );
            self.broadcast_workspace(handle.workspace_id).await;
        }
        match outcome {
            Ok(stored) => {
                debug!(event = "startup_logs_appended", agent_id = %agent_id, entries = stored.len());
                Ok(stored)
            }
            Err(rejection) => Err(rejection.error),
        }
    }

    /// Applies an agent-reported lifecycle token. Leaving the starting states
    /// ends the startup log stream if the agent never sent its own EOF.
    pub async fn set_lifecycle(
        &self,
        agent_id: Uuid,
        token: &str,
    ) -> Result<LifecycleState, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let next = {
            let mut state = handle.state.lock().await;
            let now = Utc::now();
            let next = state.lifecycle.transition(token, now).map_err(|err| {
                warn!(event = "lifecycle_rejected", agent_id = %agent_id, state = token);
                err
            })?;
            if !next.is_starting() {
                if let Some(eof) = state.logs.close_with_eof(now) {
                    handle.logs.publish(&vec![eof]);
                }
            }
            next
        };
        info!(event = "lifecycle_changed", agent_id = %agent_id, state = %next);
        self.broadcast_workspace(handle.workspace_id).await;
        Ok(next)
    }

    /// Stores a metadata result and schedules a debounced broadcast. Keys the
    /// manifest does not declare are accepted and dropped.
    pub async fn post_metadata(
        &self,
        agent_id: Uuid,
        key: &str,
        result: MetadataResult,
    ) -> Result<(), AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let stored = handle.state.lock().await.metadata.post(key, result);
        if stored {
            handle.debouncer.touch();
        } else {
            debug!(event = "metadata_key_ignored", agent_id = %agent_id, key = key);
        }
        Ok(())
    }

    pub async fn post_app_health(
        &self,
        agent_id: Uuid,
        healths: &HashMap<Uuid, String>,
    ) -> Result<(), AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let changed = handle.state.lock().await.health.apply(healths)?;
        if !changed.is_empty() {
            info!(event = "app_health_changed", agent_id = %agent_id, apps = changed.len());
            self.broadcast_workspace(handle.workspace_id).await;
        }
        Ok(())
    }

    pub async fn post_startup(
        &self,
        agent_id: Uuid,
        startup: PostStartupRequest,
    ) -> Result<(), AgentApiError> {
        parse_agent_version(&startup.version)?;
        let subsystem = startup
            .subsystem
            .parse::<Subsystem>()
            .map_err(AgentApiError::BadRequest)?;
        let handle = self.handle(agent_id).await?;
        {
            let mut state = handle.state.lock().await;
            state.version = startup.version.clone();
            state.expanded_directory = startup.expanded_directory;
            state.subsystem = subsystem;
        }
        info!(
            event = "agent_startup",
            agent_id = %agent_id,
            version = %startup.version,
            subsystem = subsystem.as_str()
        );
        self.broadcast_workspace(handle.workspace_id).await;
        Ok(())
    }

    /// Accepts a stats report, counts it as agent activity and moves the
    /// workspace's last-used time forward.
    pub async fn report_stats(
        &self,
        agent_id: Uuid,
        stats: &AgentStats,
    ) -> Result<StatsResponse, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let now = Utc::now();
        handle.state.lock().await.lifecycle.touch(now);
        if let Some(record) = self.workspace_record(handle.workspace_id).await {
            let mut workspace = record.state.lock().await;
            if now > workspace.last_used_at {
                workspace.last_used_at = now;
            }
        }
        debug!(
            event = "agent_stats",
            agent_id = %agent_id,
            connections = stats.connection_count,
            rx_bytes = stats.rx_bytes,
            tx_bytes = stats.tx_bytes
        );
        Ok(StatsResponse {
            report_interval_secs: self.config.stats_interval.as_secs(),
        })
    }

    pub async fn agent_connected(&self, agent_id: Uuid) -> Result<(), AgentApiError> {
        let handle = self.handle(agent_id).await?;
        handle.state.lock().await.lifecycle.touch(Utc::now());
        info!(event = "agent_connected", agent_id = %agent_id);
        self.broadcast_workspace(handle.workspace_id).await;
        Ok(())
    }

    pub async fn touch_agent(&self, agent_id: Uuid) -> Result<(), AgentApiError> {
        let handle = self.handle(agent_id).await?;
        handle.state.lock().await.lifecycle.touch(Utc::now());
        Ok(())
    }

    pub async fn agent_disconnected(&self, agent_id: Uuid) -> Result<(), AgentApiError> {
        let handle = self.handle(agent_id).await?;
        handle
            .state
            .lock()
            .await
            .lifecycle
            .mark_disconnected(Utc::now());
        info!(event = "agent_disconnected", agent_id = %agent_id);
        self.broadcast_workspace(handle.workspace_id).await;
        Ok(())
    }

    pub async fn agent(&self, agent_id: Uuid) -> Result<AgentView, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let state = handle.state.lock().await;
        Ok(handle.view(&state, &self.config, Utc::now()))
    }

    pub async fn logs_after(
        &self,
        agent_id: Uuid,
        after: u64,
    ) -> Result<Vec<StartupLogEntry>, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let entries = handle.state.lock().await.logs.entries_after(after);
        Ok(entries)
    }

    /// Everything stored after `after`, then live batches until EOF.
    pub async fn follow_logs(&self, agent_id: Uuid, after: u64) -> Result<LogFollower, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let state = handle.state.lock().await;
        let subscription = handle.logs.subscribe();
        let backlog = state.logs.entries_after(after);
        Ok(LogFollower::new(
            after,
            backlog,
            state.logs.is_closed(),
            subscription,
        ))
    }

    pub async fn watch_metadata(&self, agent_id: Uuid) -> Result<MetadataWatch, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let state = handle.state.lock().await;
        let subscription = handle.metadata_updates.subscribe();
        Ok(MetadataWatch::new(state.metadata.snapshot(), subscription))
    }

    /// Filtered listening ports of the agent's host, cached briefly.
    pub async fn list_ports(&self, agent_id: Uuid) -> Result<Vec<ListeningPort>, AgentApiError> {
        let handle = self.handle(agent_id).await?;
        let mut cache = handle.port_cache.lock().await;
        if let Some((fetched_at, ports)) = cache.as_ref() {
            if fetched_at.elapsed() < self.config.port_cache_ttl {
                return Ok(ports.clone());
            }
        }

        let conn = self.dial_agent(agent_id).await?;
        if !conn.await_reachable(self.config.dial_timeout).await {
            warn!(event = "agent_unreachable", agent_id = %agent_id);
            return Err(AgentApiError::Internal(
                DialError::Unreachable(agent_id).to_string(),
            ));
        }
        let raw = match conn.listening_ports().await {
            Ok(ports) => ports,
            Err(PortScanError::Unsupported) => {
                debug!(event = "ports_unsupported", agent_id = %agent_id);
                Vec::new()
            }
            Err(err) => {
                warn!(event = "ports_failed", agent_id = %agent_id, error = %err);
                return Err(AgentApiError::Internal(err.to_string()));
            }
        };
        let ports = filter_ports(
            raw,
            &self.config.port_filter,
            &app_target_ports(&handle.spec.apps),
        );
        *cache = Some((Instant::now(), ports.clone()));
        Ok(ports)
    }

    pub async fn dial_agent(&self, agent_id: Uuid) -> Result<Arc<dyn AgentConn>, AgentApiError> {
        self.handle(agent_id).await?;
        self.dialer
            .dial(agent_id)
            .await
            .map_err(|err| AgentApiError::Internal(err.to_string()))
    }

    pub async fn workspace(&self, workspace_id: Uuid) -> Result<WorkspaceSnapshot, AgentApiError> {
        let record = self
            .workspace_record(workspace_id)
            .await
            .ok_or_else(|| AgentApiError::NotFound(format!("workspace {workspace_id}")))?;
        Ok(self.workspace_snapshot(&record).await)
    }

    pub async fn watch_workspace(&self, workspace_id: Uuid) -> Result<WorkspaceWatch, AgentApiError> {
        let record = self
            .workspace_record(workspace_id)
            .await
            .ok_or_else(|| AgentApiError::NotFound(format!("workspace {workspace_id}")))?;
        let _guard = record.broadcast_lock.lock().await;
        let subscription = record.updates.subscribe();
        let snapshot = self.workspace_snapshot(&record).await;
        Ok(WorkspaceWatch::new(snapshot, subscription))
    }

    async fn handle(&self, agent_id: Uuid) -> Result<Arc<AgentHandle>, AgentApiError> {
        self.agents
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| AgentApiError::NotFound(format!("agent {agent_id}")))
    }

    async fn workspace_record(&self, workspace_id: Uuid) -> Option<Arc<WorkspaceRecord>> {
        self.workspaces.read().await.get(&workspace_id).cloned()
    }

    async fn latest_build(&self, workspace_id: Uuid) -> Option<Uuid> {
        let record = self.workspace_record(workspace_id).await?;
        let latest = record.state.lock().await.latest_build_id;
        Some(latest)
    }

    fn arm_watchdog(&self, handle: &Arc<AgentHandle>) {
        let timeout = handle.spec.connection_timeout_seconds;
        if timeout == 0 {
            return;
        }
        let registry = self.me.clone();
        let agent_id = handle.id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(timeout))).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire_start(agent_id).await;
            }
        });
        *handle
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    async fn expire_start(&self, agent_id: Uuid) {
        let Ok(handle) = self.handle(agent_id).await else {
            return;
        };
        let expired = handle.state.lock().await.lifecycle.expire_start(Utc::now());
        if expired {
            warn!(
                event = "agent_start_timeout",
                agent_id = %agent_id,
                timeout_seconds = handle.spec.connection_timeout_seconds
            );
            self.broadcast_workspace(handle.workspace_id).await;
        }
    }

    async fn workspace_snapshot(&self, record: &WorkspaceRecord) -> WorkspaceSnapshot {
        let (latest_build_id, last_used_at) = {
            let state = record.state.lock().await;
            (state.latest_build_id, state.last_used_at)
        };
        let agent_ids = self
            .builds
            .read()
            .await
            .get(&latest_build_id)
            .map(|build| build.agent_ids.clone())
            .unwrap_or_default();
        let handles: Vec<Arc<AgentHandle>> = {
            let agents = self.agents.read().await;
            agent_ids
                .iter()
                .filter_map(|id| agents.get(id).cloned())
                .collect()
        };

        let now = Utc::now();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            let state = handle.state.lock().await;
            views.push(handle.view(&state, &self.config, now));
        }
        WorkspaceSnapshot {
            workspace_id: record.id,
            latest_build_id,
            last_used_at,
            agents: views,
        }
    }

    async fn broadcast_workspace(&self, workspace_id: Uuid) {
        let Some(record) = self.workspace_record(workspace_id).await else {
            return;
        };
        let _guard = record.broadcast_lock.lock().await;
        let snapshot = self.workspace_snapshot(&record).await;
        let watchers = record.updates.publish(&snapshot);
        debug!(
            event = "workspace_broadcast",
            workspace_id = %workspace_id,
            watchers = watchers
        );
    }
}

fn validate_build(build: &BuildSpec) -> Result<(), AgentApiError> {
    let mut agent_ids = HashSet::new();
    let mut tokens = HashSet::new();
    for agent in &build.agents {
        if !agent_ids.insert(agent.id) {
            return Err(AgentApiError::BadRequest(format!(
                "agent {} is declared twice",
                agent.id
            )));
        }
        if agent.auth_token.trim().is_empty() {
            return Err(AgentApiError::BadRequest(format!(
                "agent {} has no auth token",
                agent.id
            )));
        }
        if !tokens.insert(agent.auth_token.as_str()) {
            return Err(AgentApiError::BadRequest(format!(
                "agent {} reuses another agent's token",
                agent.id
            )));
        }
        let mut keys = HashSet::new();
        for descriptor in &agent.metadata {
            if descriptor.key.is_empty() || !keys.insert(descriptor.key.as_str()) {
                return Err(AgentApiError::BadRequest(format!(
                    "agent {} declares metadata key {:?} more than once or empty",
                    agent.id, descriptor.key
                )));
            }
        }
        let mut apps = HashSet::new();
        for app in &agent.apps {
            if !apps.insert(app.id) {
                return Err(AgentApiError::BadRequest(format!(
                    "agent {} declares app {} twice",
                    agent.id, app.id
                )));
            }
        }
    }
    Ok(())
}
