use crate::config::PortFilterRule;
use crate::contracts::{AppSpec, ListeningPort};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortScanError {
    #[error("listening port discovery is not supported on this platform")]
    Unsupported,
    #[error("listening port discovery failed: {0}")]
    Io(String),
}

/// Anything that can enumerate the sockets an agent host is listening on.
#[async_trait]
pub trait PortSource: Send + Sync {
    async fn listening_ports(&self) -> Result<Vec<ListeningPort>, PortScanError>;
}

/// Fixed answer, for hosts whose ports are reported out of band.
#[derive(Debug, Clone, Default)]
pub struct StaticPortSource {
    ports: Vec<ListeningPort>,
}

impl StaticPortSource {
    pub fn new(ports: Vec<ListeningPort>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl PortSource for StaticPortSource {
    async fn listening_ports(&self) -> Result<Vec<ListeningPort>, PortScanError> {
        Ok(self.ports.clone())
    }
}

/// Reads TCP listeners from a procfs mount. Only meaningful on Linux.
#[derive(Debug, Clone)]
pub struct ProcNetPortSource {
    root: PathBuf,
}

impl ProcNetPortSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcNetPortSource {
    fn default() -> Self {
        Self::new("/proc")
    }
}

#[async_trait]
impl PortSource for ProcNetPortSource {
    async fn listening_ports(&self) -> Result<Vec<ListeningPort>, PortScanError> {
        if !cfg!(target_os = "linux") {
            return Err(PortScanError::Unsupported);
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_proc(&root))
            .await
            .map_err(|err| PortScanError::Io(err.to_string()))?
    }
}

fn scan_proc(root: &std::path::Path) -> Result<Vec<ListeningPort>, PortScanError> {
    let mut listeners = Vec::new();
    let mut found_table = false;
    for table in ["net/tcp", "net/tcp6"] {
        match std::fs::read_to_string(root.join(table)) {
            Ok(text) => {
                found_table = true;
                listeners.extend(parse_proc_net_tcp(&text));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(PortScanError::Io(format!("{table}: {err}"))),
        }
    }
    if !found_table {
        return Err(PortScanError::Io(format!(
            "no tcp tables under {}",
            root.display()
        )));
    }

    let names = socket_owners(root);
    let ports = listeners
        .into_iter()
        .map(|(port, inode)| ListeningPort {
            network: "tcp".to_string(),
            port,
            process_name: names.get(&inode).cloned().unwrap_or_default(),
        })
        .collect::<Vec<_>>();
    debug!(event = "ports_scanned", root = %root.display(), count = ports.len());
    Ok(ports)
}

const TCP_LISTEN: &str = "0A";

/// Extracts `(port, inode)` for every socket in the LISTEN state from the
/// text of `/proc/net/tcp` or `/proc/net/tcp6`. Malformed rows are skipped.
pub fn parse_proc_net_tcp(text: &str) -> Vec<(u16, u64)> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            Some((port, inode))
        })
        .collect()
}

/// Best-effort map from socket inode to owning process name. Processes we
/// cannot inspect are skipped.
fn socket_owners(root: &std::path::Path) -> HashMap<u64, String> {
    let mut owners = HashMap::new();
    let Ok(processes) = std::fs::read_dir(root) else {
        return owners;
    };
    for process in processes.flatten() {
        let pid_dir = process.path();
        let is_pid = process
            .file_name()
            .to_str()
            .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        let Ok(fds) = std::fs::read_dir(pid_dir.join("fd")) else {
            continue;
        };
        let mut comm: Option<String> = None;
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = target
                .to_str()
                .and_then(|t| t.strip_prefix("socket:["))
                .and_then(|t| t.strip_suffix(']'))
                .and_then(|t| t.parse::<u64>().ok())
            else {
                continue;
            };
            let name = comm.get_or_insert_with(|| {
                std::fs::read_to_string(pid_dir.join("comm"))
                    .map(|raw| raw.trim().to_string())
                    .unwrap_or_default()
            });
            owners.entry(inode).or_insert_with(|| name.clone());
        }
    }
    owners
}

/// Explicit ports in the agent's app URLs.
pub fn app_target_ports(apps: &[AppSpec]) -> BTreeSet<u16> {
    apps.iter()
        .filter_map(|app| app.url.as_deref())
        .filter_map(explicit_port)
        .collect()
}

/// The port written in `raw`, including one equal to the scheme default,
/// which `Url::port` normalizes away.
fn explicit_port(raw: &str) -> Option<u16> {
    let parsed = url::Url::parse(raw).ok()?;
    if let Some(port) = parsed.port() {
        return Some(port);
    }
    let default = parsed.port_or_known_default()?;
    let (_, rest) = raw.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let (_, written) = authority.rsplit_once(':')?;
    written
        .parse::<u16>()
        .ok()
        .filter(|port| *port == default)
}

/// Applies the port rule and drops tcp ports already served as apps. The
/// result is sorted and free of duplicates.
pub fn filter_ports(
    raw: Vec<ListeningPort>,
    rule: &PortFilterRule,
    app_ports: &BTreeSet<u16>,
) -> Vec<ListeningPort> {
    let mut seen = BTreeSet::new();
    let mut ports: Vec<ListeningPort> = raw
        .into_iter()
        .filter(|entry| rule.allows(entry.port))
        .filter(|entry| !(entry.network == "tcp" && app_ports.contains(&entry.port)))
        .filter(|entry| seen.insert((entry.network.clone(), entry.port)))
        .collect();
    ports.sort();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const PROC_NET_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41021 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41022 1 0000000000000000 100 0 0 10 0
   2: 0100007F:A2C4 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 41023 1 0000000000000000 20 4 30 10 -1
   3: garbage
";

    fn port(number: u16) -> ListeningPort {
        ListeningPort {
            network: "tcp".to_string(),
            port: number,
            process_name: String::new(),
        }
    }

    fn app(url: &str) -> AppSpec {
        AppSpec {
            id: Uuid::new_v4(),
            slug: "web".to_string(),
            display_name: String::new(),
            command: None,
            url: Some(url.to_string()),
            healthcheck: None,
        }
    }

    #[test]
    fn parses_only_listening_sockets() {
        let parsed = parse_proc_net_tcp(PROC_NET_TCP);
        assert_eq!(parsed, vec![(3000, 41021), (8080, 41022)]);
    }

    #[test]
    fn filter_drops_reserved_ignored_and_app_ports() {
        let raw = vec![port(8), port(22), port(9), port(3000), port(8080), port(8080)];
        let app_ports = app_target_ports(&[app("http://localhost:3000")]);
        let filtered = filter_ports(raw, &PortFilterRule::default(), &app_ports);
        let numbers: Vec<u16> = filtered.iter().map(|entry| entry.port).collect();
        assert_eq!(numbers, vec![9, 8080]);
    }

    #[test]
    fn default_port_written_in_app_url_is_excluded() {
        let app_ports = app_target_ports(&[
            app("http://localhost:80"),
            app("https://127.0.0.1:443/ui"),
        ]);
        assert_eq!(app_ports, BTreeSet::from([80, 443]));

        let filtered = filter_ports(vec![port(80), port(8000)], &PortFilterRule::default(), &app_ports);
        let numbers: Vec<u16> = filtered.iter().map(|entry| entry.port).collect();
        assert_eq!(numbers, vec![8000]);
    }

    #[test]
    fn app_urls_without_explicit_port_contribute_nothing() {
        let ports = app_target_ports(&[app("https://example.com/path"), app("not a url")]);
        assert!(ports.is_empty());
    }

    #[tokio::test]
    async fn proc_source_reads_a_fake_procfs() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let root = std::env::temp_dir().join(format!("acp-procfs-{}", Uuid::new_v4()));
        std::fs::create_dir_all(root.join("net")).expect("create net dir");
        std::fs::write(root.join("net/tcp"), PROC_NET_TCP).expect("write tcp table");

        let ports = ProcNetPortSource::new(root.clone())
            .listening_ports()
            .await
            .expect("scan");
        let numbers: Vec<u16> = ports.iter().map(|entry| entry.port).collect();
        assert_eq!(numbers, vec![3000, 8080]);

        std::fs::remove_dir_all(&root).expect("cleanup");
    }

    #[tokio::test]
    async fn missing_procfs_is_an_io_error() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let source = ProcNetPortSource::new("/definitely/not/a/procfs");
        assert!(matches!(
            source.listening_ports().await,
            Err(PortScanError::Io(_))
        ));
    }
}
