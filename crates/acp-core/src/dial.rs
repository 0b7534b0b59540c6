use crate::contracts::ListeningPort;
use crate::ports::{PortScanError, PortSource};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("agent {0} is unreachable")]
    Unreachable(Uuid),
}

/// A live session with one agent.
#[async_trait]
pub trait AgentConn: Send + Sync {
    /// Waits up to `timeout` for the agent to answer. `false` when it never did.
    async fn await_reachable(&self, timeout: Duration) -> bool;

    async fn listening_ports(&self) -> Result<Vec<ListeningPort>, PortScanError>;
}

#[async_trait]
pub trait AgentDialer: Send + Sync {
    async fn dial(&self, agent_id: Uuid) -> Result<Arc<dyn AgentConn>, DialError>;
}

/// Dialer for agents that share the hub's host. Every agent answers with
/// the same port source.
#[derive(Clone)]
pub struct LocalDialer {
    source: Arc<dyn PortSource>,
}

impl LocalDialer {
    pub fn new(source: Arc<dyn PortSource>) -> Self {
        Self { source }
    }
}

struct LocalConn {
    source: Arc<dyn PortSource>,
}

#[async_trait]
impl AgentConn for LocalConn {
    async fn await_reachable(&self, _timeout: Duration) -> bool {
        true
    }

    async fn listening_ports(&self) -> Result<Vec<ListeningPort>, PortScanError> {
        self.source.listening_ports().await
    }
}

#[async_trait]
impl AgentDialer for LocalDialer {
    async fn dial(&self, _agent_id: Uuid) -> Result<Arc<dyn AgentConn>, DialError> {
        Ok(Arc::new(LocalConn {
            source: self.source.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StaticPortSource;

    #[tokio::test]
    async fn local_dialer_answers_from_its_source() {
        let source = StaticPortSource::new(vec![ListeningPort {
            network: "tcp".to_string(),
            port: 8080,
            process_name: "python3".to_string(),
        }]);
        let dialer = LocalDialer::new(Arc::new(source));
        let conn = dialer.dial(Uuid::new_v4()).await.expect("dial");
        assert!(conn.await_reachable(Duration::from_secs(1)).await);
        let ports = conn.listening_ports().await.expect("ports");
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].process_name, "python3");
    }
}
