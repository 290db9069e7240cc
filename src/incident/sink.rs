//! Mitigation directives and the sinks that carry them out of process
//!
//! The engine never enforces anything itself. A directive is a small
//! serializable message handed to an `EnforcementSink`; what the receiving
//! side does with it (lock the account, push a firewall rule) is its own
//! business.

use crate::error::{AuditError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the enforcement collaborator is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    LockAccount,
    BlockIp,
    RevokePermissions,
}

impl DirectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectiveKind::LockAccount => "lock_account",
            DirectiveKind::BlockIp => "block_ip",
            DirectiveKind::RevokePermissions => "revoke_permissions",
        }
    }
}

impl std::fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire message for an enforcement collaborator
///
/// ```json
/// {"directive":"lock_account","target":"alice","incidentId":"inc-…","timestamp":"…"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitigationDirective {
    pub directive: DirectiveKind,
    /// User id or IP address, depending on the directive
    pub target: String,
    pub incident_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Destination for mitigation directives
#[async_trait]
pub trait EnforcementSink: Send + Sync {
    /// Hand one directive to the collaborator
    async fn deliver(&self, directive: &MitigationDirective) -> Result<()>;

    /// Sink name for logs
    fn name(&self) -> &str;
}

/// Sink that only records directives in the log
#[derive(Debug, Default, Clone)]
pub struct LogEnforcementSink;

#[async_trait]
impl EnforcementSink for LogEnforcementSink {
    async fn deliver(&self, directive: &MitigationDirective) -> Result<()> {
        tracing::warn!(
            directive = %directive.directive,
            target = %directive.target,
            incident = %directive.incident_id,
            "Mitigation directive issued"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Sink feeding an in-process handler through a bounded channel
pub struct ChannelEnforcementSink {
    tx: mpsc::Sender<MitigationDirective>,
}

impl ChannelEnforcementSink {
    /// Create the sink and the receiver the handler reads from
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MitigationDirective>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EnforcementSink for ChannelEnforcementSink {
    async fn deliver(&self, directive: &MitigationDirective) -> Result<()> {
        self.tx
            .send(directive.clone())
            .await
            .map_err(|_| AuditError::Delivery {
                sink: "channel".to_string(),
                reason: "handler dropped its receiver".to_string(),
            })
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Sink publishing JSON directives to a NATS subject
pub struct NatsEnforcementSink {
    client: async_nats::Client,
    subject: String,
}

impl NatsEnforcementSink {
    /// Connect to NATS and publish directives on `subject`
    pub async fn connect(url: &str, subject: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .map_err(|e| AuditError::Delivery {
                sink: "nats".to_string(),
                reason: format!("{}: {}", url, e),
            })?;

        let subject = subject.into();
        tracing::info!(url = %url, subject = %subject, "Enforcement sink connected to NATS");
        Ok(Self::new(client, subject))
    }

    /// Wrap an existing client
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl EnforcementSink for NatsEnforcementSink {
    async fn deliver(&self, directive: &MitigationDirective) -> Result<()> {
        let payload = serde_json::to_vec(directive)?;
        self.client
            .publish(self.subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| AuditError::Delivery {
                sink: "nats".to_string(),
                reason: e.to_string(),
            })?;
        self.client.flush().await.map_err(|e| AuditError::Delivery {
            sink: "nats".to_string(),
            reason: format!("flush failed: {}", e),
        })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
