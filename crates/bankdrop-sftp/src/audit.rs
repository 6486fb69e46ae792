//! Audit trail
//!
//! NIST 800-53: AU-2 (Audit Events), AU-3 (Content of Audit Records), AU-12 (Audit Generation)
//! Implementation: security-relevant events as serializable records, emitted
//! through `tracing` so the configured subscriber decides where they land.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{info, warn};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    /// TCP connection accepted
    ConnectionEstablished {
        /// Client IP address
        client_ip: Option<IpAddr>,
        /// Event timestamp
        timestamp: DateTime<Utc>,
    },
    /// Connection torn down
    ConnectionClosed {
        /// Client IP address
        client_ip: Option<IpAddr>,
        /// Authenticated username
        username: Option<String>,
        /// Event timestamp
        timestamp: DateTime<Utc>,
        /// Session duration in seconds
        duration_secs: i64,
        /// Why the connection ended
        reason: String,
    },
    /// Authentication attempt
    AuthAttempt {
        /// Client IP address
        client_ip: Option<IpAddr>,
        /// Username attempted
        username: String,
        /// Event timestamp
        timestamp: DateTime<Utc>,
        /// Whether authentication succeeded
        success: bool,
        /// Failure reason if applicable
        reason: Option<String>,
    },
    /// File or directory operation
    FileOperation {
        /// Client IP address
        client_ip: Option<IpAddr>,
        /// Authenticated username
        username: Option<String>,
        /// Operation type (OPEN, CLOSE, REMOVE, ...)
        operation: String,
        /// Resolved path
        path: String,
        /// Event timestamp
        timestamp: DateTime<Utc>,
        /// Whether operation succeeded
        success: bool,
        /// Bytes transferred if applicable
        bytes_transferred: Option<u64>,
        /// Error message if failed
        error: Option<String>,
    },
}

impl AuditEvent {
    /// Log the audit event
    pub fn log(&self) {
        match self {
            Self::ConnectionEstablished { client_ip, .. } => {
                info!(
                    event = "connection_established",
                    client_ip = ?client_ip,
                    audit = ?self,
                    "New connection established"
                );
            }
            Self::ConnectionClosed {
                username,
                duration_secs,
                reason,
                ..
            } => {
                info!(
                    event = "connection_closed",
                    username = ?username,
                    duration_secs,
                    reason = %reason,
                    audit = ?self,
                    "Connection closed"
                );
            }
            Self::AuthAttempt {
                username,
                success,
                reason,
                ..
            } => {
                if *success {
                    info!(
                        event = "auth_success",
                        username = %username,
                        audit = ?self,
                        "Authentication successful"
                    );
                } else {
                    warn!(
                        event = "auth_failure",
                        username = %username,
                        reason = ?reason,
                        audit = ?self,
                        "Authentication failed"
                    );
                }
            }
            Self::FileOperation {
                username,
                operation,
                path,
                success,
                bytes_transferred,
                error,
                ..
            } => {
                if *success {
                    info!(
                        event = "file_operation",
                        username = ?username,
                        operation = %operation,
                        path = %path,
                        bytes = ?bytes_transferred,
                        "File operation completed"
                    );
                } else {
                    warn!(
                        event = "file_operation_failed",
                        username = ?username,
                        operation = %operation,
                        path = %path,
                        error = ?error,
                        "File operation failed"
                    );
                }
            }
        }
    }

    /// Export as JSON
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization errors.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_attempt_json_is_tagged() {
        let event = AuditEvent::AuthAttempt {
            client_ip: "127.0.0.1".parse().ok(),
            username: "drywall".to_string(),
            timestamp: Utc::now(),
            success: false,
            reason: Some("key not authorized".to_string()),
        };

        let json = event.to_json().unwrap();
        assert!(json.contains("\"event_type\":\"AuthAttempt\""));
        assert!(json.contains("\"username\":\"drywall\""));
        assert!(json.contains("key not authorized"));
    }

    #[test]
    fn test_file_operation_round_trips_through_serde() {
        let event = AuditEvent::FileOperation {
            client_ip: None,
            username: Some("drywall".to_string()),
            operation: "CLOSE".to_string(),
            path: "/srv/upload/data.csv".to_string(),
            timestamp: Utc::now(),
            success: true,
            bytes_transferred: Some(100),
            error: None,
        };

        let parsed: AuditEvent = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        match parsed {
            AuditEvent::FileOperation {
                bytes_transferred, ..
            } => assert_eq!(bytes_transferred, Some(100)),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
