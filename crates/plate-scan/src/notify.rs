//! Downstream gate notification.
//!
//! After a successful recognition the watch loop POSTs the plate to the
//! parking gate endpoint. Delivery is fire-and-forget: failures are reported
//! to the caller for logging, never retried.

use std::fmt;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::Serialize;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GateNotifier {
    client: reqwest::Client,
    endpoint: Url,
    rfid: String,
}

#[derive(Debug, Serialize)]
struct GateNotification<'a> {
    #[serde(rename = "licensePlate")]
    license_plate: &'a str,
    rfid: &'a str,
}

#[derive(Debug)]
pub enum NotifyError {
    Client { source: reqwest::Error },
    Http { source: reqwest::Error },
    Status { status: StatusCode },
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Client { source } => {
                write!(f, "failed to build notification client: {source}")
            }
            NotifyError::Http { source } => {
                write!(f, "failed to deliver gate notification: {source}")
            }
            NotifyError::Status { status } => {
                write!(f, "parking gate rejected the notification (status {status})")
            }
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Client { source } | NotifyError::Http { source } => Some(source),
            NotifyError::Status { .. } => None,
        }
    }
}

impl GateNotifier {
    pub fn new(endpoint: Url, rfid: String) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .map_err(|source| NotifyError::Client { source })?;
        Ok(Self {
            client,
            endpoint,
            rfid,
        })
    }

    pub async fn notify(&self, plate: &str) -> Result<(), NotifyError> {
        let notification = GateNotification {
            license_plate: plate,
            rfid: &self.rfid,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&notification)
            .send()
            .await
            .map_err(|source| NotifyError::Http { source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status { status });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_payload_matches_gate_contract() {
        let notification = GateNotification {
            license_plate: "29A*67",
            rfid: "",
        };
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "licensePlate": "29A*67", "rfid": "" })
        );
    }
}
