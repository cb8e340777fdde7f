//! Periodic self-announcement to a discovery registry

use crate::config::{ServerConfig, ServiceMetadata};
use crate::service::http::{INTERFACE_PATH, PREDICTION_PATH};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Document posted to the registry on every tick
#[derive(Debug, Clone, Serialize)]
pub struct Announcement {
    pub api_key: String,
    pub name: String,
    pub sid: String,
    pub modality: String,
    pub anatomy: String,
    pub description: String,
    pub dimensionality: u8,
    pub port: u16,
    pub prediction_path: String,
    pub interface_path: String,
    pub announced_at: DateTime<Utc>,
}

impl Announcement {
    pub fn new(server: &ServerConfig, service: &ServiceMetadata) -> Self {
        Self {
            api_key: server.api_key.clone(),
            name: service.name.clone(),
            sid: service.sid.clone(),
            modality: service.modality.clone(),
            anatomy: service.anatomy.clone(),
            description: service.description.clone(),
            dimensionality: service.dimensionality,
            port: server.port,
            prediction_path: PREDICTION_PATH.to_string(),
            interface_path: INTERFACE_PATH.to_string(),
            announced_at: Utc::now(),
        }
    }
}

/// Posts an [`Announcement`] to the registry at a fixed interval
pub struct Announcer {
    client: reqwest::Client,
    registry_url: String,
    interval: Duration,
    server: ServerConfig,
    service: ServiceMetadata,
}

impl Announcer {
    pub fn new(server: &ServerConfig, service: &ServiceMetadata) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build registry client")?;
        Ok(Self {
            client,
            registry_url: server.registry_url.clone(),
            interval: Duration::from_secs(server.announce_interval_secs.max(1)),
            server: server.clone(),
            service: service.clone(),
        })
    }

    /// Send one announcement
    pub async fn announce_once(&self) -> Result<()> {
        let announcement = Announcement::new(&self.server, &self.service);
        self.client
            .post(&self.registry_url)
            .json(&announcement)
            .send()
            .await
            .with_context(|| format!("Failed to reach registry at {}", self.registry_url))?
            .error_for_status()
            .context("Registry rejected announcement")?;
        debug!(registry = %self.registry_url, name = %announcement.name, "Announced");
        Ok(())
    }

    /// Announce forever. Failures are logged and retried on the next tick.
    pub async fn run(self) {
        info!(
            registry = %self.registry_url,
            interval_secs = self.interval.as_secs(),
            "Starting registry announcements"
        );
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.announce_once().await {
                warn!(error = %e, "Announcement failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_document() {
        let mut server = ServerConfig::default();
        server.api_key = "secret".to_string();
        server.port = 9100;
        let service = ServiceMetadata::default();

        let json = serde_json::to_value(Announcement::new(&server, &service)).unwrap();
        assert_eq!(json["api_key"], "secret");
        assert_eq!(json["name"], "TEST");
        assert_eq!(json["sid"], "0000000");
        assert_eq!(json["modality"], "None");
        assert_eq!(json["dimensionality"], 3);
        assert_eq!(json["port"], 9100);
        assert_eq!(json["prediction_path"], "/predict");
        assert_eq!(json["interface_path"], "/interface");
        assert!(json["announced_at"].is_string());
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_an_error() {
        // Bind and release a port so nothing is listening on it
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut server = ServerConfig::default();
        server.registry_url = format!("http://127.0.0.1:{port}/announce");
        let announcer = Announcer::new(&server, &ServiceMetadata::default()).unwrap();
        assert!(announcer.announce_once().await.is_err());
    }
}
