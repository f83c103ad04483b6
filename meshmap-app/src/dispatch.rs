//! Alert delivery worker.
//!
//! Drains the alert engine's delivery channel and pushes each alert to the
//! configured outputs: a webhook POST and QoS-1 broker publication on the
//! base topic plus its severity sub-topic. Every channel is best-effort; a
//! failing webhook never blocks the broker publish and vice versa.

use std::sync::Arc;
use std::time::Duration;

use meshmap_core::alerts::Alert;
use meshmap_core::config::MapsConfig;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct AlertDispatcher {
    webhook_url: Option<String>,
    mqtt: Option<(AsyncClient, String)>,
    client: reqwest::Client,
}

impl AlertDispatcher {
    /// Build from config; spawns the broker client's poll task when alert
    /// publication is configured.
    pub fn new(config: &MapsConfig, shutdown: watch::Receiver<bool>) -> Self {
        let mqtt = config.alert_mqtt_topic.as_ref().map(|base_topic| {
            let mut options = MqttOptions::new(
                format!("meshmap-alerts-{:08x}", std::process::id()),
                config.mqtt_broker.clone(),
                config.mqtt_port,
            );
            options.set_keep_alive(Duration::from_secs(30));
            if let Some(ref user) = config.mqtt_username {
                options.set_credentials(
                    user.clone(),
                    config.mqtt_password.clone().unwrap_or_default(),
                );
            }
            let (client, mut eventloop) = AsyncClient::new(options, 16);
            let mut poll_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = poll_shutdown.changed() => break,
                        event = eventloop.poll() => {
                            if let Err(e) = event {
                                debug!(error = %e, "alert publisher connection error");
                                tokio::time::sleep(Duration::from_secs(5)).await;
                            }
                        }
                    }
                }
            });
            (client, base_topic.clone())
        });

        Self {
            webhook_url: config.alert_webhook_url.clone(),
            mqtt,
            client: reqwest::Client::new(),
        }
    }

    /// Run until the channel closes or shutdown fires.
    pub async fn run(
        self: Arc<Self>,
        mut alerts: mpsc::UnboundedReceiver<Alert>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            webhook = self.webhook_url.is_some(),
            mqtt = self.mqtt.is_some(),
            "alert dispatcher started"
        );
        loop {
            let alert = tokio::select! {
                _ = shutdown.changed() => break,
                alert = alerts.recv() => match alert {
                    Some(alert) => alert,
                    None => break,
                },
            };
            self.deliver(&alert).await;
        }
        info!("alert dispatcher stopped");
    }

    async fn deliver(&self, alert: &Alert) {
        if let Some(ref url) = self.webhook_url {
            // Fire-and-forget so a slow webhook cannot delay broker delivery.
            let url = url.clone();
            let client = self.client.clone();
            let payload = alert.clone();
            tokio::spawn(async move {
                match client
                    .post(&url)
                    .json(&payload)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        warn!(status = %response.status(), "alert webhook response not OK")
                    }
                    Err(e) => warn!(error = %e, "alert webhook delivery failed"),
                }
            });
        }

        if let Some((ref client, ref base_topic)) = self.mqtt {
            let payload = match serde_json::to_vec(alert) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "alert serialization failed");
                    return;
                }
            };
            let severity_topic = format!("{base_topic}/{}", alert.severity.as_str());
            for topic in [base_topic.clone(), severity_topic] {
                if let Err(e) = client
                    .publish(topic.clone(), QoS::AtLeastOnce, false, payload.clone())
                    .await
                {
                    warn!(topic = %topic, error = %e, "alert broker publish failed");
                }
            }
        }
    }
}
