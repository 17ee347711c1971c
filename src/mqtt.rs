use crate::config::MqttConfig;
use crate::error::AppError;
use std::time::Duration;
use uuid::Uuid;

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type V5Publish = mqtt5::mqttbytes::v5::Publish;
pub type QoS = mqtt5::mqttbytes::QoS;

const TLS_PORT: u16 = 8883;

pub fn build_options(cfg: &MqttConfig) -> Result<MqttOptions, AppError> {
    if cfg.host.trim().is_empty() {
        return Err(AppError::Config("mqtt.host is empty".into()));
    }
    // A fixed id would make two bridge instances kick each other off the broker.
    let client_id = format!("{}-{}", cfg.client_id, Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_start(cfg.clean_session.unwrap_or(true));
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if let Some(transport) = transport(cfg)? {
        opts.set_transport(transport);
    }
    Ok(opts)
}

/// TLS when configured or on the standard TLS port. A configured CA bundle replaces the
/// default roots.
fn transport(cfg: &MqttConfig) -> Result<Option<Transport>, AppError> {
    if let Some(path) = cfg.tls.as_ref().and_then(|t| t.ca_file.as_deref()) {
        let ca = std::fs::read(path)
            .map_err(|e| AppError::Config(format!("reading mqtt.tls.ca_file {path}: {e}")))?;
        return Ok(Some(Transport::tls(ca, None, None)));
    }
    if cfg.tls.is_some() || cfg.port == TLS_PORT {
        return Ok(Some(Transport::tls_with_default_config()));
    }
    Ok(None)
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    mqtt5::AsyncClient::new(options, 50)
}

pub enum MqttEvent {
    /// (Re)connected; subscriptions must be renewed on a clean session.
    Connected,
    Publish(V5Publish),
}

pub async fn next_event(eventloop: &mut EventLoop) -> Result<MqttEvent, AppError> {
    loop {
        match eventloop.poll().await {
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p))) => {
                return Ok(MqttEvent::Publish(p))
            }
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_))) => {
                return Ok(MqttEvent::Connected)
            }
            Ok(_) => continue,
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use rumqttc::TlsConfiguration;

    fn cfg(port: u16) -> MqttConfig {
        MqttConfig {
            host: "broker.local".into(),
            port,
            client_id: "altherma-bridge".into(),
            username: Some("u".into()),
            password: Some("p".into()),
            keep_alive_secs: Some(15),
            clean_session: None,
            tls: None,
        }
    }

    #[test]
    fn test_build_options() {
        let opts = build_options(&cfg(1883)).unwrap();
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(15));
        assert!(opts.client_id().starts_with("altherma-bridge-"));
    }

    #[test]
    fn test_plain_tcp_by_default() {
        let opts = build_options(&cfg(1883)).unwrap();
        assert!(matches!(opts.transport(), Transport::Tcp));
    }

    #[test]
    fn test_ca_file_is_loaded_into_tls_transport() {
        let path = std::env::temp_dir().join(format!("altherma-ca-{}.pem", std::process::id()));
        std::fs::write(&path, b"test-ca-bundle").unwrap();
        let mut c = cfg(8883);
        c.tls = Some(TlsConfig {
            ca_file: Some(path.to_string_lossy().into_owned()),
        });

        let opts = build_options(&c).unwrap();
        match opts.transport() {
            Transport::Tls(TlsConfiguration::Simple { ca, .. }) => {
                assert_eq!(ca, b"test-ca-bundle".to_vec())
            }
            _ => panic!("expected TLS with the configured CA"),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let mut c = cfg(8883);
        c.tls = Some(TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
        });
        assert!(matches!(build_options(&c), Err(AppError::Config(_))));
    }

    #[test]
    fn test_empty_host_rejected() {
        let mut c = cfg(1883);
        c.host = " ".into();
        assert!(matches!(build_options(&c), Err(AppError::Config(_))));
    }
}
