use altherma_bridge::config::{Config, SinkKind};
use altherma_bridge::feed::{FeedRouter, ReadingBus};
use altherma_bridge::mqtt::{self, MqttEvent, QoS};
use altherma_bridge::runner::{self, Intervals};
use altherma_bridge::session::{SessionSettings, UnitSession};
use altherma_bridge::sink::{AlertSink, CapabilitySink, LogSink, MqttSink};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let mut cfg = Config::load(&cfg_path)?;
    for w in cfg.sanitize() {
        warn!("config: {w}");
    }
    if let Some(w) = cfg.mqtt.anonymous_warning() {
        warn!("{w}");
    }
    info!(
        units = cfg.units.len(),
        timezone = %cfg.timezone,
        "loaded config"
    );

    let opts = mqtt::build_options(&cfg.mqtt)?;
    let (client, mut eventloop) = mqtt::new(opts);

    let (sink, alerts): (Arc<dyn CapabilitySink>, Arc<dyn AlertSink>) = match cfg.sink.kind {
        SinkKind::Log => {
            let s = Arc::new(LogSink);
            (s.clone(), s)
        }
        SinkKind::Mqtt => {
            let s = Arc::new(MqttSink::new(
                client.clone(),
                cfg.sink.topic_prefix.clone(),
                cfg.sink.retain,
            ));
            (s.clone(), s)
        }
    };

    let bus = ReadingBus::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let settings = SessionSettings::from_config(&cfg);
    let intervals = Intervals::from_config(&cfg.alerts);
    let started_at = Utc::now();

    let mut units = Vec::with_capacity(cfg.units.len());
    for kind in &cfg.units {
        let session = UnitSession::new(
            *kind,
            settings.clone(),
            sink.clone(),
            alerts.clone(),
            started_at,
        );
        let readings = bus.subscribe(kind.name());
        units.push((
            *kind,
            tokio::spawn(runner::run_unit(
                session,
                readings,
                intervals,
                shutdown_tx.subscribe(),
            )),
        ));
    }

    let mut router = FeedRouter::new(
        cfg.topics.clone(),
        cfg.external_voltage.clone(),
        cfg.power.voltage_default,
        bus,
    );
    let subscription = cfg.topics.subscription();

    let sig = shutdown_signal();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            res = mqtt::next_event(&mut eventloop) => {
                match res {
                    Ok(MqttEvent::Connected) => {
                        // clean sessions drop subscriptions on every reconnect
                        match client.subscribe(subscription.clone(), QoS::AtLeastOnce).await {
                            Ok(()) => info!(topic = %subscription, "subscribed to bridge feed"),
                            Err(e) => warn!(topic = %subscription, error = %e, "subscribe failed"),
                        }
                    }
                    Ok(MqttEvent::Publish(msg)) => {
                        if let Err(e) = router.handle_raw_topic(&msg.topic, &msg.payload, Utc::now()) {
                            warn!(error = %e, "processing failed for incoming message");
                        }
                    }
                    Err(e) => {
                        warn!("mqtt error: {e}; reconnecting after short delay");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    for (kind, handle) in units {
        if let Err(e) = handle.await {
            error!(unit = %kind, error = %e, "unit task ended abnormally");
        }
    }
    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "mqtt disconnect failed");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
