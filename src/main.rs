use std::sync::Arc;

use clap::Parser;
use logship::{
    admin::{KafkaTopicSource, TopicAdmin},
    decoder::get_decoder,
    fleet::Fleet,
    settings::Settings,
    sink::BackendSinkFactory,
    worker::kafka::KafkaWorkerFactory,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::new(&args.config).expect("cannot load config");
    let fleet_config = settings
        .fleet_config()
        .unwrap_or_else(|e| panic!("invalid topic pattern {}: {e}", settings.topic_pattern));
    let decoder_name = settings.decoder.clone().unwrap_or_default();
    let decoder = get_decoder(&decoder_name, settings.custom.clone())
        .unwrap_or_else(|e| panic!("failed to create decoder {decoder_name}: {:#}", e));
    let source = KafkaTopicSource::new(&settings.kafka_config(), settings.metadata_timeout())
        .unwrap_or_else(|e| panic!("failed to connect to {}: {e}", settings.kafka_broker));

    let fleet = Arc::new(Fleet::new(
        fleet_config,
        TopicAdmin::new(Arc::new(source)),
        Arc::new(BackendSinkFactory::new(
            settings.sink.clone(),
            settings.flush_policy(),
        )),
        Arc::new(KafkaWorkerFactory::new(settings.kafka_config())),
        decoder,
    ));

    let discovery = tokio::spawn(fleet.clone().run());
    tokio::signal::ctrl_c()
        .await
        .expect("cannot listen for shutdown signal");
    info!("shutdown requested");
    fleet.close().await;
    discovery
        .await
        .unwrap_or_else(|e| error!(error = %e, "discovery task failed"));
}
