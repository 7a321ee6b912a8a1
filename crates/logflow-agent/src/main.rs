// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logflow::{
    config::{
        log_level_from_env, validate_log_level, ForwarderConfig, ProducerConfig, PushMetricConfig,
    },
    elastic::{ElasticClient, ElasticStoreman},
    elastic_retrier::ElasticRetrier,
    errors::{AgentError, SinkError},
    forwarder::ForwardingAgent,
    kafka::RdKafkaFactory,
    kafka_consumer::KafkaGroupConsumer,
    metrics::{MetricPusher, ThroughputCounter},
    producer_server::ProducerServer,
    rate_limiter::WindowRateLimiter,
};

#[derive(Parser)]
#[command(name = "logflow-agent", about = "Log transport between clients, Kafka and Elasticsearch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept timbers over HTTP and publish them to Kafka
    Producer,
    /// Consume timbers from Kafka and store them in Elasticsearch
    Forwarder,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = log_level_from_env();
    validate_log_level(&log_level)?;
    init_tracing(&log_level)?;
    debug!("Logging subsystem enabled");

    match cli.command {
        Command::Producer => run_producer().await,
        Command::Forwarder => run_forwarder().await,
    }
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,rdkafka=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

async fn run_producer() -> anyhow::Result<()> {
    let config = ProducerConfig::from_env()?;
    info!("Starting producer on {}", config.address);
    info!("Kafka brokers: {:?}", config.kafka_brokers);

    let factory = Arc::new(RdKafkaFactory::new(
        config.kafka_brokers.clone(),
        config.kafka_max_retry,
        config.kafka_retry_interval,
    ));
    let limiter = Arc::new(WindowRateLimiter::new(
        config.max_tps,
        config.rate_limit_reset_interval,
    ));
    let shutdown = CancellationToken::new();
    let counter = Arc::new(ThroughputCounter::default());
    spawn_metric_pusher(config.push_metric.as_ref(), &counter, &shutdown)?;

    let server = Arc::new(ProducerServer::new(config, factory, limiter).with_counter(counter));

    let mut running = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });

    tokio::select! {
        joined = &mut running => {
            shutdown.cancel();
            joined??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down producer");
            shutdown.cancel();
            server.close();
            running.await??;
        }
    }
    Ok(())
}

fn spawn_metric_pusher(
    push_metric: Option<&PushMetricConfig>,
    counter: &Arc<ThroughputCounter>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    match push_metric {
        Some(push_metric) => {
            info!("Pushing throughput to {} every {:?}", push_metric.url, push_metric.interval);
            let pusher = MetricPusher::new(push_metric.clone(), Arc::clone(counter))?;
            tokio::spawn(pusher.run(shutdown.child_token()));
        }
        None => info!("Throughput push disabled"),
    }
    Ok(())
}

async fn run_forwarder() -> anyhow::Result<()> {
    let config = ForwarderConfig::from_env()?;
    info!("Starting forwarder");
    info!("Kafka brokers: {:?}", config.kafka_brokers);
    info!("Consumer group: {}", config.consumer_group_id);
    info!("Topics: {:?}", config.consumer_topics);
    info!("Elasticsearch: {}", config.elasticsearch_url);

    let shutdown = CancellationToken::new();
    let counter = Arc::new(ThroughputCounter::default());

    spawn_metric_pusher(config.push_metric.as_ref(), &counter, &shutdown)?;

    let retrier = ElasticRetrier::new(
        config.es_retry_interval,
        config.es_max_retry,
        Arc::new(|err: &SinkError| {
            if matches!(err, SinkError::BackendDown) {
                error!("{err}");
            }
        }),
    );
    let client = ElasticClient::new(
        &config.elasticsearch_url,
        Arc::new(retrier),
        shutdown.child_token(),
    )?;
    let store = ElasticStoreman::new(client).with_counter(counter);
    let consumer = KafkaGroupConsumer::new(
        &config.kafka_brokers,
        &config.consumer_group_id,
        config.consumer_topics.clone(),
    )?;

    let agent = Arc::new(ForwardingAgent::new(
        Arc::new(consumer),
        Arc::new(store),
        Arc::new(|err: &AgentError| match err {
            AgentError::Notification(_) => debug!("{err}"),
            _ => error!("{err}"),
        }),
    ));

    let mut running = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.start().await }
    });

    tokio::select! {
        joined = &mut running => {
            shutdown.cancel();
            joined??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down forwarder");
            shutdown.cancel();
            agent.close();
            running.await??;
        }
    }
    Ok(())
}
