// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ProducerConfig;
use crate::errors::{ProduceError, ServerError};
use crate::http_utils::{
    create_json_response, create_produce_error_response, read_body,
    verify_request_content_length, HttpResponse,
};
use crate::kafka::KafkaFactory;
use crate::metrics::ThroughputCounter;
use crate::producer_service::{ProducerService, ProducerServiceConfig};
use crate::rate_limiter::RateLimiter;
use crate::timber::{Timber, TimberCollection};

pub const PRODUCE_ENDPOINT_PATH: &str = "/produce";
pub const PRODUCE_BATCH_ENDPOINT_PATH: &str = "/produce_batch";

/// Serves [`ProducerService`] over HTTP. Kafka clients are built from the factory when the server
/// starts, so a misconfigured broker surfaces as a startup error rather than on the first call.
pub struct ProducerServer {
    config: ProducerConfig,
    factory: Arc<dyn KafkaFactory>,
    limiter: Arc<dyn RateLimiter>,
    counter: Option<Arc<ThroughputCounter>>,
    cancel_token: CancellationToken,
    service: Mutex<Option<Arc<ProducerService>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProducerServer {
    pub fn new(
        config: ProducerConfig,
        factory: Arc<dyn KafkaFactory>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        ProducerServer {
            config,
            factory,
            limiter,
            counter: None,
            cancel_token: CancellationToken::new(),
            service: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_counter(mut self, counter: Arc<ThroughputCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds the kafka clients, binds, starts the rate limiter and serves until [`Self::close`].
    /// On failure nothing is left running and the kafka clients are closed.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(ServerError::AlreadyStarted);
        }

        let producer = self
            .factory
            .make_sync_producer()
            .await
            .map_err(ServerError::MakeSyncProducer)?;
        let admin = match self.factory.make_kafka_admin().await {
            Ok(admin) => admin,
            Err(e) => {
                producer.close();
                return Err(ServerError::MakeKafkaAdmin(e));
            }
        };

        let listener = match TcpListener::bind(&self.config.address).await {
            Ok(listener) => listener,
            Err(source) => {
                admin.close();
                producer.close();
                return Err(ServerError::Bind {
                    address: self.config.address.clone(),
                    source,
                });
            }
        };

        let mut service = ProducerService::new(
            ProducerServiceConfig {
                topic_suffix: self.config.topic_suffix.clone(),
                new_event_topic: self.config.new_event_topic.clone(),
                default_partitions: self.config.default_partitions,
                default_replication_factor: self.config.default_replication_factor,
            },
            producer,
            admin,
            Arc::clone(&self.limiter),
        );
        if let Some(counter) = &self.counter {
            service = service.with_counter(Arc::clone(counter));
        }
        let service = Arc::new(service);
        *self.service.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&service));

        self.limiter.start();

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        info!("Producer listening on {local_addr}");

        let max_content_length = self.config.max_request_content_length;
        let http_service = service_fn(move |req| {
            // called for each http request
            let service = Arc::clone(&service);
            ProducerServer::endpoint_handler(service, max_content_length, req)
        });

        self.serve_tcp(listener, http_service).await
    }

    /// Stops serving and releases the kafka clients. Idempotent.
    pub fn close(&self) {
        self.cancel_token.cancel();
        self.limiter.stop();
        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(service) = service {
            service.close();
            debug!("Producer server closed");
        }
    }

    async fn serve_tcp<S>(&self, listener: TcpListener, service: S) -> Result<(), ServerError>
    where
        S: hyper::service::Service<Request<Incoming>, Response = HttpResponse>
            + Clone
            + Send
            + 'static,
        S::Future: Send,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                _ = self.cancel_token.cancelled() => {
                    debug!("Producer server shutting down");
                    return Ok(());
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }
    }

    async fn endpoint_handler(
        service: Arc<ProducerService>,
        max_content_length: usize,
        req: Request<Incoming>,
    ) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, PRODUCE_ENDPOINT_PATH) => {
                let timber: Timber =
                    match Self::decode_request(req, max_content_length, "Produce").await {
                        Ok(timber) => timber,
                        Err(response) => return response,
                    };
                match service.produce(&timber).await {
                    Ok(result) => create_json_response(&result, StatusCode::OK),
                    Err(err) => create_produce_error_response(&err),
                }
            }
            (&Method::POST, PRODUCE_BATCH_ENDPOINT_PATH) => {
                let collection: TimberCollection =
                    match Self::decode_request(req, max_content_length, "Produce batch").await {
                        Ok(collection) => collection,
                        Err(response) => return response,
                    };
                match service.produce_batch(&collection).await {
                    Ok(result) => create_json_response(&result, StatusCode::OK),
                    Err(err) => create_produce_error_response(&err),
                }
            }
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    async fn decode_request<T: serde::de::DeserializeOwned>(
        req: Request<Incoming>,
        max_content_length: usize,
        error_message_prefix: &str,
    ) -> Result<T, http::Result<HttpResponse>> {
        let (parts, body) = req.into_parts();
        if let Some(response) =
            verify_request_content_length(&parts.headers, max_content_length, error_message_prefix)
        {
            return Err(response);
        }
        let body = read_body(body, max_content_length, error_message_prefix).await?;
        serde_json::from_slice(&body).map_err(|e| {
            create_produce_error_response(&ProduceError::InvalidArgument(format!(
                "{error_message_prefix}: {e}"
            )))
        })
    }
}

impl Drop for ProducerServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
