//! AWS-API gateway: a single in-cluster proxy port.
//!
//! Incoming requests are classified by their `X-Amz-Target` header or
//! the service component of the SigV4 Authorization header. ECS
//! operations dispatch in-process; other AWS services forward to the
//! configured AWS-compatible backend, or receive a forbidden response
//! when none is configured.

use crate::api::{Api, ApiError};
use crate::util::stopper::Stopper;
use hyper::client::HttpConnector;
use hyper::header::HeaderMap;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode, Uri};
use kecs_shared::ecs::ECS_TARGET_PREFIX;
use log::{error, info, trace};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// Where a request should be routed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestTarget {
    /// An ECS operation, dispatched in-process
    Ecs(String),
    /// Another AWS service, proxied to the backend when one exists
    OtherAws(String),
    Unknown,
}

/// Service component of a SigV4 Authorization header
/// (`Credential=<key>/<date>/<region>/<service>/aws4_request`).
fn aws_service_from_authorization(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get("authorization")?.to_str().ok()?;
    let credential = authorization
        .split(|c| c == ' ' || c == ',')
        .find_map(|part| part.strip_prefix("Credential="))?;
    credential.split('/').nth(3).map(str::to_string)
}

/// Service component of an AWS endpoint hostname
/// (`<service>.<region>.amazonaws.com`, with or without a port).
fn aws_service_from_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get("host")?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or(host);
    let subdomains = host.strip_suffix(".amazonaws.com")?;
    subdomains
        .split('.')
        .next()
        .filter(|service| !service.is_empty())
        .map(str::to_string)
}

/// Classify a request by `X-Amz-Target`, then by the Authorization
/// service component, then by the Host header.
pub fn classify_request(headers: &HeaderMap) -> RequestTarget {
    if let Some(target) = headers.get("x-amz-target").and_then(|v| v.to_str().ok()) {
        let prefix = format!("{}.", ECS_TARGET_PREFIX);
        if let Some(op) = target.strip_prefix(&prefix) {
            return RequestTarget::Ecs(op.to_string());
        }
    }
    let service = aws_service_from_authorization(headers).or_else(|| aws_service_from_host(headers));
    match service {
        Some(service) if service == "ecs" => {
            // addressed to ECS but carrying no recognizable operation
            RequestTarget::Unknown
        }
        Some(service) => RequestTarget::OtherAws(service),
        None => RequestTarget::Unknown,
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/x-amz-json-1.1"),
    );
    response
}

fn error_response(error: &ApiError) -> Response<Body> {
    let status = if error.kind == "ServerException" {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::BAD_REQUEST
    };
    json_response(status, error.body())
}

fn forbidden_response(service: &str) -> Response<Body> {
    json_response(
        StatusCode::FORBIDDEN,
        json!({
            "__type": "AccessDeniedException",
            "message": format!("service {} is not enabled on this endpoint", service),
        }),
    )
}

pub struct Gateway {
    api: Arc<Api>,
    backend: Option<String>,
    client: Client<HttpConnector>,
}

impl Gateway {
    pub fn new(api: Arc<Api>, backend: Option<String>) -> Arc<Self> {
        Arc::new(Gateway {
            api,
            backend,
            client: Client::new(),
        })
    }

    async fn dispatch_ecs(&self, op: String, req: Request<Body>) -> Response<Body> {
        let bytes = match hyper::body::to_bytes(req.into_body()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return error_response(&ApiError::validation(format!(
                    "could not read request body: {}",
                    e
                )))
            }
        };
        let payload = if bytes.is_empty() {
            json!({})
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    return error_response(&ApiError::validation(format!(
                        "request body is not valid JSON: {}",
                        e
                    )))
                }
            }
        };
        match self.api.dispatch(&op, payload).await {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                trace!("dispatch_ecs - {} failed: {}", op, e);
                error_response(&e)
            }
        }
    }

    async fn forward(&self, backend: &str, mut req: Request<Body>) -> Response<Body> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = match format!("{}{}", backend.trim_end_matches('/'), path_and_query).parse()
        {
            Ok(uri) => uri,
            Err(e) => {
                return error_response(&ApiError::new(
                    "ServerException",
                    format!("bad backend URI: {}", e),
                ))
            }
        };
        *req.uri_mut() = uri;
        match self.client.request(req).await {
            Ok(response) => response,
            Err(e) => {
                error!("forward - backend request failed: {}", e);
                json_response(
                    StatusCode::BAD_GATEWAY,
                    json!({
                        "__type": "ServerException",
                        "message": format!("backend unreachable: {}", e),
                    }),
                )
            }
        }
    }

    pub async fn handle(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        match classify_request(req.headers()) {
            RequestTarget::Ecs(op) => self.dispatch_ecs(op, req).await,
            RequestTarget::OtherAws(service) => match self.backend.clone() {
                Some(backend) => self.forward(&backend, req).await,
                None => forbidden_response(&service),
            },
            RequestTarget::Unknown => forbidden_response("unknown"),
        }
    }

    /// Serve the gateway until the stopper fires.
    pub async fn run(self: Arc<Self>, port: u16, stopper: Stopper) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let gateway = self.clone();
        let make_svc = make_service_fn(move |_conn| {
            let gateway = gateway.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let gateway = gateway.clone();
                    async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                }))
            }
        });
        info!("run - gateway listening on {}", addr);
        Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move { stopper.stopped().await })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::test_api;

    fn ecs_request(op: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header("x-amz-target", format!("{}.{}", ECS_TARGET_PREFIX, op))
            .header("content-type", "application/x-amz-json-1.1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_classify_by_target_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-target",
            "AmazonEC2ContainerServiceV20141113.ListClusters".parse().unwrap(),
        );
        assert_eq!(
            RequestTarget::Ecs("ListClusters".to_string()),
            classify_request(&headers)
        );
    }

    #[test]
    fn test_classify_by_authorization_service() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            "AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20260801/us-east-1/s3/aws4_request, \
             SignedHeaders=host, Signature=deadbeef"
                .parse()
                .unwrap(),
        );
        assert_eq!(
            RequestTarget::OtherAws("s3".to_string()),
            classify_request(&headers)
        );
    }

    #[test]
    fn test_classify_by_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "s3.us-east-1.amazonaws.com".parse().unwrap());
        assert_eq!(
            RequestTarget::OtherAws("s3".to_string()),
            classify_request(&headers)
        );

        // port suffixes are stripped before matching
        let mut headers = HeaderMap::new();
        headers.insert("host", "sqs.us-east-1.amazonaws.com:443".parse().unwrap());
        assert_eq!(
            RequestTarget::OtherAws("sqs".to_string()),
            classify_request(&headers)
        );

        // an ECS host without an operation header is not routable
        let mut headers = HeaderMap::new();
        headers.insert("host", "ecs.us-east-1.amazonaws.com".parse().unwrap());
        assert_eq!(RequestTarget::Unknown, classify_request(&headers));

        // non-AWS hosts carry no routing signal
        let mut headers = HeaderMap::new();
        headers.insert("host", "localhost:5373".parse().unwrap());
        assert_eq!(RequestTarget::Unknown, classify_request(&headers));
    }

    #[test]
    fn test_authorization_wins_over_host() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            "AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20260801/us-east-1/dynamodb/aws4_request, \
             SignedHeaders=host, Signature=deadbeef"
                .parse()
                .unwrap(),
        );
        headers.insert("host", "s3.us-east-1.amazonaws.com".parse().unwrap());
        assert_eq!(
            RequestTarget::OtherAws("dynamodb".to_string()),
            classify_request(&headers)
        );
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(RequestTarget::Unknown, classify_request(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn test_ecs_operation_dispatches_in_process() {
        let gateway = Gateway::new(test_api(), None);
        let response = gateway
            .handle(ecs_request(
                "CreateCluster",
                json!({"clusterName": "production"}),
            ))
            .await;
        assert_eq!(StatusCode::OK, response.status());
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            "arn:aws:ecs:us-east-1:000000000000:cluster/production",
            body["cluster"]["clusterArn"]
        );
    }

    #[tokio::test]
    async fn test_ecs_error_surfaces_as_wire_exception() {
        let gateway = Gateway::new(test_api(), None);
        let response = gateway
            .handle(ecs_request("DeleteCluster", json!({"cluster": "ghost"})))
            .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!("ClusterNotFoundException", body["__type"]);
        assert!(body["message"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_disabled_service_receives_forbidden() {
        let gateway = Gateway::new(test_api(), None);
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                "authorization",
                "AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20260801/us-east-1/s3/aws4_request, \
                 SignedHeaders=host, Signature=deadbeef",
            )
            .body(Body::empty())
            .unwrap();
        let response = gateway.handle(request).await;
        assert_eq!(StatusCode::FORBIDDEN, response.status());
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!("AccessDeniedException", body["__type"]);
    }

    #[tokio::test]
    async fn test_empty_body_reads_as_empty_object() {
        let gateway = Gateway::new(test_api(), None);
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                "x-amz-target",
                format!("{}.ListClusters", ECS_TARGET_PREFIX),
            )
            .body(Body::empty())
            .unwrap();
        let response = gateway.handle(request).await;
        assert_eq!(StatusCode::OK, response.status());
    }
}
