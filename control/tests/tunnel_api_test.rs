//! Tunnel API client against a local fake of the configurations endpoint
//!
//! Run with: cargo test --test tunnel_api_test

#![allow(clippy::expect_used, clippy::unwrap_used)]

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tunnel_common::IngressRule;
use tunnel_control::credentials::{FeatureFlags, ResolvedConfig};
use tunnel_control::error::ApiErrorClass;
use tunnel_control::tunnel::{CloudflareTunnelClient, TunnelApi};

const PATH: &str = "/client/v4/accounts/acc/cfd_tunnel/tun/configurations";

/// Stored remote configuration, as the fake API sees it
type Remote = Arc<Mutex<Value>>;

fn respond(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}

async fn handle(req: Request<Incoming>, remote: Remote) -> Result<Response<Full<Bytes>>, Infallible> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer tok");
    if !authorized {
        return Ok(respond(
            StatusCode::FORBIDDEN,
            json!({"success": false, "errors": [{"code": 10000, "message": "Authentication error"}], "result": null}),
        ));
    }

    if req.uri().path() != PATH {
        return Ok(respond(
            StatusCode::NOT_FOUND,
            json!({"success": false, "errors": [{"code": 1003, "message": "Tunnel not found"}], "result": null}),
        ));
    }

    match *req.method() {
        Method::GET => {
            let config = remote.lock().unwrap().clone();
            Ok(respond(
                StatusCode::OK,
                json!({"success": true, "errors": [], "result": {"tunnel_id": "tun", "version": 1, "config": config}}),
            ))
        }
        Method::PUT => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let request: Value = serde_json::from_slice(&body).unwrap();
            *remote.lock().unwrap() = request["config"].clone();
            Ok(respond(
                StatusCode::OK,
                json!({"success": true, "errors": [], "result": {"tunnel_id": "tun", "version": 2}}),
            ))
        }
        _ => Ok(respond(StatusCode::METHOD_NOT_ALLOWED, json!({}))),
    }
}

async fn fake_api(initial: Value) -> (SocketAddr, Remote) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let remote: Remote = Arc::new(Mutex::new(initial));

    let shared = remote.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            let remote = shared.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, remote.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, remote)
}

fn creds(token: &str) -> ResolvedConfig {
    ResolvedConfig {
        api_token: token.to_string(),
        account_id: "acc".to_string(),
        tunnel_id: "tun".to_string(),
        tunnel_token: None,
        flags: FeatureFlags::default(),
    }
}

fn client(addr: SocketAddr) -> CloudflareTunnelClient {
    CloudflareTunnelClient::new(format!("http://{}/client/v4", addr), Duration::from_secs(5))
        .expect("client")
}

#[tokio::test]
async fn test_read_and_replace_configuration() {
    let (addr, remote) = fake_api(json!({
        "ingress": [
            {"hostname": "old.example.com", "service": "http://old.ns.svc.cluster.local:80"},
            {"service": "http_status:404"}
        ],
        "warp-routing": {"enabled": true}
    }))
    .await;
    let client = client(addr);
    let creds = creds("tok");

    let config = client.get_configuration(&creds).await.unwrap();
    assert_eq!(config.ingress.len(), 2);
    assert_eq!(config.ingress[0].hostname.as_deref(), Some("old.example.com"));

    let desired = vec![
        IngressRule::new(
            Some("app.example.com".to_string()),
            None,
            "http://svc.ns.svc.cluster.local:80",
        ),
        IngressRule::catch_all(),
    ];
    client
        .update_configuration(&creds, &config.with_ingress(desired.clone()))
        .await
        .unwrap();

    let stored = remote.lock().unwrap().clone();
    assert_eq!(stored["warp-routing"], json!({"enabled": true}));
    assert_eq!(
        stored["ingress"],
        json!([
            {"hostname": "app.example.com", "service": "http://svc.ns.svc.cluster.local:80"},
            {"service": "http_status:404"}
        ])
    );

    let reread = client.get_configuration(&creds).await.unwrap();
    assert_eq!(reread.ingress, desired);
}

#[tokio::test]
async fn test_empty_remote_configuration() {
    let (addr, _) = fake_api(Value::Null).await;
    let config = client(addr).get_configuration(&creds("tok")).await.unwrap();
    assert!(config.ingress.is_empty());
}

#[tokio::test]
async fn test_auth_failure_is_classified() {
    let (addr, _) = fake_api(json!({"ingress": []})).await;
    let err = client(addr)
        .get_configuration(&creds("wrong"))
        .await
        .unwrap_err();

    assert_eq!(err.class, ApiErrorClass::Auth);
    assert_eq!(err.status, Some(403));
    assert!(err.message.contains("Authentication error"));
}

#[tokio::test]
async fn test_unreachable_api_is_a_network_error() {
    // Bind and drop to get a port nothing listens on
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let err = client(addr)
        .get_configuration(&creds("tok"))
        .await
        .unwrap_err();
    assert_eq!(err.class, ApiErrorClass::Network);
}
