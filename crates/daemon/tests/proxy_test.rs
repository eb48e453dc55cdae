//! End-to-end tests for the proxy server against stub upstreams
//!
//! The upstream client is handed a DNS-pinned reqwest client so onion
//! hostnames resolve to local stubs; everything else runs the real server
//! path: listener, routing, sanitization and dispatch.

use oniongate_daemon::updater::ErrorHandler;
use oniongate_daemon::{ProxyServer, RedirectTable, TlsSettings, UpstreamClient};
use oniongate_registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A client that resolves the given onion hostnames to the loopback address;
/// the URL port still selects the stub.
fn pinned_client(hosts: &[&str]) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    for host in hosts {
        builder = builder.resolve(host, "127.0.0.1:0".parse().unwrap());
    }
    builder.build().unwrap()
}

async fn start_proxy(
    upstream_client: reqwest::Client,
    registry_json: String,
    tls: TlsSettings,
) -> (ProxyServer, SocketAddr) {
    let mut server = ProxyServer::new(UpstreamClient::new(upstream_client));
    server
        .with_registry(Registry::constant(registry_json.into_bytes()))
        .await
        .expect("initial registry load failed");
    server
        .serve("127.0.0.1:0".parse().unwrap(), &tls)
        .await
        .expect("proxy failed to start");
    let addr = server.local_addr().unwrap();
    (server, addr)
}

async fn mount_ping(upstream: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(upstream)
        .await;
}

#[tokio::test]
async fn proxies_request_and_sanitizes_headers() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let upstream = MockServer::start().await;
    mount_ping(&upstream).await;
    let upstream_port = upstream.address().port();

    let registry_json = format!(r#"[{{"endpoint":"http://onionhost.onion:{upstream_port}"}}]"#);
    let (mut proxy, addr) = start_proxy(
        pinned_client(&["onionhost.onion"]),
        registry_json,
        TlsSettings::Disabled,
    )
    .await;

    // raw HTTP/1.1 so the Connection header reaches the proxy verbatim
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /onionhost/v1/ping HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: close, X-Debug-Token\r\n\
         X-Debug-Token: secret\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw_response = Vec::new();
    stream.read_to_end(&mut raw_response).await.unwrap();
    let raw_response = String::from_utf8_lossy(&raw_response);
    assert!(raw_response.starts_with("HTTP/1.1 200"), "{raw_response}");
    assert!(raw_response.ends_with("pong"), "{raw_response}");

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let request = &received[0];

    // route label stripped from the upstream path
    assert_eq!(request.url.path(), "/v1/ping");

    // hop-by-hop and Connection-named headers never reach the upstream
    assert!(request.headers.get("connection").is_none());
    assert!(request.headers.get("x-debug-token").is_none());
    assert!(request.headers.get("proxy-connection").is_none());

    // forwarding headers are present
    assert_eq!(
        request.headers.get("x-forwarded-proto").unwrap(),
        "http"
    );
    assert!(request.headers.get("x-forwarded-for").is_some());
    assert_eq!(
        request.headers.get("x-origin-host").unwrap(),
        format!("onionhost.onion:{upstream_port}").as_str()
    );

    proxy.stop().await;
}

#[tokio::test]
async fn preflight_options_gets_cors_headers_and_never_reaches_upstream() {
    let upstream = MockServer::start().await;
    mount_ping(&upstream).await;
    let upstream_port = upstream.address().port();

    let registry_json = format!(r#"[{{"endpoint":"http://onionhost.onion:{upstream_port}"}}]"#);
    let (mut proxy, addr) = start_proxy(
        pinned_client(&["onionhost.onion"]),
        registry_json,
        TlsSettings::Disabled,
    )
    .await;

    let response = reqwest::Client::new()
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{addr}/onionhost/v1/ping"),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    assert!(upstream.received_requests().await.unwrap().is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn unknown_route_label_is_a_404() {
    let upstream = MockServer::start().await;
    let upstream_port = upstream.address().port();

    let registry_json = format!(r#"[{{"endpoint":"http://onionhost.onion:{upstream_port}"}}]"#);
    let (mut proxy, addr) = start_proxy(
        pinned_client(&["onionhost.onion"]),
        registry_json,
        TlsSettings::Disabled,
    )
    .await;

    let response = reqwest::get(format!("http://{addr}/not-registered/v1/ping"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_is_a_502_and_other_routes_keep_working() {
    let upstream = MockServer::start().await;
    mount_ping(&upstream).await;
    let upstream_port = upstream.address().port();

    // grab a port nothing listens on
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let registry_json = format!(
        r#"[
            {{"endpoint":"http://live.onion:{upstream_port}"}},
            {{"endpoint":"http://dead.onion:{dead_port}"}}
        ]"#
    );
    let (mut proxy, addr) = start_proxy(
        pinned_client(&["live.onion", "dead.onion"]),
        registry_json,
        TlsSettings::Disabled,
    )
    .await;

    let response = reqwest::get(format!("http://{addr}/dead/v1/ping")).await.unwrap();
    assert_eq!(response.status(), 502);

    let response = reqwest::get(format!("http://{addr}/live/v1/ping")).await.unwrap();
    assert_eq!(response.status(), 200);

    proxy.stop().await;
}

#[tokio::test]
async fn static_tls_terminates_and_reports_https_to_upstream() {
    let upstream = MockServer::start().await;
    mount_ping(&upstream).await;
    let upstream_port = upstream.address().port();

    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let registry_json = format!(r#"[{{"endpoint":"http://onionhost.onion:{upstream_port}"}}]"#);
    let (mut proxy, addr) = start_proxy(
        pinned_client(&["onionhost.onion"]),
        registry_json,
        TlsSettings::Static {
            cert_path,
            key_path,
        },
    )
    .await;

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = client
        .get(format!("https://{addr}/onionhost/v1/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "pong");

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(
        received[0].headers.get("x-forwarded-proto").unwrap(),
        "https"
    );

    proxy.stop().await;
}

#[tokio::test]
async fn remote_refresh_makes_new_routes_routable_without_restart() {
    let upstream = MockServer::start().await;
    mount_ping(&upstream).await;
    let upstream_port = upstream.address().port();

    let registry_server = MockServer::start().await;
    let first = format!(r#"[{{"endpoint":"http://alpha.onion:{upstream_port}"}}]"#);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(first, "application/json"))
        .mount(&registry_server)
        .await;

    let mut proxy = ProxyServer::new(UpstreamClient::new(pinned_client(&[
        "alpha.onion",
        "beta.onion",
    ])));
    proxy
        .with_registry(Registry::from_source(&registry_server.uri()).unwrap())
        .await
        .unwrap();
    let on_error: ErrorHandler = Arc::new(|_| {});
    proxy.with_auto_update(Duration::from_millis(50), on_error);
    proxy
        .serve("127.0.0.1:0".parse().unwrap(), &TlsSettings::Disabled)
        .await
        .unwrap();
    let addr = proxy.local_addr().unwrap();

    // only alpha is routable at first
    let response = reqwest::get(format!("http://{addr}/beta/v1/ping")).await.unwrap();
    assert_eq!(response.status(), 404);

    // the registry grows; the route must appear while the server is live
    let second = format!(
        r#"[
            {{"endpoint":"http://alpha.onion:{upstream_port}"}},
            {{"endpoint":"http://beta.onion:{upstream_port}"}}
        ]"#
    );
    registry_server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(second, "application/json"))
        .mount(&registry_server)
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = reqwest::get(format!("http://{addr}/beta/v1/ping")).await.unwrap();
        if response.status() == 200 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "beta route never became routable"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // pre-existing routes were never disturbed
    let response = reqwest::get(format!("http://{addr}/alpha/v1/ping")).await.unwrap();
    assert_eq!(response.status(), 200);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_never_observe_torn_entries() {
    let table = Arc::new(RwLock::new(RedirectTable::new()));

    let mut tasks = Vec::new();
    // writers keep ingesting fresh batches of self-consistent entries
    for writer in 0..4u16 {
        let table = table.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..50u16 {
                let port = 1000 + writer * 100 + round % 7;
                let raw = format!(
                    r#"[{{"endpoint":"http://writer{writer}-round{round}.onion:{port}"}}]"#
                );
                table.write().await.ingest(raw.as_bytes()).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    // readers verify that every visible entry is internally consistent
    for _ in 0..4 {
        let table = table.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..200 {
                {
                    let table = table.read().await;
                    for entry in table.entries() {
                        let upstream = entry.upstream();
                        let expected_host = match upstream.port() {
                            Some(port) => format!("{}:{port}", upstream.host_str().unwrap()),
                            None => upstream.host_str().unwrap().to_string(),
                        };
                        assert_eq!(entry.host(), expected_host);
                        assert!(expected_host.starts_with(&entry.route_label()));
                    }
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    let table = table.read().await;
    assert_eq!(table.len(), 4 * 50);
}
