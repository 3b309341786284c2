#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use skyfeed::config::MeshConfig;
    use skyfeed::vpn::VpnStatusClient;

    fn mesh(name: &str, api_url: &str, token: &str) -> MeshConfig {
        MeshConfig {
            name: name.to_string(),
            enabled: true,
            cidr: "100.64.0.0/10".to_string(),
            api_url: api_url.to_string(),
            api_token: token.to_string(),
        }
    }

    /// Peer API stub that counts requests and can check the bearer token.
    async fn spawn_peer_api(
        body: &'static str,
        expect_token: Option<&'static str>,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_srv = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                hits_srv.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();

                    let authorized = match expect_token {
                        Some(token) => {
                            request.contains(&format!("Bearer {}", token))
                        }
                        None => true,
                    };

                    let response = if authorized {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        (format!("http://{}", addr), hits)
    }

    #[tokio::test]
    async fn test_resolve_known_peer() {
        let (api, _) = spawn_peer_api(
            r#"[{"id":"peer-1","name":"rooftop-pi","ip":"100.64.0.5","connected":true}]"#,
            None,
        )
        .await;

        let client = VpnStatusClient::new().unwrap();
        let peer = client
            .resolve_peer(&mesh("netbird", &api, ""), "100.64.0.5".parse().unwrap())
            .await
            .expect("peer should resolve");

        assert_eq!(peer.id, "peer-1");
        assert_eq!(peer.hostname.as_deref(), Some("rooftop-pi"));
        assert!(peer.online);
    }

    #[tokio::test]
    async fn test_resolve_unknown_address_on_known_mesh() {
        let (api, _) = spawn_peer_api(
            r#"[{"id":"peer-1","name":"rooftop-pi","ip":"100.64.0.5","connected":true}]"#,
            None,
        )
        .await;

        let client = VpnStatusClient::new().unwrap();
        let peer = client
            .resolve_peer(&mesh("netbird", &api, ""), "100.64.0.99".parse().unwrap())
            .await;
        assert!(peer.is_none());
    }

    #[tokio::test]
    async fn test_secondary_addresses_resolve() {
        let (api, _) = spawn_peer_api(
            r#"[{"id":"peer-2","hostname":"attic","ip":"100.64.0.8","ip_addresses":["100.64.0.9"],"connected":false}]"#,
            None,
        )
        .await;

        let client = VpnStatusClient::new().unwrap();
        let m = mesh("netbird", &api, "");

        let primary = client.resolve_peer(&m, "100.64.0.8".parse().unwrap()).await;
        let secondary = client.resolve_peer(&m, "100.64.0.9".parse().unwrap()).await;
        assert_eq!(primary.map(|p| p.id), Some("peer-2".to_string()));
        assert_eq!(secondary.map(|p| p.id), Some("peer-2".to_string()));
    }

    #[tokio::test]
    async fn test_cache_bounds_api_volume() {
        let (api, hits) = spawn_peer_api(
            r#"[{"id":"peer-1","name":"rooftop-pi","ip":"100.64.0.5","connected":true}]"#,
            None,
        )
        .await;

        let client = VpnStatusClient::new().unwrap();
        let m = mesh("netbird", &api, "");

        for _ in 0..20 {
            let _ = client.resolve_peer(&m, "100.64.0.5".parse().unwrap()).await;
        }
        // A connection burst costs a single fetch within the TTL.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let (api, hits) = spawn_peer_api(
            r#"[{"id":"peer-1","name":"rooftop-pi","ip":"100.64.0.5","connected":true}]"#,
            None,
        )
        .await;

        let client = VpnStatusClient::new().unwrap();
        let m = mesh("netbird", &api, "");

        let _ = client.resolve_peer(&m, "100.64.0.5".parse().unwrap()).await;
        client.invalidate();
        let _ = client.resolve_peer(&m, "100.64.0.5".parse().unwrap()).await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_ttl_refetches() {
        let (api, hits) = spawn_peer_api(
            r#"[{"id":"peer-1","name":"rooftop-pi","ip":"100.64.0.5","connected":true}]"#,
            None,
        )
        .await;

        let client = VpnStatusClient::with_ttl(Duration::from_millis(50)).unwrap();
        let m = mesh("netbird", &api, "");

        let _ = client.resolve_peer(&m, "100.64.0.5".parse().unwrap()).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = client.resolve_peer(&m, "100.64.0.5".parse().unwrap()).await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let (api, _) = spawn_peer_api(
            r#"[{"id":"peer-1","name":"rooftop-pi","ip":"100.64.0.5","connected":true}]"#,
            Some("nb-secret"),
        )
        .await;

        let client = VpnStatusClient::new().unwrap();

        // Correct token resolves; missing token gets a 401 and resolves None.
        let with_token = client
            .resolve_peer(&mesh("netbird", &api, "nb-secret"), "100.64.0.5".parse().unwrap())
            .await;
        assert!(with_token.is_some());

        let client2 = VpnStatusClient::new().unwrap();
        let without_token = client2
            .resolve_peer(&mesh("netbird2", &api, ""), "100.64.0.5".parse().unwrap())
            .await;
        assert!(without_token.is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_resolves_to_none() {
        let (api, _) = spawn_peer_api("this is not json", None).await;

        let client = VpnStatusClient::new().unwrap();
        let peer = client
            .resolve_peer(&mesh("netbird", &api, ""), "100.64.0.5".parse().unwrap())
            .await;
        assert!(peer.is_none());
    }

    #[tokio::test]
    async fn test_list_peers_snapshot() {
        let (api, _) = spawn_peer_api(
            r#"[{"id":"a","name":"one","ip":"100.64.0.1","connected":true},
                {"id":"b","name":"two","ip":"100.64.0.2","connected":false}]"#,
            None,
        )
        .await;

        let client = VpnStatusClient::new().unwrap();
        let peers = client.list_peers(&mesh("netbird", &api, "")).await;
        assert_eq!(peers.len(), 2);
    }
}
