mod cache;
mod config;
mod detective;
mod dns;
mod journal;
#[cfg(test)]
mod testutil;
mod upstream;
mod web;

use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dns::engine::QueryEngine;
use crate::dns::packet;
use crate::web::server::WebServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "detox_dns=info".into()),
        )
        .init();

    info!("🕵️ detox-dns v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "detox-dns.toml".to_string());

    let config = Arc::new(Config::load(&config_path)?);
    info!("TLS_DNS {}", config.upstreams.tls_dns);
    info!("LOCAL_DNS {}", config.upstreams.local_dns);
    info!("HONEYPOT_DNS {}", config.upstreams.honeypot_dns);

    // One-time engine construction (cache restore, resolver clients, detective)
    let engine = Arc::new(QueryEngine::new(config.clone()).await?);

    // Cache supervisor: periodic expiry sweep + snapshot persistence
    let supervisor_engine = engine.clone();
    tokio::spawn(async move {
        supervisor_engine.run_cache_supervisor().await;
    });

    // Liveness/stats endpoint
    let web_engine = engine.clone();
    let web_config = config.clone();
    tokio::spawn(async move {
        let server = WebServer::new(web_engine, web_config);
        if let Err(e) = server.run().await {
            error!("Web server error: {}", e);
        }
    });

    // Bind UDP socket
    let bind_addr = format!("{}:{}", config.listen.address, config.listen.port);
    let udp_socket = UdpSocket::bind(&bind_addr).await?;
    info!("🕵️ detox-dns listening on {} (UDP)", bind_addr);

    // Bind TCP listener
    let tcp_listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("🕵️ detox-dns listening on {} (TCP)", bind_addr);

    // TCP handler
    let tcp_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let eng = tcp_engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = eng.handle_tcp(stream, addr).await {
                            warn!("TCP handler error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("TCP accept error: {}", e),
            }
        }
    });

    // Main UDP loop - one task per inbound query
    let udp_socket = Arc::new(udp_socket);
    let mut buf = vec![0u8; 4096];
    loop {
        match udp_socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let query = buf[..len].to_vec();
                let socket = udp_socket.clone();
                let eng = engine.clone();
                tokio::spawn(async move {
                    match eng.handle_query(&query).await {
                        Ok(response) => {
                            if let Err(e) = socket.send_to(&response, addr).await {
                                warn!("Failed to send response to {}: {}", addr, e);
                            }
                        }
                        Err(e) => {
                            warn!("Query handling error from {}: {}", addr, e);
                            // Answer a name error rather than dropping silently
                            if let Ok(nx) = packet::build_nxdomain(&query) {
                                let _ = socket.send_to(&nx, addr).await;
                            }
                        }
                    }
                });
            }
            Err(e) => error!("UDP recv error: {}", e),
        }
    }
}
