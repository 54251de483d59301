use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use warp::Filter;

use room_dialogue::api;
use room_dialogue::config::ServerConfig;
use room_dialogue::generation::{DisabledGenerator, Generator, HttpGenerator};
use room_dialogue::store::{MemoryStore, RoomStore};
use room_dialogue::Server;

/// Checks that both PEM files parse before handing them to warp, which
/// would otherwise panic on a bad certificate.
fn tls_files_usable(cert_path: &Path, key_path: &Path) -> bool {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open certificate file {}: {}", cert_path.display(), e);
            return false;
        }
    };
    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open private key file {}: {}", key_path.display(), e);
            return false;
        }
    };

    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect();
    match certs {
        Ok(certs) if !certs.is_empty() => {}
        Ok(_) => {
            warn!("No certificates found in {}", cert_path.display());
            return false;
        }
        Err(e) => {
            warn!("Failed to parse certificate: {}", e);
            return false;
        }
    }

    match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
        Ok(Some(_)) => true,
        Ok(None) => {
            warn!("No private key found in {}", key_path.display());
            false
        }
        Err(e) => {
            warn!("Failed to parse private key: {}", e);
            false
        }
    }
}

async fn open_store(config: &ServerConfig) -> room_dialogue::Result<Arc<dyn RoomStore>> {
    match &config.data_dir {
        Some(dir) => {
            let store = MemoryStore::open(dir).await?;
            info!("Persisting rooms under {}", dir.display());
            Ok(Arc::new(store))
        }
        None => {
            info!("No data directory configured; rooms are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn generator(config: &ServerConfig) -> Arc<dyn Generator> {
    match &config.generator_url {
        Some(url) => Arc::new(HttpGenerator::new(url.clone(), config.generation_attempts)),
        None => {
            warn!("No generator endpoint configured; automated replies are disabled");
            Arc::new(DisabledGenerator)
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = ServerConfig::parse();

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open room store: {}", e);
            std::process::exit(1);
        }
    };
    let server = Server::new(store, generator(&config), config.history_window);

    let routes = api::routes(server.clone())
        .or(warp::fs::dir(config.static_dir.clone()))
        .with(warp::cors().allow_any_origin());

    let addr = SocketAddr::new(config.bind, config.port);
    let shutdown = {
        let server = server.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            server.shutdown();
        }
    };

    let tls = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) if tls_files_usable(cert, key) => Some((cert.clone(), key.clone())),
        (Some(_), Some(_)) => {
            warn!("TLS material unusable, falling back to HTTP/WS");
            None
        }
        _ => None,
    };

    match tls {
        Some((cert, key)) => {
            let (bound, serving) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(addr, shutdown);
            info!("Starting secure server (HTTPS/WSS) on {}", bound);
            serving.await;
        }
        None => {
            let (bound, serving) = warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown);
            info!("Starting server (HTTP/WS) on {}", bound);
            serving.await;
        }
    }
}
