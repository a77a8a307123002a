mod content;
mod error;
mod messages;
mod registry;
mod round;
mod rules;
mod server;
mod session;

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use log::{info, warn};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use warp::Filter;

use content::BuiltinContent;
use server::Server;

const PORT: u16 = 2052;
const CERT_PATH: &str = "ssl/parlor/certificate.pem";
const KEY_PATH: &str = "ssl/parlor/private.key";

fn load_tls_config() -> Option<ServerConfig> {
    let cert_file = match File::open(CERT_PATH) {
        Ok(file) => file,
        Err(e) => {
            warn!("no TLS certificate at {CERT_PATH}: {e}");
            return None;
        }
    };
    let key_file = match File::open(KEY_PATH) {
        Ok(file) => file,
        Err(e) => {
            warn!("no TLS key at {KEY_PATH}: {e}");
            return None;
        }
    };

    let certs: Vec<CertificateDer<'static>> =
        match certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>() {
            Ok(certs) => certs,
            Err(e) => {
                warn!("failed to parse certificate: {e}");
                return None;
            }
        };
    let key = match pkcs8_private_keys(&mut BufReader::new(key_file)).next() {
        Some(Ok(key)) => PrivateKeyDer::Pkcs8(key),
        Some(Err(e)) => {
            warn!("failed to parse private key: {e}");
            return None;
        }
        None => {
            warn!("no PKCS#8 private key found in {KEY_PATH}");
            return None;
        }
    };

    match ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("failed to build TLS config: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Info).init();

    let server = Server::new(Arc::new(BuiltinContent::new()));
    server.spawn_idle_reaper();

    let ws_server = server.clone();
    let ws_route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
        let server = ws_server.clone();
        ws.on_upgrade(move |socket| async move {
            server.handle_connection(socket).await;
        })
    });

    let static_files = warp::fs::dir("public");

    let routes = ws_route.or(static_files).with(warp::cors().allow_any_origin());

    match load_tls_config() {
        Some(_) => {
            info!("serving WSS/HTTPS on port {PORT}");
            warp::serve(routes)
                .tls()
                .cert_path(CERT_PATH)
                .key_path(KEY_PATH)
                .run(([0, 0, 0, 0], PORT))
                .await;
        }
        None => {
            info!("serving WS/HTTP on port {PORT}");
            warp::serve(routes).run(([0, 0, 0, 0], PORT)).await;
        }
    }
}
