use std::env;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use dotenv::dotenv;
use log::{info, warn};
use server_inner::ServerInner;
use tonic::transport::Server;

use crate::clock::SystemClock;
use crate::encoder::{FfmpegLauncher, Launcher};
use crate::session::StreamManager;

pub mod service {
    tonic::include_proto!("livecast");
}

mod clock;
mod commands;
mod encoder;
mod log_sink;
mod monitor;
mod server_inner;
mod session;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_ADDR: &str = "[::1]:50051";

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let launcher = Arc::new(FfmpegLauncher::from_env());
    probe_encoder(launcher.program()).await;

    let manager = Arc::new(StreamManager::new(Arc::new(SystemClock), launcher));
    let server = ServerInner::new(manager);

    let addr = env::var("LIVECAST_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("LIVECAST_ADDR resolves to nothing: {}", addr))?;
    info!("listening on {}", addr);

    Server::builder()
        .add_service(service::livecast_server::LivecastServer::new(server))
        .serve(addr)
        .await?;
    Ok(())
}

/// Streams cannot start without the encoder binary; say so up front.
async fn probe_encoder(program: &str) {
    match tokio::process::Command::new(program)
        .arg("-version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            info!("encoder available: {}", program);
        }
        Ok(output) => {
            warn!("{} -version exited with {}", program, output.status);
        }
        Err(err) => {
            warn!("encoder {} not runnable: {}", program, err);
        }
    }
}
