use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use murmur::cli;
use murmur::cluster::ClusterCoordinator;
use murmur::error::Result;
use murmur::protocol::{Message, MessageHandler, Path};
use murmur::{api, settings};

/// Logs every application message delivered by the cluster
struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn handle_message(&self, message: Message) -> Result<()> {
        info!(
            path = %message.path,
            id = message.id,
            from_node = message.node_id,
            "Received: {}",
            String::from_utf8_lossy(&message.body)
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args and env vars
    let args = cli::Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let path = Path::new(args.path.clone())?;
    let coordinator = Arc::new(ClusterCoordinator::new(args.cluster_config()).await?);
    coordinator.set_message_handler(Arc::new(LoggingHandler))?;
    coordinator.start().await?;

    if let Some(http_address) = args.http_listen {
        let router = api::api(coordinator.clone()).await?;
        info!(
            "Starting {} {} monitoring API on {}",
            settings::APP_NAME,
            settings::APP_VERSION,
            http_address
        );
        tokio::spawn(async move {
            if let Err(e) = axum::Server::bind(&http_address)
                .serve(router.into_make_service())
                .await
            {
                error!("Monitoring API stopped: {}", e);
            }
        });
    }

    // Each stdin line is broadcast as one application message
    let next_id = AtomicU64::new(1);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut fatal = coordinator.fatal_signal();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if !line.is_empty() => {
                    let mut message = Message::new(path.clone(), line);
                    message.id = next_id.fetch_add(1, Ordering::Relaxed);
                    message.node_id = coordinator.node_id();
                    message.time = chrono::Utc::now().timestamp();
                    if let Err(e) = coordinator.broadcast_message(&message) {
                        error!("Broadcast failed: {}", e);
                    }
                }
                Some(_) => {}
                None => {
                    info!("stdin closed");
                    break;
                }
            },
            changed = fatal.changed() => {
                if changed.is_ok() {
                    let conflict = fatal.borrow().clone();
                    if let Some(conflict) = conflict {
                        coordinator.stop().await.ok();
                        return Err(conflict.into_error().into());
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received ctrl-c");
                break;
            }
        }
    }

    coordinator.stop().await?;
    Ok(())
}
