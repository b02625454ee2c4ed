//! amfcore AMF (Access and Mobility Management Function)
//!
//! Control-plane core: NAS procedures, NGAP session management and the
//! context registries, run as four cooperating tasks.

pub mod app;
pub mod arena;
pub mod auth;
pub mod config;
pub mod context;
pub mod event;
pub mod gmm;
pub mod gmm_sm;
pub mod nas_context;
pub mod nas_message;
pub mod nas_security;
pub mod ngap;
pub mod ngap_context;
pub mod ngap_message;
pub mod ngap_sm;
pub mod runtime;
pub mod sbi;
pub mod types;
pub mod ue_context;

#[cfg(test)]
mod property_tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::task::JoinHandle;

use app::{AppMessage, AppTask, LogSink, NotificationSink};
use config::{AmfConfig, ConfigError};
use context::{AmfContext, ChannelTransport, OutboundPdu, RadioTransport, TaskBase};
use gmm::N1Task;
use ngap::N2Task;
use runtime::{channel, spawn, TaskId};
use sbi::{N11Task, PeerNf, StaticPeerNf};

/// amfcore AMF - Access and Mobility Management Function
#[derive(Parser, Debug)]
#[command(name = "amfcore-amfd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "5G Core Access and Mobility Management Function")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/amfcore/amf.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,
}

// ============================================================================
// Application
// ============================================================================

/// Running AMF: the shared task base and the spawned task loops
pub struct AmfApp {
    base: TaskBase,
    tasks: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl AmfApp {
    /// Build the context and spawn the App, N1, N2 and N11 tasks
    pub fn start(
        config: AmfConfig,
        peer: Arc<dyn PeerNf>,
        radio: Arc<dyn RadioTransport>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let ctx = Arc::new(AmfContext::new(config).context("invalid AMF configuration")?);
        let (app, app_rx) = channel(TaskId::App);
        let (n1, n1_rx) = channel(TaskId::N1);
        let (n2, n2_rx) = channel(TaskId::N2);
        let (n11, n11_rx) = channel(TaskId::N11);
        let base = TaskBase {
            ctx,
            app,
            n1,
            n2,
            n11,
            radio,
        };

        let tasks = vec![
            spawn(N11Task::new(base.clone(), peer), n11_rx),
            spawn(N2Task::new(base.clone()), n2_rx),
            spawn(N1Task::new(base.clone()), n1_rx),
            spawn(AppTask::new(base.clone(), sink), app_rx),
        ];
        log::info!("AMF tasks started");
        Ok(Self {
            base,
            tasks,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn base(&self) -> &TaskBase {
        &self.base
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub async fn run(&self) {
        log::info!("AMF running...");
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop every task after its queued messages, App first
    pub async fn shutdown(self) {
        log::info!("AMF shutting down...");
        let base = &self.base;
        let results = [
            base.app.shutdown().await,
            base.n1.shutdown().await,
            base.n2.shutdown().await,
            base.n11.shutdown().await,
        ];
        for result in results {
            if let Err(e) = result {
                log::warn!("Task shutdown failed: {}", e);
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                log::warn!("Task ended abnormally: {}", e);
            }
        }
        log::info!(
            "AMF stopped ({} UE contexts, {} gNBs)",
            base.ctx.ue_contexts.len(),
            base.ctx.ngap.gnb_count()
        );
    }
}

/// Load the configuration file; a missing file falls back to defaults
fn load_config(path: &str) -> Result<AmfConfig> {
    match AmfConfig::load(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::Io(e)) => {
            log::warn!("Could not read config file '{}': {}. Using defaults.", path, e);
            Ok(AmfConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("loading {}", path)),
    }
}

/// Writer side of the radio transport
///
/// The SCTP association and ASN.1 codec live behind this channel; here the
/// outbound PDUs are only traced.
fn spawn_radio_writer(mut rx: tokio::sync::mpsc::UnboundedReceiver<OutboundPdu>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(pdu) = rx.recv().await {
            log::trace!(
                "[assoc={}] stream {} <- {}",
                pdu.assoc,
                pdu.stream,
                pdu.msg.name()
            );
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .write_style(if args.no_color {
            env_logger::WriteStyle::Never
        } else {
            env_logger::WriteStyle::Auto
        })
        .init();

    log::info!("amfcore AMF v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);

    let config = load_config(&args.config)?;
    let peer = Arc::new(StaticPeerNf::new(config.clone()).context("peer NF setup")?);
    let (transport, outbound) = ChannelTransport::new();
    let writer = spawn_radio_writer(outbound);

    let app = AmfApp::start(config, peer, Arc::new(transport), Arc::new(LogSink))?;

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    app.base().app.send(AppMessage::RegisterNf)?;
    app.run().await;
    app.shutdown().await;
    writer.abort();

    log::info!("amfcore AMF terminated");
    Ok(())
}
