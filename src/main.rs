use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pi_sentry::config::{AppConfig, Tuning};
use pi_sentry::error::{AppError, ErrorSlot};
use pi_sentry::notify::{AlertTransport, NotificationLimiter, NullAlert, SmtpAlert};
use pi_sentry::pipeline::Pipeline;
use pi_sentry::server::{CommandSink, DeliveryServer, FrameMailbox};
use pi_sentry::tty;
use pi_sentry::utils::Shutdown;
use pi_sentry::video::{CaptureConfig, CaptureSource};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// pi-sentry command line arguments
#[derive(Parser, Debug)]
#[command(name = "pi-sentry")]
#[command(version, about = "A lightweight video surveillance server", long_about = None)]
struct CliArgs {
    /// Path to a JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video device path (overrides config)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable the interactive TTY key loop
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> anyhow::Result<u8> {
    tracing::info!("starting pi-sentry v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.video.device = device;
    }

    let shutdown = Shutdown::new();
    let errors = Arc::new(ErrorSlot::new());

    let mailbox = Arc::new(FrameMailbox::new());
    let tuning = Arc::new(Tuning::new(&config.pipeline));
    let pipeline = Pipeline::new(tuning, mailbox.clone(), shutdown.clone());
    let control: Arc<dyn CommandSink> = Arc::new(pipeline.control());

    // Listeners first; a taken port is fatal before anything else starts.
    let server = match DeliveryServer::bind(
        &config.server,
        mailbox.clone(),
        control.clone(),
        shutdown.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            errors.record(e);
            return Ok(errors.exit_code());
        }
    };

    // Camera next; an initialization failure leaves no worker behind.
    let capture = CaptureSource::new(CaptureConfig::from(&config.video));
    let frames = match capture.start().await {
        Ok(frames) => frames,
        Err(e) => {
            errors.record(e);
            return Ok(errors.exit_code());
        }
    };

    let transport: Arc<dyn AlertTransport> = if config.notify.enabled {
        Arc::new(SmtpAlert::from_config(&config.notify)?)
    } else {
        Arc::new(NullAlert)
    };
    let limiter =
        NotificationLimiter::new(transport, Duration::from_secs(config.notify.suppress_secs));

    let pipeline_task = pipeline.spawn(frames, limiter, errors.clone());

    let server_task = {
        let errors = errors.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                errors.record(e);
            }
            shutdown.trigger();
        })
    };

    let tty_task = if args.headless {
        None
    } else {
        Some(tty::spawn(control.clone(), shutdown.clone(), errors.clone()))
    };

    // SIGINT carries the Interrupt exit code, unlike a clean 'q' quit.
    {
        let errors = errors.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                errors.record(AppError::Interrupt);
                shutdown.trigger();
            }
        });
    }

    // The pipeline outlives every session; when it exits, everything stops.
    let _ = pipeline_task.await;
    shutdown.trigger();
    let _ = server_task.await;
    if let Some(task) = tty_task {
        let _ = task.await;
    }
    capture.stop().await;

    tracing::info!("shutdown complete");
    Ok(errors.exit_code())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "pi_sentry=error",
        LogLevel::Warn => "pi_sentry=warn",
        LogLevel::Info => "pi_sentry=info",
        LogLevel::Debug => "pi_sentry=debug",
        LogLevel::Trace => "pi_sentry=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
