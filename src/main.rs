use atc_sensor_relay::app::{
    CycleConfig, Interrupt, Interrupted, Options, RunError, open_transport, run_cycle,
};
use atc_sensor_relay::broker::memory::MemoryBroker;
use atc_sensor_relay::broker::mqtt::MqttBroker;
use atc_sensor_relay::broker::Broker;
use atc_sensor_relay::registry::Registry;
use clap::Parser;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Print what a dry run would have published, one `topic payload` line each.
fn print_published(broker: &MemoryBroker) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    for message in broker.published() {
        writeln!(
            out,
            "{} {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        )?;
    }
    Ok(())
}

async fn run(options: Options) -> Result<(), RunError> {
    let registry = Registry::load(&options.device_settings)?;
    info!(
        "Loaded {} devices from {}",
        registry.len(),
        options.device_settings.display()
    );
    let config = CycleConfig::from(&options);

    let Some(transport) = open_transport(options.backend, &registry).await? else {
        warn!("No devices configured, nothing to do");
        return Ok(());
    };

    let interrupt = Interrupt::new();
    let signals = interrupt.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match signals.trigger() {
                Interrupted::Scan => info!("Interrupted, ending scan"),
                Interrupted::Cycle => warn!("Interrupted, cancelling cycle"),
            }
        }
    });

    let dry_run = options.dry_run.then(MemoryBroker::new);
    let mqtt = MqttBroker::default();
    let broker: &dyn Broker = match &dry_run {
        Some(memory) => memory,
        None => &mqtt,
    };

    run_cycle(&config, &registry, transport.as_ref(), broker, &interrupt).await?;

    if let Some(memory) = &dry_run
        && let Err(e) = print_published(memory)
    {
        error!("can't write output: {}", e);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for schedulers
    // (e.g., cron, systemd timers) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    let filter = if options.quiet {
        EnvFilter::new("warn")
    } else if options.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
