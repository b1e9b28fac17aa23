//! Netbridge CLI
//!
//! Soak-tests the native platform and prints configuration.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use netbridge::bridge::TimerHandle;
use netbridge::config::{BridgeConfig, CONFIG_FILE_NAME};
use netbridge::platform::{NativePlatform, Platform};
use serde::Serialize;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "netbridge")]
#[command(version)]
#[command(about = "Native networking bridge runtime", long_about = None)]
struct Cli {
    /// Configuration file (default: search upward for netbridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config {
        /// Write it to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Stress the native platform and print its statistic as JSON
    Soak {
        /// Producer threads submitting to one executor
        #[arg(long, default_value = "4")]
        producers: usize,

        /// Executor items per producer
        #[arg(long, default_value = "10000")]
        items: u64,

        /// Worker tasks to submit; every other one is canceled
        #[arg(long, default_value = "64")]
        tasks: u64,

        /// Repeating timer ticks to wait for
        #[arg(long, default_value = "20")]
        ticks: u64,

        /// Datagrams to echo over loopback
        #[arg(long, default_value = "256")]
        datagrams: u64,

        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[derive(Debug, Default, Serialize)]
struct SoakReport {
    elapsed_ms: u128,
    executor_items: u64,
    executor_rejections: u64,
    worker_completions: u64,
    worker_canceled: u64,
    timer_ticks: u64,
    datagrams_echoed: u64,
    send_failures: u64,
    platform: netbridge::platform::PlatformStatistic,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            BridgeConfig::find_and_load(&cwd)
                .with_context(|| format!("Failed to load {}", CONFIG_FILE_NAME))
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config { output } => cmd_config(&config, output.as_deref()),
        Commands::Soak {
            producers,
            items,
            tasks,
            ticks,
            datagrams,
            timeout,
        } => cmd_soak(
            &config,
            producers,
            items,
            tasks,
            ticks,
            datagrams,
            Duration::from_secs(timeout),
        ),
    }
}

fn cmd_config(config: &BridgeConfig, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            config
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

fn cmd_soak(
    config: &BridgeConfig,
    producers: usize,
    items: u64,
    tasks: u64,
    ticks: u64,
    datagrams: u64,
    limit: Duration,
) -> Result<()> {
    let platform = Rc::new(NativePlatform::new(config).context("Failed to create platform")?);
    platform.startup()?;
    let started = Instant::now();

    // Executor: many producers, one consumer.
    let executed = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));
    let executor = platform.acquire_executor()?;
    let handles: Vec<_> = (0..producers)
        .map(|_| {
            let executor = executor.clone();
            let executed = Arc::clone(&executed);
            let rejected = Arc::clone(&rejected);
            std::thread::spawn(move || {
                for _ in 0..items {
                    let counter = Arc::clone(&executed);
                    let submitted = executor.submit(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                    if submitted.is_err() {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    // Worker tasks, half of them canceled right away.
    let completions = Rc::new(Cell::new(0u64));
    let canceled = Rc::new(Cell::new(0u64));
    for n in 0..tasks {
        let completions = Rc::clone(&completions);
        let canceled = Rc::clone(&canceled);
        let task = platform.submit_worker_task(
            Box::new(|| std::thread::sleep(Duration::from_millis(1))),
            Box::new(move |was_canceled| {
                completions.set(completions.get() + 1);
                if was_canceled {
                    canceled.set(canceled.get() + 1);
                }
            }),
        )?;
        if n % 2 == 1 {
            platform.cancel_worker_task(task);
        }
    }

    // Repeating timer.
    let timer_ticks = Rc::new(Cell::new(0u64));
    let timer = TimerHandle::new();
    {
        let timer_ticks = Rc::clone(&timer_ticks);
        platform.timer_start(
            Box::new(move || timer_ticks.set(timer_ticks.get() + 1)),
            5,
            5,
            Some(&timer),
        )?;
    }

    // UDP loopback echo.
    let server = platform.udp_bind("127.0.0.1:0".parse()?)?;
    let server_addr = platform
        .udp_local_address(server)
        .context("Server socket has no local address")?;
    let client = platform.udp_connect(server_addr)?;
    let max_datagram = config.udp.max_datagram;
    {
        let echo = Rc::downgrade(&platform);
        platform.udp_recv_start(
            server,
            Box::new(move || Some(vec![0u8; max_datagram])),
            Box::new(move |from, data, _| {
                if let Some(platform) = echo.upgrade() {
                    let _ = platform.udp_send(server, Some(from), &[data.as_slice()], None);
                }
            }),
        )?;
    }
    let echoed = Rc::new(Cell::new(0u64));
    {
        let echoed = Rc::clone(&echoed);
        platform.udp_recv_start(
            client,
            Box::new(move || Some(vec![0u8; max_datagram])),
            Box::new(move |_, _, _| echoed.set(echoed.get() + 1)),
        )?;
    }
    let send_failures = Rc::new(Cell::new(0u64));
    for n in 0..datagrams {
        let failures = Rc::clone(&send_failures);
        platform.udp_send(
            client,
            None,
            &[&n.to_be_bytes()[..]],
            Some(Box::new(move |status| {
                if status < 0 {
                    failures.set(failures.get() + 1);
                }
            })),
        )?;
    }

    let expected_items = producers as u64 * items;
    let done = || {
        executed.load(Ordering::Relaxed) + rejected.load(Ordering::Relaxed) >= expected_items
            && completions.get() >= tasks
            && timer_ticks.get() >= ticks
            && echoed.get() + send_failures.get() >= datagrams
    };
    while !done() {
        if started.elapsed() > limit {
            break;
        }
        platform.poll(Some(Duration::from_millis(10)))?;
    }
    for handle in handles {
        if handle.join().is_err() {
            bail!("Producer thread panicked");
        }
    }

    platform.timer_stop(&timer);
    platform.release_executor(&executor);
    platform.poll(Some(Duration::ZERO))?;

    let report = SoakReport {
        elapsed_ms: started.elapsed().as_millis(),
        executor_items: executed.load(Ordering::Relaxed),
        executor_rejections: rejected.load(Ordering::Relaxed),
        worker_completions: completions.get(),
        worker_canceled: canceled.get(),
        timer_ticks: timer_ticks.get(),
        datagrams_echoed: echoed.get(),
        send_failures: send_failures.get(),
        platform: platform.statistic(),
    };
    platform.shutdown(None);

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !done() {
        bail!("Soak did not finish within {:?}", limit);
    }
    Ok(())
}
