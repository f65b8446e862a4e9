mod app;

use std::error::Error;
use std::sync::mpsc::{self, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info, LevelFilter};
use rand::seq::SliceRandom;
use signal_hook::consts::signal::*;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::exfiltrator::origin::WithOrigin;
use signal_hook::iterator::SignalsInfo;
use signal_hook::low_level::raise;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use crate::app::DemoSetup;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Drives a simulated NIC whose interrupts arrive as real-time signals.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Tasklet worker threads
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// MSI-X vectors on the simulated NIC
    #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(0..=8))]
    vectors: u32,

    /// Interrupts to raise before shutting down
    #[arg(short, long, default_value_t = 32)]
    interrupts: usize,

    /// Milliseconds between two interrupts
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

const INTR_IRQ_BASE: i32 = 35; // SIGRTMIN: 34 & SIGRTMAX: 64

fn irq_signal(irq: u32) -> i32 {
    INTR_IRQ_BASE + irq as i32
}

/// Device thread: raises the signal of a random line every `interval`, then
/// asks the interrupt thread to stop.
fn spawn_device(
    irqs: Vec<u32>,
    count: usize,
    interval: Duration,
    receiver: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut rng = rand::thread_rng();
        for _ in 0..count {
            match receiver.try_recv() {
                Ok(_) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {}
            }
            if let Some(irq) = irqs.choose(&mut rng) {
                if let Err(e) = raise(irq_signal(*irq)) {
                    error!("Device: raising irq {irq} failed: {e}");
                }
            }
            thread::sleep(interval);
        }
        if let Err(e) = raise(SIGTERM) {
            error!("Device: raising SIGTERM failed: {e}");
        }
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    TermLogger::init(
        args.log_level.into(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let setup = DemoSetup::new(args.workers, args.vectors)?;
    setup.register()?;

    // Signal setup
    let mut sigs: Vec<i32> = setup.irqs().into_iter().map(irq_signal).collect();
    sigs.push(SIGHUP);
    sigs.extend(TERM_SIGNALS);
    let mut signals = SignalsInfo::<WithOrigin>::new(&sigs)?;

    let (sender, receiver) = mpsc::channel();
    let device = spawn_device(
        setup.irqs(),
        args.interrupts,
        Duration::from_millis(args.interval_ms),
        receiver,
    );

    // Interrupt thread
    for info in &mut signals {
        match info.signal {
            SIGHUP => {}
            sig if TERM_SIGNALS.contains(&sig) => {
                info!("Terminating");
                break;
            }
            sig => setup.handle_irq((sig - INTR_IRQ_BASE) as u32),
        }
    }

    // Device thread termination
    let _ = sender.send(());
    if device.join().is_err() {
        error!("Device thread panicked");
    }
    setup.teardown();
    Ok(())
}
