use std::env;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pcm_multi::control::status::MultiStatus;
use pcm_multi::tone::ToneGenerator;
use pcm_multi::{
    MultiConfig, MultiError, PcmFormat, PcmMode, PcmMulti, TransportPcm, TransportSignal,
};

const CHANNELS: u8 = 2;
const SAMPLING_RATE: u32 = 48_000;
const PERIOD_FRAMES: usize = 240;

struct Options {
    clients: usize,
    seconds: f64,
    format: PcmFormat,
}

fn usage() {
    println!(
        "Usage: multictl [--clients N] [--seconds S] [--format u8|s16|s32]\n\n\
         Runs a simulated playback transport fed by N tone clients, then\n\
         drains every client and prints the multi status."
    );
}

fn parse_args() -> Options {
    let mut options = Options {
        clients: 2,
        seconds: 2.0,
        format: PcmFormat::S16Le,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next().unwrap_or_else(|| {
                eprintln!("multictl: missing value for {name}");
                process::exit(1);
            })
        };
        match arg.as_str() {
            "--clients" | "-c" => {
                options.clients = value("--clients").parse().unwrap_or_else(|_| {
                    eprintln!("multictl: --clients expects a number");
                    process::exit(1);
                })
            }
            "--seconds" | "-s" => {
                options.seconds = value("--seconds").parse().unwrap_or_else(|_| {
                    eprintln!("multictl: --seconds expects a number");
                    process::exit(1);
                })
            }
            "--format" | "-f" => {
                options.format = match value("--format").as_str() {
                    "u8" => PcmFormat::U8,
                    "s16" => PcmFormat::S16Le,
                    "s32" => PcmFormat::S32Le,
                    other => {
                        eprintln!("multictl: unknown format '{other}'");
                        process::exit(1);
                    }
                }
            }
            "--help" | "-h" => {
                usage();
                process::exit(0);
            }
            other => {
                eprintln!("multictl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }
    options
}

fn print_status(status: &MultiStatus) {
    println!("State       : {:?}", status.state);
    println!("Clients     : {} ({} active)", status.client_count, status.active_count);
    println!("Mix Avail   : {} samples", status.mix_avail);
    println!("Delay       : {:.1} ms", status.delay as f64 / 10.0);
    for client in &status.clients {
        println!(
            "  [{}] {:?} | buffered={} bytes | mix delay={} samples | watching={}",
            client.id,
            client.state,
            client.buffered_bytes,
            client.mix_delay,
            if client.watching { "yes" } else { "no" },
        );
    }
}

fn run(options: Options) -> Result<(), MultiError> {
    let (transport, signals) = TransportPcm::new(PcmMode::Sink, options.format, CHANNELS, SAMPLING_RATE);
    let multi = Arc::new(PcmMulti::create(Arc::new(transport), MultiConfig::default())?);
    let transfer_samples = PERIOD_FRAMES * CHANNELS as usize;
    multi.init(transfer_samples)?;

    let running = Arc::new(AtomicBool::new(true));
    let mut controls = Vec::new();
    let mut writers = Vec::new();
    for n in 0..options.clients {
        let (audio, audio_peer) = UnixStream::pair()?;
        let (control, control_peer) = UnixStream::pair()?;
        multi.add_client(OwnedFd::from(audio_peer), OwnedFd::from(control_peer))?;
        controls.push(control);

        let running = Arc::clone(&running);
        let format = options.format;
        writers.push(thread::spawn(move || {
            let mut audio = audio;
            let mut tone = ToneGenerator::new(format, CHANNELS, SAMPLING_RATE, 220.0 * (n + 1) as f64, 0.2);
            while running.load(Ordering::Relaxed) {
                let pcm = tone.render(PERIOD_FRAMES);
                if audio.write_all(&pcm).is_err() {
                    break;
                }
            }
        }));
    }

    let reader = {
        let multi = Arc::clone(&multi);
        let running = Arc::clone(&running);
        let sample_bytes = options.format.sample_bytes();
        thread::spawn(move || {
            let period = Duration::from_secs_f64(PERIOD_FRAMES as f64 / SAMPLING_RATE as f64);
            let mut buffer = vec![0u8; transfer_samples * sample_bytes];
            let mut total = 0usize;
            let mut next = Instant::now();
            while running.load(Ordering::Relaxed) {
                match multi.read(&mut buffer, transfer_samples) {
                    Ok(0) => break,
                    Ok(samples) => total += samples,
                    Err(MultiError::TryAgain) => {}
                    Err(_) => break,
                }
                next += period;
                thread::sleep(next.saturating_duration_since(Instant::now()));
            }
            total
        })
    };

    thread::sleep(Duration::from_secs_f64(options.seconds.max(0.0)));
    println!("Status after {:.1} s:", options.seconds);
    print_status(&multi.status());

    running.store(false, Ordering::Relaxed);
    let samples = reader.join().unwrap_or(0);
    for control in &mut controls {
        control.write_all(b"Drain")?;
        let mut reply = [0u8; 8];
        let len = control.read(&mut reply)?;
        println!("Drain reply : {}", String::from_utf8_lossy(&reply[..len]));
    }
    drop(controls);
    for writer in writers {
        let _ = writer.join();
    }

    println!(
        "Transport read {} frames ({:.2} s)",
        samples / CHANNELS as usize,
        samples as f64 / CHANNELS as f64 / SAMPLING_RATE as f64
    );
    let signals: Vec<TransportSignal> = signals.try_iter().collect();
    println!("Signals     : {signals:?}");
    Ok(())
}

fn main() {
    pcm_multi::init_tracing();
    let options = parse_args();
    if let Err(err) = run(options) {
        eprintln!("multictl: {err}");
        process::exit(1);
    }
}
