use colored::*;

use clap::{App, AppSettings, Arg, ArgMatches};

use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::warn;

use ring_icmp::ping::process_identifier;
use ring_icmp::sink::init_diagnostics;
use ring_icmp::util::parse_timeout;
use ring_icmp::{
    ConsoleSink, DnsResolver, FileSink, LogSink, PingConfig, PingSession, PingSummary, ProbeError,
    RawTransport,
};

fn main() {
    let matches = App::new("ring")
        .setting(AppSettings::ColoredHelp)
        .version(env!("CARGO_PKG_VERSION"))
        .author("Bryan Becar <becar.bryan@gmail.com>")
        .about("A Rust clone of the `ping` utility.\nThe name is a portmanteau of Rust and pING. :)")
        .arg(Arg::with_name("DESTINATION")
            .help("Hostnames or IPv4 addresses, each pinged in its own session")
            .required(true)
            .multiple(true)
            .index(1))
        .arg(Arg::with_name("count")
            .help("Stop after sending COUNT echo requests")
            .short("c")
            .long("count")
            .takes_value(true)
            .default_value("4"))
        .arg(Arg::with_name("timeout")
            .help("How long to wait for each reply, in seconds or as a duration (ex: 2, 0.5, 400ms)")
            .short("W")
            .long("timeout")
            .takes_value(true)
            .default_value("2"))
        .arg(Arg::with_name("payload-size")
            .help("Bytes of echo request payload, at least 8")
            .short("s")
            .long("payload-size")
            .takes_value(true)
            .default_value("56"))
        .arg(Arg::with_name("log-to-file")
            .help("Write each destination's report to <time>-ping-<host>.log (implied by several destinations)")
            .short("o")
            .long("log-to-file"))
        .arg(Arg::with_name("log-dir")
            .help("Directory for report files")
            .long("log-dir")
            .takes_value(true)
            .default_value("."))
        .arg(Arg::with_name("verbose")
            .help("Print diagnostics to stderr")
            .short("v")
            .long("verbose"))
        .get_matches();

    init_diagnostics(matches.is_present("verbose"));

    let config = match parse_config(&matches) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {}", "ring:".red().bold(), e);
            process::exit(2);
        }
    };

    let hosts: Vec<&str> = matches.values_of("DESTINATION").map(|v| v.collect()).unwrap_or_default();
    let to_files = hosts.len() > 1 || matches.is_present("log-to-file");
    let log_dir = Path::new(matches.value_of("log-dir").unwrap_or("."));

    let interrupted = Arc::new(AtomicBool::new(false));
    let r = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Error setting Ctrl-C handler");
    }

    // One independent session per destination. They share nothing but the
    // interrupt flag.
    let failures = thread::scope(|scope| {
        let handles: Vec<_> = hosts
            .iter()
            .enumerate()
            .map(|(index, host)| {
                let interrupted = interrupted.clone();
                scope.spawn(move || ping_destination(host, index, config, to_files, log_dir, interrupted))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(false))
            .filter(|ok| !ok)
            .count()
    });

    if failures > 0 {
        process::exit(1);
    }
}

fn parse_config(matches: &ArgMatches) -> Result<PingConfig, ProbeError> {
    let defaults = PingConfig::default();

    let count = match matches.value_of("count") {
        Some(c) => c
            .parse::<u32>()
            .map_err(|_| ProbeError::InvalidArgument(format!("invalid count {:?} (ex: 4)", c)))?,
        None => defaults.count,
    };
    let timeout = match matches.value_of("timeout") {
        Some(t) => parse_timeout(t)?,
        None => defaults.timeout,
    };
    let payload_size = match matches.value_of("payload-size") {
        Some(s) => s
            .parse::<usize>()
            .map_err(|_| ProbeError::InvalidArgument(format!("invalid payload size {:?} (ex: 56)", s)))?,
        None => defaults.payload_size,
    };

    let config = PingConfig {
        count,
        timeout,
        payload_size,
    };
    config.validate()?;
    Ok(config)
}

/// Runs one destination's session to completion. Returns false if the
/// session was aborted.
fn ping_destination(
    host: &str,
    index: usize,
    config: PingConfig,
    to_file: bool,
    log_dir: &Path,
    interrupted: Arc<AtomicBool>,
) -> bool {
    let mut sink: Box<dyn LogSink> = if to_file {
        match FileSink::create(log_dir, "ping", host) {
            Ok(file) => {
                println!("{} {} {} {}", "PING".cyan(), host.bold(), "→".yellow(), file.path().display());
                Box::new(file)
            }
            Err(e) => {
                eprintln!("{} {}: cannot create log file: {}", "ring:".red().bold(), host, e);
                return false;
            }
        }
    } else {
        Box::new(ConsoleSink)
    };

    // Sessions running side by side in this process need distinct identifiers.
    let identifier = process_identifier().wrapping_add(index as u16);
    let session = PingSession::new(host, config, RawTransport, DnsResolver)
        .with_identifier(identifier)
        .with_interrupt(interrupted);

    match session.run(sink.as_mut()) {
        Ok(summary) => {
            if to_file {
                print_summary(host, &summary);
            }
            true
        }
        Err(e) => {
            warn!(host, error = %e, "Ping session aborted");
            sink.record(&format!("ring: {}: {}", host, e));
            if to_file {
                eprintln!("{} {}: {}", "ring:".red().bold(), host.bold(), e);
            }
            false
        }
    }
}

fn print_summary(host: &str, summary: &PingSummary) {
    println!("{} {} {} {}", "===".yellow(), host.bold(), "ping statistics".cyan(), "===".yellow());
    println!("{} packets transmitted, {} received, {}% packet loss",
        summary.transmitted().to_string().bold(), summary.received().to_string().bold(),
        format!("{:.2}", summary.loss_percent()).bold());
}
