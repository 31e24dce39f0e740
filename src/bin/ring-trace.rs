use colored::*;

use clap::{App, AppSettings, Arg, ArgMatches};

use std::process;

use tracing::warn;

use ring_icmp::sink::init_diagnostics;
use ring_icmp::util::parse_timeout;
use ring_icmp::{ConsoleSink, DnsResolver, LogSink, ProbeError, RawTransport, TraceConfig, TraceSession};

fn main() {
    let matches = App::new("ring-trace")
        .setting(AppSettings::ColoredHelp)
        .version(env!("CARGO_PKG_VERSION"))
        .author("Bryan Becar <becar.bryan@gmail.com>")
        .about("Traces the IPv4 path to a host with ICMP echo requests")
        .arg(Arg::with_name("DESTINATION")
            .help("Hostname or IPv4 address")
            .required(true)
            .index(1))
        .arg(Arg::with_name("max-hops")
            .help("Maximum number of hops (max TTL) to probe")
            .short("m")
            .long("max-hops")
            .takes_value(true)
            .default_value("30"))
        .arg(Arg::with_name("first-ttl")
            .help("TTL to start the sweep with")
            .short("f")
            .long("first-ttl")
            .takes_value(true)
            .default_value("1"))
        .arg(Arg::with_name("timeout")
            .help("How long to wait for each probe, in seconds or as a duration (ex: 0.1, 250ms)")
            .short("W")
            .long("timeout")
            .takes_value(true)
            .default_value("0.1"))
        .arg(Arg::with_name("payload-size")
            .help("Bytes of echo request payload, at least 8")
            .short("s")
            .long("payload-size")
            .takes_value(true)
            .default_value("60"))
        .arg(Arg::with_name("verbose")
            .help("Print diagnostics to stderr")
            .short("v")
            .long("verbose"))
        .get_matches();

    init_diagnostics(matches.is_present("verbose"));

    let config = match parse_config(&matches) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {}", "ring-trace:".red().bold(), e);
            process::exit(2);
        }
    };

    let host = matches.value_of("DESTINATION").unwrap_or_default();
    let mut sink = ConsoleSink;
    match TraceSession::new(host, config, RawTransport, DnsResolver).run(&mut sink) {
        Ok(trace) if !trace.reached() => {
            sink.record(&format!("{} not reached within {} hops", host, config.max_hops).yellow().to_string());
        }
        Ok(_) => {}
        Err(e) => {
            warn!(host, error = %e, "Traceroute aborted");
            eprintln!("{} {}: {}", "ring-trace:".red().bold(), host.bold(), e);
            process::exit(1);
        }
    }
}

fn parse_config(matches: &ArgMatches) -> Result<TraceConfig, ProbeError> {
    let defaults = TraceConfig::default();

    let ttl_arg = |name: &str, default: u8| -> Result<u8, ProbeError> {
        match matches.value_of(name) {
            Some(v) => v
                .parse::<u8>()
                .map_err(|_| ProbeError::InvalidArgument(format!("invalid {} {:?} (ex: 1..255)", name, v))),
            None => Ok(default),
        }
    };

    let config = TraceConfig {
        first_ttl: ttl_arg("first-ttl", defaults.first_ttl)?,
        max_hops: ttl_arg("max-hops", defaults.max_hops)?,
        timeout: match matches.value_of("timeout") {
            Some(t) => parse_timeout(t)?,
            None => defaults.timeout,
        },
        payload_size: match matches.value_of("payload-size") {
            Some(s) => s
                .parse::<usize>()
                .map_err(|_| ProbeError::InvalidArgument(format!("invalid payload size {:?} (ex: 60)", s)))?,
            None => defaults.payload_size,
        },
    };
    config.validate()?;
    Ok(config)
}
