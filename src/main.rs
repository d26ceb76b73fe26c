use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockprobe_rs::config::{ListenerConfig, ProbeConfig, TlsFiles};
use blockprobe_rs::doh::{DohProbe, DEFAULT_RESOLVER};
use blockprobe_rs::listener::PassiveListener;
use blockprobe_rs::pool::WorkerPool;
use blockprobe_rs::probe::Probe;
use blockprobe_rs::sink::{self, CsvWriter, JsonLinesWriter, RecordWriter};
use blockprobe_rs::tcp_probe::TcpProbe;
use blockprobe_rs::types::{
    ConnectionRecord, Job, JobResult, Record, CAPTURE_HEADER, DNS_HEADER, PAYLOAD_HEADER,
};
use blockprobe_rs::{ports, targets};

/// blockprobe-rs: measure dynamic blocking with active probes and a passive capture sink.
#[derive(Debug, Parser)]
#[command(name = "blockprobe-rs", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Force debug-level logging (otherwise RUST_LOG or `info`).
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Test whether domains are affected by DNS blocking using DNS over HTTPS.
    Dns(DnsArgs),
    /// Test whether payloads from FILE(s) trigger dynamic blocking. With no FILE, read stdin.
    Payload(PayloadArgs),
    /// Receive TCP/TLS connections and record what arrives.
    Sink(SinkArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Jsonl,
}

#[derive(Debug, Args)]
struct OutputArgs {
    /// Output file (default stdout).
    #[arg(long)]
    out: Option<PathBuf>,

    /// Output encoding.
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct DnsArgs {
    /// DoH resolver endpoint.
    #[arg(long, default_value = DEFAULT_RESOLVER)]
    host: String,

    /// Repeat up to this number of queries for each domain.
    #[arg(long, default_value_t = 3)]
    repeat: u32,

    /// Mark a domain as affected if this number of consecutive queries all time out.
    #[arg(long = "try", default_value_t = 2)]
    threshold: u32,

    /// Timeout of each DoH request, in seconds.
    #[arg(long, default_value = "5", value_parser = parse_seconds)]
    timeout: Duration,

    /// Pause between queries, in seconds.
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    interval: Duration,

    /// Pause after a timed out query, in seconds.
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    wait: Duration,

    /// Number of workers in parallel.
    #[arg(long, default_value_t = 10)]
    worker: usize,

    #[command(flatten)]
    output: OutputArgs,

    /// Files containing one domain per line.
    files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct PayloadArgs {
    /// Destination host.
    #[arg(long)]
    host: String,

    /// Comma-separated ports to send each payload to, e.g. 3000,4000-4002.
    #[arg(short = 'p', long = "ports", default_value = "80")]
    ports: String,

    /// Repeatedly make up to this number of connections to each ip:port.
    #[arg(long, default_value_t = 25)]
    repeat: u32,

    /// Mark an ip:port as affected if this number of consecutive connections all time out.
    #[arg(long = "try", default_value_t = 5)]
    threshold: u32,

    /// Timeout of TCP connect and send, in seconds.
    #[arg(long, default_value = "5", value_parser = parse_seconds)]
    timeout: Duration,

    /// Pause between connections to an ip:port, in seconds.
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    interval: Duration,

    /// Pause between connections when an ip:port timed out, in seconds.
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    wait: Duration,

    /// Time between sending a payload and closing the connection, in seconds.
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    sleep: Duration,

    /// Number of workers in parallel.
    #[arg(long, default_value_t = 10)]
    worker: usize,

    #[command(flatten)]
    output: OutputArgs,

    /// Files containing one hex payload per line.
    files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct SinkArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    ip: std::net::IpAddr,

    /// Comma-separated ports to listen on, e.g. 3000,4000-4002.
    #[arg(short = 'p', long = "ports", default_value = "12345")]
    ports: String,

    /// Close a connection after this many idle seconds.
    #[arg(long, default_value = "60", value_parser = parse_seconds)]
    timeout: Duration,

    /// Output file.
    #[arg(long, default_value = "output.csv")]
    out: PathBuf,

    /// Output encoding.
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Do not write the CSV header line.
    #[arg(long = "no-header", default_value_t = false)]
    no_header: bool,

    /// Listen with TLS.
    #[arg(long, default_value_t = false)]
    tls: bool,

    /// TLS certificate file (PEM).
    #[arg(long = "tls-cert", default_value = "server.crt")]
    tls_cert: PathBuf,

    /// TLS private key file (PKCS#8 PEM).
    #[arg(long = "tls-key", default_value = "server.key")]
    tls_key: PathBuf,

    /// Maximum connections recorded at once.
    #[arg(long = "max-connections", default_value_t = 1024)]
    max_connections: usize,

    /// Seconds open connections get to finish on shutdown.
    #[arg(long, default_value = "5", value_parser = parse_seconds)]
    grace: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref(), cli.debug)?;

    let res = match cli.command {
        Command::Dns(args) => run_dns(args).await,
        Command::Payload(args) => run_payload(args).await,
        Command::Sink(args) => run_sink(args).await,
    };
    if let Err(e) = res {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(log: Option<&Path>, debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    match log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            registry
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => registry
            .with(fmt::layer().with_target(false).with_writer(io::stderr))
            .init(),
    }
    Ok(())
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let v: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if v < 0.0 {
        return Err(format!("expected a non-negative number of seconds, got {s}"));
    }
    Duration::try_from_secs_f64(v).map_err(|e| format!("{s} seconds: {e}"))
}

async fn run_dns(args: DnsArgs) -> Result<()> {
    let config = ProbeConfig {
        workers: args.worker,
        timeout: args.timeout,
        repeat: args.repeat,
        threshold: args.threshold,
        interval: args.interval,
        backoff: args.wait,
    };
    config.validate()?;
    let jobs = targets::domain_jobs(&targets::read_lines(&args.files)?)?;
    let probe = DohProbe::new(&args.host)?;

    info!("DoH resolver   : {}", probe.resolver());
    log_probe_config(&config, jobs.len());
    run_probe(Arc::new(probe), config, jobs, &args.output, DNS_HEADER).await
}

async fn run_payload(args: PayloadArgs) -> Result<()> {
    let config = ProbeConfig {
        workers: args.worker,
        timeout: args.timeout,
        repeat: args.repeat,
        threshold: args.threshold,
        interval: args.interval,
        backoff: args.wait,
    };
    config.validate()?;
    let ports = ports::parse_port_spec(&args.ports)?;
    let jobs = targets::payload_jobs(&targets::read_lines(&args.files)?, &ports)?;
    let probe = TcpProbe::new(args.host.clone(), args.sleep);

    info!("destination    : {} ports {:?}", probe.host(), ports);
    log_probe_config(&config, jobs.len());
    run_probe(Arc::new(probe), config, jobs, &args.output, PAYLOAD_HEADER).await
}

fn log_probe_config(config: &ProbeConfig, jobs: usize) {
    info!("jobs           : {jobs}");
    info!("workers        : {}", config.workers);
    info!("repeat / try   : {} / {}", config.repeat, config.threshold);
    info!(
        "timeout/interval/wait : {:?} / {:?} / {:?}",
        config.timeout, config.interval, config.backoff
    );
}

async fn run_probe(
    probe: Arc<dyn Probe>,
    config: ProbeConfig,
    jobs: Vec<Job>,
    output: &OutputArgs,
    header: &[&str],
) -> Result<()> {
    let grace = config.timeout;
    let writer = open_writer::<JobResult>(output.out.as_deref(), output.format, Some(header))?;
    let (tx, drain) = sink::channel();
    let drain = drain.spawn(writer);

    let pool = WorkerPool::start(Arc::new(config), probe, tx);
    let total = jobs.len();
    for job in jobs {
        pool.submit(job)?;
    }

    let interrupted = tokio::select! {
        _ = pool.drain() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        warn!("interrupted; {} of {total} job(s) unfinished", pool.pending());
        pool.abort(grace).await;
    } else {
        pool.shutdown().await;
        info!("all {total} targets tested");
    }

    let report = drain.await.context("result writer task failed")?;
    finish_report(report)
}

async fn run_sink(args: SinkArgs) -> Result<()> {
    let config = ListenerConfig {
        bind: args.ip,
        ports: ports::parse_port_spec(&args.ports)?,
        read_timeout: args.timeout,
        max_connections: args.max_connections,
        grace_period: args.grace,
        tls: args.tls.then(|| TlsFiles { cert: args.tls_cert.clone(), key: args.tls_key.clone() }),
    };
    let listener = PassiveListener::bind(&config).await?;

    let header = (!args.no_header).then_some(CAPTURE_HEADER);
    let writer = open_writer::<ConnectionRecord>(Some(args.out.as_path()), args.format, header)?;
    let (tx, drain) = sink::channel();
    let drain = drain.spawn(writer);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("sink server exiting");
        }
        on_signal.cancel();
    });

    listener.run(tx, cancel).await;
    let report = drain.await.context("capture writer task failed")?;
    finish_report(report)
}

fn open_writer<R: Record>(
    out: Option<&Path>,
    format: OutputFormat,
    header: Option<&[&str]>,
) -> Result<Box<dyn RecordWriter<R> + Send>> {
    let dest: Box<dyn Write + Send> = match out {
        Some(path) => Box::new(
            File::create(path)
                .with_context(|| format!("failed to create output file: {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    Ok(match format {
        OutputFormat::Csv => Box::new(CsvWriter::new(dest, header).context("failed to write header")?),
        OutputFormat::Jsonl => Box::new(JsonLinesWriter::new(dest)),
    })
}

/// Surface unwritten records on stderr so they are not lost.
fn finish_report<R: Record>(report: sink::DrainReport<R>) -> Result<()> {
    info!("{} record(s) written", report.written);
    if report.failed.is_empty() {
        return Ok(());
    }
    let mut err = io::stderr().lock();
    for record in &report.failed {
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(err, "{line}");
        }
    }
    match report.last_error {
        Some(e) => bail!("{} record(s) could not be written: {e}", report.failed.len()),
        None => bail!("{} record(s) could not be written", report.failed.len()),
    }
}
