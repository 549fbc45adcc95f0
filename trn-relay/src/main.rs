#![forbid(unsafe_code)]

use std::io::{BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use trn_relay_lib::config::{self, PortModeCfg, PortProtoCfg};
use trn_relay_lib::error::{MsgErr, RelayError};
use trn_relay_lib::frame::mb1::MB1_MAX_FRAME_BYTES;
use trn_relay_lib::frame::{Mb1Frame, Mb1StreamReader, Mb71Frame};
use trn_relay_lib::net::multicast::{self, McastOptions};
use trn_relay_lib::net::{Port, TargetAddr};
use trn_relay_lib::proto::text;
use trn_relay_lib::proto::{CommstProtocol, MbTextProtocol, TrnmsgProtocol, TrnuTextProtocol};
use trn_relay_lib::telemetry::tracing::init_tracing;
use trn_relay_lib::trn::BenchFilter;
use trn_relay_lib::SessionLog;

#[derive(Parser, Debug)]
#[command(version, about = "Sonar telemetry and TRN middleware")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the netif ports described by a TOML configuration.
    Serve {
        /// Path to configuration TOML file
        #[arg(short, long, value_name = "FILE", default_value = "trn-relay.toml")]
        config: PathBuf,
    },
    /// Convert an MB1 log file to MB71/FBT format.
    Mb1conv {
        /// Input MB1 file
        #[arg(long)]
        ifile: PathBuf,
        /// Output file (default is <ifile>.mb71)
        #[arg(long)]
        ofile: Option<PathBuf>,
        /// Byte-swap output records for cross-endian consumers
        #[arg(long)]
        byteswap: bool,
        #[arg(long, default_value_t = 0)]
        verbose: u8,
    },
    /// Read and display MB1 records from a log file or server.
    Mb1cat {
        /// Input MB1 file
        #[arg(long, conflicts_with = "host")]
        ifile: Option<PathBuf>,
        /// Subscribe to an MB1 server (ip:port) instead of reading a file
        #[arg(long)]
        host: Option<String>,
        /// Consecutive receive timeouts tolerated in --host mode
        #[arg(long, default_value_t = 5)]
        retries: u32,
        /// Output selector: any combination of H (header), B (beams),
        /// X (hex); A or * selects all
        #[arg(long, default_value = "H")]
        format: String,
        /// Number of records to read (0 = all)
        #[arg(long, default_value_t = 0)]
        cycles: u64,
    },
    /// Export MB1 records from a log file as CSV.
    Mb12csv {
        /// Input MB1 file
        #[arg(long)]
        ifile: PathBuf,
        /// Output CSV file
        #[arg(long)]
        ofile: Option<PathBuf>,
        /// Suppress stdout output
        #[arg(long)]
        nocsv: bool,
        /// Inputs use radians for heading and lat/lon; convert to
        /// degrees on output
        #[arg(long)]
        rad: bool,
    },
    /// Multicast publisher loop.
    Mcpub {
        #[arg(long, default_value = multicast::MCAST_GROUP_DFL)]
        group: String,
        #[arg(long, default_value_t = multicast::MCAST_PORT_DFL)]
        mcast_port: u16,
        #[arg(long, default_value_t = multicast::MCAST_LOCAL_PORT_DFL)]
        local_port: u16,
        #[arg(long, default_value_t = multicast::MCAST_TTL_DFL)]
        ttl: u32,
        /// Interface address for sends and group membership
        #[arg(long, default_value = "0.0.0.0")]
        iface: String,
        /// Expect and acknowledge subscriber pings
        #[arg(long)]
        bidir: bool,
        /// Wrap messages in an LCM-compatible envelope on this channel
        #[arg(long, value_name = "CHANNEL")]
        lcm: Option<String>,
        /// Messages to send (-1 = indefinite)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        cycles: i64,
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
    },
    /// Multicast subscriber loop.
    Mcsub {
        #[arg(long, default_value = multicast::MCAST_GROUP_DFL)]
        group: String,
        #[arg(long, default_value_t = multicast::MCAST_PORT_DFL)]
        mcast_port: u16,
        #[arg(long, default_value_t = multicast::MCAST_TTL_DFL)]
        ttl: u32,
        /// Interface address for sends and group membership
        #[arg(long, default_value = "0.0.0.0")]
        iface: String,
        /// Reply to each message with a ping
        #[arg(long)]
        bidir: bool,
        /// Expect LCM-enveloped messages on this channel
        #[arg(long, value_name = "CHANNEL")]
        lcm: Option<String>,
        /// Messages to receive (-1 = indefinite)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        cycles: i64,
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let status = match cli.cmd {
        Cmd::Serve { config } => serve(&config).await,
        Cmd::Mb1conv {
            ifile,
            ofile,
            byteswap,
            verbose,
        } => mb1conv(&ifile, ofile.as_deref(), byteswap, verbose),
        Cmd::Mb1cat {
            ifile,
            host,
            retries,
            format,
            cycles,
        } => match (ifile, host) {
            (Some(path), None) => mb1cat_file(&path, &format, cycles),
            (None, Some(host)) => mb1cat_net(&host, retries, &format, cycles).await,
            _ => {
                init_tracing("info");
                error!("exactly one of --ifile or --host is required");
                std::process::exit(2);
            }
        },
        Cmd::Mb12csv {
            ifile,
            ofile,
            nocsv,
            rad,
        } => mb12csv(&ifile, ofile.as_deref(), nocsv, rad),
        Cmd::Mcpub {
            group,
            mcast_port,
            local_port,
            ttl,
            iface,
            bidir,
            lcm,
            cycles,
            delay_ms,
        } => {
            init_tracing("info");
            let opts = match mcast_options(
                &group, mcast_port, local_port, ttl, &iface, bidir, lcm, cycles, delay_ms,
            ) {
                Ok(o) => o,
                Err(e) => {
                    error!(%e, "invalid multicast options");
                    std::process::exit(2);
                }
            };
            let shutdown = shutdown_channel();
            multicast::run_pub(opts, shutdown).await.map(|_| ())
        }
        Cmd::Mcsub {
            group,
            mcast_port,
            ttl,
            iface,
            bidir,
            lcm,
            cycles,
            delay_ms,
        } => {
            init_tracing("info");
            let opts = match mcast_options(
                &group, mcast_port, 0, ttl, &iface, bidir, lcm, cycles, delay_ms,
            ) {
                Ok(o) => o,
                Err(e) => {
                    error!(%e, "invalid multicast options");
                    std::process::exit(2);
                }
            };
            let shutdown = shutdown_channel();
            multicast::run_sub(opts, shutdown).await.map(|_| ())
        }
    };

    if let Err(e) = status {
        error!(%e, "exited with error");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn mcast_options(
    group: &str,
    mcast_port: u16,
    local_port: u16,
    ttl: u32,
    iface: &str,
    bidir: bool,
    lcm: Option<String>,
    cycles: i64,
    delay_ms: u64,
) -> Result<McastOptions, RelayError> {
    let group = group
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid multicast group: {group}")))?;
    let iface = iface
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid multicast interface: {iface}")))?;
    Ok(McastOptions {
        group,
        mcast_port,
        local_port,
        ttl,
        loopback: true,
        iface,
        bind_en: true,
        bidir,
        lcm_channel: lcm,
        cycles,
        delay: Duration::from_millis(delay_ms),
    })
}

fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
        // keep the sender alive so receivers observe the flag
        std::future::pending::<()>().await;
    });
    rx
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(%e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(%e, "failed to install SIGHUP handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn serve(config_path: &Path) -> Result<(), RelayError> {
    let cfg = match config::load_from_path(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing("info");
            return Err(e);
        }
    };
    init_tracing(&cfg.log.level);
    info!(?config_path, ports = cfg.ports.len(), "configuration loaded");

    let shutdown = shutdown_channel();
    let mut tasks = Vec::new();
    let mut feeds: Vec<mpsc::Sender<Bytes>> = Vec::new();

    for pc in &cfg.ports {
        let log = match &cfg.log.dir {
            Some(dir) => SessionLog::create(dir, &format!("netif-{}", pc.name))?,
            None => SessionLog::null(),
        };
        let settings = pc.settings();
        let name = pc.name.clone();
        match pc.protocol {
            PortProtoCfg::Commst => {
                let proto = CommstProtocol::new(BenchFilter::new(), cfg.commst.options());
                let port = Port::new(settings, log, proto, shutdown.clone());
                tasks.push(tokio::spawn(async move {
                    (name, port.run().await)
                }));
            }
            PortProtoCfg::Trnmsg => {
                let proto = TrnmsgProtocol::new(BenchFilter::new());
                let port = Port::new(settings, log, proto, shutdown.clone());
                tasks.push(tokio::spawn(async move {
                    (name, port.run().await)
                }));
            }
            PortProtoCfg::Mb => {
                let mut port = Port::new(settings, log, MbTextProtocol, shutdown.clone());
                if pc.mode == PortModeCfg::Pub {
                    let (tx, rx) = mpsc::channel(64);
                    feeds.push(tx);
                    port = port.with_input(rx);
                }
                tasks.push(tokio::spawn(async move {
                    (name, port.run().await)
                }));
            }
            PortProtoCfg::Trnu => {
                let mut port =
                    Port::new(settings, log, TrnuTextProtocol::new(), shutdown.clone());
                if pc.mode == PortModeCfg::Pub {
                    let (tx, rx) = mpsc::channel(64);
                    feeds.push(tx);
                    port = port.with_input(rx);
                }
                tasks.push(tokio::spawn(async move {
                    (name, port.run().await)
                }));
            }
        }
    }

    if let Some(source) = cfg.source.clone() {
        if feeds.is_empty() {
            warn!("mb1 source configured but no publish-mode ports");
        } else {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let res = replay_mb1(
                    &source.mb1_file,
                    Duration::from_millis(source.interval_ms),
                    &feeds,
                    shutdown,
                )
                .await;
                ("mb1-source".to_string(), res)
            }));
        }
    }

    for task in tasks {
        match task.await {
            Ok((name, Ok(()))) => info!(%name, "task finished"),
            Ok((name, Err(e))) => warn!(%name, %e, "task failed"),
            Err(e) => warn!(%e, "task panicked"),
        }
    }
    Ok(())
}

/// Replay the records of an MB1 log file into the publish feeds at a
/// fixed cadence.
async fn replay_mb1(
    path: &Path,
    interval: Duration,
    feeds: &[mpsc::Sender<Bytes>],
    shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let data = tokio::fs::read(path).await?;
    info!(?path, bytes = data.len(), "replaying mb1 source");
    let mut cur = Cursor::new(&data[..]);
    let mut reader = Mb1StreamReader::new();
    let mut records = 0u64;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match reader.read_frame(&mut cur) {
            Ok(_) => {
                records += 1;
                let bytes = Bytes::copy_from_slice(reader.frame().as_bytes());
                for tx in feeds {
                    let _ = tx.send(bytes.clone()).await;
                }
            }
            Err(RelayError::Msg(MsgErr::Eof)) => break,
            Err(RelayError::Msg(MsgErr::Eparse)) => continue,
            Err(e) => return Err(e),
        }
        tokio::time::sleep(interval).await;
    }
    info!(records, lost = reader.lost_bytes(), "mb1 source done");
    Ok(())
}

fn mb1conv(
    ifile: &Path,
    ofile: Option<&Path>,
    byteswap: bool,
    verbose: u8,
) -> Result<(), RelayError> {
    init_tracing(if verbose > 0 { "debug" } else { "info" });

    let default_out = {
        let mut p = ifile.as_os_str().to_os_string();
        p.push(".mb71");
        PathBuf::from(p)
    };
    let out_path = ofile.map(Path::to_path_buf).unwrap_or(default_out);

    let input = std::fs::File::open(ifile)?;
    let mut src = BufReader::new(input);
    let mut out = std::io::BufWriter::new(std::fs::File::create(&out_path)?);

    let mut reader = Mb1StreamReader::new();
    let mut records = 0u64;
    let mut input_bytes = 0u64;
    let mut output_bytes = 0u64;
    let mut errors = 0u64;

    loop {
        match reader.read_frame(&mut src) {
            Ok(n) => {
                input_bytes += n as u64;
                let mut mb71 = Mb71Frame::from_mb1(reader.frame());
                if verbose > 1 {
                    eprintln!("{}", mb71.show(verbose > 2, 3));
                }
                if byteswap && reader.frame().nbeams() > 0 {
                    mb71.byteswap()?;
                }
                let bytes = mb71.as_bytes();
                out.write_all(bytes)?;
                output_bytes += bytes.len() as u64;
                records += 1;
            }
            Err(RelayError::Msg(MsgErr::Eof)) => break,
            Err(RelayError::Msg(MsgErr::Eparse)) | Err(RelayError::Msg(MsgErr::Echk)) => {
                errors += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    out.flush()?;

    info!(
        records,
        input_bytes,
        output_bytes,
        errors,
        lost = reader.lost_bytes(),
        out = %out_path.display(),
        "mb1conv done"
    );
    Ok(())
}

struct DisplayFlags {
    header: bool,
    beams: bool,
    hex: bool,
}

fn parse_format(format: &str) -> Result<DisplayFlags, RelayError> {
    let mut flags = DisplayFlags {
        header: false,
        beams: false,
        hex: false,
    };
    for c in format.chars() {
        match c {
            'h' | 'H' => flags.header = true,
            'b' | 'B' => flags.beams = true,
            'x' | 'X' => flags.hex = true,
            'a' | 'A' | '*' => {
                flags.header = true;
                flags.beams = true;
                flags.hex = true;
            }
            _ => {
                return Err(RelayError::Config(format!(
                    "invalid format letter '{c}' (expected H, B, X, A, or *)"
                )))
            }
        }
    }
    Ok(flags)
}

fn show_record(frame: &Mb1Frame, len: usize, seq: u64, flags: &DisplayFlags) {
    println!("record[{seq}] len[{len}]");
    if flags.header || flags.beams {
        print!("{}", frame.show(flags.beams, 3));
    }
    if flags.hex {
        print!(
            "{}",
            trn_relay_lib::frame::bytesutil::hex_show(frame.as_bytes(), 16, true, 3)
        );
    }
}

fn mb1cat_file(ifile: &Path, format: &str, cycles: u64) -> Result<(), RelayError> {
    init_tracing("info");
    let flags = parse_format(format)?;

    let input = std::fs::File::open(ifile)?;
    let mut src = BufReader::new(input);
    let mut reader = Mb1StreamReader::new();
    let mut records = 0u64;
    let mut errors = 0u64;

    while cycles == 0 || records < cycles {
        match reader.read_frame(&mut src) {
            Ok(n) => {
                records += 1;
                show_record(reader.frame(), n, records, &flags);
            }
            Err(RelayError::Msg(MsgErr::Eof)) => break,
            Err(RelayError::Msg(MsgErr::Eparse)) | Err(RelayError::Msg(MsgErr::Echk)) => {
                errors += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    info!(records, errors, lost = reader.lost_bytes(), "mb1cat done");
    if cycles > 0 && records < cycles {
        return Err(RelayError::Frame(format!(
            "requested {cycles} records, read {records}"
        )));
    }
    Ok(())
}

/// Subscribe to an MB1 publish port: announce with CON, refresh the
/// server-side heartbeat with HBT, and display each record received.
async fn mb1cat_net(
    host: &str,
    retries: u32,
    format: &str,
    cycles: u64,
) -> Result<(), RelayError> {
    init_tracing("info");
    let flags = parse_format(format)?;

    let addr = host.parse::<TargetAddr>()?.resolve().await?;
    let sock = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    sock.send_to(&text::message(text::TOK_CON, &[]), addr)
        .await?;
    info!(%addr, "subscribed");

    let mut buf = vec![0u8; MB1_MAX_FRAME_BYTES];
    let mut records = 0u64;
    let mut errors = 0u64;
    let mut timeouts = 0u32;
    let mut last_hbt = tokio::time::Instant::now();

    while cycles == 0 || records < cycles {
        if last_hbt.elapsed() >= Duration::from_secs(5) {
            last_hbt = tokio::time::Instant::now();
            let _ = sock
                .send_to(&text::message(text::TOK_HBT, &[]), addr)
                .await;
        }
        let recv = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf)).await;
        let (n, _src) = match recv {
            Err(_) => {
                timeouts += 1;
                if timeouts > retries {
                    info!(records, errors, "no data from server");
                    return Err(RelayError::Msg(MsgErr::Etmout));
                }
                continue;
            }
            Ok(res) => res?,
        };
        timeouts = 0;

        let msg = &buf[..n];
        let tok = text::token(msg);
        if tok == text::TOK_ACK || tok == text::TOK_NACK {
            continue;
        }
        match Mb1Frame::from_bytes(msg) {
            Ok(frame) => {
                records += 1;
                show_record(&frame, n, records, &flags);
            }
            Err(_) => errors += 1,
        }
    }

    info!(records, errors, "mb1cat done");
    Ok(())
}

fn mb12csv(ifile: &Path, ofile: Option<&Path>, nocsv: bool, rad: bool) -> Result<(), RelayError> {
    init_tracing("info");

    let input = std::fs::File::open(ifile)?;
    let mut src = BufReader::new(input);
    let mut out = match ofile {
        Some(p) => Some(std::io::BufWriter::new(std::fs::File::create(p)?)),
        None => None,
    };

    let mut reader = Mb1StreamReader::new();
    let mut records = 0u64;
    let mut errors = 0u64;
    let mut output_bytes = 0u64;

    loop {
        match reader.read_frame(&mut src) {
            Ok(_) => {
                let line = reader.frame().csv_record(rad);
                if !nocsv {
                    println!("{line}");
                }
                if let Some(w) = out.as_mut() {
                    writeln!(w, "{line}")?;
                    output_bytes += line.len() as u64 + 1;
                }
                records += 1;
            }
            Err(RelayError::Msg(MsgErr::Eof)) => break,
            Err(RelayError::Msg(MsgErr::Eparse)) | Err(RelayError::Msg(MsgErr::Echk)) => {
                errors += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    if let Some(mut w) = out {
        w.flush()?;
    }

    info!(
        records,
        errors,
        output_bytes,
        lost = reader.lost_bytes(),
        "mb12csv done"
    );
    Ok(())
}
