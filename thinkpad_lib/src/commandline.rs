//! Module to factor out commandline interaction

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap_num::maybe_hex;
use log::LevelFilter;

use crate::built_info;
use crate::config;
use crate::thinkpad_ec::protocol::ROW_LEN;
use crate::thinkpad_ec::simulated::SimulatedEc;
use crate::thinkpad_ec::{EcError, EcOptions, EcResult, EcRow, RegisterPort, ThinkpadEc};
use crate::util;

/// Pause between rounds of --poll, like a 50Hz sensor poll
const POLL_INTERVAL: Duration = Duration::from_millis(20);

type Ec = ThinkpadEc<Box<dyn RegisterPort + Send>>;

/// Talk to the embedded controller of ThinkPad laptops
#[derive(Parser, Debug)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,

    /// Show tool version information (Add -v for more details)
    #[arg(long)]
    version: bool,

    /// Check that this is a ThinkPad and that the EC follows protocol
    #[arg(long)]
    probe: bool,

    /// Request row, up to 16 comma separated bytes (e.g. 0x11,0,0x01)
    #[arg(long, value_delimiter = ',', value_parser = maybe_hex::<u8>)]
    row: Vec<u8>,

    /// Which bytes of the request row to send. arg0 is required.
    #[arg(long, value_parser = maybe_hex::<u16>, default_value = "0xFFFF")]
    mask: u16,

    /// Which bytes of the reply to read. First and last are always read.
    #[arg(long, value_parser = maybe_hex::<u16>, default_value = "0xFFFF")]
    read_mask: u16,

    /// Prefetch the row first, then read it without retrying the request
    #[arg(long)]
    prefetch: bool,

    /// Read the row N times without ever blocking, like a sensor poll
    #[arg(long, value_name = "N")]
    poll: Option<u32>,

    /// Use a simulated EC instead of the hardware
    #[arg(long)]
    simulate: bool,

    /// Talk to the EC even if SMBIOS says this isn't a ThinkPad
    #[arg(long)]
    force: bool,

    /// Path to the config file (Default: thinkpad_ec.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log anomalies even if they're expected during normal operation
    #[arg(long)]
    debug: bool,
}

pub fn parse(args: &[String]) -> Cli {
    Cli::parse_from(args)
}

fn init_logger(args: &Cli) {
    let mut level = args.verbosity.log_level_filter();
    if args.debug && level < LevelFilter::Debug {
        level = LevelFilter::Debug;
    }
    let _ = env_logger::Builder::new().filter_level(level).try_init();
}

fn print_tool_version(verbose: bool) {
    println!("{} {}", built_info::PKG_NAME, built_info::PKG_VERSION);
    if verbose {
        println!("  Target:         {}", built_info::TARGET);
        println!("  Profile:        {}", built_info::PROFILE);
        println!("  Built:          {}", built_info::BUILT_TIME_UTC);
        if let Some(hash) = built_info::GIT_COMMIT_HASH {
            println!("  Git commit:     {}", hash);
        }
    }
}

fn request_row(args: &Cli) -> EcResult<EcRow> {
    if args.row.is_empty() {
        return Err(EcError::DeviceError("No request --row given".to_string()));
    }
    if args.row.len() > ROW_LEN {
        return Err(EcError::DeviceError(format!(
            "Request row has {} bytes, at most {} allowed",
            args.row.len(),
            ROW_LEN
        )));
    }
    let mut val = [0; ROW_LEN];
    val[..args.row.len()].copy_from_slice(&args.row);
    let row = EcRow::new(args.mask, val);
    if !row.is_valid_request() {
        return Err(EcError::InvalidArgument { mask: row.mask });
    }
    Ok(row)
}

fn print_row(row: &EcRow) {
    print!("{:#06X}: ", row.mask);
    util::print_buffer(&row.val);
}

fn open_port(args: &Cli, base_port: u16) -> EcResult<Box<dyn RegisterPort + Send>> {
    if args.simulate {
        info!("Using simulated EC");
        return Ok(Box::new(SimulatedEc::new()));
    }

    #[cfg(feature = "smbios")]
    if !crate::smbios::is_thinkpad() {
        if args.force {
            warn!("Not a ThinkPad, continuing anyway");
        } else {
            return Err(EcError::DeviceError(
                "This is not a ThinkPad. Use --force to try anyway.".to_string(),
            ));
        }
    }

    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        any(feature = "linux_pio", feature = "freebsd_pio")
    ))]
    {
        let port = crate::thinkpad_ec::portio::PortIo::claim(base_port)?;
        Ok(Box::new(port))
    }
    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        any(feature = "linux_pio", feature = "freebsd_pio")
    )))]
    {
        let _ = base_port;
        Err(EcError::DeviceError(
            "Built without port I/O support".to_string(),
        ))
    }
}

fn read_once(ec: &Ec, args: &Cli, request: &EcRow) -> EcResult<()> {
    let data = if args.prefetch {
        let mut data = EcRow::response(args.read_mask);
        let mut guard = ec.lock();
        guard.prefetch_row(request)?;
        let (ret, attempts) = ec
            .options()
            .timing
            .row_retry
            .run(|| guard.try_read_row(request, &mut data));
        debug!("try_read_row took {} attempts", attempts);
        ret?;
        guard.unlock();
        data
    } else {
        ec.locked_read_row(request, args.read_mask)?
    };
    print_row(&data);
    Ok(())
}

/// Never waits for the EC. Whatever isn't ready now is picked up next round.
fn poll(ec: &Ec, args: &Cli, request: &EcRow, rounds: u32) -> EcResult<()> {
    for round in 0..rounds {
        match ec.try_lock() {
            Ok(mut guard) => {
                let mut data = EcRow::response(args.read_mask);
                match guard.try_read_row(request, &mut data) {
                    Ok(()) => {
                        print!("{:>4} ", round);
                        print_row(&data);
                    }
                    Err(err) if err.is_transient() => println!("{:>4} {}", round, err),
                    Err(err) => return Err(err),
                }
                match guard.prefetch_row(request) {
                    Ok(()) => {}
                    Err(err) if err.is_transient() => debug!("prefetch: {}", err),
                    Err(err) => return Err(err),
                }
                guard.unlock();
            }
            Err(err) => println!("{:>4} {}", round, err),
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

fn run(args: &Cli, base_port: u16, options: EcOptions) -> EcResult<()> {
    let port = open_port(args, base_port)?;
    let ec = ThinkpadEc::attach(port, options)?;
    if args.probe {
        println!("EC probe succeeded");
    }

    if args.row.is_empty() && (args.prefetch || args.poll.is_some()) {
        return Err(EcError::DeviceError("No request --row given".to_string()));
    }
    if args.row.is_empty() {
        return Ok(());
    }
    let request = request_row(args)?;
    match args.poll {
        Some(rounds) => poll(&ec, args, &request, rounds),
        None => read_once(&ec, args, &request),
    }
}

pub fn run_with_args(args: &Cli) -> i32 {
    init_logger(args);

    if args.version {
        print_tool_version(args.verbosity.log_level_filter() > LevelFilter::Error);
        return 0;
    }

    let settings = match config::load_config(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            error!("{}", err);
            return 1;
        }
    };
    let mut options = settings.options;
    options.debug |= args.debug;

    match run(args, settings.base_port, options) {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let args: Vec<String> = std::iter::once("thinkpad_tool")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn parses_hex_row_and_masks() {
        let args = cli(&["--row", "0x11,0,0x01", "--mask", "0x8001", "--read-mask", "0"]);
        assert_eq!(args.row, vec![0x11, 0x00, 0x01]);
        assert_eq!(args.mask, 0x8001);
        assert_eq!(args.read_mask, 0);
        let row = request_row(&args).unwrap();
        assert_eq!(row.arg0(), 0x11);
        assert_eq!(row.val[2], 0x01);
    }

    #[test]
    fn rejects_request_without_arg0() {
        let args = cli(&["--row", "0x11", "--mask", "0x8000"]);
        assert_eq!(
            request_row(&args),
            Err(EcError::InvalidArgument { mask: 0x8000 })
        );
    }

    #[test]
    fn rejects_overlong_row() {
        let long = vec!["1"; ROW_LEN + 1].join(",");
        let args = cli(&["--row", &long]);
        assert!(request_row(&args).is_err());
    }

    #[test]
    fn simulated_read_and_poll() {
        let args = cli(&["--simulate", "--row", "0x11,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0x01"]);
        assert_eq!(run(&args, 0x1600, EcOptions::default()), Ok(()));

        let args = cli(&["--simulate", "--prefetch", "--row", "0x11"]);
        assert_eq!(run(&args, 0x1600, EcOptions::default()), Ok(()));

        let args = cli(&["--simulate", "--poll", "3", "--row", "0x11"]);
        assert_eq!(run(&args, 0x1600, EcOptions::default()), Ok(()));
    }

    #[test]
    fn poll_without_row_fails() {
        let args = cli(&["--simulate", "--poll", "3"]);
        assert!(run(&args, 0x1600, EcOptions::default()).is_err());
    }
}
