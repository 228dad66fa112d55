use anyhow::{Context, Result};
use clap::{arg, value_parser, AppSettings, ArgAction, Command};
use log::debug;
use spp::{config::Config, event::Address};

mod bridge;
mod config;
mod scan;

pub struct CmdData {
    config: Config,
}

pub async fn run() -> Result<()> {
    let matches = Command::new("spp")
        .version("0.1")
        .about("Bridge a local serial port to a bluetooth LE serial port service")
        .arg(
            arg!(
            -v --verbose "Enable verbose output"
            )
            .action(ArgAction::SetTrue),
        )
        .arg(
            arg!(
            -c --config <CONFIG> "Load settings from a json config file"
            )
            .required(false),
        )
        .arg(
            arg!(
                -s --serial <PATH> "Set the serial port"
            )
            .required(false),
        )
        .arg(
            arg!(
                -b --baud <BAUD> "Set the baud rate for the serial port"
            )
            .required(false)
            .value_parser(value_parser!(u32)),
        )
        .arg(
            arg!(
                -t --target <ADDRESS> "Address of the peer to connect to"
            )
            .required(false)
            .value_parser(value_parser!(Address)),
        )
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(bridge::subcmd())
        .subcommand(scan::subcmd())
        .subcommand(config::subcmd())
        .get_matches();

    let verbose = *matches.get_one::<bool>("verbose").unwrap();
    env_logger::init_from_env(env_logger::Env::default().filter_or(
        env_logger::DEFAULT_FILTER_ENV,
        if verbose { "debug" } else { "info" },
    ));

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::load(path)
            .await
            .context("failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(path) = matches.get_one::<String>("serial") {
        config.serial.path = path.clone();
    }
    if let Some(baud) = matches.get_one::<u32>("baud") {
        config.serial.baud = *baud;
    }
    if let Some(target) = matches.get_one::<Address>("target") {
        config.target = *target;
    }
    debug!("configuration: {:?}", config);

    let mut data = CmdData { config };

    match matches.subcommand() {
        Some(("bridge", matches)) => bridge::cmd(&mut data, matches).await,
        Some(("scan", matches)) => scan::cmd(&mut data, matches).await,
        Some(("config", matches)) => config::cmd(&mut data, matches).await,
        _ => unreachable!(),
    }
}
