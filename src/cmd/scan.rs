use std::{collections::HashSet, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{arg, ArgAction, ArgMatches, Command};
use log::info;
use serde::Serialize;
use spp::{
    bluetooth::BluezStack,
    event::{Address, StackEvent},
    stack::RadioStack,
};
use tokio::sync::mpsc;

#[derive(Serialize)]
struct Seen<'a> {
    address: Address,
    name: Option<&'a str>,
    rssi: Option<i16>,
}

pub fn subcmd<'help>() -> Command<'help> {
    Command::new("scan")
        .about("print nearby devices, one json object per line")
        .arg(
            arg!( -a --all "print every advertisement, not just new devices")
                .action(ArgAction::SetTrue),
        )
}

pub async fn cmd(data: &mut super::CmdData, m: &ArgMatches) -> Result<()> {
    let all = *m.get_one::<bool>("all").unwrap();

    let (events_send, mut events) = mpsc::unbounded_channel();
    let stack = Arc::new(
        BluezStack::new(events_send)
            .await
            .context("failed to set up bluetooth")?,
    );
    stack
        .start_scan(&data.config.scan)
        .context("failed to start scan")?;
    info!("scanning, target is {}", data.config.target);

    let mut seen = HashSet::new();
    loop {
        tokio::select! {
            event = events.recv() => {
                let (peer, name, rssi) = match event {
                    Some(StackEvent::ScanResult { peer, name, rssi }) => (peer, name, rssi),
                    Some(_) => continue,
                    None => bail!("bluetooth stack went away"),
                };
                if !seen.insert(peer) && !all {
                    continue;
                }
                let entry = Seen { address: peer, name: name.as_deref(), rssi };
                println!("{}", serde_json::to_string(&entry)?);
                if peer == data.config.target {
                    info!("found target {peer}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    stack.stop_scan()?;
    Ok(())
}
