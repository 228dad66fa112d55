use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{ArgMatches, Command};
use log::{error, info};
use spp::{
    bluetooth::BluezStack, chunker, event::StackEvent, registrar, serial, session::Session,
    stack::RadioStack,
};
use tokio::{sync::mpsc, time::timeout};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn subcmd<'help>() -> Command<'help> {
    Command::new("bridge").about("bridge the serial port to the peer's serial port service")
}

pub async fn cmd(data: &mut super::CmdData, _m: &ArgMatches) -> Result<()> {
    let config = data.config.clone();

    let (events_send, mut events) = mpsc::unbounded_channel();
    let stack: Arc<dyn RadioStack> = Arc::new(
        BluezStack::new(events_send)
            .await
            .context("failed to set up bluetooth")?,
    );
    let port = serial::open(&config.serial)?;

    let (inbound_send, inbound_recv) = mpsc::unbounded_channel();
    let (outbound_send, outbound_recv) = mpsc::channel(config.outbound_queue.max(1));
    let (mut session, handles) = Session::new(config.clone(), stack.clone(), inbound_send);

    tokio::spawn(registrar::run(
        handles.registrations,
        stack.clone(),
        handles.link.clone(),
        config.registration_pacing(),
    ));
    tokio::spawn(chunker::run(
        outbound_recv,
        stack.clone(),
        handles.link,
        config.write_type,
    ));
    let mut bridge = tokio::spawn(serial::run(port, outbound_send, inbound_recv));

    session.start().context("failed to start scanning")?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => session.handle(event),
                None => bail!("bluetooth stack went away"),
            },
            res = &mut bridge => {
                res.context("serial bridge failed")??;
                info!("serial port closed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if session.connection().is_some() {
        if let Err(e) = session.disconnect() {
            error!("error disconnecting from peer: {e}");
        }
        let disconnected = async {
            while let Some(event) = events.recv().await {
                if let StackEvent::Disconnected { .. } = event {
                    break;
                }
            }
        };
        if timeout(DISCONNECT_TIMEOUT, disconnected).await.is_err() {
            error!("peer did not confirm disconnect");
        }
    }
    Ok(())
}
