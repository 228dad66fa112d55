use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};

use crate::config::{FlowControl, SerialConfig};

const READ_BUFFER: usize = 4096;

pub fn open(config: &SerialConfig) -> Result<SerialStream> {
    let flow_control = match config.flow_control {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    };
    let builder = tokio_serial::new(config.path.as_str(), config.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(flow_control)
        .timeout(Duration::from_secs(1));
    let port = SerialStream::open(&builder)
        .with_context(|| format!("failed to open serial port {}", config.path))?;
    info!("opened serial port {} at {} baud", config.path, config.baud);
    Ok(port)
}

/// Shuttle bytes between the local stream and the session.
///
/// Everything read from `stream` is queued on `outbound`; every inbound
/// message is written back to `stream` as is. Returns once the stream hits
/// end of file or the outbound queue closes.
pub async fn run<F>(
    stream: F,
    outbound: mpsc::Sender<Vec<u8>>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<()>
where
    F: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buffer = [0u8; READ_BUFFER];
    let mut inbound_open = true;

    loop {
        tokio::select! {
            len = reader.read(&mut read_buffer) => {
                let len = len.context("error reading from local stream")?;
                if len == 0 {
                    info!("local stream closed");
                    return Ok(());
                }
                let mut buf = Vec::new();
                if let Err(e) = buf.try_reserve_exact(len) {
                    error!("dropping {len} bytes from local stream: {e}");
                    continue;
                }
                buf.extend_from_slice(&read_buffer[..len]);
                debug!("read {len} bytes from local stream");
                if outbound.send(buf).await.is_err() {
                    debug!("outbound queue closed");
                    return Ok(());
                }
            }
            msg = inbound.recv(), if inbound_open => {
                match msg {
                    Some(msg) => {
                        writer.write_all(&msg).await.context("error writing to local stream")?;
                        writer.flush().await.context("error writing to local stream")?;
                    }
                    None => inbound_open = false,
                }
            }
        }
    }
}
