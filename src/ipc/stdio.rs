//! JSON-lines bridge between the event bus and a host process
//!
//! Each inbound line is an [`IpcMessage`] for an inbound channel and is
//! forwarded to the bus. Every event on an outbound channel is written back as
//! one line.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{Channel, Ipc, IpcMessage, Subscription};
use crate::Result;

/// Stdio bridge for a host process
///
/// Outbound channels are subscribed on construction, so events emitted
/// before [`StdioBridge::run`] starts are queued rather than lost.
pub struct StdioBridge {
    ipc: Arc<dyn Ipc>,
    outbound: mpsc::UnboundedReceiver<IpcMessage>,
    _subscriptions: Vec<Subscription>,
}

impl StdioBridge {
    /// Bridge for `ipc`
    pub fn new(ipc: Arc<dyn Ipc>) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel::<IpcMessage>();
        let subscriptions = Channel::OUTBOUND
            .into_iter()
            .map(|channel| {
                let tx = tx.clone();
                ipc.on(
                    channel,
                    Arc::new(move |payload: &Value| {
                        let _ = tx.send(IpcMessage {
                            channel,
                            payload: payload.clone(),
                        });
                    }),
                )
            })
            .collect();

        Self {
            ipc,
            outbound,
            _subscriptions: subscriptions,
        }
    }

    /// Pump events until `reader` reaches EOF or shutdown is signalled
    ///
    /// # Errors
    ///
    /// Returns an error if reading input or writing output fails.
    pub async fn run<R, W>(mut self, reader: R, mut writer: W, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        info!("IPC bridge started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("IPC bridge shutting down");
                    break;
                }
                Some(message) = self.outbound.recv() => {
                    Self::write_message(&mut writer, &message).await?;
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => self.handle_line(&line),
                        None => {
                            info!("IPC input closed");
                            break;
                        }
                    }
                }
            }
        }

        // Events emitted before shutdown still reach the host
        while let Ok(message) = self.outbound.try_recv() {
            Self::write_message(&mut writer, &message).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<IpcMessage>(line) {
            Ok(message) if message.channel.is_outbound() => {
                warn!(channel = %message.channel, "Ignoring inbound message on outbound channel");
            }
            Ok(message) => {
                debug!(channel = %message.channel, "IPC inbound");
                self.ipc.send(message.channel, message.payload);
            }
            Err(e) => warn!(error = %e, "Invalid IPC message"),
        }
    }

    async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &IpcMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Listener, LocalIpc};
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, BufReader, duplex};

    #[tokio::test]
    async fn test_inbound_lines_reach_listeners() {
        let ipc = LocalIpc::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |payload: &Value| s.lock().push(payload.clone()));
        let _sub = ipc.on(Channel::ConfigUpdated, listener);

        let input = concat!(
            "{\"channel\":\"config-updated\",\"payload\":{\"systemNotification\":true}}\n",
            "garbage\n",
            "\n",
            "{\"channel\":\"todo-reminder\"}\n",
        );
        let (_tx, shutdown) = broadcast::channel(1);
        StdioBridge::new(Arc::new(ipc.clone()))
            .run(BufReader::new(input.as_bytes()), tokio::io::sink(), shutdown)
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![json!({"systemNotification": true})]);
    }

    #[tokio::test]
    async fn test_outbound_events_written_as_lines() {
        let ipc = LocalIpc::new();
        let (out_writer, mut out_reader) = duplex(4096);
        let (in_writer, in_reader) = duplex(64);
        let (shutdown_tx, shutdown) = broadcast::channel(1);

        let bridge = StdioBridge::new(Arc::new(ipc.clone()));
        let handle = tokio::spawn(bridge.run(BufReader::new(in_reader), out_writer, shutdown));

        ipc.send(Channel::TodoReminder, Value::Null);
        ipc.send(
            Channel::ShowNotification,
            json!({"title": "⏰ Todo reminder", "content": "Call Bob"}),
        );
        ipc.send(Channel::TodoUpdated, Value::Null);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        drop(in_writer);

        let mut output = String::new();
        out_reader.read_to_string(&mut output).await.unwrap();
        let lines: Vec<Value> = output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(
            lines,
            vec![
                json!({"channel": "todo-reminder"}),
                json!({"channel": "show-notification", "payload": {"title": "⏰ Todo reminder", "content": "Call Bob"}}),
            ]
        );
        assert_eq!(ipc.listener_count(Channel::TodoReminder), 0);
    }
}
