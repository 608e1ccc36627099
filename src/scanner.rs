// Scan input: a cancellable subscription that forwards raw scans, one per
// physical event, in arrival order to a single consumer.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SCAN_CHANNEL_CAPACITY: usize = 64;

/// A device producing raw scan strings
#[async_trait]
pub trait ScanSource: Send + 'static {
    /// Next raw scan, or `None` once the device is gone
    async fn next_scan(&mut self) -> std::io::Result<Option<String>>;
}

/// Newline-terminated scans from a keyboard-wedge scanner, a tty device
/// file, or stdin
///
/// Lines are read as bytes and decoded lossily: a scanner that emits FNC1 or
/// other non-UTF-8 bytes still yields a scan, which the codec then classifies.
pub struct LineScanSource<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R> LineScanSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
        }
    }
}

#[async_trait]
impl<R> ScanSource for LineScanSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_scan(&mut self) -> std::io::Result<Option<String>> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(None);
            }
            let decoded = String::from_utf8_lossy(&self.line);
            // Only the terminator goes; the payload may carry GS bytes
            let scan = decoded.trim_end_matches(['\r', '\n']);
            if !scan.is_empty() {
                return Ok(Some(scan.to_string()));
            }
        }
    }
}

/// Handle to a running scan reader. Dropping it stops the reader too.
pub struct ScanSubscription {
    stop: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

impl ScanSubscription {
    pub fn is_active(&self) -> bool {
        self.reader.as_ref().is_some_and(|reader| !reader.is_finished())
    }

    /// Stop the reader and wait for it to exit
    pub async fn unsubscribe(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                warn!(error = %e, "Scan reader ended abnormally");
            }
        }
        debug!("Scan subscription cancelled");
    }
}

impl Drop for ScanSubscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Start forwarding scans from `source`. Scans arrive on the returned
/// receiver in device order; the channel closes when the source ends or the
/// subscription is cancelled.
pub fn subscribe<S: ScanSource>(mut source: S) -> (ScanSubscription, mpsc::Receiver<String>) {
    let (sender, receiver) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
    let (stop, mut stopped) = oneshot::channel::<()>();

    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = &mut stopped => break,

                scan = source.next_scan() => match scan {
                    Ok(Some(raw)) => {
                        if sender.send(raw).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Scan source closed");
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        warn!(error = %e, "Dropping unreadable scan");
                    }
                    Err(e) => {
                        warn!(error = %e, "Scan source failed");
                        break;
                    }
                },
            }
        }
    });

    (
        ScanSubscription {
            stop: Some(stop),
            reader: Some(reader),
        },
        receiver,
    )
}
