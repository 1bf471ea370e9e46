//! Trailing-edge debounce for bursty bus telemetry
//!
//! Every [`Debouncer::touch`] restarts the quiet window; the flush callback
//! runs once the window passes with no further touches.
//! [`Debouncer::flush_now`] bypasses the window.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Touch,
    FlushNow,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Debouncer {
    /// Spawn the debounce task; it stops on cancellation or when every
    /// `Debouncer` handle is dropped.
    pub fn spawn<F>(
        window: Duration,
        flush: F,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>)
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(window, rx, flush, cancel));
        (Self { tx }, task)
    }

    /// Record activity and restart the quiet window
    pub fn touch(&self) {
        let _ = self.tx.send(Signal::Touch);
    }

    /// Flush immediately and cancel any pending window
    pub fn flush_now(&self) {
        let _ = self.tx.send(Signal::FlushNow);
    }
}

async fn run<F>(
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<Signal>,
    flush: F,
    cancel: CancellationToken,
) where
    F: Fn(),
{
    let mut deadline: Option<Instant> = None;

    loop {
        let pending_until = deadline;
        let quiet = async move {
            match pending_until {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = rx.recv() => match signal {
                Some(Signal::Touch) => deadline = Some(Instant::now() + window),
                Some(Signal::FlushNow) => {
                    trace!("Forced flush");
                    deadline = None;
                    flush();
                },
                None => break,
            },
            _ = quiet => {
                trace!("Quiet window elapsed, flushing");
                deadline = None;
                flush();
            },
        }
    }
}
