//! Long-running mode: newline-delimited JSON triggers in, one JSON report
//! per invocation out.
//!
//! Reports are written in completion order, not input order. On shutdown no
//! further lines are read, and every invocation already started is allowed
//! to finish and report.

use std::{io, sync::Arc};

use ferry_common::{Signal, internal};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Semaphore, broadcast, mpsc},
    task::JoinSet,
};

use crate::{
    PipelineError,
    pipeline::{Disposition, Pipeline, Report, Trigger},
};

/// Counts of reports written, by disposition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServeSummary {
    pub processed: usize,
    pub done: usize,
    pub retryable: usize,
    pub dropped: usize,
    pub configuration_errors: usize,
}

impl ServeSummary {
    const fn record(&mut self, disposition: Disposition) {
        self.processed += 1;
        match disposition {
            Disposition::Done => self.done += 1,
            Disposition::Retryable => self.retryable += 1,
            Disposition::Dropped => self.dropped += 1,
            Disposition::ConfigurationError => self.configuration_errors += 1,
        }
    }
}

async fn write_reports<W>(
    mut output: W,
    mut reports: mpsc::Receiver<Report>,
) -> io::Result<(ServeSummary, W)>
where
    W: AsyncWrite + Unpin,
{
    let mut summary = ServeSummary::default();

    while let Some(report) = reports.recv().await {
        summary.record(report.disposition);

        let mut line = serde_json::to_vec(&report).map_err(io::Error::other)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }

    Ok((summary, output))
}

/// Process triggers from `input` until it ends or a shutdown signal arrives.
///
/// At most `max_concurrency` invocations run at once; reading pauses while
/// the limit is reached. Malformed lines are reported as dropped and do not
/// stop the loop.
///
/// # Errors
///
/// Reading `input` or writing `output` failed.
pub async fn serve<R, W>(
    pipeline: Arc<Pipeline>,
    input: R,
    output: W,
    max_concurrency: usize,
    mut signals: broadcast::Receiver<Signal>,
) -> io::Result<(ServeSummary, W)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let limit = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let (reports, receiver) = mpsc::channel(max_concurrency.max(1) * 2);
    let writer = tokio::spawn(write_reports(output, receiver));

    let mut lines = BufReader::new(input).lines();
    let mut tasks = JoinSet::new();

    internal!(level = INFO, max_concurrency, "Serving triggers");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    internal!(level = INFO, "Input closed");
                    break;
                };

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let trigger = match serde_json::from_str::<Trigger>(line) {
                    Ok(trigger) => trigger,
                    Err(err) => {
                        let report = Report::rejected(line, &PipelineError::InvalidTrigger(err.to_string()));
                        if reports.send(report).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let permit = Arc::clone(&limit)
                    .acquire_owned()
                    .await
                    .map_err(io::Error::other)?;
                let pipeline = Arc::clone(&pipeline);
                let reports = reports.clone();

                tasks.spawn(async move {
                    let report = pipeline.process(&trigger).await;
                    drop(permit);
                    let _ = reports.send(report).await;
                });
            }

            signal = signals.recv() => match signal {
                Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                    internal!(level = INFO, in_flight = tasks.len(), "Shutdown requested, draining");
                    break;
                }
                // The address map watcher handles reloads.
                Ok(Signal::Reload) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            },

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    internal!(level = ERROR, error = %err, "Invocation task failed");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            internal!(level = ERROR, error = %err, "Invocation task failed");
        }
    }

    drop(reports);
    let (summary, output) = writer.await.map_err(io::Error::other)??;

    internal!(
        level = INFO,
        processed = summary.processed,
        done = summary.done,
        retryable = summary.retryable,
        dropped = summary.dropped,
        configuration_errors = summary.configuration_errors,
        "Serve finished"
    );

    Ok((summary, output))
}
