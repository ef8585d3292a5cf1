//! Ledger transaction submission with ordered status reporting.
//!
//! Every submission gets a [`SubmissionId`] and runs on its own task. Raw
//! statuses from the transport pass through a [`StatusSequencer`], so the
//! consumer sees finality increase monotonically and exactly one terminal
//! status per submission. A transport that stays silent past the submission
//! timeout is dropped and the submission reported failed.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapters::LedgerSubmitter;
use crate::domain::{OperationCall, SubmissionId, SubmissionStatus};

/// Raw statuses buffered between the transport and the sequencer
const STATUS_BUFFER: usize = 16;

const DEFAULT_SUBMISSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Status report for one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionUpdate {
    pub id: SubmissionId,
    /// Rendered call, e.g. `kidotLoan.lend(3, 2000)`
    pub call: String,
    pub status: SubmissionStatus,
}

/// Filters a raw status sequence down to a well-formed one
#[derive(Debug, Default)]
pub struct StatusSequencer {
    last_rank: Option<u8>,
    terminated: bool,
}

impl StatusSequencer {
    /// Returns true if `status` should be reported
    pub fn accept(&mut self, status: &SubmissionStatus) -> bool {
        if self.terminated {
            return false;
        }
        let rank = status.finality_rank();
        if matches!(self.last_rank, Some(last) if rank <= last) {
            return false;
        }
        self.last_rank = Some(rank);
        self.terminated = status.is_terminal();
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

pub struct TransactionGateway {
    submitter: Arc<dyn LedgerSubmitter>,
    dry_run: bool,
    submission_timeout: Duration,
}

impl TransactionGateway {
    pub fn new(submitter: Arc<dyn LedgerSubmitter>, dry_run: bool) -> Self {
        Self {
            submitter,
            dry_run,
            submission_timeout: DEFAULT_SUBMISSION_TIMEOUT,
        }
    }

    pub fn with_submission_timeout(mut self, submission_timeout: Duration) -> Self {
        self.submission_timeout = submission_timeout;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Submit `call` and report its progress into `on_status`.
    ///
    /// Returns immediately. If `on_status` is closed by the time a status is
    /// ready, the status is discarded.
    pub fn submit(
        &self,
        call: OperationCall,
        on_status: mpsc::Sender<SubmissionUpdate>,
    ) -> SubmissionId {
        let id = SubmissionId::new();
        let submitter = self.submitter.clone();
        let dry_run = self.dry_run;
        let submission_timeout = self.submission_timeout;

        tokio::spawn(async move {
            let rendered = call.to_string();
            let (raw_tx, raw_rx) = mpsc::channel(STATUS_BUFFER);

            let transport = async move {
                if dry_run {
                    info!(%id, call = %call, "DRY RUN: would submit ledger call");
                    let _ = raw_tx.send(SubmissionStatus::Pending).await;
                    let _ = raw_tx.send(SubmissionStatus::Finalized).await;
                    Ok(())
                } else {
                    submitter.send(&call, raw_tx).await
                }
            };

            let report = |status: SubmissionStatus| {
                let update = SubmissionUpdate {
                    id,
                    call: rendered.clone(),
                    status,
                };
                let on_status = on_status.clone();
                async move {
                    if on_status.send(update).await.is_err() {
                        debug!(%id, "status consumer gone, discarding submission status");
                    }
                }
            };

            let mut sequencer = StatusSequencer::default();
            let relay = async {
                // Owned here so the transport's sends fail once we stop listening
                let mut raw_rx = raw_rx;
                while let Some(status) = raw_rx.recv().await {
                    if sequencer.accept(&status) {
                        report(status).await;
                        if sequencer.is_terminated() {
                            break;
                        }
                    } else {
                        debug!(%id, %status, "dropping out-of-order submission status");
                    }
                }
            };

            let outcome = timeout(submission_timeout, async {
                let (outcome, ()) = tokio::join!(transport, relay);
                outcome
            })
            .await;

            if !sequencer.is_terminated() {
                let reason = match outcome {
                    Err(_) => format!(
                        "timed out after {} ms without a terminal status",
                        submission_timeout.as_millis()
                    ),
                    Ok(Err(e)) => e.to_string(),
                    Ok(Ok(())) => "transport ended without a terminal status".to_string(),
                };
                warn!(%id, call = %rendered, %reason, "ledger submission failed");
                report(SubmissionStatus::Failed(reason)).await;
            } else if let Ok(Err(e)) = outcome {
                debug!(%id, "transport error after terminal status: {}", e);
            }
        });

        id
    }
}
