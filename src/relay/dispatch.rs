//! Racing dispatcher: fans a prepared upstream request out into N
//! concurrent attempts, returns the first 200 and cancels the rest. A
//! five-second timer adds one best-effort escalation attempt when nothing
//! has won yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{RelayError, Result};

const ESCALATION_DELAY: Duration = Duration::from_secs(5);

enum AttemptOutcome {
    Response(reqwest::Response),
    Failed(RelayError),
    Canceled,
}

pub struct RacingClient {
    client: reqwest::Client,
    header_timeout: Duration,
    escalation_delay: Duration,
}

impl RacingClient {
    pub fn new(header_timeout: Duration, total_timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(32);
        if let Some(timeout) = total_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            header_timeout: header_timeout.max(Duration::from_secs(5)),
            escalation_delay: ESCALATION_DELAY,
        })
    }

    /// Shrinks the escalation timer; exists for tests that cannot wait five
    /// wall-clock seconds.
    pub fn with_escalation_delay(mut self, delay: Duration) -> Self {
        self.escalation_delay = delay;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// First 200 wins; non-200s queue as fallback; all-failed returns the
    /// first fallback or the last transport error. `fanout == 1` degenerates
    /// to a single attempt with no racing and no escalation.
    pub async fn dispatch(
        &self,
        request: reqwest::Request,
        fanout: u32,
    ) -> Result<reqwest::Response> {
        let n = fanout.max(1) as usize;
        if n == 1 {
            return self.single(request).await;
        }

        metrics::counter!("racing_dispatch_total").increment(1);
        let cancels: Arc<Mutex<HashMap<usize, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut attempts: JoinSet<(usize, AttemptOutcome)> = JoinSet::new();
        let mut next_index = 0usize;

        for _ in 0..n {
            self.launch(&request, &mut attempts, &cancels, &mut next_index)
                .await?;
        }

        let escalation = tokio::time::sleep(self.escalation_delay);
        tokio::pin!(escalation);
        let mut escalated = false;
        let mut fallback: Option<reqwest::Response> = None;
        let mut last_error: Option<RelayError> = None;

        loop {
            tokio::select! {
                joined = attempts.join_next() => {
                    let Some(joined) = joined else {
                        // every attempt is done and nobody returned 200
                        break;
                    };
                    match joined {
                        Err(join_error) => {
                            // a panicked attempt is a hard failure, recovered here
                            error!(error = %join_error, "racing attempt crashed");
                            last_error = Some(RelayError::internal(
                                "attempt_crashed",
                                join_error.to_string(),
                            ));
                        }
                        Ok((_, AttemptOutcome::Canceled)) => {}
                        Ok((index, AttemptOutcome::Failed(e))) => {
                            cancels.lock().await.remove(&index);
                            debug!(index, error = %e, "racing attempt failed");
                            last_error = Some(e);
                        }
                        Ok((index, AttemptOutcome::Response(resp))) => {
                            cancels.lock().await.remove(&index);
                            if resp.status() == StatusCode::OK {
                                // winner: cancel everything still in the table
                                for (_, token) in cancels.lock().await.drain() {
                                    token.cancel();
                                }
                                attempts.detach_all();
                                drop(fallback); // closes the queued loser body
                                metrics::counter!("racing_wins_total").increment(1);
                                return Ok(resp);
                            }
                            if fallback.is_none() {
                                fallback = Some(resp);
                            }
                            // later non-200s are dropped on the spot
                        }
                    }
                }
                _ = &mut escalation, if !escalated => {
                    escalated = true;
                    metrics::counter!("racing_escalations_total").increment(1);
                    debug!("no winner after escalation delay, launching one extra attempt");
                    if let Err(e) =
                        self.launch(&request, &mut attempts, &cancels, &mut next_index).await
                    {
                        last_error = Some(e);
                    }
                }
            }
        }

        match fallback {
            Some(resp) => Ok(resp),
            None => Err(last_error.unwrap_or_else(|| {
                RelayError::internal("do_request_failed", "no attempt produced a response")
            })),
        }
    }

    async fn single(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        match tokio::time::timeout(self.header_timeout, self.client.execute(request)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(RelayError::Transport(e)),
            Err(_) => Err(RelayError::internal(
                "do_request_failed",
                "upstream response headers timed out",
            )),
        }
    }

    async fn launch(
        &self,
        request: &reqwest::Request,
        attempts: &mut JoinSet<(usize, AttemptOutcome)>,
        cancels: &Arc<Mutex<HashMap<usize, CancellationToken>>>,
        next_index: &mut usize,
    ) -> Result<()> {
        // bodies are buffered bytes, so every attempt gets a fresh clone
        let attempt_request = request.try_clone().ok_or_else(|| {
            RelayError::internal("clone_request_failed", "request body is not replayable")
        })?;
        let index = *next_index;
        *next_index += 1;

        let token = CancellationToken::new();
        cancels.lock().await.insert(index, token.clone());
        metrics::counter!("racing_attempts_total").increment(1);

        let client = self.client.clone();
        let header_timeout = self.header_timeout;
        attempts.spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => AttemptOutcome::Canceled,
                result = tokio::time::timeout(header_timeout, client.execute(attempt_request)) => {
                    match result {
                        Ok(Ok(resp)) => AttemptOutcome::Response(resp),
                        Ok(Err(e)) => AttemptOutcome::Failed(RelayError::Transport(e)),
                        Err(_) => AttemptOutcome::Failed(RelayError::internal(
                            "do_request_failed",
                            "upstream response headers timed out",
                        )),
                    }
                }
            };
            (index, outcome)
        });
        Ok(())
    }
}
