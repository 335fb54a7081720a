//! Concurrent resolution across several upstreams.
//!
//! The same query goes to every client at once. The first NOERROR answer
//! wins immediately. A decoded answer with any other response code is kept
//! as a fallback (the first one only) while the race waits for something
//! better, and transport errors are only reported when nothing else arrived.

use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::dns::DnsResolver;
use crate::error::{Error, Result};

/// Hard ceiling for one race.
pub const DEFAULT_RACE_TIMEOUT: Duration = Duration::from_secs(5);

/// The answer a race settled on.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub answer: Message,
    /// Index of the answering client in the slice given to the race.
    pub winner: usize,
    /// Time from the start of the race until the answer was chosen.
    pub elapsed: Duration,
}

/// Races one query across many upstream clients.
#[derive(Debug, Clone, Copy)]
pub struct RaceOrchestrator {
    timeout: Duration,
}

impl Default for RaceOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_RACE_TIMEOUT)
    }
}

impl RaceOrchestrator {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Race `query` across `clients` and return the chosen answer.
    pub async fn race_resolve<R: DnsResolver>(
        &self,
        cancel: &CancellationToken,
        query: &Message,
        clients: &[R],
    ) -> Result<Message> {
        self.race(cancel, query, clients)
            .await
            .map(|outcome| outcome.answer)
    }

    /// Race `query` across `clients`, reporting which client answered.
    ///
    /// Every attempt gets its own copy of the query. All attempts still in
    /// flight are told to stop as soon as this returns, whatever the reason;
    /// they stop at their next suspension point.
    ///
    /// # Errors
    ///
    /// - [`Error::NoUpstreams`] if `clients` is empty
    /// - [`Error::Cancelled`] if `cancel` fires first
    /// - [`Error::RaceTimeout`] if the ceiling passes with no fallback answer
    /// - [`Error::AllUpstreamsFailed`] with the last error if every attempt failed
    #[instrument(skip_all, fields(domain, upstreams = clients.len()))]
    pub async fn race<R: DnsResolver>(
        &self,
        cancel: &CancellationToken,
        query: &Message,
        clients: &[R],
    ) -> Result<RaceOutcome> {
        if clients.is_empty() {
            return Err(Error::NoUpstreams);
        }

        if let Some(q) = query.queries().first() {
            tracing::Span::current().record("domain", q.name().to_string());
        }

        let start = Instant::now();
        let race_token = cancel.child_token();
        let _stop_attempts = race_token.clone().drop_guard();

        let (tx, mut rx) = mpsc::channel::<(usize, Result<Message>)>(clients.len());
        for (index, client) in clients.iter().enumerate() {
            let client = client.clone();
            let query = query.clone();
            let tx = tx.clone();
            let token = race_token.clone();

            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    result = client.resolve(&query) => result,
                };
                // Capacity equals the number of attempts, so this never waits.
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut fallback: Option<(usize, Message)> = None;
        let mut last_error: Option<Error> = None;

        for _ in 0..clients.len() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    record_outcome("cancelled", start);
                    return Err(Error::Cancelled);
                }
                () = &mut deadline => {
                    return match fallback {
                        Some((winner, answer)) => {
                            warn!(upstream = winner, "race timed out, using fallback answer");
                            record_outcome("fallback", start);
                            Ok(RaceOutcome { answer, winner, elapsed: start.elapsed() })
                        }
                        None => {
                            warn!(timeout = ?self.timeout, "race timed out without an answer");
                            record_outcome("timeout", start);
                            Err(Error::RaceTimeout(self.timeout))
                        }
                    };
                }
                received = rx.recv() => match received {
                    Some((winner, Ok(answer))) if answer.response_code() == ResponseCode::NoError => {
                        debug!(upstream = winner, elapsed = ?start.elapsed(), "race won");
                        record_outcome("success", start);
                        return Ok(RaceOutcome { answer, winner, elapsed: start.elapsed() });
                    }
                    Some((index, Ok(answer))) => {
                        debug!(upstream = index, code = %answer.response_code(), "non-success answer");
                        if fallback.is_none() {
                            fallback = Some((index, answer));
                        }
                    }
                    Some((index, Err(err))) => {
                        debug!(upstream = index, error = %err, "upstream attempt failed");
                        last_error = Some(err);
                    }
                    None => break,
                },
            }
        }

        if let Some((winner, answer)) = fallback {
            record_outcome("fallback", start);
            return Ok(RaceOutcome {
                answer,
                winner,
                elapsed: start.elapsed(),
            });
        }

        record_outcome("failed", start);
        match last_error {
            Some(err) => Err(Error::AllUpstreamsFailed(Box::new(err))),
            None => Err(Error::NoResponse),
        }
    }
}

/// Race `query` across `clients` with the default five second ceiling.
pub async fn race_resolve<R: DnsResolver>(
    cancel: &CancellationToken,
    query: &Message,
    clients: &[R],
) -> Result<Message> {
    RaceOrchestrator::default()
        .race_resolve(cancel, query, clients)
        .await
}

fn record_outcome(outcome: &'static str, start: Instant) {
    metrics::counter!("dohrelay_race_total", "outcome" => outcome).increment(1);
    metrics::histogram!("dohrelay_race_duration_seconds").record(start.elapsed().as_secs_f64());
}
