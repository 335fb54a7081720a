//! Per-query summary handed to a query-log collaborator.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, ResponseCode};
use serde::Serialize;

use crate::error::Error;
use crate::race::RaceOutcome;

/// Status recorded when no answer could be obtained.
pub const STATUS_ERROR: &str = "ERROR";

/// Summary of one resolved (or failed) query, serializable as one JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRecord {
    /// Milliseconds since the Unix epoch when the record was made.
    pub time: u64,
    pub domain: String,
    pub query_type: String,
    /// Label of the answering upstream, empty when none answered.
    pub upstream: String,
    /// Answer record data joined with `", "`.
    pub answer: String,
    pub duration_ms: u64,
    /// Response-code mnemonic such as `NOERROR`, or `ERROR`.
    pub status: String,
}

impl QueryRecord {
    /// Summarize a race that produced an answer.
    pub fn new(query: &Message, upstream: &str, outcome: &RaceOutcome) -> Self {
        let (domain, query_type) = question(query);
        let answer = outcome
            .answer
            .answers()
            .iter()
            .filter_map(|record| record.data().map(ToString::to_string))
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            time: now_millis(),
            domain,
            query_type,
            upstream: upstream.to_string(),
            answer,
            duration_ms: millis(outcome.elapsed),
            status: rcode_mnemonic(outcome.answer.response_code()),
        }
    }

    /// Summarize a query for which no answer could be obtained.
    pub fn failed(query: &Message, elapsed: Duration, error: &Error) -> Self {
        let (domain, query_type) = question(query);
        Self {
            time: now_millis(),
            domain,
            query_type,
            upstream: String::new(),
            answer: error.to_string(),
            duration_ms: millis(elapsed),
            status: STATUS_ERROR.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn question(query: &Message) -> (String, String) {
    query
        .queries()
        .first()
        .map(|q| {
            let name = q.name().to_utf8();
            let name = name.strip_suffix('.').unwrap_or(&name).to_string();
            (name, q.query_type().to_string())
        })
        .unwrap_or_default()
}

/// Conventional upper-case mnemonic for a response code.
pub fn rcode_mnemonic(code: ResponseCode) -> String {
    match code {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        ResponseCode::YXDomain => "YXDOMAIN".to_string(),
        ResponseCode::YXRRSet => "YXRRSET".to_string(),
        ResponseCode::NXRRSet => "NXRRSET".to_string(),
        ResponseCode::NotAuth => "NOTAUTH".to_string(),
        ResponseCode::NotZone => "NOTZONE".to_string(),
        ResponseCode::BADVERS => "BADVERS".to_string(),
        other => format!("RCODE{}", u16::from(other)),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or_default()
}
