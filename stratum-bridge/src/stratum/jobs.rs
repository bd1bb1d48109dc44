//! Job packet construction.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

// Miners whose firmware wants the whole job in a single parameter.
static BIG_JOB_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(".*BzMiner.*").unwrap());

/// Decide the job encoding from the client-reported software string.
/// Decided once, at a connection's first job.
pub fn uses_big_job(remote_app: &str) -> bool {
    BIG_JOB_REGEX.is_match(remote_app)
}

/// Build the parameter list of a `mining.notify` packet.
///
/// Standard encoding sends the header and timestamp as two parameters;
/// large-job encoding appends the timestamp to the header bytes and sends
/// one combined hex parameter.
pub fn build_job_params(
    job_id: u64,
    header: &[u8],
    timestamp: u64,
    big_job: bool,
) -> Vec<Value> {
    let mut params = vec![Value::String(job_id.to_string())];
    if big_job {
        let mut combined = Vec::with_capacity(header.len() + 8);
        combined.extend_from_slice(header);
        combined.extend_from_slice(&timestamp.to_le_bytes());
        params.push(Value::String(hex::encode(combined)));
    } else {
        params.push(Value::String(hex::encode(header)));
        params.push(json!(timestamp));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("BzMiner-v15", true; "bzminer")]
    #[test_case("GodMiner/2.0", false; "other asic")]
    #[test_case("", false; "empty")]
    #[test_case("prefix BzMiner suffix", true; "embedded")]
    fn big_job_negotiation(remote_app: &str, expected: bool) {
        assert_eq!(uses_big_job(remote_app), expected);
    }

    #[test]
    fn standard_params_split_header_and_timestamp() {
        let params = build_job_params(12, &[0xab, 0xcd], 99, false);
        assert_eq!(params.len(), 3);
        assert_eq!(params[0], json!("12"));
        assert_eq!(params[1], json!("abcd"));
        assert_eq!(params[2], json!(99));
    }

    #[test]
    fn big_job_params_combine_header_and_timestamp() {
        let params = build_job_params(12, &[0xab, 0xcd], 1, true);
        assert_eq!(params.len(), 2);
        // Little-endian timestamp appended to the header bytes.
        assert_eq!(params[1], json!("abcd0100000000000000"));
    }
}
