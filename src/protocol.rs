//! Line protocol adapter.
//!
//! One command per input line, one JSON object per output line:
//!
//! ```text
//! check <key>            evaluate a request for <key>
//! done <key> ok|fail     report the outcome of an admitted request
//! info <key>             current metadata, without consuming quota
//! reset <key>            forget <key>
//! reset-all              forget every key
//! ```
//!
//! Malformed lines get an `{"error": ...}` reply and the session continues.

use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::Result;
use crate::ratelimit::{Clock, LimiterStore, RateLimitInfo, RateLimiter};

/// Errors in a single protocol line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0} requires a key")]
    MissingKey(&'static str),

    #[error("outcome must be `ok` or `fail`, got `{0}`")]
    InvalidOutcome(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

/// A parsed protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Check(String),
    Done { key: String, succeeded: bool },
    Info(String),
    Reset(String),
    ResetAll,
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default();

        let command = match verb {
            "check" => Command::Check(required_key(&mut parts, "check")?),
            "info" => Command::Info(required_key(&mut parts, "info")?),
            "reset" => Command::Reset(required_key(&mut parts, "reset")?),
            "reset-all" => Command::ResetAll,
            "done" => {
                let key = required_key(&mut parts, "done")?;
                let succeeded = match parts.next() {
                    Some("ok") => true,
                    Some("fail") => false,
                    other => {
                        return Err(ProtocolError::InvalidOutcome(
                            other.unwrap_or_default().to_string(),
                        ))
                    }
                };
                Command::Done { key, succeeded }
            }
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        if let Some(extra) = parts.next() {
            return Err(ProtocolError::UnexpectedArgument(extra.to_string()));
        }
        Ok(command)
    }
}

fn required_key<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    verb: &'static str,
) -> std::result::Result<String, ProtocolError> {
    parts
        .next()
        .map(str::to_owned)
        .ok_or(ProtocolError::MissingKey(verb))
}

/// A reply line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Decision {
        key: String,
        allowed: bool,
        #[serde(flatten)]
        info: RateLimitInfo,
    },
    Outcome {
        key: String,
        refunded: bool,
    },
    Info {
        key: String,
        blocked: bool,
        #[serde(flatten)]
        info: RateLimitInfo,
    },
    Reset {
        reset: String,
    },
    ResetAll {
        reset_all: bool,
    },
    Error {
        error: String,
    },
}

/// Run one line against the limiter.
///
/// Returns `None` for blank lines.
pub fn execute<S: LimiterStore, C: Clock>(limiter: &RateLimiter<S, C>, line: &str) -> Option<Reply> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let command = match line.parse::<Command>() {
        Ok(command) => command,
        Err(e) => {
            warn!(line = %line, error = %e, "Rejected malformed command");
            return Some(Reply::Error {
                error: e.to_string(),
            });
        }
    };

    let reply = match command {
        Command::Check(key) => {
            let decision = limiter.evaluate(&key);
            Reply::Decision {
                key,
                allowed: decision.is_allowed(),
                info: decision.info,
            }
        }
        Command::Done { key, succeeded } => {
            let refunded = limiter.report_outcome(&key, succeeded);
            Reply::Outcome { key, refunded }
        }
        Command::Info(key) => Reply::Info {
            blocked: limiter.is_blocked(&key),
            info: limiter.info(&key),
            key,
        },
        Command::Reset(key) => {
            limiter.reset(&key);
            Reply::Reset { reset: key }
        }
        Command::ResetAll => {
            limiter.reset_all();
            Reply::ResetAll { reset_all: true }
        }
    };
    Some(reply)
}

/// Serve commands from `reader` until end of input, writing replies to `writer`.
///
/// Returns the number of commands answered.
pub async fn serve<S, C, R, W>(limiter: &RateLimiter<S, C>, reader: R, mut writer: W) -> Result<u64>
where
    S: LimiterStore,
    C: Clock,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut answered = 0;

    while let Some(line) = lines.next_line().await? {
        let Some(reply) = execute(limiter, &line) else {
            continue;
        };

        let mut encoded = serde_json::to_vec(&reply).map_err(std::io::Error::from)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        answered += 1;
    }

    debug!(answered = answered, "End of input");
    Ok(answered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, RateLimitConfig};
    use crate::ratelimit::{ManualClock, MemoryStore};
    use tokio::io::BufReader;

    fn create_test_limiter(config: RateLimitConfig) -> RateLimiter<MemoryStore, ManualClock> {
        RateLimiter::with_store(config, MemoryStore::new(), ManualClock::new(0)).unwrap()
    }

    fn parse_replies(output: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "check alice".parse::<Command>(),
            Ok(Command::Check("alice".to_string()))
        );
        assert_eq!(
            "  done bob fail ".parse::<Command>(),
            Ok(Command::Done {
                key: "bob".to_string(),
                succeeded: false
            })
        );
        assert_eq!("reset-all".parse::<Command>(), Ok(Command::ResetAll));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "check".parse::<Command>(),
            Err(ProtocolError::MissingKey("check"))
        );
        assert_eq!(
            "done bob maybe".parse::<Command>(),
            Err(ProtocolError::InvalidOutcome("maybe".to_string()))
        );
        assert_eq!(
            "check a b".parse::<Command>(),
            Err(ProtocolError::UnexpectedArgument("b".to_string()))
        );
        assert_eq!(
            "launch".parse::<Command>(),
            Err(ProtocolError::UnknownCommand("launch".to_string()))
        );
    }

    #[test]
    fn test_execute_blank_line() {
        let limiter = create_test_limiter(RateLimitConfig::default());
        assert_eq!(execute(&limiter, "   "), None);
    }

    #[test]
    fn test_execute_info_and_reset() {
        let config = RateLimitConfig::new(Algorithm::TokenBucket, 1000, 1).with_block_duration(1000);
        let limiter = create_test_limiter(config);

        execute(&limiter, "check k");
        execute(&limiter, "check k");

        match execute(&limiter, "info k") {
            Some(Reply::Info { blocked, info, .. }) => {
                assert!(blocked);
                assert_eq!(info.retry_after_ms, Some(1000));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        assert_eq!(
            execute(&limiter, "reset k"),
            Some(Reply::Reset {
                reset: "k".to_string()
            })
        );
        assert_eq!(limiter.key_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_session() {
        let config = RateLimitConfig::new(Algorithm::TokenBucket, 60_000, 1).with_skip(true, false);
        let limiter = create_test_limiter(config);

        // Lines split across reads are reassembled
        let input = tokio_test::io::Builder::new()
            .read(b"check alice\ncheck al")
            .read(b"ice\n\nbogus\ndone alice ok\n")
            .read(b"check alice\nreset-all\n")
            .build();
        let mut output = Vec::new();

        let answered = serve(&limiter, BufReader::new(input), &mut output)
            .await
            .unwrap();
        assert_eq!(answered, 6);

        let replies = parse_replies(&output);
        assert_eq!(replies.len(), 6);

        assert_eq!(replies[0]["key"], "alice");
        assert_eq!(replies[0]["allowed"], true);
        assert_eq!(replies[0]["limit"], 1);
        assert_eq!(replies[0]["remaining"], 0);
        assert_eq!(replies[0]["reset_time_ms"], 60_000);

        assert_eq!(replies[1]["allowed"], false);
        assert!(replies[2]["error"].as_str().unwrap().contains("bogus"));
        assert_eq!(replies[3]["refunded"], true);
        assert_eq!(replies[4]["allowed"], true);
        assert_eq!(replies[5]["reset_all"], true);
    }

    #[tokio::test]
    async fn test_serve_empty_input() {
        let limiter = create_test_limiter(RateLimitConfig::default());
        let mut output = Vec::new();

        let answered = serve(&limiter, &b""[..], &mut output).await.unwrap();
        assert_eq!(answered, 0);
        assert!(output.is_empty());
    }
}
