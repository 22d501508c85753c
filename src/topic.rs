use std::time::Duration;

use crate::error::Result;

/// Separator between topic levels.
const SEPARATOR: char = '.';
/// Matches exactly one level.
const WILDCARD: &str = "+";
/// Matches any number of trailing levels; only valid as the last part.
const MULTI_WILDCARD: &str = "#";

/// One level of a parsed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Exact(String),
    /// `+`
    Single,
    /// `#`
    Multi,
}

impl Part {
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Part::Exact(_))
    }
}

/// A parsed topic: its canonical bytes (options stripped), the level parts,
/// and any `?last=` / `?ttl=` options carried on the string.
#[derive(Debug, Clone, Default)]
pub struct Topic {
    pub topic: Vec<u8>,
    pub parts: Vec<Part>,
    pub depth: u8,
    /// Lower time bound for queries, from `?last=<dur>`.
    pub last: Option<Duration>,
    /// Entry time-to-live, from `?ttl=<dur>`.
    pub ttl: Option<Duration>,
    /// Result cap, from `?last=<n>`.
    pub limit: Option<usize>,
}

impl Topic {
    /// Parses a topic string such as `dev18.sensor.+?last=1h`.
    pub fn parse(raw: &[u8]) -> Result<Topic> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| crate::errbadreq!("topic is not valid utf-8"))?;
        let (name, options) = match text.split_once('?') {
            Some((n, o)) => (n, Some(o)),
            None => (text, None),
        };
        if name.is_empty() {
            return Err(crate::errbadreq!("empty topic"));
        }

        let mut parts = Vec::new();
        let split: Vec<&str> = name.split(SEPARATOR).collect();
        for (i, p) in split.iter().enumerate() {
            match *p {
                "" => return Err(crate::errbadreq!("empty topic level in {name:?}")),
                WILDCARD => parts.push(Part::Single),
                MULTI_WILDCARD => {
                    if i != split.len() - 1 {
                        return Err(crate::errbadreq!("'#' must be the last level in {name:?}"));
                    }
                    parts.push(Part::Multi);
                }
                exact => {
                    if exact.contains(['+', '#']) {
                        return Err(crate::errbadreq!("wildcard inside level in {name:?}"));
                    }
                    parts.push(Part::Exact(exact.to_string()));
                }
            }
        }

        let mut topic = Topic {
            topic: name.as_bytes().to_vec(),
            depth: parts.len() as u8,
            parts,
            ..Default::default()
        };
        if let Some(options) = options {
            topic.parse_options(options)?;
        }
        Ok(topic)
    }

    pub fn has_wildcards(&self) -> bool {
        self.parts.iter().any(Part::is_wildcard)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        for opt in options.split('&') {
            match opt.split_once('=') {
                Some(("last", v)) => {
                    if let Ok(n) = v.parse::<usize>() {
                        self.limit = Some(n);
                    } else {
                        self.last = Some(parse_duration(v)?);
                    }
                }
                Some(("ttl", v)) => {
                    self.ttl = Some(parse_duration(v)?);
                }
                _ => return Err(crate::errbadreq!("unknown topic option {opt:?}")),
            }
        }
        Ok(())
    }
}

/// Parses durations of the form `90s`, `15m`, `1h` or `2d`.
fn parse_duration(text: &str) -> Result<Duration> {
    let (num, unit) = text.split_at(text.len().saturating_sub(1));
    let n: u64 = num
        .parse()
        .map_err(|_| crate::errbadreq!("bad duration {text:?}"))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        _ => return Err(crate::errbadreq!("bad duration unit {text:?}")),
    };
    Ok(Duration::from_secs(secs))
}
