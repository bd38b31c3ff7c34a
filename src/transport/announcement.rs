// ABOUTME: Load announcement carried in heartbeat datagrams
// ABOUTME: Encodes as `v=1&ready=<n>&busy=<n>&port=<p>` and parses the same form

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Wire format version written by `encode`
pub const ANNOUNCEMENT_VERSION: &str = "1";

/// A node's advertised capacity and service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Announcement {
    /// Workers free to take requests
    pub ready: u32,
    /// Workers currently serving
    pub busy: u32,
    /// Port the node accepts cluster traffic on
    pub port: u16,
}

impl Announcement {
    pub const fn new(ready: u32, busy: u32, port: u16) -> Self {
        Self { ready, busy, port }
    }

    /// ASCII payload for one datagram
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v={ANNOUNCEMENT_VERSION}&ready={}&busy={}&port={}",
            self.ready, self.busy, self.port
        )
    }
}

/// Errors parsing an announcement payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnouncementParseError {
    #[error("Malformed announcement field '{0}'")]
    Malformed(String),

    #[error("Unsupported announcement version '{0}'")]
    UnsupportedVersion(String),

    #[error("Announcement missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value '{value}' for announcement field '{field}'")]
    InvalidField { field: &'static str, value: String },
}

fn parse_field<T: FromStr>(field: &'static str, value: Option<&str>) -> Result<T, AnnouncementParseError> {
    let value = value.ok_or(AnnouncementParseError::MissingField(field))?;
    value.parse().map_err(|_| AnnouncementParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

impl FromStr for Announcement {
    type Err = AnnouncementParseError;

    /// Unknown keys are ignored so newer senders stay readable
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mut version, mut ready, mut busy, mut port) = (None, None, None, None);

        for pair in s.trim().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| AnnouncementParseError::Malformed(pair.to_string()))?;
            match key {
                "v" => version = Some(value),
                "ready" => ready = Some(value),
                "busy" => busy = Some(value),
                "port" => port = Some(value),
                _ => {}
            }
        }

        let version = version.ok_or(AnnouncementParseError::MissingField("v"))?;
        if version != ANNOUNCEMENT_VERSION {
            return Err(AnnouncementParseError::UnsupportedVersion(version.to_string()));
        }

        Ok(Self {
            ready: parse_field("ready", ready)?,
            busy: parse_field("busy", busy)?,
            port: parse_field("port", port)?,
        })
    }
}
