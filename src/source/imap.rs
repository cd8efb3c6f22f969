//! IMAP source connector over rustls.
//!
//! Speaks just enough IMAP4rev1 to log in, search a mailbox and pull
//! message bodies with `BODY.PEEK[]`, so polling never flips the server's
//! `\Seen` flag. The protocol is blocking and runs on `spawn_blocking`.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::ImapConfig;
use crate::error::SourceError;
use crate::source::mail::{is_sender_allowed, parse_message};
use crate::source::{FetchFilter, RawItem, SourceConnector};

const SOURCE_NAME: &str = "imap";

/// Socket read timeout for a single IMAP exchange.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls one IMAP mailbox.
pub struct ImapSource {
    config: Arc<ImapConfig>,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl SourceConnector for ImapSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_new(
        &self,
        filter: &FetchFilter,
        max_count: usize,
    ) -> Result<Vec<RawItem>, SourceError> {
        let config = Arc::clone(&self.config);
        let filter = filter.clone();
        let max_count = max_count.min(config.fetch_max);
        let items = tokio::task::spawn_blocking(move || fetch_blocking(&config, &filter, max_count))
            .await
            .map_err(|e| protocol(format!("fetch task panicked: {e}")))??;
        info!(count = items.len(), host = %self.config.host, "Fetched mail");
        Ok(items)
    }

    async fn health_check(&self) -> Result<(), SourceError> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.login(&config)?;
            session.command("NOOP")?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| protocol(format!("health task panicked: {e}")))?
    }
}

fn fetch_blocking(
    config: &ImapConfig,
    filter: &FetchFilter,
    max_count: usize,
) -> Result<Vec<RawItem>, SourceError> {
    let mut session = ImapSession::connect(config)?;
    session.login(config)?;
    session.command(&format!("SELECT {}", quote(&config.mailbox)))?;

    let search = session.command(&format!("UID SEARCH {}", search_criteria(filter)))?;
    let uids = parse_search(&search.lines);
    debug!(matches = uids.len(), "IMAP search complete");

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for uid in uids {
        if items.len() >= max_count {
            break;
        }
        let response = session.command(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
        let Some(raw) = response.literals.first() else {
            warn!(uid, "FETCH returned no message body");
            continue;
        };
        let fallback_id = format!("imap:{}:{uid}", config.mailbox);
        let Some(item) = parse_message(raw, &fallback_id) else {
            warn!(uid, "Skipping unparseable message");
            continue;
        };
        if !is_sender_allowed(&config.allowed_senders, &item.sender) {
            debug!(uid, sender = %item.sender, "Sender not in allow-list");
            continue;
        }
        if seen.insert(item.external_id.clone()) {
            items.push(item);
        }
    }

    session.logout();
    Ok(items)
}

/// SEARCH criteria for a filter, e.g. `UNSEEN SINCE 08-May-2024`.
fn search_criteria(filter: &FetchFilter) -> String {
    let mut parts = vec![if filter.unread_only { "UNSEEN" } else { "ALL" }.to_string()];
    if let Some(since) = filter.since {
        parts.push(format!("SINCE {}", imap_date(since)));
    }
    parts.join(" ")
}

fn imap_date(at: DateTime<Utc>) -> String {
    at.format("%d-%b-%Y").to_string()
}

/// UIDs from `* SEARCH` lines, ascending so the oldest mail comes first.
fn parse_search(lines: &[String]) -> Vec<u32> {
    let mut uids: Vec<u32> = lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Byte count of a trailing `{N}` literal marker.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.trim_end().strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].parse().ok()
}

fn protocol(reason: impl Into<String>) -> SourceError {
    SourceError::Protocol {
        name: SOURCE_NAME.to_string(),
        reason: reason.into(),
    }
}

fn connection(reason: impl Into<String>) -> SourceError {
    SourceError::Connection {
        name: SOURCE_NAME.to_string(),
        reason: reason.into(),
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Untagged lines and literals collected up to a tagged completion.
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &ImapConfig) -> Result<Self, SourceError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| connection(format!("{}:{}: {e}", config.host, config.port)))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| connection(e.to_string()))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connection(format!("invalid host name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connection(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(connection(format!("unexpected greeting: {}", greeting.trim())));
        }
        Ok(session)
    }

    fn login(&mut self, config: &ImapConfig) -> Result<(), SourceError> {
        let cmd = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        self.command(&cmd).map(|_| ()).map_err(|e| match e {
            SourceError::Protocol { reason, .. } => SourceError::AuthFailed {
                name: SOURCE_NAME.to_string(),
                reason,
            },
            other => other,
        })
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        let n = self
            .stream
            .read_until(b'\n', &mut buf)
            .map_err(|e| connection(e.to_string()))?;
        if n == 0 {
            return Err(connection("connection closed by server"));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a tagged command and read until its completion line.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, SourceError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| connection(e.to_string()))?;

        let mut response = ImapResponse {
            lines: Vec::new(),
            literals: Vec::new(),
        };
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                let verb = cmd.split_whitespace().next().unwrap_or(cmd);
                return Err(protocol(format!("{verb} failed: {}", status.trim())));
            }
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream
                    .read_exact(&mut literal)
                    .map_err(|e| connection(e.to_string()))?;
                response.literals.push(literal);
            }
            response.lines.push(line.trim_end().to_string());
        }
    }
}
