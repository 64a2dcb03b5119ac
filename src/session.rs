use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::command::{is_recognized, parse_command, ParsedCommand};
use crate::config::Config;
use crate::delivery::DeliveryManager;
use crate::envelope::{parse_helo_domain, parse_mail_from, parse_rcpt_to, MailFromError};
use crate::error::SessionError;
use crate::metrics::Metrics;
use crate::policy::{AddressPolicy, Recipient};

/// Monotonically increasing session id generator, shared by the acceptor.
pub fn next_session_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The session's place in the envelope-and-data protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Greet,
    Ready,
    Mail,
    Data,
    Quit,
}

/// Per-connection protocol state, owned exclusively by the task running it.
pub struct Session {
    pub id: u64,
    state: State,
    remote_host: String,
    remote_domain: String,
    from: Option<String>,
    recipients: Vec<Recipient>,
    /// First write failure observed (displayed, not retained verbatim
    /// since `std::io::Error` isn't `Clone`); once set, further sends are
    /// suppressed and the session loop exits.
    send_error: Option<String>,
    config: Arc<Config>,
    policy: Arc<dyn AddressPolicy>,
    delivery: Arc<dyn DeliveryManager>,
    metrics: Arc<Metrics>,
}

/// Outcome of a bounded, idle-deadline-guarded read.
enum ReadOutcome<T> {
    Got(T),
    Eof,
    Timeout,
    TooLong,
    Io(SessionError),
}

impl Session {
    pub fn new(
        id: u64,
        remote_host: String,
        config: Arc<Config>,
        policy: Arc<dyn AddressPolicy>,
        delivery: Arc<dyn DeliveryManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            state: State::Greet,
            remote_host,
            remote_domain: String::new(),
            from: None,
            recipients: Vec::new(),
            send_error: None,
            config,
            policy,
            delivery,
            metrics,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn reset(&mut self) {
        self.state = State::Ready;
        self.from = None;
        self.recipients.clear();
    }

    fn idle(&self) -> Duration {
        Duration::from_secs(self.config.max_idle_secs)
    }

    /// Writes one reply line, re-arming the write deadline first. The
    /// first failure is latched; subsequent calls are suppressed and
    /// return the same error without touching the socket again.
    async fn send_reply<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        text: &str,
    ) -> Result<(), SessionError> {
        if let Some(reason) = &self.send_error {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                reason.clone(),
            )));
        }
        let line = format!("{text}\r\n");
        let result = tokio::time::timeout(self.idle(), async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.send_error = Some(e.to_string());
                Err(SessionError::Io(e))
            }
            Err(_) => {
                self.send_error = Some(SessionError::Timeout.to_string());
                Err(SessionError::Timeout)
            }
        }
    }

    /// Writes a multi-line reply (EHLO capabilities): every line but the
    /// last uses `code-`, the last uses `code `. The text of each line
    /// already carries the correct separator.
    async fn send_multiline<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        lines: &[String],
    ) -> Result<(), SessionError> {
        for line in lines {
            self.send_reply(writer, line).await?;
        }
        Ok(())
    }

    fn warn(&self, msg: &str) {
        self.metrics.warn();
        warn!(session = self.id, peer = %self.remote_host, "{}", msg);
    }

    /// Greets the client and runs the command loop until QUIT or an
    /// unrecoverable error.
    pub async fn run<S>(&mut self, stream: S)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        if self
            .send_reply(
                reader.get_mut(),
                &format!("220 {} Inbucket SMTP ready", self.config.domain),
            )
            .await
            .is_err()
        {
            return;
        }

        loop {
            let outcome = self.read_line(&mut reader).await;
            match outcome {
                ReadOutcome::Got(line) => {
                    self.handle_line(&mut reader, &line).await;
                    // A latched send_error means some earlier reply failed to
                    // go out; per the sendError invariant, the session must
                    // not process any further commands once that happens.
                    if self.state == State::Quit || self.send_error.is_some() {
                        break;
                    }
                }
                ReadOutcome::Eof => {
                    if matches!(self.state, State::Greet | State::Ready) {
                        info!(session = self.id, peer = %self.remote_host, "peer closed connection");
                    } else {
                        self.warn("peer closed connection mid-transaction");
                    }
                    break;
                }
                ReadOutcome::TooLong => {
                    self.warn("command line exceeded maximum length");
                    let _ = self
                        .send_reply(reader.get_mut(), "500 Line too long")
                        .await;
                    if self.send_error.is_some() {
                        break;
                    }
                }
                ReadOutcome::Timeout => {
                    let _ = self
                        .send_reply(reader.get_mut(), "221 Idle timeout, bye bye")
                        .await;
                    info!(session = self.id, peer = %self.remote_host, "{}", SessionError::Timeout);
                    break;
                }
                ReadOutcome::Io(e) => {
                    let _ = self
                        .send_reply(reader.get_mut(), "221 Idle timeout, bye bye")
                        .await;
                    self.warn(&format!("read error: {e}"));
                    break;
                }
            }
        }
    }

    /// Reads one CRLF-terminated (bare `\n` tolerated) command line under
    /// a refreshed idle deadline, capped at `max_line_length` bytes so a
    /// client that never sends a terminator can't grow the buffer without
    /// bound. A line past the cap is drained to its terminator (without
    /// being retained) and reported as [`ReadOutcome::TooLong`].
    async fn read_line<S>(&self, reader: &mut BufReader<S>) -> ReadOutcome<String>
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        let max_len = self.config.max_line_length;
        let mut raw = Vec::with_capacity(128);
        let mut over_limit = false;

        loop {
            let chunk = match tokio::time::timeout(self.idle(), reader.fill_buf()).await {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(e)) => return ReadOutcome::Io(e.into()),
                Err(_) => return ReadOutcome::Timeout,
            };
            if chunk.is_empty() {
                return if raw.is_empty() {
                    ReadOutcome::Eof
                } else if over_limit {
                    ReadOutcome::TooLong
                } else {
                    ReadOutcome::Got(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string())
                };
            }
            if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
                if !over_limit {
                    raw.extend_from_slice(&chunk[..=pos]);
                }
                let consumed = pos + 1;
                reader.consume(consumed);
                return if over_limit || raw.len() > max_len {
                    ReadOutcome::TooLong
                } else {
                    ReadOutcome::Got(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string())
                };
            }
            if !over_limit {
                raw.extend_from_slice(chunk);
                if raw.len() > max_len {
                    over_limit = true;
                }
            }
            let len = chunk.len();
            reader.consume(len);
        }
    }

    /// Reads one raw byte-line (including its terminator) under a
    /// refreshed idle deadline, used during the DATA phase to preserve
    /// exact wire framing.
    async fn read_byte_line<S>(&self, reader: &mut BufReader<S>, buf: &mut Vec<u8>) -> ReadOutcome<()>
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        buf.clear();
        let read = tokio::time::timeout(self.idle(), reader.read_until(b'\n', buf)).await;
        match read {
            Ok(Ok(0)) => ReadOutcome::Eof,
            Ok(Ok(_)) => ReadOutcome::Got(()),
            Ok(Err(e)) => ReadOutcome::Io(e.into()),
            Err(_) => ReadOutcome::Timeout,
        }
    }

    async fn handle_line<S>(&mut self, reader: &mut BufReader<S>, line: &str)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        match parse_command(line) {
            ParsedCommand::Empty => {
                let _ = self.send_reply(reader.get_mut(), "500 Speak up").await;
            }
            ParsedCommand::Malformed => {
                self.warn("malformed command line");
                let _ = self
                    .send_reply(reader.get_mut(), "500 Syntax error, command garbled")
                    .await;
            }
            ParsedCommand::Command { verb, arg } => {
                self.dispatch(reader, &verb, &arg).await;
            }
        }
    }

    async fn dispatch<S>(&mut self, reader: &mut BufReader<S>, verb: &str, arg: &str)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        match verb {
            "HELO" => self.handle_helo(reader, false, arg).await,
            "EHLO" => self.handle_helo(reader, true, arg).await,
            "MAIL" => self.handle_mail(reader, arg).await,
            "RCPT" => self.handle_rcpt(reader, arg).await,
            "DATA" => self.handle_data(reader).await,
            "RSET" => {
                self.reset();
                let _ = self.send_reply(reader.get_mut(), "250 Session reset").await;
            }
            "NOOP" => {
                let _ = self
                    .send_reply(reader.get_mut(), "250 I have successfully done nothing")
                    .await;
            }
            "QUIT" => {
                let _ = self
                    .send_reply(reader.get_mut(), "221 Goodnight and good luck")
                    .await;
                self.state = State::Quit;
            }
            "VRFY" => {
                let _ = self
                    .send_reply(reader.get_mut(), "252 Cannot VRFY user, but will accept message")
                    .await;
            }
            // The remaining recognised verbs (SEND/SOML/SAML/EXPN/HELP/TURN)
            // are intentionally unimplemented; anything not in the shared
            // verb table at all is unrecognized. Consulting `is_recognized`
            // here, rather than hand-duplicating its verb list, keeps
            // `command::RECOGNIZED_VERBS` the single source of truth.
            _ if is_recognized(verb) => {
                self.warn(&format!("{verb} not implemented"));
                let _ = self.send_reply(reader.get_mut(), "502 not implemented").await;
            }
            _ => {
                self.warn(&format!("unrecognized verb {verb}"));
                let _ = self
                    .send_reply(
                        reader.get_mut(),
                        &format!("500 Syntax error, {verb} command unrecognized"),
                    )
                    .await;
            }
        }
    }

    async fn out_of_sequence<S>(&mut self, reader: &mut BufReader<S>, verb: &str)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        self.warn(&format!("{verb} out of sequence in state {:?}", self.state));
        let _ = self
            .send_reply(reader.get_mut(), &format!("503 Command {verb} is out of sequence"))
            .await;
    }

    async fn handle_helo<S>(&mut self, reader: &mut BufReader<S>, is_ehlo: bool, arg: &str)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != State::Greet {
            let verb = if is_ehlo { "EHLO" } else { "HELO" };
            self.out_of_sequence(reader, verb).await;
            return;
        }
        match parse_helo_domain(arg) {
            Ok(domain) => {
                self.remote_domain = domain.to_string();
                self.state = State::Ready;
                if is_ehlo {
                    let lines = vec![
                        "250-Great, let's get this show on the road".to_string(),
                        "250-8BITMIME".to_string(),
                        format!("250 SIZE {}", self.config.max_message_bytes),
                    ];
                    let _ = self.send_multiline(reader.get_mut(), &lines).await;
                } else {
                    let _ = self
                        .send_reply(reader.get_mut(), "250 Great, let's get this show on the road")
                        .await;
                }
            }
            Err(_) => {
                self.warn("HELO/EHLO missing domain argument");
                let _ = self
                    .send_reply(reader.get_mut(), "501 Domain/address argument required")
                    .await;
            }
        }
    }

    async fn handle_mail<S>(&mut self, reader: &mut BufReader<S>, arg: &str)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != State::Ready {
            self.out_of_sequence(reader, "MAIL").await;
            return;
        }
        match parse_mail_from(arg, self.config.max_message_bytes) {
            Ok(parsed) => match self.policy.parse_email_address(&parsed.address) {
                Ok(_) => {
                    let reply = format!("250 Roger, accepting mail from <{}>", parsed.address);
                    self.from = Some(parsed.address);
                    self.state = State::Mail;
                    let _ = self.send_reply(reader.get_mut(), &reply).await;
                }
                Err(_) => {
                    self.warn("MAIL FROM address rejected by policy");
                    let _ = self
                        .send_reply(
                            reader.get_mut(),
                            "501 Was expecting MAIL arg syntax of FROM:<address>",
                        )
                        .await;
                }
            },
            Err(MailFromError::BadSyntax) => {
                self.warn("malformed MAIL FROM argument");
                let _ = self
                    .send_reply(
                        reader.get_mut(),
                        "501 Was expecting MAIL arg syntax of FROM:<address>",
                    )
                    .await;
            }
            Err(MailFromError::SizeExceeded) => {
                self.warn("MAIL FROM SIZE parameter exceeds maximum");
                let _ = self
                    .send_reply(reader.get_mut(), "552 Max message size exceeded")
                    .await;
            }
        }
    }

    async fn handle_rcpt<S>(&mut self, reader: &mut BufReader<S>, arg: &str)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != State::Mail {
            self.out_of_sequence(reader, "RCPT").await;
            return;
        }
        if self.recipients.len() >= self.config.max_recipients {
            self.warn("recipient limit exceeded");
            let _ = self
                .send_reply(
                    reader.get_mut(),
                    &format!(
                        "552 Maximum limit of {} recipients reached",
                        self.config.max_recipients
                    ),
                )
                .await;
            return;
        }
        let address = match parse_rcpt_to(arg) {
            Ok(address) => address,
            Err(_) => {
                self.warn("malformed RCPT TO argument");
                let _ = self
                    .send_reply(reader.get_mut(), "501 Bad recipient address syntax")
                    .await;
                return;
            }
        };
        match self.policy.new_recipient(&address) {
            Ok(recipient) => {
                let reply = format!("250 I'll make sure <{}> gets this", recipient.address());
                self.recipients.push(recipient);
                let _ = self.send_reply(reader.get_mut(), &reply).await;
            }
            Err(_) => {
                self.warn("recipient rejected by policy");
                let _ = self
                    .send_reply(reader.get_mut(), "501 Bad recipient address syntax")
                    .await;
            }
        }
    }

    async fn handle_data<S>(&mut self, reader: &mut BufReader<S>)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != State::Mail || self.recipients.is_empty() {
            self.out_of_sequence(reader, "DATA").await;
            return;
        }
        self.state = State::Data;
        if self
            .send_reply(reader.get_mut(), "354 Start mail input; end with <CRLF>.<CRLF>")
            .await
            .is_err()
        {
            return;
        }

        let body = match self.read_data_body(reader).await {
            Some(body) => body,
            None => return,
        };

        self.complete_delivery(reader, body).await;
    }

    /// Streams the message body until the `<CRLF>.<CRLF>` (or bare `\n.\n`)
    /// terminator, dot-unstuffing as it goes. Returns `None` if the
    /// connection ended the session outright (timeout, I/O error, EOF, or
    /// a size-limit rejection that already replied and reset).
    async fn read_data_body<S>(&mut self, reader: &mut BufReader<S>) -> Option<Vec<u8>>
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        let mut body = Vec::with_capacity(8192);
        let mut line_buf = Vec::with_capacity(1024);

        loop {
            match self.read_byte_line(reader, &mut line_buf).await {
                ReadOutcome::Got(()) => {}
                ReadOutcome::TooLong => unreachable!("read_byte_line never reports TooLong"),
                ReadOutcome::Eof => {
                    self.warn("peer closed connection mid-DATA");
                    return None;
                }
                ReadOutcome::Timeout => {
                    let _ = self
                        .send_reply(reader.get_mut(), "221 Idle timeout, bye bye")
                        .await;
                    info!(session = self.id, peer = %self.remote_host, "{} during DATA", SessionError::Timeout);
                    return None;
                }
                ReadOutcome::Io(e) => {
                    let _ = self
                        .send_reply(reader.get_mut(), "221 Idle timeout, bye bye")
                        .await;
                    self.warn(&format!("read error during DATA: {e}"));
                    return None;
                }
            }

            if line_buf == b".\r\n" || line_buf == b".\n" {
                return Some(body);
            }

            let unstuffed: &[u8] = if line_buf.first() == Some(&b'.') {
                &line_buf[1..]
            } else {
                &line_buf[..]
            };
            body.extend_from_slice(unstuffed);

            if body.len() as u64 > self.config.max_message_bytes {
                self.warn("message exceeds maximum size");
                let _ = self
                    .send_reply(reader.get_mut(), "552 Maximum message size exceeded")
                    .await;
                self.reset();
                return None;
            }
        }
    }

    /// Delivers the completed body to every recipient that wants it
    /// stored, in RCPT order, aborting on the first delivery failure.
    async fn complete_delivery<S>(&mut self, reader: &mut BufReader<S>, body: Vec<u8>)
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        let from = self.from.clone().unwrap_or_default();
        let recipients = self.recipients.clone();
        let timestamp = rfc822_timestamp(SystemTime::now());

        for recipient in &recipients {
            if !recipient.should_store() {
                continue;
            }
            let prefix = format!(
                "Received: from {} ([{}]) by {}\r\n  for {}; {}\r\n",
                self.remote_domain,
                self.remote_host,
                self.config.domain,
                recipient.address(),
                timestamp,
            );
            match self
                .delivery
                .deliver(recipient, &from, &recipients, &prefix, &body)
            {
                Ok(_) => self.metrics.received(1),
                Err(e) => {
                    let err: SessionError = e.into();
                    self.metrics.error();
                    self.warn(&format!("delivery failed for {}: {err}", recipient.address()));
                    let _ = self
                        .send_reply(
                            reader.get_mut(),
                            &format!("451 Failed to store message for {}", recipient.local_part()),
                        )
                        .await;
                    self.reset();
                    return;
                }
            }
        }

        debug!(session = self.id, peer = %self.remote_host, size = body.len(), "message accepted");
        let _ = self
            .send_reply(reader.get_mut(), "250 Mail accepted for delivery")
            .await;
        self.reset();
    }
}

/// `Mon, 02 Jan 2006 15:04:05 +0000 (UTC)`, matching the RFC-822-style
/// trace timestamp format. No timezone database is available in this
/// dependency stack (the `time` crate's `local-offset` feature is not
/// enabled), so the offset is always UTC.
const RFC822_FORMAT: &[time::format_description::FormatItem<'_>] = time::macros::format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] +0000 (UTC)"
);

fn rfc822_timestamp(now: SystemTime) -> String {
    time::OffsetDateTime::from(now)
        .format(RFC822_FORMAT)
        .expect("RFC822_FORMAT is a fixed, valid format description")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_has_rfc822_shape() {
        let ts = rfc822_timestamp(UNIX_EPOCH + Duration::from_secs(0));
        assert_eq!(ts, "Thu, 01 Jan 1970 00:00:00 +0000 (UTC)");
    }

    #[test]
    fn timestamp_tracks_known_date() {
        // 2021-03-14T15:09:26Z
        let ts = rfc822_timestamp(UNIX_EPOCH + Duration::from_secs(1_615_734_566));
        assert_eq!(ts, "Sun, 14 Mar 2021 15:09:26 +0000 (UTC)");
    }

    #[test]
    fn next_session_id_is_monotonic() {
        let a = next_session_id();
        let b = next_session_id();
        assert!(b > a);
    }
}
