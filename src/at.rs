//! AT Dialogue: synchronous request/response exchange on top of the serial
//! transport.
//!
//! Grounded on `execute_at`/`response_is_complete`/`sanitize_response`/
//! `strip_echo` from the teacher's native modem driver, generalized to
//! recognize the fuller terminator set this protocol needs (`+CMS ERROR:`,
//! `+CMGS:`, and the `>` send prompt) and to accept a per-call `expect` hint.

use std::time::Duration;

use crate::error::SmsError;
use crate::serial::{deadline_ms, SerialTransport};

/// Which terminator ended a dialogue round, in priority order of
/// recognition (first match in accumulated text wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    CmsError(u16),
    Error,
    Cmgs(String),
    Ok,
    Prompt,
}

/// Drives one AT command line to completion and classifies the result.
pub struct AtDialogue<'a> {
    transport: &'a SerialTransport,
}

impl<'a> AtDialogue<'a> {
    #[must_use]
    pub fn new(transport: &'a SerialTransport) -> Self {
        Self { transport }
    }

    /// Issue `line`, wait up to `wait` for a terminator. `expect`, when
    /// given, lets the caller short-circuit as soon as that substring
    /// appears (used to detect the `>` send prompt without waiting for a
    /// full result code).
    pub fn command(
        &self,
        line: &str,
        wait: Duration,
        expect: Option<&str>,
    ) -> Result<(String, Terminator), SmsError> {
        self.transport.flush_input()?;
        self.transport.write(format!("{line}\r").as_bytes())?;

        let deadline = deadline_ms(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));
        let mut accumulated = String::new();
        let mut found: Option<Terminator> = None;

        self.transport.poll_until(deadline, |chunk| {
            accumulated.push_str(&String::from_utf8_lossy(chunk));
            if let Some(needle) = expect {
                if accumulated.contains(needle) {
                    found = Some(Terminator::Prompt);
                    return true;
                }
            }
            if let Some(term) = classify_terminator(&accumulated) {
                found = Some(term);
                return true;
            }
            false
        })?;

        let cleaned = strip_echo(&sanitize_response(&accumulated));
        match found {
            Some(term) => Ok((cleaned, term)),
            None => Err(SmsError::AtProtocol(format!(
                "timed out after {:.1}s waiting for {line}: {cleaned:?}",
                wait.as_secs_f64()
            ))),
        }
    }

    /// Write raw payload bytes (e.g. hex-encoded SMS body) followed by
    /// Ctrl-Z, then wait for the send result. Used once the `>` prompt has
    /// already been observed for `AT+CMGS`.
    pub fn send_payload(
        &self,
        hex_payload: &str,
        wait: Duration,
    ) -> Result<(String, Terminator), SmsError> {
        self.transport.write(hex_payload.as_bytes())?;
        self.transport.write(&[0x1A])?;

        let deadline = deadline_ms(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));
        let mut accumulated = String::new();
        let mut found: Option<Terminator> = None;

        self.transport.poll_until(deadline, |chunk| {
            accumulated.push_str(&String::from_utf8_lossy(chunk));
            if let Some(term) = classify_terminator(&accumulated) {
                found = Some(term);
                return true;
            }
            false
        })?;

        let cleaned = strip_echo(&sanitize_response(&accumulated));
        match found {
            Some(term) => Ok((cleaned, term)),
            None => Err(SmsError::AtProtocol(format!(
                "timed out after {:.1}s waiting for send result: {cleaned:?}",
                wait.as_secs_f64()
            ))),
        }
    }
}

/// Scan accumulated response text for a recognized terminator, in priority
/// order: `+CMS ERROR:`, `ERROR`, `+CMGS:`, `OK`, then the bare `>` prompt.
fn classify_terminator(text: &str) -> Option<Terminator> {
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("+CMS ERROR:") {
            if let Ok(code) = rest.trim().parse::<u16>() {
                return Some(Terminator::CmsError(code));
            }
            return Some(Terminator::CmsError(0));
        }
        if trimmed == "ERROR" {
            return Some(Terminator::Error);
        }
        if let Some(rest) = trimmed.strip_prefix("+CMGS:") {
            return Some(Terminator::Cmgs(rest.trim().to_string()));
        }
        if trimmed == "OK" {
            return Some(Terminator::Ok);
        }
    }
    if text.contains('>') {
        return Some(Terminator::Prompt);
    }
    None
}

/// Remove NUL bytes, non-printable control characters (except CR/LF), and
/// the UTF-8 replacement character left behind by lossy decoding.
fn sanitize_response(response: &str) -> String {
    response
        .chars()
        .filter(|&c| c == '\r' || c == '\n' || !c.is_control())
        .filter(|&c| c != '\u{FFFD}')
        .collect()
}

/// Strip echoed `AT...` lines (safety net for ATE0 not yet taking effect).
fn strip_echo(response: &str) -> String {
    response
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return false;
            }
            let alpha_start = trimmed.find(|c: char| c.is_ascii_alphabetic());
            match alpha_start {
                Some(pos) => !trimmed[pos..].starts_with("AT"),
                None => true,
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ok() {
        assert_eq!(classify_terminator("+CSQ: 15,99\r\nOK\r\n"), Some(Terminator::Ok));
    }

    #[test]
    fn classifies_error() {
        assert_eq!(classify_terminator("ERROR\r\n"), Some(Terminator::Error));
    }

    #[test]
    fn classifies_cms_error_code() {
        assert_eq!(
            classify_terminator("+CMS ERROR: 300\r\n"),
            Some(Terminator::CmsError(300))
        );
    }

    #[test]
    fn classifies_cmgs_reference() {
        assert_eq!(
            classify_terminator("+CMGS: 42\r\nOK\r\n"),
            Some(Terminator::Cmgs("42".to_string()))
        );
    }

    #[test]
    fn cms_error_takes_priority_over_trailing_ok_like_text() {
        // +CMS ERROR must win even if some other recognizable token appears later.
        let text = "+CMS ERROR: 500\r\n";
        assert_eq!(classify_terminator(text), Some(Terminator::CmsError(500)));
    }

    #[test]
    fn classifies_prompt() {
        assert_eq!(classify_terminator("\r\n> "), Some(Terminator::Prompt));
    }

    #[test]
    fn returns_none_on_partial_response() {
        assert_eq!(classify_terminator("+CSQ: 15,99\r\n"), None);
    }

    #[test]
    fn strips_echoed_command_line() {
        let response = "AT+CSQ\r\n+CSQ: 15,99\r\nOK\r\n";
        let stripped = strip_echo(response);
        assert!(stripped.contains("+CSQ: 15,99"));
        assert!(!stripped.contains("AT+CSQ"));
    }

    #[test]
    fn sanitize_removes_nul_and_replacement_char() {
        let response = "\x00\u{FFFD}+CSQ: 15,99\r\nOK\r\n";
        let cleaned = sanitize_response(response);
        assert!(!cleaned.contains('\x00'));
        assert!(!cleaned.contains('\u{FFFD}'));
        assert!(cleaned.contains("+CSQ: 15,99"));
    }
}
