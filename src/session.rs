//! Modem Session (C4): owns one physical modem — connect, probe identity,
//! send, health-check, close.
//!
//! Each dialogue is offloaded to a blocking thread via
//! `tokio::task::spawn_blocking`, mirroring the teacher's "dedicated thread
//! owns the fd" design (`src/modem.rs`) but keeping the transport itself
//! synchronous and generic over the call rather than hard-wiring one
//! request/reply channel.

use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::at::{AtDialogue, Terminator};
use crate::error::{CmsErrorKind, SmsError};
use crate::pdu::{encode_destination, encode_segment_hex, Quirks, SegmentPlan};
use crate::serial::SerialTransport;

/// Consecutive AT-level errors tolerated before a session marks itself
/// unavailable (§4.4 failure policy).
pub const ERROR_THRESHOLD: u32 = 3;

const OPEN_SETTLE: Duration = Duration::from_secs(2);
const SHORT_WAIT: Duration = Duration::from_secs(5);
const PROMPT_WAIT: Duration = Duration::from_secs(5);

/// Recognized vendor family, detected from `ATI`. Drives quirks such as
/// destination hex-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vendor {
    Quectel,
    Huawei,
    Zte,
    Sierra,
    Simcom,
    Unknown(String),
}

impl Vendor {
    fn detect(ati_response: &str) -> Self {
        let lower = ati_response.to_lowercase();
        if lower.contains("quectel") {
            Self::Quectel
        } else if lower.contains("huawei") {
            Self::Huawei
        } else if lower.contains("zte") {
            Self::Zte
        } else if lower.contains("sierra") {
            Self::Sierra
        } else if lower.contains("simcom") || lower.contains("sim7") {
            Self::Simcom
        } else {
            Self::Unknown(ati_response.trim().to_string())
        }
    }

    /// Quirks implied by vendor family. Every family defaults to
    /// hex-encoding the destination per the open-question resolution;
    /// override here as specific vendor behavior is confirmed in the field.
    fn quirks(&self) -> Quirks {
        Quirks::default()
    }
}

/// Immutable identity, populated once during `configure()`.
#[derive(Debug, Clone)]
pub struct ModemDescriptor {
    pub port: String,
    pub manufacturer: String,
    pub model: String,
    pub imei: String,
    pub imsi: String,
    pub service_center: Option<String>,
}

/// Current lifecycle stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Probed,
    Ready,
    Faulted,
}

/// Mutable health snapshot, read by the pool selector and updated by the
/// owning lease holder or the health loop.
#[derive(Debug)]
pub struct ModemState {
    signal: AtomicI8,
    available: AtomicBool,
    error_count: AtomicU32,
    last_used: AtomicU64,
    in_use: AtomicBool,
    network: Mutex<Option<String>>,
}

impl ModemState {
    fn new() -> Self {
        Self {
            signal: AtomicI8::new(-1),
            available: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            last_used: AtomicU64::new(now_epoch()),
            in_use: AtomicBool::new(false),
            network: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn signal(&self) -> i8 {
        self.signal.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn network(&self) -> Option<String> {
        self.network.lock().unwrap().clone()
    }

    fn note_success(&self) {
        self.error_count.store(0, Ordering::Relaxed);
        self.last_used.store(now_epoch(), Ordering::Relaxed);
    }

    fn note_error(&self) -> u32 {
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= ERROR_THRESHOLD {
            self.available.store(false, Ordering::Relaxed);
        }
        count
    }

    pub(crate) fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Relaxed);
        if !in_use {
            self.last_used.store(now_epoch(), Ordering::Relaxed);
        }
    }
}

#[must_use]
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Outcome of one send attempt: which segments made it through, their
/// modem-assigned references, and — if it stopped early — why.
#[derive(Debug)]
pub struct SendOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub references: Vec<String>,
    pub error: Option<SmsError>,
}

impl SendOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.succeeded == self.total && self.total > 0
    }
}

/// One modem, bound to one serial port for its whole lifetime.
pub struct ModemSession {
    transport: Arc<Mutex<SerialTransport>>,
    descriptor: Mutex<Option<ModemDescriptor>>,
    status: Mutex<SessionStatus>,
    state: ModemState,
    quirks: Mutex<Quirks>,
    country_code: String,
    baud: u32,
}

impl ModemSession {
    /// `open()`: opens the port, settles, flushes, and requires a bare
    /// `AT` → `OK` before returning.
    pub async fn open(port: &str, baud: u32, country_code: &str) -> Result<Self, SmsError> {
        let port_owned = port.to_string();
        let transport = tokio::task::spawn_blocking(move || SerialTransport::open(&port_owned, baud))
            .await
            .map_err(|e| SmsError::TransportBroken(format!("join error: {e}")))??;

        tokio::time::sleep(OPEN_SETTLE).await;

        let transport = Arc::new(Mutex::new(transport));
        let session = Self {
            transport,
            descriptor: Mutex::new(None),
            status: Mutex::new(SessionStatus::Closed),
            state: ModemState::new(),
            quirks: Mutex::new(Quirks::default()),
            country_code: country_code.to_string(),
            baud,
        };

        session.dialogue(move |d| {
            d.transport.flush_input()?;
            let (_, term) = d.command("AT", SHORT_WAIT, None)?;
            match term {
                Terminator::Ok => Ok(()),
                other => Err(SmsError::AtProtocol(format!("AT probe got {other:?}"))),
            }
        })?
        .await?;

        *session.status.lock().unwrap() = SessionStatus::Probed;
        Ok(session)
    }

    /// `configure()`: disable echo, enable verbose CMS errors, detect
    /// vendor, set storage/text-mode/charset, and collect the descriptor.
    pub async fn configure(&self) -> Result<ModemDescriptor, SmsError> {
        let port = {
            let t = self.transport.lock().unwrap();
            t.device().to_string()
        };

        let descriptor = self
            .dialogue(move |d| {
                d.command("ATE0", SHORT_WAIT, None)?;
                d.command("AT+CMEE=2", SHORT_WAIT, None)?;

                let (ati, _) = d.command("ATI", SHORT_WAIT, None)?;
                let vendor = Vendor::detect(&ati);

                d.command(r#"AT+CPMS="SM","SM","SM""#, SHORT_WAIT, None)?;
                d.command("AT+CMGF=1", SHORT_WAIT, None)?;
                d.command(r#"AT+CSCS="UCS2""#, SHORT_WAIT, None)?;

                let (manufacturer, _) = d.command("AT+CGMI", SHORT_WAIT, None)?;
                let (model, _) = d.command("AT+CGMM", SHORT_WAIT, None)?;
                let (imei, _) = d.command("AT+GSN", SHORT_WAIT, None)?;
                let (imsi, _) = d.command("AT+CIMI", SHORT_WAIT, None)?;
                let (smsc, _) = d.command("AT+CSCA?", SHORT_WAIT, None)?;

                Ok((
                    ModemDescriptor {
                        port: port.clone(),
                        manufacturer: first_data_line(&manufacturer),
                        model: first_data_line(&model),
                        imei: first_data_line(&imei),
                        imsi: first_data_line(&imsi),
                        service_center: parse_csca(&smsc),
                    },
                    vendor,
                ))
            })?
            .await?;

        let (descriptor, vendor) = descriptor;
        *self.quirks.lock().unwrap() = vendor.quirks();
        *self.descriptor.lock().unwrap() = Some(descriptor.clone());

        let signal = self.dialogue(|d| probe_signal_dialogue(d))?.await?;
        self.state.signal.store(signal, Ordering::Relaxed);
        self.state.available.store(signal > 0, Ordering::Relaxed);

        *self.status.lock().unwrap() = SessionStatus::Ready;
        Ok(descriptor)
    }

    /// `send(request)`: plan segments, dialogue each through the modem,
    /// and accumulate references. Stops at the first failed segment.
    pub async fn send(&self, phone: &str, body: &str) -> Result<SendOutcome, SmsError> {
        let destination = normalize_phone(phone, &self.country_code);
        let plan = SegmentPlan::plan(body)?;
        let quirks = *self.quirks.lock().unwrap();
        let total = plan.segments.len();

        let mut references = Vec::with_capacity(total);
        for segment in &plan.segments {
            let dest_arg = encode_destination(&destination, quirks);
            let payload_hex = encode_segment_hex(segment);
            let segment_count = total;

            let result = self
                .dialogue(move |d| {
                    let (_, term) = d.command(
                        &format!(r#"AT+CMGS="{dest_arg}""#),
                        PROMPT_WAIT,
                        Some(">"),
                    )?;
                    if term != Terminator::Prompt {
                        return Err(SmsError::AtProtocol(format!(
                            "expected prompt, got {term:?}"
                        )));
                    }

                    let wait = send_wait(segment_count);
                    let (_, term) = d.send_payload(&payload_hex, wait)?;
                    match term {
                        Terminator::Cmgs(reference) => Ok(reference),
                        Terminator::CmsError(code) => Err(SmsError::CmsError {
                            code,
                            kind: CmsErrorKind::from_code(code),
                        }),
                        other => Err(SmsError::AtProtocol(format!(
                            "unexpected send terminator {other:?}"
                        ))),
                    }
                })?
                .await;

            match result {
                Ok(reference) => {
                    references.push(reference);
                    self.state.note_success();
                }
                Err(err) => {
                    if err.counts_as_modem_error() {
                        let count = self.state.note_error();
                        warn!(
                            port = %self.port_name(),
                            error_count = count,
                            "AT error during send"
                        );
                    }
                    if matches!(err, SmsError::TransportBroken(_)) {
                        *self.status.lock().unwrap() = SessionStatus::Faulted;
                    }
                    return Ok(SendOutcome {
                        total,
                        succeeded: references.len(),
                        references,
                        error: Some(err),
                    });
                }
            }
        }

        Ok(SendOutcome {
            total,
            succeeded: references.len(),
            references,
            error: None,
        })
    }

    /// Cheap `AT+CSQ` health check. Refreshes signal; availability reflects
    /// `signal > 0 && session not Faulted`.
    pub async fn health_check(&self) -> Result<(), SmsError> {
        if *self.status.lock().unwrap() == SessionStatus::Faulted {
            return Ok(());
        }

        let result = self.dialogue(|d| probe_signal_dialogue(d))?.await;
        match result {
            Ok(signal) => {
                self.state.signal.store(signal, Ordering::Relaxed);
                let faulted = *self.status.lock().unwrap() == SessionStatus::Faulted;
                self.state
                    .available
                    .store(signal > 0 && !faulted, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                if matches!(err, SmsError::TransportBroken(_)) {
                    *self.status.lock().unwrap() = SessionStatus::Faulted;
                    self.state.available.store(false, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    /// Explicit close. Safe to call from any state; idempotent.
    pub async fn close(&self) -> Result<(), SmsError> {
        *self.status.lock().unwrap() = SessionStatus::Closed;
        self.state.available.store(false, Ordering::Relaxed);
        debug!(port = %self.port_name(), "modem session closed");
        Ok(())
    }

    /// A `Ready`, available session over `/dev/null` with no physical modem
    /// attached, for pool-arbitration tests that need a real session to
    /// hold a lease against without hardware.
    #[cfg(test)]
    pub(crate) fn new_ready_for_test(signal: i8) -> Self {
        let state = ModemState::new();
        state.signal.store(signal, Ordering::Relaxed);
        state.available.store(true, Ordering::Relaxed);
        Self {
            transport: Arc::new(Mutex::new(SerialTransport::open_null())),
            descriptor: Mutex::new(None),
            status: Mutex::new(SessionStatus::Ready),
            state,
            quirks: Mutex::new(Quirks::default()),
            country_code: "+1".to_string(),
            baud: 115_200,
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    #[must_use]
    pub fn state(&self) -> &ModemState {
        &self.state
    }

    #[must_use]
    pub fn descriptor(&self) -> Option<ModemDescriptor> {
        self.descriptor.lock().unwrap().clone()
    }

    #[must_use]
    pub fn port_name(&self) -> String {
        self.descriptor
            .lock()
            .unwrap()
            .as_ref()
            .map_or_else(|| self.transport.lock().unwrap().device().to_string(), |d| d.port.clone())
    }

    /// Offload a blocking AT dialogue closure to a worker thread, holding
    /// the transport's mutex for its duration. This is the single point
    /// where "blocking I/O" crosses into the async world.
    fn dialogue<F, T>(
        &self,
        f: F,
    ) -> Result<impl std::future::Future<Output = Result<T, SmsError>>, SmsError>
    where
        F: for<'a> FnOnce(&AtDialogue<'a>) -> Result<T, SmsError> + Send + 'static,
        T: Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        Ok(async move {
            tokio::task::spawn_blocking(move || {
                let guard = transport.lock().unwrap();
                let dialogue = AtDialogue::new(&guard);
                f(&dialogue)
            })
            .await
            .map_err(|e| SmsError::TransportBroken(format!("join error: {e}")))?
        })
    }
}

fn probe_signal_dialogue(d: &AtDialogue<'_>) -> Result<i8, SmsError> {
    let (resp, term) = d.command("AT+CSQ", SHORT_WAIT, None)?;
    if term != Terminator::Ok {
        return Err(SmsError::AtProtocol(format!("AT+CSQ got {term:?}")));
    }
    parse_csq(&resp).ok_or_else(|| SmsError::AtProtocol(format!("unparseable +CSQ: {resp}")))
}

/// Parse `+CSQ: <rssi>,<ber>` into a signal value (0-31, or -1 unknown).
fn parse_csq(resp: &str) -> Option<i8> {
    for line in resp.lines() {
        if let Some(rest) = line.trim().strip_prefix("+CSQ:") {
            let rssi = rest.split(',').next()?.trim();
            if let Ok(n) = rssi.parse::<i8>() {
                return Some(if n == 99 { -1 } else { n });
            }
        }
    }
    None
}

/// Pull the first non-`AT`/non-`OK` data line out of a single-value query
/// response (e.g. `AT+CGMI` → manufacturer name on its own line).
fn first_data_line(resp: &str) -> String {
    resp.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && *l != "OK" && !l.starts_with('+'))
        .unwrap_or("")
        .to_string()
}

/// Parse `+CSCA: "<number>",<type>` into just the number.
fn parse_csca(resp: &str) -> Option<String> {
    for line in resp.lines() {
        if let Some(rest) = line.trim().strip_prefix("+CSCA:") {
            let first = rest.split(',').next()?.trim();
            return Some(first.trim_matches('"').to_string());
        }
    }
    None
}

/// Normalize a destination: bare national numbers gain the configured
/// country-code prefix; anything already starting with `+` passes through.
#[must_use]
pub fn normalize_phone(phone: &str, country_code: &str) -> String {
    if phone.starts_with('+') {
        phone.to_string()
    } else {
        format!("{country_code}{phone}")
    }
}

/// Wait for the `+CMGS:`/`+CMS ERROR:` result: ~5s base plus 3s per
/// additional segment, capped at 30s.
fn send_wait(segment_count: usize) -> Duration {
    let extra = segment_count.saturating_sub(1) as u64 * 3;
    Duration::from_secs((5 + extra).min(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_csq_normal_signal() {
        assert_eq!(parse_csq("+CSQ: 24,99\r\nOK\r\n"), Some(24));
    }

    #[test]
    fn parses_csq_unknown_as_negative_one() {
        assert_eq!(parse_csq("+CSQ: 99,99\r\nOK\r\n"), Some(-1));
    }

    #[test]
    fn parses_csca_number() {
        assert_eq!(
            parse_csca(r#"+CSCA: "+12345678901",145"#),
            Some("+12345678901".to_string())
        );
    }

    #[test]
    fn normalizes_national_number_with_default_country_code() {
        assert_eq!(normalize_phone("13800138000", "+86"), "+8613800138000");
    }

    #[test]
    fn passes_through_already_normalized_number() {
        assert_eq!(normalize_phone("+442071838750", "+86"), "+442071838750");
    }

    #[test]
    fn send_wait_scales_with_segment_count_and_caps_at_30s() {
        assert_eq!(send_wait(1), Duration::from_secs(5));
        assert_eq!(send_wait(2), Duration::from_secs(8));
        assert_eq!(send_wait(20), Duration::from_secs(30));
    }

    #[test]
    fn vendor_detects_quectel() {
        assert_eq!(Vendor::detect("Quectel\r\nEC25\r\nOK"), Vendor::Quectel);
    }

    #[test]
    fn vendor_falls_back_to_unknown() {
        assert_eq!(
            Vendor::detect("Some Other Modem"),
            Vendor::Unknown("Some Other Modem".to_string())
        );
    }
}
