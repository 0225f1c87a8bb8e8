//! PDU/UCS-2 codec: text-mode UCS-2 encoding, segmentation, UDH headers, and
//! CMS error code classification.
//!
//! Text-mode UCS-2 is the only send path implemented; PDU mode is a
//! non-core alternative left for later (per design notes).

use rand::Rng;

use crate::error::SmsError;

/// Short-message code-unit limit before segmentation kicks in.
pub const SINGLE_SEGMENT_LIMIT: usize = 70;
/// Code units per segment once a message is split into concatenated parts.
pub const SEGMENT_CHUNK_SIZE: usize = 67;

/// Vendor-specific quirks affecting the wire encoding. Detected from `ATI`
/// in `configure()`; defaults match the most conservative Quectel behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quirks {
    /// Whether the destination number is hex-encoded as UCS2 (true) or sent
    /// as plain ASCII digits (false). Default: true, per the open-question
    /// resolution — some Quectel firmwares require this when `CSCS="UCS2"`.
    pub hex_encode_destination: bool,
}

impl Default for Quirks {
    fn default() -> Self {
        Self {
            hex_encode_destination: true,
        }
    }
}

/// The 6-byte concatenation header: `05 00 03 RR TT SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatenationHeader {
    /// Reference number shared by every segment of one logical message.
    pub reference: u8,
    /// Total segment count.
    pub total: u8,
    /// 1-based index of this segment.
    pub sequence: u8,
}

impl ConcatenationHeader {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 6] {
        [0x05, 0x00, 0x03, self.reference, self.total, self.sequence]
    }
}

/// One outgoing segment: optional UDH plus its UCS2 code units, ready for
/// hex encoding.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: Option<ConcatenationHeader>,
    pub code_units: Vec<u16>,
}

/// An ordered plan for transmitting one logical message, possibly split
/// across several AT+CMGS dialogues.
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    /// Plan segments for `body`. Rejects an empty body before any AT
    /// dialogue begins (§4.3, §8 boundary behavior).
    pub fn plan(body: &str) -> Result<Self, SmsError> {
        if body.is_empty() {
            return Err(SmsError::EncodingRejected("empty message body".into()));
        }

        let units: Vec<u16> = body.encode_utf16().collect();
        if units.len() <= SINGLE_SEGMENT_LIMIT {
            return Ok(Self {
                segments: vec![Segment {
                    header: None,
                    code_units: units,
                }],
            });
        }

        let reference: u8 = rand::thread_rng().gen_range(1..=255);
        let chunks: Vec<&[u16]> = units.chunks(SEGMENT_CHUNK_SIZE).collect();
        let total = u8::try_from(chunks.len()).map_err(|_| {
            SmsError::EncodingRejected(format!(
                "message too long: {} segments exceeds 255",
                chunks.len()
            ))
        })?;

        let segments = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Segment {
                header: Some(ConcatenationHeader {
                    reference,
                    total,
                    #[allow(clippy::cast_possible_truncation)]
                    sequence: (i + 1) as u8,
                }),
                code_units: chunk.to_vec(),
            })
            .collect();

        Ok(Self { segments })
    }
}

/// Encode UTF-16BE code units to upper-case hex, 4 hex chars per unit.
#[must_use]
pub fn encode_ucs2_hex(units: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(units.len() * 2);
    for unit in units {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    hex::encode_upper(bytes)
}

/// Decode upper- or lower-case UCS2 hex back to UTF-16 code units.
pub fn decode_ucs2_hex(s: &str) -> Result<Vec<u16>, SmsError> {
    let bytes = hex::decode(s).map_err(|e| SmsError::EncodingRejected(format!("bad hex: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(SmsError::EncodingRejected(
            "odd-length UCS2 byte sequence".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect())
}

/// Hex-encode a segment's full wire payload: UDH bytes (if any) followed by
/// the UCS2 body, per §4.3's "`UDH_bytes ++ UCS2_bytes`" rule.
#[must_use]
pub fn encode_segment_hex(segment: &Segment) -> String {
    let mut bytes = Vec::new();
    if let Some(header) = segment.header {
        bytes.extend_from_slice(&header.to_bytes());
    }
    for unit in &segment.code_units {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    hex::encode_upper(bytes)
}

/// Encode a destination phone number for `AT+CMGS="<arg>"`.
///
/// When `quirks.hex_encode_destination` the digits (leading `+` stripped)
/// are UTF-16BE hex-encoded like the body; otherwise the plain ASCII digits
/// are used directly.
#[must_use]
pub fn encode_destination(phone: &str, quirks: Quirks) -> String {
    let digits: String = phone.chars().filter(|c| *c != '+').collect();
    if quirks.hex_encode_destination {
        let units: Vec<u16> = digits.encode_utf16().collect();
        encode_ucs2_hex(&units)
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_single_segment_at_the_boundary() {
        let body = "x".repeat(SINGLE_SEGMENT_LIMIT);
        let plan = SegmentPlan::plan(&body).unwrap();
        assert_eq!(plan.segments.len(), 1);
        assert!(plan.segments[0].header.is_none());
    }

    #[test]
    fn splits_into_two_segments_just_past_the_boundary() {
        let body = "x".repeat(SINGLE_SEGMENT_LIMIT + 1);
        let plan = SegmentPlan::plan(&body).unwrap();
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].code_units.len(), SEGMENT_CHUNK_SIZE);
        assert_eq!(plan.segments[1].code_units.len(), 4);
        let h0 = plan.segments[0].header.unwrap();
        let h1 = plan.segments[1].header.unwrap();
        assert_eq!(h0.reference, h1.reference);
        assert_eq!(h0.total, 2);
        assert_eq!((h0.sequence, h1.sequence), (1, 2));
    }

    #[test]
    fn long_chinese_body_splits_into_two_segments_with_shared_reference() {
        let body = "你好".repeat(50);
        assert_eq!(body.encode_utf16().count(), 100);
        let plan = SegmentPlan::plan(&body).unwrap();
        assert_eq!(plan.segments.len(), 2);
        let refs: Vec<u8> = plan
            .segments
            .iter()
            .map(|s| s.header.unwrap().reference)
            .collect();
        assert_eq!(refs[0], refs[1]);
    }

    #[test]
    fn rejects_empty_body() {
        let err = SegmentPlan::plan("").unwrap_err();
        assert!(matches!(err, SmsError::EncodingRejected(_)));
    }

    #[test]
    fn ucs2_hex_round_trips() {
        let units: Vec<u16> = "hi there".encode_utf16().collect();
        let hex = encode_ucs2_hex(&units);
        assert_eq!(hex, hex.to_uppercase());
        assert_eq!(hex.len() % 2, 0);
        let decoded = decode_ucs2_hex(&hex).unwrap();
        assert_eq!(decoded, units);
    }

    #[test]
    fn destination_defaults_to_hex_encoded() {
        let encoded = encode_destination("+15551234567", Quirks::default());
        assert_eq!(encoded, "00310035003500350031003200330034003500360037");
    }

    #[test]
    fn destination_passes_through_digits_without_hex_quirk() {
        let encoded = encode_destination(
            "+15551234567",
            Quirks {
                hex_encode_destination: false,
            },
        );
        assert_eq!(encoded, "15551234567");
    }

    #[test]
    fn cms_error_kind_classifies_known_codes() {
        use crate::error::CmsErrorKind;
        assert_eq!(CmsErrorKind::from_code(23), CmsErrorKind::PayloadTooLong);
        assert_eq!(CmsErrorKind::from_code(300), CmsErrorKind::InvalidDestination);
        assert_eq!(CmsErrorKind::from_code(500), CmsErrorKind::Unspecified);
        assert_eq!(CmsErrorKind::from_code(29), CmsErrorKind::SimLocked);
        assert_eq!(CmsErrorKind::from_code(9999), CmsErrorKind::Unknown(9999));
    }
}
