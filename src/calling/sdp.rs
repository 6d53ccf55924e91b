//! Minimal SDP offer/answer generation and parsing.
//!
//! Descriptions carry one m-line per media kind, BUNDLEd onto a single ICE
//! transport (one ufrag/pwd pair at session level). Candidates are trickled
//! separately, so generated descriptions contain none; any `a=candidate`
//! lines in a received description are still picked up.

use std::fmt::Write;

use super::ice::Candidate;
use super::media::TrackKind;
use super::transport::TransportError;

/// Media direction attribute of an m-line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_attr(self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn from_attr(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// Whether the side that wrote this line sends media.
    pub fn sends(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    pub kind: TrackKind,
    pub mid: String,
    pub direction: Direction,
}

/// The parts of a description the transports care about.
#[derive(Debug, Clone)]
pub struct ParsedSdp {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub media: Vec<MediaLine>,
    pub candidates: Vec<Candidate>,
}

impl ParsedSdp {
    /// Kinds of media the author of this description will send.
    pub fn sent_kinds(&self) -> Vec<TrackKind> {
        self.media
            .iter()
            .filter(|m| m.direction.sends())
            .map(|m| m.kind)
            .collect()
    }
}

/// Random lowercase hex string of `bytes * 2` characters from the OS CSPRNG.
fn random_hex(bytes: usize) -> Result<String, TransportError> {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf)
        .map_err(|e| TransportError::Io(format!("OS random source failed: {}", e)))?;
    let mut s = String::with_capacity(bytes * 2);
    for b in &buf {
        let _ = write!(s, "{:02x}", b);
    }
    Ok(s)
}

/// Random 8-character ICE username fragment.
pub fn generate_ice_ufrag() -> Result<String, TransportError> {
    random_hex(4)
}

/// Random 24-character ICE password (hex, so no characters parsers reject).
pub fn generate_ice_pwd() -> Result<String, TransportError> {
    random_hex(12)
}

/// Media lines for an offer sending `kinds`.
pub fn offer_media(kinds: &[TrackKind]) -> Vec<MediaLine> {
    let mut lines = Vec::new();
    for kind in [TrackKind::Audio, TrackKind::Video] {
        if kinds.contains(&kind) {
            lines.push(MediaLine {
                kind,
                mid: lines.len().to_string(),
                direction: Direction::SendRecv,
            });
        }
    }
    lines
}

/// Media lines answering `offer` while sending `kinds`.
///
/// Mirrors the offer's m-lines; kinds we have no track for are receive-only.
pub fn answer_media(offer: &ParsedSdp, kinds: &[TrackKind]) -> Vec<MediaLine> {
    offer
        .media
        .iter()
        .map(|m| {
            let sending = kinds.contains(&m.kind);
            let direction = match (sending, m.direction.sends()) {
                (true, true) => Direction::SendRecv,
                (true, false) => Direction::SendOnly,
                (false, true) => Direction::RecvOnly,
                (false, false) => Direction::Inactive,
            };
            MediaLine {
                kind: m.kind,
                mid: m.mid.clone(),
                direction,
            }
        })
        .collect()
}

/// Render a description.
pub fn build(session_id: u64, ice_ufrag: &str, ice_pwd: &str, media: &[MediaLine]) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    let _ = write!(sdp, "o=- {} 2 IN IP4 127.0.0.1\r\n", session_id);
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");
    if !media.is_empty() {
        let mids: Vec<&str> = media.iter().map(|m| m.mid.as_str()).collect();
        let _ = write!(sdp, "a=group:BUNDLE {}\r\n", mids.join(" "));
    }
    let _ = write!(sdp, "a=ice-ufrag:{}\r\n", ice_ufrag);
    let _ = write!(sdp, "a=ice-pwd:{}\r\n", ice_pwd);
    sdp.push_str("a=ice-options:trickle\r\n");

    for m in media {
        match m.kind {
            TrackKind::Audio => {
                sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
                sdp.push_str("c=IN IP4 0.0.0.0\r\n");
                let _ = write!(sdp, "a=mid:{}\r\n", m.mid);
                let _ = write!(sdp, "a={}\r\n", m.direction.as_attr());
                sdp.push_str("a=rtcp-mux\r\n");
                sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
            }
            TrackKind::Video => {
                sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
                sdp.push_str("c=IN IP4 0.0.0.0\r\n");
                let _ = write!(sdp, "a=mid:{}\r\n", m.mid);
                let _ = write!(sdp, "a={}\r\n", m.direction.as_attr());
                sdp.push_str("a=rtcp-mux\r\n");
                sdp.push_str("a=rtpmap:96 VP8/90000\r\n");
            }
        }
    }
    sdp
}

/// Parse a description, requiring ICE credentials.
///
/// Unknown m-line kinds (e.g. `application`) are skipped. Credentials may
/// sit at session level or inside the first m-line.
pub fn parse(sdp: &str) -> Result<ParsedSdp, TransportError> {
    let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("v=0") {
        return Err(TransportError::InvalidDescription(
            "description must start with v=0".into(),
        ));
    }

    let mut ice_ufrag = None;
    let mut ice_pwd = None;
    let mut media: Vec<MediaLine> = Vec::new();
    let mut candidates = Vec::new();
    // Whether the current m-line is one we track.
    let mut in_known_media = false;

    for line in lines {
        if let Some(rest) = line.strip_prefix("m=") {
            let kind = match rest.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
            in_known_media = kind.is_some();
            if let Some(kind) = kind {
                media.push(MediaLine {
                    kind,
                    mid: media.len().to_string(),
                    direction: Direction::SendRecv,
                });
            }
        } else if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
            ice_ufrag.get_or_insert_with(|| v.to_string());
        } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
            ice_pwd.get_or_insert_with(|| v.to_string());
        } else if line.starts_with("a=candidate:") {
            match Candidate::parse(line) {
                Ok(c) => candidates.push(c),
                Err(e) => tracing::debug!("Ignoring SDP candidate: {}", e),
            }
        } else if let Some(attr) = line.strip_prefix("a=") {
            if !in_known_media {
                continue;
            }
            let Some(current) = media.last_mut() else {
                continue;
            };
            if let Some(mid) = attr.strip_prefix("mid:") {
                current.mid = mid.to_string();
            } else if let Some(dir) = Direction::from_attr(attr) {
                current.direction = dir;
            }
        }
    }

    let ice_ufrag = ice_ufrag
        .ok_or_else(|| TransportError::InvalidDescription("missing a=ice-ufrag".into()))?;
    let ice_pwd =
        ice_pwd.ok_or_else(|| TransportError::InvalidDescription("missing a=ice-pwd".into()))?;

    Ok(ParsedSdp {
        ice_ufrag,
        ice_pwd,
        media,
        candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_offer_parses() {
        let media = offer_media(&[TrackKind::Video, TrackKind::Audio]);
        let sdp = build(7, "ufrag1", "0123456789abcdef01234567", &media);
        assert!(sdp.contains("a=group:BUNDLE 0 1\r\n"));

        let parsed = parse(&sdp).unwrap();
        assert_eq!(parsed.ice_ufrag, "ufrag1");
        assert_eq!(parsed.media.len(), 2);
        assert_eq!(parsed.media[0].kind, TrackKind::Audio);
        assert_eq!(parsed.media[1].mid, "1");
        assert_eq!(parsed.sent_kinds(), vec![TrackKind::Audio, TrackKind::Video]);
    }

    #[test]
    fn test_audio_only_answer_to_video_offer() {
        let offer = parse(&build(
            1,
            "a",
            "pwdpwdpwdpwdpwdpwdpwdpwd",
            &offer_media(&[TrackKind::Audio, TrackKind::Video]),
        ))
        .unwrap();
        let answer = answer_media(&offer, &[TrackKind::Audio]);
        assert_eq!(answer[0].direction, Direction::SendRecv);
        assert_eq!(answer[1].direction, Direction::RecvOnly);

        let parsed = parse(&build(2, "b", "pwdpwdpwdpwdpwdpwdpwdpwd", &answer)).unwrap();
        assert_eq!(parsed.sent_kinds(), vec![TrackKind::Audio]);
    }

    #[test]
    fn test_parse_browser_style_offer() {
        let sdp = "\
v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1 2\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 63\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:Jq4x\r\n\
a=ice-pwd:asd88fgpdd777uzjYhagZg0a\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=candidate:842163049 1 udp 1677729535 203.0.113.7 61665 typ srflx raddr 10.0.0.2 rport 61665\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:1\r\n\
a=sendrecv\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:2\r\n\
a=recvonly\r\n";
        let parsed = parse(sdp).unwrap();
        assert_eq!(parsed.ice_ufrag, "Jq4x");
        assert_eq!(parsed.media.len(), 2);
        assert_eq!(parsed.media[1].mid, "2");
        assert_eq!(parsed.media[1].direction, Direction::RecvOnly);
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.candidates[0].port, 61665);
        assert_eq!(parsed.sent_kinds(), vec![TrackKind::Audio]);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = parse("v=0\r\nm=audio 9 RTP/AVP 0\r\n").unwrap_err();
        assert!(matches!(err, TransportError::InvalidDescription(_)));
        assert!(parse("hello").is_err());
    }

    #[test]
    fn test_generated_credentials() {
        let ufrag = generate_ice_ufrag().unwrap();
        let pwd = generate_ice_pwd().unwrap();
        assert_eq!(ufrag.len(), 8);
        assert_eq!(pwd.len(), 24);
        assert!(pwd.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(ufrag, generate_ice_ufrag().unwrap());
    }
}
