//! SDP codec preference rewriting
//!
//! The gateway honors the payload-type order of the `m=video` line, so the
//! offer is rewritten to list the preferred codec's payload types first.
//! The transform is pure and best-effort: an SDP without a video section or
//! without the target codec is returned unchanged.

/// Reorder the video media line so payload types mapped to `codec` come
/// first. Relative order is preserved within both the preferred and the
/// remaining group.
pub fn prefer_codec(sdp: &str, codec: &str) -> String {
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = sdp.split(newline).collect();

    let video_idx = match lines.iter().position(|l| l.starts_with("m=video ")) {
        Some(i) => i,
        None => return sdp.to_string(),
    };

    // Section runs until the next m= line or end of document.
    let section_end = lines[video_idx + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|off| video_idx + 1 + off)
        .unwrap_or(lines.len());

    let preferred = collect_payload_types(&lines[video_idx + 1..section_end], codec);
    if preferred.is_empty() {
        return sdp.to_string();
    }

    let media_line = match reorder_media_line(lines[video_idx], &preferred) {
        Some(l) => l,
        None => return sdp.to_string(),
    };

    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    out[video_idx] = media_line;
    out.join(newline)
}

/// Payload types whose rtpmap names `codec` (case-insensitive), in order of
/// appearance.
fn collect_payload_types(section: &[&str], codec: &str) -> Vec<String> {
    let mut pts = Vec::new();
    for line in section {
        let rest = match line.strip_prefix("a=rtpmap:") {
            Some(r) => r,
            None => continue,
        };
        let mut parts = rest.splitn(2, ' ');
        let pt = match parts.next() {
            Some(p) if !p.is_empty() => p,
            _ => continue,
        };
        let encoding = parts.next().unwrap_or("");
        let name = encoding.split('/').next().unwrap_or("");
        if name.eq_ignore_ascii_case(codec) {
            pts.push(pt.to_string());
        }
    }
    pts
}

/// Rebuild `m=video <port> <proto> <fmt list>` with `preferred` first.
fn reorder_media_line(line: &str, preferred: &[String]) -> Option<String> {
    let fields: Vec<&str> = line.split(' ').collect();
    // m=video, port, proto, then at least one payload type
    if fields.len() < 4 {
        return None;
    }
    let (head, fmts) = fields.split_at(3);

    let mut front: Vec<&str> = Vec::new();
    let mut back: Vec<&str> = Vec::new();
    for fmt in fmts {
        if preferred.iter().any(|p| p == fmt) {
            front.push(fmt);
        } else {
            back.push(fmt);
        }
    }
    if front.is_empty() {
        return None;
    }

    let mut out = head.to_vec();
    out.extend(front);
    out.extend(back);
    Some(out.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96 97 98\r\n\
        a=rtpmap:96 VP8/90000\r\n\
        a=rtpmap:97 H264/90000\r\n\
        a=fmtp:97 packetization-mode=1\r\n\
        a=rtpmap:98 VP9/90000\r\n";

    #[test]
    fn moves_target_codec_first() {
        let out = prefer_codec(OFFER, "H264");
        assert!(out.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 96 98"));
        // Audio line untouched
        assert!(out.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111"));
    }

    #[test]
    fn preserves_relative_order_of_others() {
        let sdp = OFFER.replace("96 97 98", "98 97 96");
        let out = prefer_codec(&sdp, "H264");
        assert!(out.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 98 96"));
    }

    #[test]
    fn idempotent() {
        let once = prefer_codec(OFFER, "H264");
        let twice = prefer_codec(&once, "H264");
        assert_eq!(once, twice);
    }

    #[test]
    fn multiple_payload_types_for_codec() {
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99\r\n\
            a=rtpmap:96 VP8/90000\r\n\
            a=rtpmap:97 H264/90000\r\n\
            a=rtpmap:98 VP9/90000\r\n\
            a=rtpmap:99 H264/90000\r\n";
        let out = prefer_codec(sdp, "H264");
        assert!(out.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 99 96 98"));
    }

    #[test]
    fn no_video_section_is_identity() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n";
        assert_eq!(prefer_codec(sdp, "H264"), sdp);
    }

    #[test]
    fn missing_codec_is_identity() {
        assert_eq!(prefer_codec(OFFER, "AV1"), OFFER);
    }

    #[test]
    fn malformed_input_is_identity() {
        assert_eq!(prefer_codec("", "H264"), "");
        assert_eq!(prefer_codec("garbage", "H264"), "garbage");
        let truncated = "m=video 9\r\na=rtpmap:97 H264/90000\r\n";
        assert_eq!(prefer_codec(truncated, "H264"), truncated);
    }

    #[test]
    fn codec_match_is_case_insensitive() {
        let out = prefer_codec(OFFER, "h264");
        assert!(out.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 96 98"));
    }

    #[test]
    fn plain_lf_line_endings() {
        let sdp = OFFER.replace("\r\n", "\n");
        let out = prefer_codec(&sdp, "H264");
        assert!(out.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 96 98"));
        assert!(!out.contains('\r'));
    }
}
