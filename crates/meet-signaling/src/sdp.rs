//! Text transforms applied to session descriptions before they reach the
//! negotiation engine.
//!
//! Both transforms work line by line on CRLF-delimited text and leave every
//! line they do not target byte-for-byte intact. Neither can fail: when the
//! line they look for is missing, the input comes back unchanged.

const LINE_BREAK: &str = "\r\n";
const VIDEO_MEDIA_LINE: &str = "m=video ";
const AUDIO_CODEC_PARAM_BITRATE: &str = "maxaveragebitrate";

/// Moves every payload type whose rtpmap names `codec` to the front of the
/// video media line.
pub fn prefer_codec(sdp: &str, codec: &str) -> String {
    let lines: Vec<&str> = sdp.split(LINE_BREAK).collect();
    let Some(m_index) = lines
        .iter()
        .position(|line| line.starts_with(VIDEO_MEDIA_LINE))
    else {
        tracing::debug!(target: "meet::sdp", codec, "no video media line; codec preference skipped");
        return sdp.to_owned();
    };

    let section_end = lines[m_index + 1..]
        .iter()
        .position(|line| line.starts_with("m="))
        .map(|offset| m_index + 1 + offset)
        .unwrap_or(lines.len());
    let preferred: Vec<&str> = lines[m_index + 1..section_end]
        .iter()
        .filter_map(|line| rtpmap_payload_type(line, codec))
        .collect();
    if preferred.is_empty() {
        tracing::debug!(target: "meet::sdp", codec, "no payload types for codec");
        return sdp.to_owned();
    }

    let Some(m_line) = move_payload_types_to_front(&preferred, lines[m_index]) else {
        return sdp.to_owned();
    };
    lines
        .iter()
        .enumerate()
        .map(|(index, line)| if index == m_index { m_line.as_str() } else { *line })
        .collect::<Vec<_>>()
        .join(LINE_BREAK)
}

/// Adds an audio start bitrate for `codec`, either by extending its existing
/// format-parameter line or by inserting one right after its rtpmap line.
pub fn set_start_bitrate(sdp: &str, codec: &str, kbps: u32) -> String {
    let mut lines: Vec<String> = sdp.split(LINE_BREAK).map(str::to_owned).collect();
    let Some((rtpmap_index, payload_type)) = lines.iter().enumerate().find_map(|(index, line)| {
        rtpmap_payload_type(line, codec).map(|pt| (index, pt.to_owned()))
    }) else {
        tracing::debug!(target: "meet::sdp", codec, "no rtpmap for codec; bitrate untouched");
        return sdp.to_owned();
    };

    let bitrate = kbps.saturating_mul(1000);
    let fmtp_prefix = format!("a=fmtp:{payload_type} ");
    match lines.iter().position(|line| line.starts_with(&fmtp_prefix)) {
        Some(index) => {
            if has_param(&lines[index][fmtp_prefix.len()..], AUDIO_CODEC_PARAM_BITRATE) {
                return sdp.to_owned();
            }
            lines[index].push_str(&format!("; {AUDIO_CODEC_PARAM_BITRATE}={bitrate}"));
            tracing::debug!(target: "meet::sdp", line = %lines[index], "updated fmtp line");
        }
        None => {
            let line = format!("{fmtp_prefix}{AUDIO_CODEC_PARAM_BITRATE}={bitrate}");
            tracing::debug!(target: "meet::sdp", line = %line, "inserted fmtp line");
            lines.insert(rtpmap_index + 1, line);
        }
    }
    lines.join(LINE_BREAK)
}

/// Matches `a=rtpmap:<pt> <codec>/<clock>[/<params>]` and returns `<pt>`.
fn rtpmap_payload_type<'a>(line: &'a str, codec: &str) -> Option<&'a str> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let (payload_type, encoding) = rest.split_once(' ')?;
    if !is_number(payload_type) {
        return None;
    }
    let (name, clock) = encoding.split_once('/')?;
    if !name.eq_ignore_ascii_case(codec) {
        return None;
    }
    clock.split('/').all(is_number).then_some(payload_type)
}

fn move_payload_types_to_front(preferred: &[&str], m_line: &str) -> Option<String> {
    // m=<media> <port> <proto> <fmt> ...
    let parts: Vec<&str> = m_line.split(' ').collect();
    if parts.len() <= 3 {
        tracing::warn!(target: "meet::sdp", m_line, "malformed media description line");
        return None;
    }
    let (header, formats) = parts.split_at(3);
    let mut reordered: Vec<&str> = header.to_vec();
    reordered.extend(formats.iter().copied().filter(|pt| preferred.contains(pt)));
    reordered.extend(formats.iter().copied().filter(|pt| !preferred.contains(pt)));
    Some(reordered.join(" "))
}

fn has_param(params: &str, name: &str) -> bool {
    params
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .any(|(key, _)| key.trim() == name)
}

fn is_number(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdp(lines: &[&str]) -> String {
        let mut text = lines.join(LINE_BREAK);
        text.push_str(LINE_BREAK);
        text
    }

    fn offer_with_video(m_line: &str) -> String {
        sdp(&[
            "v=0",
            "o=- 4611731400430051336 2 IN IP4 127.0.0.1",
            "s=-",
            "t=0 0",
            "m=audio 9 UDP/TLS/RTP/SAVPF 111 103",
            "a=rtpmap:111 opus/48000/2",
            "a=fmtp:111 minptime=10;useinbandfec=1",
            "a=rtpmap:103 ISAC/16000",
            m_line,
            "a=rtpmap:96 VP8/90000",
            "a=rtpmap:97 rtx/90000",
            "a=fmtp:97 apt=96",
            "a=rtpmap:98 VP8/90000",
        ])
    }

    #[test]
    fn prefer_codec_moves_matching_payload_types_forward() {
        let input = offer_with_video("m=video 9 UDP/TLS/RTP/SAVPF 96 97 98");
        let output = prefer_codec(&input, "VP8");
        assert!(output.contains("\r\nm=video 9 UDP/TLS/RTP/SAVPF 96 98 97\r\n"));
        assert_eq!(
            output.replace("96 98 97", "96 97 98"),
            input,
            "only the media line changes"
        );
    }

    #[test]
    fn prefer_codec_keeps_relative_order_of_the_rest() {
        let input = offer_with_video("m=video 9 UDP/TLS/RTP/SAVPF 97 100 98 101 96");
        let output = prefer_codec(&input, "vp8");
        assert!(output.contains("m=video 9 UDP/TLS/RTP/SAVPF 98 96 97 100 101\r\n"));
    }

    #[test]
    fn prefer_codec_is_idempotent() {
        let input = offer_with_video("m=video 9 UDP/TLS/RTP/SAVPF 97 96 98");
        let once = prefer_codec(&input, "VP8");
        let twice = prefer_codec(&once, "VP8");
        assert_eq!(once, twice);
    }

    #[test]
    fn prefer_codec_without_video_or_codec_is_a_no_op() {
        let audio_only = sdp(&["v=0", "m=audio 9 RTP/SAVPF 111", "a=rtpmap:111 opus/48000/2"]);
        assert_eq!(prefer_codec(&audio_only, "VP8"), audio_only);

        let input = offer_with_video("m=video 9 UDP/TLS/RTP/SAVPF 96 97 98");
        assert_eq!(prefer_codec(&input, "H264"), input);

        let truncated = sdp(&["m=video 9 RTP/SAVPF", "a=rtpmap:96 VP8/90000"]);
        assert_eq!(prefer_codec(&truncated, "VP8"), truncated);
    }

    #[test]
    fn prefer_codec_ignores_rtpmaps_of_other_sections() {
        let input = sdp(&[
            "m=video 9 RTP/SAVPF 100 101",
            "a=rtpmap:100 H264/90000",
            "a=rtpmap:101 rtx/90000",
            "m=application 9 DTLS/SCTP 5000",
            "a=rtpmap:101 VP8/90000",
        ]);
        assert_eq!(prefer_codec(&input, "VP8"), input);
    }

    #[test]
    fn set_start_bitrate_extends_existing_fmtp_line() {
        let input = offer_with_video("m=video 9 UDP/TLS/RTP/SAVPF 96 97 98");
        let output = set_start_bitrate(&input, "opus", 32);
        assert_eq!(
            output,
            input.replace(
                "a=fmtp:111 minptime=10;useinbandfec=1\r\n",
                "a=fmtp:111 minptime=10;useinbandfec=1; maxaveragebitrate=32000\r\n"
            )
        );
    }

    #[test]
    fn set_start_bitrate_inserts_fmtp_after_rtpmap() {
        let input = sdp(&[
            "v=0",
            "m=audio 9 RTP/SAVPF 111 0",
            "a=rtpmap:111 opus/48000/2",
            "a=rtpmap:0 PCMU/8000",
        ]);
        let output = set_start_bitrate(&input, "opus", 32);
        assert_eq!(
            output,
            sdp(&[
                "v=0",
                "m=audio 9 RTP/SAVPF 111 0",
                "a=rtpmap:111 opus/48000/2",
                "a=fmtp:111 maxaveragebitrate=32000",
                "a=rtpmap:0 PCMU/8000",
            ])
        );
    }

    #[test]
    fn set_start_bitrate_handles_rtpmap_on_last_line() {
        let input = sdp(&["m=audio 9 RTP/SAVPF 111", "a=rtpmap:111 opus/48000/2"]);
        let output = set_start_bitrate(&input, "opus", 64);
        assert_eq!(
            output,
            sdp(&[
                "m=audio 9 RTP/SAVPF 111",
                "a=rtpmap:111 opus/48000/2",
                "a=fmtp:111 maxaveragebitrate=64000",
            ])
        );
    }

    #[test]
    fn set_start_bitrate_never_duplicates_the_parameter() {
        let input = offer_with_video("m=video 9 UDP/TLS/RTP/SAVPF 96 97 98");
        let once = set_start_bitrate(&input, "opus", 32);
        let twice = set_start_bitrate(&once, "opus", 32);
        assert_eq!(once, twice);
        assert_eq!(twice.matches(AUDIO_CODEC_PARAM_BITRATE).count(), 1);

        let bare = sdp(&["m=audio 9 RTP/SAVPF 111", "a=rtpmap:111 opus/48000/2"]);
        let inserted = set_start_bitrate(&set_start_bitrate(&bare, "opus", 32), "opus", 32);
        assert_eq!(inserted.matches(AUDIO_CODEC_PARAM_BITRATE).count(), 1);
    }

    #[test]
    fn set_start_bitrate_without_codec_is_a_no_op() {
        let input = sdp(&["v=0", "m=audio 9 RTP/SAVPF 0", "a=rtpmap:0 PCMU/8000"]);
        assert_eq!(set_start_bitrate(&input, "opus", 32), input);
    }

    #[test]
    fn rtpmap_matching_requires_numeric_clock() {
        assert_eq!(rtpmap_payload_type("a=rtpmap:96 VP8/90000", "VP8"), Some("96"));
        assert_eq!(rtpmap_payload_type("a=rtpmap:111 opus/48000/2", "opus"), Some("111"));
        assert_eq!(rtpmap_payload_type("a=rtpmap:96 VP8", "VP8"), None);
        assert_eq!(rtpmap_payload_type("a=rtpmap:96 VP8/abc", "VP8"), None);
        assert_eq!(rtpmap_payload_type("a=rtpmap:x VP8/90000", "VP8"), None);
        assert_eq!(rtpmap_payload_type("a=rtpmap:96 VP9/90000", "VP8"), None);
    }
}
