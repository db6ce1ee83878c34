//! Oversized wire frames travel as a count frame followed by that many
//! continuation frames; the receiver stitches them back together.

/// Frames above this size are split before hitting the socket.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;

/// A frame this short consisting only of digits announces a segmented
/// message.
const MAX_COUNT_DIGITS: usize = 6;

pub fn split_outgoing(payload: String, max_frame_bytes: usize) -> Vec<String> {
    if payload.len() <= max_frame_bytes {
        return vec![payload];
    }

    let mut segments = Vec::new();
    let mut rest = payload.as_str();
    while !rest.is_empty() {
        let mut cut = rest.len().min(max_frame_bytes);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        segments.push(head.to_string());
        rest = tail;
    }

    let mut frames = Vec::with_capacity(segments.len() + 1);
    frames.push(segments.len().to_string());
    frames.extend(segments);
    frames
}

/// Reassembles segmented messages on the receive side.
#[derive(Default, Debug)]
pub struct FrameReassembler {
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    remaining: usize,
    buffer: String,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one incoming frame; returns a complete message when available.
    pub fn push(&mut self, frame: String) -> Option<String> {
        if let Some(mut pending) = self.pending.take() {
            pending.buffer.push_str(&frame);
            pending.remaining -= 1;
            if pending.remaining == 0 {
                return Some(pending.buffer);
            }
            self.pending = Some(pending);
            return None;
        }

        if frame.len() <= MAX_COUNT_DIGITS && !frame.is_empty() {
            if let Ok(count) = frame.parse::<usize>() {
                if count > 0 {
                    self.pending = Some(Pending {
                        remaining: count,
                        buffer: String::new(),
                    });
                    return None;
                }
            }
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_frames_pass_through() {
        assert_eq!(
            split_outgoing("{\"t\":\"d\"}".to_string(), MAX_FRAME_BYTES),
            vec!["{\"t\":\"d\"}".to_string()]
        );

        let mut reassembler = FrameReassembler::new();
        assert_eq!(
            reassembler.push("{\"x\":1}".to_string()),
            Some("{\"x\":1}".to_string())
        );
    }

    #[test]
    fn large_frames_round_trip() {
        let payload = "x".repeat(40_000);
        let frames = split_outgoing(payload.clone(), MAX_FRAME_BYTES);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], "3");

        let mut reassembler = FrameReassembler::new();
        let mut result = None;
        for frame in frames {
            result = reassembler.push(frame);
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn split_respects_char_boundaries() {
        let payload = "é".repeat(10_000);
        let frames = split_outgoing(payload.clone(), 1024);
        let mut reassembler = FrameReassembler::new();
        let mut result = None;
        for frame in frames {
            result = reassembler.push(frame);
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn numeric_payload_messages_survive_after_reassembly() {
        // A digits-only frame announces segmentation, so a real message of
        // "2" must arrive inside a segmented batch to be unambiguous.
        let mut reassembler = FrameReassembler::new();
        assert_eq!(reassembler.push("1".to_string()), None);
        assert_eq!(reassembler.push("2".to_string()), Some("2".to_string()));
    }
}
