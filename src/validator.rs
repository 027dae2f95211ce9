//! Stateless input validation for data arriving on the client->PTY path.
//!
//! Mirrors the size-cap and UTF-8 checks in `security.rs`, extended with the
//! escape-sequence denylist the specification requires: an OSC sequence
//! (`ESC ]`) that is not terminated within the chunk can hijack the
//! terminal, so it is rejected. Binary input that simply fails UTF-8
//! decoding is *not* rejected — terminal semantics require passing arbitrary
//! control bytes (including 0x03, 0x04) straight through.

use crate::error::ValidationError;

const ESC: u8 = 0x1b;
const OSC_INTRODUCER: u8 = b']';
const BEL: u8 = 0x07;

/// Validate an inbound chunk against the size cap and escape-sequence
/// denylist. Returns `Ok(())` if the chunk may be written to the PTY.
pub fn validate(chunk: &[u8], max_bytes: usize) -> Result<(), ValidationError> {
    if chunk.len() > max_bytes {
        return Err(ValidationError::Oversize);
    }

    if has_unterminated_osc(chunk) {
        return Err(ValidationError::UnsafeEscape);
    }

    Ok(())
}

/// An OSC sequence starts `ESC ]` and is terminated either by BEL (`0x07`)
/// or the two-byte ST (`ESC \`). If the chunk contains the introducer but no
/// terminator before the chunk ends, the sequence is unterminated and
/// therefore unsafe to forward as-is.
fn has_unterminated_osc(chunk: &[u8]) -> bool {
    let mut i = 0;
    while i + 1 < chunk.len() {
        if chunk[i] == ESC && chunk[i + 1] == OSC_INTRODUCER {
            let rest = &chunk[i + 2..];
            if !osc_terminated(rest) {
                return true;
            }
            // Skip past a terminated OSC and keep scanning for another.
            i += 2;
            continue;
        }
        i += 1;
    }
    // A trailing lone ESC with nothing after it cannot be classified as an
    // OSC sequence yet; it is not itself a denylisted pattern.
    false
}

fn osc_terminated(rest: &[u8]) -> bool {
    let mut j = 0;
    while j < rest.len() {
        if rest[j] == BEL {
            return true;
        }
        if rest[j] == ESC && j + 1 < rest.len() && rest[j + 1] == b'\\' {
            return true;
        }
        j += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_cap() {
        let chunk = vec![b'a'; 2048];
        assert!(validate(&chunk, 2048).is_ok());
    }

    #[test]
    fn rejects_one_over_cap() {
        let chunk = vec![b'a'; 2049];
        assert_eq!(validate(&chunk, 2048), Err(ValidationError::Oversize));
    }

    #[test]
    fn accepts_plain_text() {
        assert!(validate(b"ls -la\n", 2048).is_ok());
    }

    #[test]
    fn accepts_raw_control_bytes() {
        assert!(validate(&[0x03], 2048).is_ok());
        assert!(validate(&[0x04], 2048).is_ok());
    }

    #[test]
    fn accepts_binary_non_utf8_input() {
        let chunk = [0xff, 0xfe, 0x00, 0x01];
        assert!(validate(&chunk, 2048).is_ok());
    }

    #[test]
    fn accepts_osc_terminated_by_bel() {
        let mut chunk = vec![ESC, OSC_INTRODUCER];
        chunk.extend_from_slice(b"0;title");
        chunk.push(BEL);
        assert!(validate(&chunk, 2048).is_ok());
    }

    #[test]
    fn accepts_osc_terminated_by_st() {
        let mut chunk = vec![ESC, OSC_INTRODUCER];
        chunk.extend_from_slice(b"0;title");
        chunk.push(ESC);
        chunk.push(b'\\');
        assert!(validate(&chunk, 2048).is_ok());
    }

    #[test]
    fn rejects_unterminated_osc() {
        let mut chunk = vec![ESC, OSC_INTRODUCER];
        chunk.extend_from_slice(b"0;evil-title-with-no-terminator");
        assert_eq!(validate(&chunk, 2048), Err(ValidationError::UnsafeEscape));
    }
}
