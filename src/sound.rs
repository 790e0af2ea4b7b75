//! Splits a sound node's payload into header and body, and MIME-sniffs the
//! body by magic bytes (§4.6).

use crate::error::Result;
use crate::tree::{NodeData, NodeId, SoundProvenance, Tree};

/// A guessed audio container MIME type, from [`sniff_mime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mime {
    Wav,
    Ogg,
    Mpeg,
}

impl Mime {
    pub const fn as_str(self) -> &'static str {
        match self {
            Mime::Wav => "audio/wav",
            Mime::Ogg => "audio/ogg",
            Mime::Mpeg => "audio/mpeg",
        }
    }
}

/// Guesses a MIME type from leading magic bytes, per the table in §4.6.
/// Exposed standalone (SPEC_FULL §F.4) so a host can sniff an arbitrary byte
/// slice — e.g. a freshly recorded clip — without building a tree node.
pub fn sniff_mime(data: &[u8]) -> Mime {
    if data.starts_with(b"RIFF") {
        Mime::Wav
    } else if data.starts_with(b"OggS") {
        Mime::Ogg
    } else {
        Mime::Mpeg
    }
}

/// Returns a sound node's opaque audio body and its MIME guess (§6.1
/// `extract_sound`). The header block is retained on the node for re-emit
/// but is not interpreted here.
pub fn extract_sound(tree: &Tree, node: NodeId) -> Result<(Vec<u8>, Mime)> {
    let NodeData::Sound { provenance, .. } = &tree.get(node).data else {
        return Ok((Vec::new(), Mime::Mpeg));
    };
    let Some(SoundProvenance {
        buffer,
        data_offset,
        data_len,
        ..
    }) = provenance
    else {
        return Ok((Vec::new(), Mime::Mpeg));
    };
    let data = buffer[*data_offset..*data_offset + *data_len].to_vec();
    let mime = sniff_mime(&data);
    Ok((data, mime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_known_magic_bytes() {
        assert_eq!(sniff_mime(b"RIFF....WAVEfmt "), Mime::Wav);
        assert_eq!(sniff_mime(b"OggS\x00\x02"), Mime::Ogg);
        assert_eq!(sniff_mime(b"\xFF\xFB\x90\x00"), Mime::Mpeg);
        assert_eq!(sniff_mime(&[]), Mime::Mpeg);
    }
}
