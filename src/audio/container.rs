//! # WAV Container Handling
//!
//! Browser recorders deliver audio either as complete RIFF/WAVE containers or
//! as bare 16-bit PCM. Transcription providers expect one well-formed container
//! per request, so chunks are normalised here:
//!
//! - **Header synthesis**: bare PCM gets a minimal mono 16-bit PCM header
//! - **Concatenation**: the first chunk keeps its header, later chunks lose theirs
//! - **Size repair**: RIFF and `data` size fields are rewritten to the real length

use byteorder::{ByteOrder, LittleEndian};

/// Length of the canonical PCM WAV header produced by [`pcm_header`].
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;
const CHANNELS: u16 = 1;

/// Check whether the bytes start with a RIFF/WAVE container header.
pub fn has_wav_header(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Build a mono 16-bit PCM header describing `payload_len` bytes of samples.
pub fn pcm_header(payload_len: usize, sample_rate: u32) -> [u8; WAV_HEADER_LEN] {
    let payload_len = clamp_u32(payload_len);
    let block_align = CHANNELS * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * u32::from(block_align);

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut header[4..8], payload_len.saturating_add(36));
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], 16);
    LittleEndian::write_u16(&mut header[20..22], 1); // PCM
    LittleEndian::write_u16(&mut header[22..24], CHANNELS);
    LittleEndian::write_u32(&mut header[24..28], sample_rate);
    LittleEndian::write_u32(&mut header[28..32], byte_rate);
    LittleEndian::write_u16(&mut header[32..34], block_align);
    LittleEndian::write_u16(&mut header[34..36], BITS_PER_SAMPLE);
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], payload_len);
    header
}

/// Return the bytes wrapped in a container, synthesizing a header when missing.
pub fn ensure_container(bytes: Vec<u8>, sample_rate: u32) -> Vec<u8> {
    if has_wav_header(&bytes) {
        return bytes;
    }

    let mut wrapped = Vec::with_capacity(WAV_HEADER_LEN + bytes.len());
    wrapped.extend_from_slice(&pcm_header(bytes.len(), sample_rate));
    wrapped.extend_from_slice(&bytes);
    wrapped
}

/// Locate the `data` chunk.
///
/// Returns `(size_field_offset, payload_offset)`. Walks the chunk list instead of
/// assuming 44 bytes, since recorders may emit `LIST` or `fact` chunks first.
pub fn data_chunk_offsets(bytes: &[u8]) -> Option<(usize, usize)> {
    if !has_wav_header(bytes) {
        return None;
    }

    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        if id == b"data" {
            return Some((pos + 4, pos + 8));
        }
        let size = LittleEndian::read_u32(&bytes[pos + 4..pos + 8]) as usize;
        // Chunks are word aligned
        pos = pos.checked_add(8 + size + (size & 1))?;
    }

    None
}

/// Slice of raw samples following the container header.
pub fn payload(bytes: &[u8]) -> &[u8] {
    match data_chunk_offsets(bytes) {
        Some((_, start)) => &bytes[start..],
        None if has_wav_header(bytes) => &bytes[WAV_HEADER_LEN.min(bytes.len())..],
        None => bytes,
    }
}

/// Rewrite the RIFF and `data` size fields to match the buffer length.
pub fn rewrite_sizes(bytes: &mut [u8]) {
    if !has_wav_header(bytes) {
        return;
    }

    let riff_size = clamp_u32(bytes.len() - 8);
    LittleEndian::write_u32(&mut bytes[4..8], riff_size);

    if let Some((size_offset, start)) = data_chunk_offsets(bytes) {
        let data_size = clamp_u32(bytes.len() - start);
        LittleEndian::write_u32(&mut bytes[size_offset..size_offset + 4], data_size);
    }
}

/// Declared `(riff_size, data_size)` of a container, if it has one.
pub fn declared_sizes(bytes: &[u8]) -> Option<(u32, u32)> {
    let (size_offset, _) = data_chunk_offsets(bytes)?;
    Some((
        LittleEndian::read_u32(&bytes[4..8]),
        LittleEndian::read_u32(&bytes[size_offset..size_offset + 4]),
    ))
}

/// Concatenate containers into one.
///
/// The first chunk is kept whole (header + payload); every following chunk
/// contributes only its payload. Size fields are rewritten afterwards.
pub fn concatenate<B: AsRef<[u8]>>(chunks: &[B]) -> Vec<u8> {
    let total: usize = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut combined = Vec::with_capacity(total);

    for (index, chunk) in chunks.iter().enumerate() {
        let chunk = chunk.as_ref();
        if index == 0 {
            combined.extend_from_slice(chunk);
        } else {
            combined.extend_from_slice(payload(chunk));
        }
    }

    rewrite_sizes(&mut combined);
    combined
}

fn clamp_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_header_is_synthesized_for_bare_pcm() {
        let wrapped = ensure_container(pcm(400, 1), 16000);
        assert_eq!(wrapped.len(), 444);
        assert!(has_wav_header(&wrapped));
        assert_eq!(declared_sizes(&wrapped), Some((436, 400)));
        assert_eq!(LittleEndian::read_u32(&wrapped[24..28]), 16000);
        assert_eq!(LittleEndian::read_u16(&wrapped[22..24]), 1);
        assert_eq!(LittleEndian::read_u16(&wrapped[34..36]), 16);
    }

    #[test]
    fn test_existing_container_is_untouched() {
        let wrapped = ensure_container(pcm(10, 2), 16000);
        let again = ensure_container(wrapped.clone(), 8000);
        assert_eq!(wrapped, again);
    }

    #[test]
    fn test_concatenate_strips_later_headers_and_fixes_sizes() {
        let a = ensure_container(pcm(100, 1), 16000);
        let b = ensure_container(pcm(200, 2), 16000);
        let c = ensure_container(pcm(300, 3), 16000);

        let combined = concatenate(&[a.clone(), b, c]);
        assert_eq!(combined.len(), WAV_HEADER_LEN + 600);
        assert_eq!(&combined[..WAV_HEADER_LEN], &pcm_header(600, 16000)[..]);
        assert_eq!(&combined[WAV_HEADER_LEN..WAV_HEADER_LEN + 100], &a[WAV_HEADER_LEN..]);

        let (riff, data) = declared_sizes(&combined).expect("container");
        assert_eq!(riff as usize, combined.len() - 8);
        assert_eq!(data as usize, combined.len() - WAV_HEADER_LEN);
    }

    #[test]
    fn test_data_chunk_found_after_extra_chunks() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&[0; 4]);
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 0]); // padded to even
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&[9; 8]);

        assert_eq!(data_chunk_offsets(&bytes), Some((28, 32)));
        rewrite_sizes(&mut bytes);
        assert_eq!(declared_sizes(&bytes), Some((bytes.len() as u32 - 8, 8)));
        assert_eq!(payload(&bytes), &[9; 8]);
    }
}
