//! Ogg/Opus framing for inbound and outbound audio (spec.md §4.1, §4.6).
//!
//! Inbound: the client streams Opus-in-Ogg pages. Until a page with the
//! "first page" bit set has been observed, frames are silently dropped —
//! reconnecting clients occasionally replay stale pages from a previous
//! session and the decoder must not be fed a mid-stream page.
//!
//! Outbound: PCM float32 samples produced by TTS are pushed through an
//! Opus stream writer which may emit zero or more bytes per push; only
//! non-empty outputs become `response.audio.delta` events.

/// Byte offset and bit mask of the Ogg page header's "beginning of stream"
/// flag (RFC 3533 header_type byte, bit 1 / 0x02).
const OGG_HEADER_TYPE_BYTE: usize = 5;
const OGG_BOS_BIT: u8 = 0b0000_0010;

/// Returns whether an Ogg page's header marks it as a first ("beginning of
/// stream") page.
pub fn is_first_page(page: &[u8]) -> bool {
    page.get(OGG_HEADER_TYPE_BYTE)
        .map(|b| b & OGG_BOS_BIT != 0)
        .unwrap_or(false)
}

/// Gates inbound audio frames until the first-page bit has been seen once.
#[derive(Debug, Default)]
pub struct FirstPageGate {
    seen_first_page: bool,
}

impl FirstPageGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw Ogg page. Returns `true` if the page should be forwarded
    /// to the decoder, `false` if it must be silently discarded.
    pub fn admit(&mut self, page: &[u8]) -> bool {
        if !self.seen_first_page {
            if is_first_page(page) {
                self.seen_first_page = true;
            } else {
                return false;
            }
        }
        true
    }
}

/// A minimal Opus stream encoder abstraction. The real codec call is
/// offloaded to a blocking task per spec.md §5 ("CPU-bound calls are
/// offloaded to a worker so the event loop is never blocked"); this struct
/// models the accumulation/flush contract the orchestrator depends on.
pub trait OpusEncoder: Send {
    /// Push PCM f32 samples, returning zero or more encoded Opus packets.
    fn push(&mut self, pcm: &[f32]) -> Vec<Vec<u8>>;
}

/// A minimal Opus stream decoder abstraction for inbound audio.
pub trait OpusDecoder: Send {
    /// Push an Opus-in-Ogg page, returning decoded PCM samples if any.
    fn push(&mut self, page: &[u8]) -> Vec<i16>;
}

/// `OpusDecoder` backed by a persistent `ffmpeg` subprocess, grounded in
/// `server::realtime_voice`'s `decode_webm_to_pcm` — but that helper spawns
/// one ffmpeg per buffer, which only works because WebM/MediaRecorder
/// chunks are independently decodable. A continuous Ogg/Opus bitstream is
/// not: the decoder needs page-to-page container state, so one `ffmpeg`
/// child is kept alive for the session's lifetime, fed pages as they
/// arrive, with a background thread draining its stdout into a shared
/// buffer (`push` runs synchronously and is meant to be called from a
/// blocking task per spec.md §5).
pub struct OggOpusDecoder {
    stdin: std::process::ChildStdin,
    child: std::process::Child,
    pcm: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<i16>>>,
}

impl OggOpusDecoder {
    pub fn spawn(sample_rate: u32) -> std::io::Result<Self> {
        use std::process::{Command, Stdio};

        let mut child = Command::new("ffmpeg")
            .args([
                "-f",
                "ogg",
                "-i",
                "pipe:0",
                "-f",
                "s16le",
                "-ar",
                &sample_rate.to_string(),
                "-ac",
                "1",
                "-loglevel",
                "error",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");
        let pcm = std::sync::Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new()));
        let pcm_writer = pcm.clone();

        std::thread::spawn(move || {
            use std::io::Read;
            let mut chunk = [0u8; 4096];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut buf = pcm_writer.lock().unwrap();
                        for pair in chunk[..n].chunks_exact(2) {
                            buf.push_back(i16::from_le_bytes([pair[0], pair[1]]));
                        }
                    }
                }
            }
        });

        Ok(Self { stdin, child, pcm })
    }
}

impl OpusDecoder for OggOpusDecoder {
    fn push(&mut self, page: &[u8]) -> Vec<i16> {
        use std::io::Write;
        if self.stdin.write_all(page).is_err() || self.stdin.flush().is_err() {
            return Vec::new();
        }
        self.pcm.lock().unwrap().drain(..).collect()
    }
}

impl Drop for OggOpusDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

/// `OpusEncoder` backed by a persistent `ffmpeg` subprocess: PCM float32
/// samples go in over stdin, Ogg/Opus bytes come out over stdout. Each
/// `push` drains whatever the background reader thread has accumulated
/// since the last call, which may span zero, one, or several `libopus`
/// frames depending on ffmpeg's internal buffering — matching the "zero or
/// more bytes per push" contract this trait documents.
pub struct OggOpusEncoder {
    stdin: std::process::ChildStdin,
    child: std::process::Child,
    chunks: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<Vec<u8>>>>,
}

impl OggOpusEncoder {
    pub fn spawn(sample_rate: u32) -> std::io::Result<Self> {
        use std::process::{Command, Stdio};

        let mut child = Command::new("ffmpeg")
            .args([
                "-f",
                "f32le",
                "-ar",
                &sample_rate.to_string(),
                "-ac",
                "1",
                "-i",
                "pipe:0",
                "-c:a",
                "libopus",
                "-f",
                "ogg",
                "-loglevel",
                "error",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");
        let chunks = std::sync::Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new()));
        let chunks_writer = chunks.clone();

        std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => chunks_writer.lock().unwrap().push_back(buf[..n].to_vec()),
                }
            }
        });

        Ok(Self { stdin, child, chunks })
    }
}

impl OpusEncoder for OggOpusEncoder {
    fn push(&mut self, pcm: &[f32]) -> Vec<Vec<u8>> {
        use std::io::Write;
        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        if self.stdin.write_all(&bytes).is_err() || self.stdin.flush().is_err() {
            return Vec::new();
        }
        self.chunks.lock().unwrap().drain(..).collect()
    }
}

impl Drop for OggOpusEncoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_header_type(header_type: u8) -> Vec<u8> {
        let mut page = vec![0u8; 27];
        page[0..4].copy_from_slice(b"OggS");
        page[4] = 0; // version
        page[OGG_HEADER_TYPE_BYTE] = header_type;
        page
    }

    #[test]
    fn first_page_gating_discards_until_bos_bit_seen() {
        let mut gate = FirstPageGate::new();

        let non_first = page_with_header_type(0x00);
        assert!(!gate.admit(&non_first));
        assert!(!gate.admit(&non_first));

        let first = page_with_header_type(OGG_BOS_BIT);
        assert!(gate.admit(&first));

        // All subsequent frames, even non-BOS ones, are now forwarded.
        assert!(gate.admit(&non_first));
    }

    #[test]
    fn detects_bos_bit_combined_with_other_flags() {
        let page = page_with_header_type(OGG_BOS_BIT | 0b0000_0001);
        assert!(is_first_page(&page));
    }
}
