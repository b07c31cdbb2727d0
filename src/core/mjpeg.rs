//! MJPEG (`multipart/x-mixed-replace`) frame source for the camera stream.
//!
//! ESP32-CAM firmware sends parts like:
//!
//! ```text
//! --123456789000000000000987654321\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 15342\r\n
//! X-Timestamp: 1712.123\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! `Content-Length` is used when present; otherwise the part is read up to the
//! JPEG end-of-image marker (`FF D9`).
//!
//! When the HTTP body ends, [`MjpegSource`] drops the connection and reopens it
//! on the next read, so a camera that closes the stream every few minutes just
//! looks like a couple of transient read failures to the stream loop.

use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;

use log::{debug, trace};
use reqwest::blocking::{Client, Response};

use super::stream::{Connector, FrameError, FrameSource};

/// Upper bound for a single JPEG part
pub const MAX_PART_BYTES: usize = 8 * 1024 * 1024;

/// Upper bound for a boundary/header line
const MAX_LINE_BYTES: u64 = 4096;

/// Give up on a silent camera after this long when opening the stream
pub const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest wait for response headers or for any single body read
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Pulls JPEG parts out of a multipart byte stream
pub struct MjpegReader<R: BufRead> {
    inner: R,
}

impl<R: BufRead> MjpegReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next part payload. `Ok(None)` at end of stream (EOF or closing boundary).
    pub fn next_part(&mut self) -> io::Result<Option<Vec<u8>>> {
        // Skip until a boundary line
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            let line = trim_crlf(&line);
            if line.starts_with(b"--") {
                if line.len() > 4 && line.ends_with(b"--") {
                    trace!("Closing multipart boundary");
                    return Ok(None);
                }
                break;
            }
        }

        // Part headers
        let mut content_length = None;
        loop {
            let Some(line) = self.read_line()? else {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF inside part headers"));
            };
            let line = trim_crlf(&line);
            if line.is_empty() {
                break;
            }
            if let Some(len) = parse_content_length(line) {
                content_length = Some(len);
            }
        }

        match content_length {
            Some(len) if len > MAX_PART_BYTES => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("part too large: {} bytes", len),
            )),
            Some(len) => {
                let mut buf = vec![0u8; len];
                self.inner.read_exact(&mut buf)?;
                Ok(Some(buf))
            }
            None => self.read_until_eoi().map(Some),
        }
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = (&mut self.inner).take(MAX_LINE_BYTES).read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    fn read_until_eoi(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        loop {
            let n = self.inner.read_until(0xD9, &mut buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF inside JPEG part"));
            }
            if buf.ends_with(&[0xFF, 0xD9]) {
                return Ok(buf);
            }
            if buf.len() > MAX_PART_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "JPEG part without end marker"));
            }
        }
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn parse_content_length(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

/// Camera stream over HTTP, reconnecting after the body ends
pub struct MjpegSource {
    url: String,
    client: Client,
    reader: Option<MjpegReader<BufReader<Response>>>,
}

impl MjpegSource {
    /// Open the stream; any failure here means the camera is unreachable.
    pub fn open(url: &str) -> Result<Self, FrameError> {
        Self::open_with(url, STREAM_READ_TIMEOUT)
    }

    /// Like [`open`](Self::open) with a custom limit on each wait for data.
    pub fn open_with(url: &str, read_timeout: Duration) -> Result<Self, FrameError> {
        // The blocking client applies `timeout` to the header wait and to each
        // body read separately, never to the whole endless body.
        let client = Client::builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT.min(read_timeout))
            .timeout(read_timeout)
            .build()
            .map_err(|e| FrameError::Fatal(format!("Failed to build HTTP client: {}", e)))?;

        let mut source = Self { url: url.to_string(), client, reader: None };
        source.reconnect().map_err(|e| FrameError::Fatal(e.to_string()))?;
        Ok(source)
    }

    fn reconnect(&mut self) -> Result<(), FrameError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| FrameError::Transient(format!("stream connect failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FrameError::Fatal(format!(
                "stream endpoint returned status {}",
                status.as_u16()
            )));
        }

        debug!("Stream connected: {}", self.url);
        self.reader = Some(MjpegReader::new(BufReader::new(response)));
        Ok(())
    }
}

impl FrameSource for MjpegSource {
    fn next_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        if self.reader.is_none() {
            self.reconnect()?;
        }
        let Some(reader) = self.reader.as_mut() else {
            return Err(FrameError::Transient("stream not connected".to_string()));
        };

        match reader.next_part() {
            Ok(Some(part)) => Ok(part),
            Ok(None) => {
                self.reader = None;
                Err(FrameError::Transient("stream ended, reconnecting".to_string()))
            }
            Err(e) => {
                // Malformed part: resync on the next boundary. Anything else: new connection.
                if e.kind() != io::ErrorKind::InvalidData {
                    self.reader = None;
                }
                Err(FrameError::Transient(format!("stream read failed: {}", e)))
            }
        }
    }
}

/// Connects to real cameras over HTTP
#[derive(Debug, Clone, Copy)]
pub struct HttpConnector {
    /// Silence longer than this fails the open or the current read
    pub read_timeout: Duration,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self { read_timeout: STREAM_READ_TIMEOUT }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, url: &str) -> Result<Box<dyn FrameSource>, FrameError> {
        Ok(Box::new(MjpegSource::open_with(url, self.read_timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{jpeg_bytes, mjpeg_body};
    use std::io::{Cursor, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_reads_parts_with_content_length() {
        let frames = vec![jpeg_bytes(8, 8, 1), jpeg_bytes(16, 8, 2), jpeg_bytes(8, 16, 3)];
        let body = mjpeg_body("123456789000000000000987654321", &frames);
        let mut reader = MjpegReader::new(Cursor::new(body));

        for expected in &frames {
            assert_eq!(reader.next_part().unwrap().as_ref(), Some(expected));
        }
        assert_eq!(reader.next_part().unwrap(), None);
    }

    #[test]
    fn test_reads_parts_without_content_length() {
        let frame = jpeg_bytes(12, 12, 50);
        let mut body = Vec::new();
        body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&frame);
        body.extend_from_slice(b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&frame);
        body.extend_from_slice(b"\r\n--frame--\r\n");

        let mut reader = MjpegReader::new(Cursor::new(body));
        assert_eq!(reader.next_part().unwrap(), Some(frame.clone()));
        assert_eq!(reader.next_part().unwrap(), Some(frame));
        assert_eq!(reader.next_part().unwrap(), None);
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        assert_eq!(parse_content_length(b"content-length: 42"), Some(42));
        assert_eq!(parse_content_length(b"Content-Length:7"), Some(7));
        assert_eq!(parse_content_length(b"X-Timestamp: 1.5"), None);
    }

    #[test]
    fn test_truncated_part_is_an_error() {
        let mut body = b"--b\r\nContent-Length: 100\r\n\r\n".to_vec();
        body.extend_from_slice(&[0u8; 10]);
        let mut reader = MjpegReader::new(Cursor::new(body));
        let err = reader.next_part().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversized_part_is_rejected() {
        let body = format!("--b\r\nContent-Length: {}\r\n\r\n", MAX_PART_BYTES + 1);
        let mut reader = MjpegReader::new(Cursor::new(body.into_bytes()));
        assert_eq!(reader.next_part().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_open_unreachable_camera_fails() {
        assert!(MjpegSource::open("http://127.0.0.1:1/stream").is_err());
    }

    #[test]
    fn test_stalled_body_read_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hold_tx, hold_rx) = std::sync::mpsc::channel::<()>();
        let camera = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = conn.read(&mut request).unwrap();
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace;boundary=b\r\n\r\n")
                .unwrap();
            conn.flush().unwrap();
            // Headers sent, then silence until the test is done
            let _ = hold_rx.recv();
        });

        let url = format!("http://127.0.0.1:{}/stream", port);
        let mut source = MjpegSource::open_with(&url, Duration::from_millis(200)).unwrap();
        let started = Instant::now();
        let err = source.next_frame().unwrap_err();
        assert!(matches!(err, FrameError::Transient(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(3));

        drop(hold_tx);
        camera.join().unwrap();
    }
}
