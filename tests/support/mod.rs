//! Minimal HTTP/1.1 chunked-transfer harness for driving the connection
//! manager, duplex engine, and auto-probe against a fake remote endpoint
//! without a real webshell handler on the other end. `mockito` can't model
//! these scenarios because the probe and full-duplex tests depend on a
//! server that replies *while the client's request body is still open*,
//! which mockito's request/response matching doesn't support.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

pub async fn read_request_head(reader: &mut BufReader<OwnedReadHalf>) -> RequestHead {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("read request line");
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        reader.read_line(&mut header_line).await.expect("read header line");
        if header_line == "\r\n" || header_line.is_empty() {
            break;
        }
        if let Some((key, value)) = header_line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    RequestHead { method, path, headers }
}

/// Reads one chunk of a chunked-transfer body. Returns `None` at the
/// terminating zero-length chunk.
pub async fn read_chunk(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<u8>> {
    let mut size_line = String::new();
    reader.read_line(&mut size_line).await.ok()?;
    let size = usize::from_str_radix(size_line.trim(), 16).ok()?;
    if size == 0 {
        let mut trailer = String::new();
        let _ = reader.read_line(&mut trailer).await;
        return None;
    }
    let mut data = vec![0u8; size];
    reader.read_exact(&mut data).await.ok()?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await.ok()?;
    Some(data)
}

pub async fn write_response_head(writer: &mut OwnedWriteHalf, status: u16) {
    let reason = if status == 200 { "OK" } else { "Error" };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nTransfer-Encoding: chunked\r\nContent-Type: application/octet-stream\r\n\r\n"
    );
    writer.write_all(head.as_bytes()).await.expect("write response head");
}

pub async fn write_fixed_response(writer: &mut OwnedWriteHalf, status: u16, body: &[u8]) {
    let reason = if status == 200 { "OK" } else { "Error" };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await.expect("write response head");
    writer.write_all(body).await.expect("write response body");
}

pub async fn write_chunk(writer: &mut OwnedWriteHalf, data: &[u8]) {
    let header = format!("{:x}\r\n", data.len());
    writer.write_all(header.as_bytes()).await.expect("write chunk size");
    writer.write_all(data).await.expect("write chunk data");
    writer.write_all(b"\r\n").await.expect("write chunk trailer");
}

pub async fn write_last_chunk(writer: &mut OwnedWriteHalf) {
    writer.write_all(b"0\r\n\r\n").await.expect("write terminating chunk");
}

/// Reads a fixed-length (`Content-Length`) body, used by half-duplex
/// writes and the non-streaming CREATE request: `reqwest` knows these
/// bodies' lengths up front and doesn't chunk them.
pub async fn read_fixed_body(reader: &mut BufReader<OwnedReadHalf>, content_length: usize) -> Vec<u8> {
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.expect("read fixed-length body");
    body
}
