//! S3/S4: the auto-probe picks full-duplex when a fake intermediary
//! streams the request body through promptly, and half-duplex when it
//! buffers the whole body before replying. Both also verify the learned
//! response-body offset.

mod support;

use tokio::io::BufReader;
use tokio::net::TcpListener;

use tunnelproxy::config::{Config, DuplexMode};
use tunnelproxy::transport::{build_client, HttpTransport};

async fn transport_for(target: String) -> HttpTransport {
    let mut cfg = Config::default();
    cfg.target = target;
    let resolved = cfg.resolve().expect("config resolves");
    let client = build_client(&resolved).expect("client builds");
    HttpTransport::new(client, &resolved).expect("transport builds")
}

#[tokio::test]
async fn probe_picks_full_duplex_when_server_echoes_promptly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);
        let _head = support::read_request_head(&mut reader).await;

        // The probe's single chunk carries the whole payload; a streaming
        // intermediary proxies it through without waiting for EOF.
        let chunk = support::read_chunk(&mut reader).await.expect("probe payload chunk");

        let mut echoed = b"aaaaaaaaaaa".to_vec(); // 11-byte banner
        echoed.extend_from_slice(&chunk);
        support::write_response_head(&mut wr, 200).await;
        support::write_chunk(&mut wr, &echoed).await;
        support::write_last_chunk(&mut wr).await;
    });

    let transport = transport_for(format!("http://{addr}/tunnel.jsp")).await;
    let result = tunnelproxy::probe::run(&transport).await.expect("probe succeeds");

    assert_eq!(result.mode, DuplexMode::Full);
    assert_eq!(result.offset, 11);

    server.await.unwrap();
}

#[tokio::test]
async fn probe_picks_half_duplex_when_server_buffers_before_replying() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);
        let _head = support::read_request_head(&mut reader).await;

        // Drain every chunk through the terminating zero-length chunk
        // before replying at all: models an intermediary that buffers the
        // entire request body before it does anything with it. The
        // terminating chunk only arrives once the probe gives up on the
        // request body after its own idle timeout, which is what pushes
        // the measured latency past the full-duplex cutoff.
        let mut buffered = Vec::new();
        while let Some(chunk) = support::read_chunk(&mut reader).await {
            buffered.extend_from_slice(&chunk);
        }

        let mut echoed = b"aaaaaaaaaaa".to_vec();
        echoed.extend_from_slice(&buffered);
        support::write_response_head(&mut wr, 200).await;
        support::write_chunk(&mut wr, &echoed).await;
        support::write_last_chunk(&mut wr).await;
    });

    let transport = transport_for(format!("http://{addr}/tunnel.jsp")).await;
    let result = tunnelproxy::probe::run(&transport).await.expect("probe succeeds");

    assert_eq!(result.mode, DuplexMode::Half);
    assert_eq!(result.offset, 11);

    server.await.unwrap();
}
