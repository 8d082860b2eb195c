use fastcgi_fpm::meta::{self, Header, RecordType, Role};
use std::{path::PathBuf, sync::Once};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static START: Once = Once::new();

/// Setup function that is only run once, even if called multiple times.
pub fn setup() {
    START.call_once(|| {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

/// Writes one raw record.
pub async fn write_record(
    stream: &mut (impl AsyncWrite + Unpin), r#type: RecordType, id: u16, content: &[u8],
) {
    Header::new(r#type, id, content)
        .write_to_stream(stream, content)
        .await
        .unwrap();
}

/// Sends a full request: BEGIN_REQUEST, PARAMS (with terminator), STDIN
/// (with terminator).
pub async fn send_request(
    stream: &mut (impl AsyncWrite + Unpin), id: u16, params: &[(&str, &str)], stdin: &[u8],
    keep_conn: bool,
) {
    let begin = [
        0,
        Role::Responder as u8,
        keep_conn as u8,
        0,
        0,
        0,
        0,
        0,
    ];
    write_record(stream, RecordType::BeginRequest, id, &begin).await;

    let mut pairs = Vec::new();
    for (name, value) in params {
        meta::encode_pair(&mut pairs, name.as_bytes(), value.as_bytes());
    }
    if !pairs.is_empty() {
        write_record(stream, RecordType::Params, id, &pairs).await;
    }
    write_record(stream, RecordType::Params, id, &[]).await;

    if !stdin.is_empty() {
        write_record(stream, RecordType::Stdin, id, stdin).await;
    }
    write_record(stream, RecordType::Stdin, id, &[]).await;
}

/// Reads records until END_REQUEST, returning (stdout, stderr,
/// app-status).
pub async fn read_response(stream: &mut (impl AsyncRead + Unpin)) -> (Vec<u8>, Vec<u8>, u32) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let header = Header::new_from_stream(stream).await.unwrap();
        let body = header.read_content_from_stream(stream).await.unwrap();
        match header.r#type {
            RecordType::Stdout => stdout.extend_from_slice(&body),
            RecordType::Stderr => stderr.extend_from_slice(&body),
            RecordType::EndRequest => {
                let app_status = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                return (stdout, stderr, app_status);
            }
            other => panic!("unexpected record type {other}"),
        }
    }
}

/// A connected (client, server-side) TCP pair on loopback.
pub async fn tcp_pair() -> (tokio::net::TcpStream, fastcgi_fpm::net::Stream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
    (
        client.unwrap(),
        fastcgi_fpm::net::Stream::Tcp(accepted.unwrap().0),
    )
}

/// Writes a temp script file and returns its path.
pub fn script(tag: &str, content: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("fpm-it-{}-{tag}", std::process::id()));
    std::fs::write(&path, content).unwrap();
    path
}
