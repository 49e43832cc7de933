//! NTRIP caster client.
//!
//! Speaks the HTTP-flavoured NTRIP 1.0 handshake over TCP (TLS optional),
//! then consumes the continuous RTCM 3.x downlink and classifies every chunk
//! before it goes anywhere near the receiver: a mountpoint that streams NMEA
//! text instead of corrections is loudly diagnosed and discarded.  GGA
//! uplink shares the same socket; the coordinator's uploader is the only
//! caller, so the caster sees exactly one position report per second.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Result, RoverError};
use crate::rtcm::{self, DataType, RtcmFrame, RtcmParser, RtcmStats};

const USER_AGENT: &str = "NTRIP rtk-rover/0.1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DATA_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Header section larger than this means the caster is not speaking NTRIP.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Connection parameters for one caster mountpoint.
#[derive(Debug, Clone)]
pub struct NtripConfig {
    pub host:       String,
    pub port:       u16,
    pub mountpoint: String,
    pub username:   String,
    pub password:   String,
    pub tls:        bool,
}

/// Callback producing the current GGA sentence for uplink; `None` falls back
/// to the dummy sentence.
pub type GgaSource = Box<dyn Fn() -> Option<String> + Send + Sync>;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type IoBox = Box<dyn AsyncStream>;

/// Client statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct NtripStatus {
    pub connected:           bool,
    pub bytes_received:      u64,
    pub connection_attempts: u64,
    pub last_data_age_secs:  Option<f64>,
    pub rtcm:                RtcmStats,
}

pub struct NtripClient {
    cfg:        NtripConfig,
    gga_source: Mutex<GgaSource>,

    reader:  Mutex<Option<ReadHalf<IoBox>>>,
    writer:  tokio::sync::Mutex<Option<WriteHalf<IoBox>>>,
    /// Stream bytes that arrived glued to the handshake response.
    pending: Mutex<Vec<u8>>,

    parser:    Mutex<RtcmParser>,
    connected: AtomicBool,
    running:   AtomicBool,

    bytes_received:      AtomicU64,
    connection_attempts: AtomicU64,
    last_data:           Mutex<Option<Instant>>,
}

impl NtripClient {
    pub fn new(cfg: NtripConfig, gga_source: GgaSource) -> Self {
        NtripClient {
            cfg,
            gga_source: Mutex::new(gga_source),
            reader:  Mutex::new(None),
            writer:  tokio::sync::Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            parser:  Mutex::new(RtcmParser::new()),
            connected: AtomicBool::new(false),
            running:   AtomicBool::new(false),
            bytes_received:      AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            last_data:           Mutex::new(None),
        }
    }

    /// Replace the GGA callback (wired after the coordinator exists).
    pub fn set_gga_source(&self, source: GgaSource) {
        *self.gga_source.lock().unwrap() = source;
    }

    /// Open the caster session: TCP (+TLS), request, response validation,
    /// initial GGA.
    pub async fn connect(&self) -> Result<()> {
        let (reader, writer, leftover) = self.establish().await?;
        *self.reader.lock().unwrap() = Some(reader);
        *self.writer.lock().await = Some(writer);
        *self.pending.lock().unwrap() = leftover;
        self.connected.store(true, Ordering::SeqCst);
        info!(
            "NTRIP session established: {}:{}/{}",
            self.cfg.host, self.cfg.port, self.cfg.mountpoint
        );
        Ok(())
    }

    async fn establish(&self) -> Result<(ReadHalf<IoBox>, WriteHalf<IoBox>, Vec<u8>)> {
        let attempt = self.connection_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "connecting to NTRIP caster {}:{} (attempt {attempt})",
            self.cfg.host, self.cfg.port
        );

        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.cfg.host.as_str(), self.cfg.port)),
        )
        .await
        .map_err(|_| RoverError::NtripTimeout)?
        .map_err(|e| RoverError::NtripConnection(e.to_string()))?;

        let io: IoBox = if self.cfg.tls {
            self.wrap_tls(tcp).await?
        } else {
            Box::new(tcp)
        };
        let (mut reader, mut writer) = tokio::io::split(io);

        writer
            .write_all(self.build_request().as_bytes())
            .await
            .map_err(|e| RoverError::NtripConnection(e.to_string()))?;

        let leftover = read_response_headers(&mut reader).await?;

        // Initial GGA so the caster can pick its nearest reference data.
        let gga = {
            let source = self.gga_source.lock().unwrap();
            (*source)().unwrap_or_else(crate::nmea::build_dummy_gga)
        };
        writer
            .write_all(gga.as_bytes())
            .await
            .map_err(|e| RoverError::NtripConnection(e.to_string()))?;
        debug!("initial GGA sent to caster");

        Ok((reader, writer, leftover))
    }

    async fn wrap_tls(&self, tcp: TcpStream) -> Result<IoBox> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let name = rustls::pki_types::ServerName::try_from(self.cfg.host.clone())
            .map_err(|e| RoverError::Config(format!("bad caster hostname: {e}")))?;
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| RoverError::NtripConnection(format!("TLS handshake: {e}")))?;
        Ok(Box::new(stream))
    }

    fn build_request(&self) -> String {
        let mountpoint = if self.cfg.mountpoint.starts_with('/') {
            self.cfg.mountpoint.clone()
        } else {
            format!("/{}", self.cfg.mountpoint)
        };
        let credentials = BASE64.encode(format!("{}:{}", self.cfg.username, self.cfg.password));
        format!(
            "GET {mountpoint} HTTP/1.1\r\n\
             User-Agent: {USER_AGENT}\r\n\
             Authorization: Basic {credentials}\r\n\
             Host: {}:{}\r\n\
             \r\n",
            self.cfg.host, self.cfg.port
        )
    }

    /// Consume the RTCM downlink until `disconnect()` or the reconnect budget
    /// runs out.  Every valid frame is handed to `on_frame`, one at a time.
    pub async fn run_reception<F>(self: Arc<Self>, on_frame: F)
    where
        F: Fn(RtcmFrame) + Send + Sync + 'static,
    {
        let mut reader = match self.reader.lock().unwrap().take() {
            Some(r) => r,
            None => {
                error!("cannot start NTRIP reception: not connected");
                return;
            }
        };
        self.running.store(true, Ordering::SeqCst);

        // Bytes that trailed the handshake headers are stream data.
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        if !pending.is_empty() {
            self.process_chunk(&pending, &on_frame);
        }

        let mut reconnect_attempts = 0u32;
        let mut buf = vec![0u8; 4096];

        while self.running.load(Ordering::SeqCst) {
            let outcome = tokio::time::timeout(DATA_TIMEOUT, reader.read(&mut buf)).await;
            match outcome {
                Err(_) => {
                    // Quiet casters are normal between correction bursts.
                    debug!("NTRIP read timeout, continuing");
                    continue;
                }
                Ok(Ok(0)) => {
                    warn!("NTRIP caster closed the connection");
                }
                Ok(Ok(n)) => {
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    *self.last_data.lock().unwrap() = Some(Instant::now());
                    self.process_chunk(&buf[..n], &on_frame);
                    reconnect_attempts = 0;
                    continue;
                }
                Ok(Err(e)) => {
                    error!("NTRIP receive error: {e}");
                }
            }

            // Reconnect path (socket error or EOF).
            self.connected.store(false, Ordering::SeqCst);
            reconnect_attempts += 1;
            if reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                error!("NTRIP reconnect budget exhausted ({MAX_RECONNECT_ATTEMPTS} attempts)");
                break;
            }
            let backoff = RECONNECT_INTERVAL * reconnect_attempts;
            info!("reconnecting to NTRIP caster in {backoff:?} (attempt {reconnect_attempts})");
            tokio::time::sleep(backoff).await;

            match self.establish().await {
                Ok((new_reader, new_writer, leftover)) => {
                    reader = new_reader;
                    *self.writer.lock().await = Some(new_writer);
                    self.connected.store(true, Ordering::SeqCst);
                    reconnect_attempts = 0;
                    info!("NTRIP reconnection successful");
                    // A partial frame from the old session must not eat the
                    // start of the new stream.
                    self.parser.lock().unwrap().reset();
                    if !leftover.is_empty() {
                        self.process_chunk(&leftover, &on_frame);
                    }
                }
                Err(e) => warn!("NTRIP reconnection failed: {e}"),
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        info!("NTRIP reception loop ended");
    }

    /// Classify one received chunk and forward any valid frames.
    fn process_chunk<F>(&self, data: &[u8], on_frame: &F)
    where
        F: Fn(RtcmFrame),
    {
        match rtcm::detect_data_type(data) {
            DataType::Nmea => {
                let text = String::from_utf8_lossy(data);
                error!(
                    "mountpoint '{}' is sending NMEA, RTCM expected: {}",
                    self.cfg.mountpoint,
                    text.trim().chars().take(80).collect::<String>()
                );
                error!("fix: choose a mountpoint that serves RTCM corrections");
            }
            DataType::Rtcm => {
                let frames = self.parser.lock().unwrap().add_data(data);
                for frame in frames {
                    on_frame(frame);
                }
            }
            DataType::Unknown => {
                let preview: Vec<String> =
                    data.iter().take(20).map(|b| format!("{b:02x}")).collect();
                debug!("unclassified NTRIP data, first bytes: {}", preview.join(" "));
            }
        }
    }

    /// Uplink one GGA sentence on the shared socket.
    pub async fn send_gga(&self, gga: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| RoverError::NtripConnection("not connected".into()))?;
        writer
            .write_all(gga.as_bytes())
            .await
            .map_err(|e| RoverError::NtripConnection(e.to_string()))?;
        debug!("GGA uplinked to caster");
        Ok(())
    }

    /// Stop the reception loop and drop the socket halves.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.reader.lock().unwrap().take();
        self.writer.lock().await.take();
        info!("NTRIP disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the reception loop is alive (it handles its own reconnects
    /// while it runs).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> NtripStatus {
        NtripStatus {
            connected:           self.connected.load(Ordering::SeqCst),
            bytes_received:      self.bytes_received.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            last_data_age_secs:  self
                .last_data
                .lock()
                .unwrap()
                .map(|t| t.elapsed().as_secs_f64()),
            rtcm: self.parser.lock().unwrap().stats(),
        }
    }
}

/// Read the caster response up to the header/body blank line.  Returns any
/// stream bytes that arrived after it.
async fn read_response_headers<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut response = Vec::new();
    let mut buf = [0u8; 1024];

    let header_end = loop {
        let n = tokio::time::timeout(CONNECT_TIMEOUT, reader.read(&mut buf))
            .await
            .map_err(|_| RoverError::NtripTimeout)?
            .map_err(|e| RoverError::NtripConnection(e.to_string()))?;
        if n == 0 {
            return Err(RoverError::NtripConnection(
                "no response from caster".into(),
            ));
        }
        response.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_blank_line(&response) {
            break pos;
        }
        if response.len() > MAX_HEADER_BYTES {
            return Err(RoverError::NtripConnection(
                "oversized caster response, not an NTRIP endpoint".into(),
            ));
        }
    };

    let header_text = String::from_utf8_lossy(&response[..header_end]);
    let mut accepted = false;
    for line in header_text.split("\r\n") {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("NTRIP header: {line}");
        if line.contains("SOURCETABLE") {
            return Err(RoverError::NtripConnection(
                "mountpoint does not exist (caster sent source table)".into(),
            ));
        }
        if line.contains("401") {
            return Err(RoverError::NtripAuth(
                "unauthorized, check username/password".into(),
            ));
        }
        if line.contains("404 Not Found") {
            return Err(RoverError::NtripConnection("mountpoint not found".into()));
        }
        if ["ICY 200 OK", "HTTP/1.0 200 OK", "HTTP/1.1 200 OK"]
            .iter()
            .any(|ok| line.contains(ok))
        {
            accepted = true;
        }
    }
    if !accepted {
        return Err(RoverError::NtripConnection(
            "caster did not accept the request".into(),
        ));
    }

    Ok(response[header_end + 4..].to_vec())
}

/// Offset of the `\r\n\r\n` separator, if present.
fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn client() -> NtripClient {
        NtripClient::new(
            NtripConfig {
                host:       "caster.example".into(),
                port:       2101,
                mountpoint: "NEAR".into(),
                username:   "user".into(),
                password:   "secret".into(),
                tls:        false,
            },
            Box::new(|| None),
        )
    }

    #[test]
    fn request_has_auth_and_host() {
        let req = client().build_request();
        assert!(req.starts_with("GET /NEAR HTTP/1.1\r\n"));
        assert!(req.contains("Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));
        assert!(req.contains("Host: caster.example:2101\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn nmea_chunk_is_discarded() {
        // S4: a mountpoint streaming NMEA must not forward anything.
        let client = client();
        let forwarded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&forwarded);
        let chunk = b"$GNGGA,123519,5213.000,N,02100.000,E,1,08,0.9,100.0,M,0.0,M,,*7A\r\n";
        client.process_chunk(chunk.as_slice(), &move |_f| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);
        assert_eq!(client.status().rtcm.frames_parsed, 0);
    }

    #[test]
    fn rtcm_chunk_forwards_frames() {
        let client = client();
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&forwarded);
        let mut stream = crate::rtcm::encode_frame(1005, &[1, 2, 3]);
        stream.extend(crate::rtcm::encode_frame(1077, &[4, 5, 6, 7]));
        client.process_chunk(&stream, &move |f| sink.lock().unwrap().push(f));

        let frames = forwarded.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message_type, 1005);
        assert_eq!(frames[1].message_type, 1077);
    }

    #[test]
    fn unknown_chunk_ignored() {
        let client = client();
        let forwarded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&forwarded);
        client.process_chunk(&[0u8; 64], &move |_f| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn response_parsing_accepts_and_rejects() {
        async fn parse(response: &[u8]) -> Result<Vec<u8>> {
            let mut cursor = std::io::Cursor::new(response.to_vec());
            read_response_headers(&mut cursor).await
        }

        let leftover = parse(b"ICY 200 OK\r\n\r\n\xd3\x00\x01").await.unwrap();
        assert_eq!(leftover, vec![0xd3, 0x00, 0x01]);

        assert!(parse(b"HTTP/1.1 200 OK\r\nContent-Type: gnss/data\r\n\r\n")
            .await
            .is_ok());

        match parse(b"HTTP/1.1 401 Unauthorized\r\n\r\n").await {
            Err(RoverError::NtripAuth(_)) => {}
            other => panic!("expected auth error, got {other:?}"),
        }

        match parse(b"SOURCETABLE 200 OK\r\n\r\nSTR;...").await {
            Err(RoverError::NtripConnection(msg)) => {
                assert!(msg.contains("source table"));
            }
            other => panic!("expected connection error, got {other:?}"),
        }

        match parse(b"HTTP/1.1 404 Not Found\r\n\r\n").await {
            Err(RoverError::NtripConnection(_)) => {}
            other => panic!("expected connection error, got {other:?}"),
        }
    }
}
