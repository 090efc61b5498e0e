mod reply;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufStream, BufWriter};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::either::Either;

use crate::client::{RemoteClient, RemoteConnector, RemoteEntry, RemoteError, join_remote};
use reply::{
    Reply, format_timeval, parse_epsv, parse_list_line, parse_mlsd_line, parse_pasv,
    parse_timeval, read_reply, reply_error,
};

pub const DEFAULT_PORT: u16 = 21;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type FtpStream = Either<TcpStream, TlsStream<TcpStream>>;

/// Where and how to log in. `secure` selects explicit TLS (`AUTH TLS`) for
/// the control and data connections.
#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub secure: bool,
    pub timeout: Duration,
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("secure", &self.secure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FtpConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            secure: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Session over one FTP control connection, passive mode, binary type.
pub struct FtpClient {
    config: FtpConfig,
    tls: Option<Arc<ClientConfig>>,
    control: Option<BufStream<FtpStream>>,
    mlsd: Option<bool>,
}

impl FtpClient {
    pub fn new(config: FtpConfig) -> Result<Self, RemoteError> {
        let tls = if config.secure {
            Some(tls_config()?)
        } else {
            None
        };
        Ok(Self::with_tls(config, tls))
    }

    fn with_tls(config: FtpConfig, tls: Option<Arc<ClientConfig>>) -> Self {
        Self {
            config,
            tls,
            control: None,
            mlsd: None,
        }
    }

    fn server_name(&self) -> Result<ServerName<'static>, RemoteError> {
        ServerName::try_from(self.config.host.clone())
            .map_err(|err| RemoteError::Connection(format!("invalid TLS server name: {err}")))
    }

    async fn wrap_tls(&self, tcp: TcpStream) -> Result<FtpStream, RemoteError> {
        let Some(tls) = &self.tls else {
            return Ok(Either::Left(tcp));
        };
        let stream = TlsConnector::from(Arc::clone(tls))
            .connect(self.server_name()?, tcp)
            .await
            .map_err(|err| RemoteError::Connection(format!("TLS handshake failed: {err}")))?;
        Ok(Either::Right(stream))
    }

    async fn open_tcp(&self, port: u16) -> Result<TcpStream, RemoteError> {
        let address = (self.config.host.as_str(), port);
        match tokio::time::timeout(self.config.timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(RemoteError::Connection(format!(
                "{}:{port}: {err}",
                self.config.host
            ))),
            Err(_) => Err(RemoteError::Connection(format!(
                "{}:{port}: connect timed out",
                self.config.host
            ))),
        }
    }

    /// Sends one command and reads its reply. Any I/O failure or a `421`
    /// closes the session.
    async fn command(&mut self, command: &str) -> Result<Reply, RemoteError> {
        let verb = command.split(' ').next().unwrap_or_default().to_string();
        let timeout = self.config.timeout;
        let control = self.control.as_mut().ok_or(RemoteError::NotConnected)?;
        let exchange = async {
            control.write_all(command.as_bytes()).await?;
            control.write_all(b"\r\n").await?;
            control.flush().await?;
            read_reply(&mut *control).await
        };
        let result = tokio::time::timeout(timeout, exchange).await;
        self.settle(&verb, result)
    }

    /// Reads the reply that closes a data transfer.
    async fn read_final(&mut self, verb: &str) -> Result<Reply, RemoteError> {
        let timeout = self.config.timeout;
        let control = self.control.as_mut().ok_or(RemoteError::NotConnected)?;
        let result = tokio::time::timeout(timeout, read_reply(control)).await;
        self.settle(verb, result)
    }

    fn settle(
        &mut self,
        verb: &str,
        result: Result<std::io::Result<Reply>, tokio::time::error::Elapsed>,
    ) -> Result<Reply, RemoteError> {
        match result {
            Ok(Ok(reply)) if reply.code == 421 => {
                self.control = None;
                Err(reply_error(&reply, verb))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                self.control = None;
                Err(RemoteError::Connection(format!("{verb}: {err}")))
            }
            Err(_) => {
                self.control = None;
                Err(RemoteError::Connection(format!("{verb}: timed out")))
            }
        }
    }

    async fn expect(
        &mut self,
        command: &str,
        codes: &[u16],
        path: &str,
    ) -> Result<Reply, RemoteError> {
        let reply = self.command(command).await?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply_error(&reply, path))
        }
    }

    async fn handshake(&mut self) -> Result<(), RemoteError> {
        let tcp = self.open_tcp(self.config.port).await?;
        self.control = Some(BufStream::new(Either::Left(tcp)));
        let greeting = self.read_final("greeting").await?;
        if !greeting.is_completion() {
            return Err(reply_error(&greeting, "greeting"));
        }

        if self.tls.is_some() {
            self.expect("AUTH TLS", &[234], "AUTH").await?;
            let Some(control) = self.control.take() else {
                return Err(RemoteError::NotConnected);
            };
            let Either::Left(tcp) = control.into_inner() else {
                return Err(RemoteError::Connection("control already secured".into()));
            };
            let secured = self.wrap_tls(tcp).await?;
            self.control = Some(BufStream::new(secured));
        }

        let user = format!("USER {}", self.config.username);
        let reply = self.command(&user).await?;
        match reply.code {
            230 => {}
            331 | 332 => {
                let pass = format!("PASS {}", self.config.password);
                self.expect(&pass, &[202, 230], "login").await?;
            }
            _ => return Err(reply_error(&reply, "login")),
        }

        if self.tls.is_some() {
            self.expect("PBSZ 0", &[200], "PBSZ").await?;
            self.expect("PROT P", &[200], "PROT").await?;
        }
        self.expect("TYPE I", &[200], "TYPE").await?;
        Ok(())
    }

    async fn open_data(&mut self) -> Result<FtpStream, RemoteError> {
        let reply = self.command("EPSV").await?;
        let port = if reply.code == 229 {
            parse_epsv(&reply.text)
        } else {
            let reply = self.expect("PASV", &[227], "PASV").await?;
            parse_pasv(&reply.text)
        }
        .ok_or_else(|| RemoteError::Other("unparseable passive mode reply".into()))?;
        let tcp = self.open_tcp(port).await?;
        self.wrap_tls(tcp).await
    }

    /// Runs a listing command; `Ok(Err(reply))` when the server rejects it.
    async fn read_listing(
        &mut self,
        command: &str,
        path: &str,
    ) -> Result<Result<Vec<String>, Reply>, RemoteError> {
        let mut data = self.open_data().await?;
        let reply = self.command(command).await?;
        if !reply.is_preliminary() {
            return Ok(Err(reply));
        }
        let mut raw = Vec::new();
        let read = data.read_to_end(&mut raw).await;
        drop(data);
        if let Err(err) = read {
            self.control = None;
            return Err(RemoteError::Connection(format!("listing {path}: {err}")));
        }
        let done = self.read_final("listing").await?;
        if !done.is_completion() {
            return Err(reply_error(&done, path));
        }
        Ok(Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect()))
    }

    async fn modified_of(&mut self, path: &str) -> Result<Option<OffsetDateTime>, RemoteError> {
        let reply = self.command(&format!("MDTM {path}")).await?;
        Ok(if reply.code == 213 {
            parse_timeval(&reply.text)
        } else {
            None
        })
    }
}

fn tls_config() -> Result<Arc<ClientConfig>, RemoteError> {
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| RemoteError::Other(format!("TLS setup failed: {err}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[async_trait]
impl RemoteClient for FtpClient {
    async fn connect(&mut self) -> Result<(), RemoteError> {
        if self.control.is_some() {
            return Ok(());
        }
        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.control = None;
                Err(match err {
                    RemoteError::Connection(_) => err,
                    other => RemoteError::Connection(other.to_string()),
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.control.is_some()
    }

    async fn disconnect(&mut self) -> Result<(), RemoteError> {
        if self.control.is_some() {
            let _ = self.command("QUIT").await;
        }
        self.control = None;
        Ok(())
    }

    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        if self.mlsd != Some(false) {
            match self.read_listing(&format!("MLSD {path}"), path).await? {
                Ok(lines) => {
                    self.mlsd = Some(true);
                    return Ok(lines.iter().filter_map(|line| parse_mlsd_line(line)).collect());
                }
                Err(reply) if reply.is_unsupported() => self.mlsd = Some(false),
                Err(reply) => return Err(reply_error(&reply, path)),
            }
        }

        let lines = match self.read_listing(&format!("LIST {path}"), path).await? {
            Ok(lines) => lines,
            Err(reply) => return Err(reply_error(&reply, path)),
        };
        let mut entries: Vec<RemoteEntry> =
            lines.iter().filter_map(|line| parse_list_line(line)).collect();
        for entry in entries.iter_mut().filter(|entry| !entry.is_dir) {
            entry.modified = self.modified_of(&join_remote(path, &entry.name)).await?;
        }
        Ok(entries)
    }

    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        buffer_size: usize,
    ) -> Result<u64, RemoteError> {
        let source = tokio::fs::File::open(local).await?;
        let mut reader = BufReader::with_capacity(buffer_size.max(1), source);
        let mut data = self.open_data().await?;
        let reply = self.command(&format!("STOR {remote}")).await?;
        if !reply.is_preliminary() {
            return Err(reply_error(&reply, remote));
        }
        let sent = match tokio::io::copy_buf(&mut reader, &mut data).await {
            Ok(sent) => sent,
            Err(err) => {
                self.control = None;
                return Err(RemoteError::Io(err));
            }
        };
        if let Err(err) = data.shutdown().await {
            self.control = None;
            return Err(RemoteError::Connection(format!("STOR {remote}: {err}")));
        }
        drop(data);
        let done = self.read_final("STOR").await?;
        if !done.is_completion() {
            return Err(reply_error(&done, remote));
        }
        Ok(sent)
    }

    async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        buffer_size: usize,
    ) -> Result<u64, RemoteError> {
        let data = self.open_data().await?;
        let reply = self.command(&format!("RETR {remote}")).await?;
        if !reply.is_preliminary() {
            return Err(reply_error(&reply, remote));
        }
        let file = match tokio::fs::File::create(local).await {
            Ok(file) => file,
            Err(err) => {
                self.control = None;
                return Err(RemoteError::Io(err));
            }
        };
        let mut reader = BufReader::with_capacity(buffer_size.max(1), data);
        let mut writer = BufWriter::with_capacity(buffer_size.max(1), file);
        let copied = match tokio::io::copy_buf(&mut reader, &mut writer).await {
            Ok(copied) => copied,
            Err(err) => {
                self.control = None;
                return Err(RemoteError::Io(err));
            }
        };
        writer.flush().await?;
        drop(reader);
        let done = self.read_final("RETR").await?;
        if !done.is_completion() {
            return Err(reply_error(&done, remote));
        }
        Ok(copied)
    }

    async fn delete(&mut self, path: &str) -> Result<(), RemoteError> {
        self.expect(&format!("DELE {path}"), &[250], path).await?;
        Ok(())
    }

    async fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        let reply = self.command(&format!("MKD {path}")).await?;
        if reply.code == 257 {
            return Ok(());
        }
        // Servers answer 550 for an existing directory; CWD tells them apart.
        let cwd = self.command(&format!("CWD {path}")).await?;
        if cwd.code == 250 {
            Ok(())
        } else {
            Err(reply_error(&reply, path))
        }
    }

    async fn set_modified(
        &mut self,
        path: &str,
        modified: OffsetDateTime,
    ) -> Result<(), RemoteError> {
        let stamp = format_timeval(modified);
        let reply = self.command(&format!("MFMT {stamp} {path}")).await?;
        if reply.code == 213 {
            return Ok(());
        }
        if reply.is_unsupported() {
            self.expect(&format!("MDTM {stamp} {path}"), &[213, 253], path)
                .await?;
            return Ok(());
        }
        Err(reply_error(&reply, path))
    }
}

/// Connector for `ftp://` and explicit-TLS `ftps://` endpoints. The TLS
/// configuration is built once and shared by every session.
#[derive(Clone)]
pub struct FtpConnector {
    config: FtpConfig,
    tls: Option<Arc<ClientConfig>>,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Result<Self, RemoteError> {
        let tls = if config.secure {
            Some(tls_config()?)
        } else {
            None
        };
        Ok(Self { config, tls })
    }
}

impl RemoteConnector for FtpConnector {
    fn session(&self) -> Box<dyn RemoteClient> {
        Box::new(FtpClient::with_tls(self.config.clone(), self.tls.clone()))
    }

    fn describe(&self) -> String {
        format!(
            "{}://{}@{}:{}",
            if self.config.secure { "ftps" } else { "ftp" },
            self.config.username,
            self.config.host,
            self.config.port
        )
    }
}
