//! Discovery of the PocketIC server process and the HTTP plumbing shared by all
//! instances created from one client process.

use crate::common::rest::{
    BlobCompression, BlobId, CreateInstanceResponse, InstanceConfig, InstanceId, Topology,
};
use crate::error::PocketIcError;
use crate::protocol::WireProtocol;
use reqwest::{blocking::Response, Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::{debug, info};

pub(crate) const PROCESSING_TIME_HEADER: &str = "processing-timeout-ms";
pub const DEFAULT_MAX_REQUEST_TIME_MS: u64 = 300_000;
const LOCALHOST: &str = "127.0.0.1";
const STARTUP_DEADLINE: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Base URL of the server discovered by this process, shared by every instance.
static SERVER_URL: Mutex<Option<Url>> = Mutex::new(None);

/// Finds the server that belongs to this process, or launches one.
///
/// The process id is the synchronization key: the server is started with
/// `--pid <pid>` and publishes `pocket_ic_<pid>.port` followed by
/// `pocket_ic_<pid>.ready` in the temporary directory. If the ready file already
/// exists, the running server is reused and nothing is launched.
///
/// The binary is `binary` if given, else the `POCKET_IC_BIN` environment
/// variable, else `./pocket-ic`. Its stdout and stderr are discarded unless
/// `POCKET_IC_INHERIT_STDOUT` / `POCKET_IC_INHERIT_STDERR` are set.
pub fn start_or_reuse_server(binary: Option<&Path>) -> Result<Url, PocketIcError> {
    let mut cached = SERVER_URL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(url) = cached.as_ref() {
        return Ok(url.clone());
    }

    let pid = std::process::id();
    let port_file_path = std::env::temp_dir().join(format!("pocket_ic_{pid}.port"));
    let ready_file_path = std::env::temp_dir().join(format!("pocket_ic_{pid}.ready"));

    if ready_file_path.is_file() {
        info!(pid, "reusing running PocketIC server");
    } else {
        let bin_path = binary_path(binary);
        if !bin_path.is_file() {
            return Err(PocketIcError::BinaryNotFound {
                path: bin_path,
                cwd: std::env::current_dir()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_else(|_| "an unknown directory".to_string()),
            });
        }

        let mut cmd = Command::new(&bin_path);
        cmd.arg("--pid").arg(pid.to_string());
        if std::env::var_os("POCKET_IC_INHERIT_STDOUT").is_none() {
            cmd.stdout(Stdio::null());
        }
        if std::env::var_os("POCKET_IC_INHERIT_STDERR").is_none() {
            cmd.stderr(Stdio::null());
        }
        cmd.spawn().map_err(|source| PocketIcError::ServerLaunch {
            path: bin_path.clone(),
            source,
        })?;
        info!(pid, binary = %bin_path.display(), "launched PocketIC server");
    }

    wait_for_ready_file(&ready_file_path)?;
    let url = read_port_file(&port_file_path)?;
    info!(%url, "PocketIC server is ready");
    *cached = Some(url.clone());
    Ok(url)
}

fn binary_path(binary: Option<&Path>) -> PathBuf {
    match binary {
        Some(path) => path.to_path_buf(),
        None => std::env::var_os("POCKET_IC_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./pocket-ic")),
    }
}

fn wait_for_ready_file(ready_file_path: &Path) -> Result<(), PocketIcError> {
    let start = Instant::now();
    loop {
        if let Ok(true) = ready_file_path.try_exists() {
            return Ok(());
        }
        if start.elapsed() > STARTUP_DEADLINE {
            return Err(PocketIcError::StartupTimeout(STARTUP_DEADLINE));
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
}

pub(crate) fn read_port_file(port_file_path: &Path) -> Result<Url, PocketIcError> {
    let invalid = |reason: String| PocketIcError::InvalidPortFile {
        path: port_file_path.to_path_buf(),
        reason,
    };
    let port_string = std::fs::read_to_string(port_file_path).map_err(|e| invalid(e.to_string()))?;
    let port: u16 = port_string
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{e}: {port_string:?}")))?;
    Url::parse(&format!("http://{LOCALHOST}:{port}/")).map_err(|e| invalid(e.to_string()))
}

/// A connection to a running PocketIC server.
///
/// Cheap to clone; the underlying `reqwest` client shares its connection pool.
#[derive(Clone, Debug)]
pub struct PocketIcServer {
    url: Url,
    client: reqwest::blocking::Client,
    max_request_time_ms: u64,
    protocol: WireProtocol,
}

impl PocketIcServer {
    /// Connects to the server of this process, launching it if necessary.
    pub fn start(binary: Option<&Path>) -> Result<Self, PocketIcError> {
        let url = start_or_reuse_server(binary)?;
        Self::from_url(url, DEFAULT_MAX_REQUEST_TIME_MS, WireProtocol::default())
    }

    /// Connects to a server at a known URL, skipping discovery.
    ///
    /// `max_request_time_ms` is sent with every instance request as the
    /// server-side processing limit and is also the transport timeout.
    pub fn from_url(
        mut url: Url,
        max_request_time_ms: u64,
        protocol: WireProtocol,
    ) -> Result<Self, PocketIcError> {
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(max_request_time_ms))
            .build()?;
        Ok(Self {
            url,
            client,
            max_request_time_ms,
            protocol,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    /// The status of every instance the server has ever created, indexed by instance id.
    pub fn list_instances(&self) -> Result<Vec<String>, PocketIcError> {
        let text = self.send(self.client.get(self.join("instances")?), "instances")?;
        parse_json(&text)
    }

    /// Creates a new instance and returns its id, plus the topology if the server
    /// reports it inline.
    pub fn create_instance(
        &self,
        config: &InstanceConfig,
    ) -> Result<(InstanceId, Option<Topology>), PocketIcError> {
        config.validate()?;
        let request = self
            .client
            .post(self.join("instances")?)
            .header(PROCESSING_TIME_HEADER, self.max_request_time_ms)
            .json(config);
        let text = self.send(request, "instances")?;
        match parse_json::<CreateInstanceResponse>(&text)? {
            CreateInstanceResponse::Created {
                instance_id,
                topology,
            } => {
                let topology = topology.map(Topology::try_from).transpose()?;
                info!(instance_id, "created PocketIC instance");
                Ok((instance_id, topology))
            }
            CreateInstanceResponse::Error { message } => Err(PocketIcError::Server {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message,
            }),
        }
    }

    pub fn delete_instance(&self, instance_id: InstanceId) -> Result<(), PocketIcError> {
        let endpoint = format!("instances/{instance_id}");
        let request = self
            .client
            .delete(self.join(&endpoint)?)
            .header(PROCESSING_TIME_HEADER, self.max_request_time_ms);
        self.send(request, &endpoint)?;
        info!(instance_id, "deleted PocketIC instance");
        Ok(())
    }

    /// Uploads a blob to the server's blob store.
    ///
    /// Gzip blobs are sent with `Content-Encoding: gzip` and stored decompressed.
    pub fn upload_blob(
        &self,
        blob: Vec<u8>,
        compression: BlobCompression,
    ) -> Result<BlobId, PocketIcError> {
        let mut request = self.client.post(self.join("blobstore/")?).body(blob);
        if let Some(encoding) = compression.content_encoding() {
            request = request.header(reqwest::header::CONTENT_ENCODING, encoding);
        }
        let text = self.send(request, "blobstore/")?;
        BlobId::from_hex(&text)
    }

    pub(crate) fn instance_get<T: DeserializeOwned>(
        &self,
        instance_id: InstanceId,
        endpoint: &str,
    ) -> Result<T, PocketIcError> {
        let text = self.instance_request(Method::GET, instance_id, endpoint, None::<&()>)?;
        parse_json(&text)
    }

    pub(crate) fn instance_post<T: DeserializeOwned, B: Serialize>(
        &self,
        instance_id: InstanceId,
        endpoint: &str,
        body: &B,
    ) -> Result<T, PocketIcError> {
        let text = self.instance_request(Method::POST, instance_id, endpoint, Some(body))?;
        parse_json(&text)
    }

    /// Like [`Self::instance_post`], but returns the raw response body.
    pub(crate) fn instance_post_text<B: Serialize>(
        &self,
        instance_id: InstanceId,
        endpoint: &str,
        body: &B,
    ) -> Result<String, PocketIcError> {
        self.instance_request(Method::POST, instance_id, endpoint, Some(body))
    }

    fn instance_request<B: Serialize>(
        &self,
        method: Method,
        instance_id: InstanceId,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<String, PocketIcError> {
        let path = format!("instances/{instance_id}/{endpoint}");
        let mut request = self
            .client
            .request(method, self.join(&path)?)
            .header(PROCESSING_TIME_HEADER, self.max_request_time_ms);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request, &path)
    }

    fn join(&self, path: &str) -> Result<Url, PocketIcError> {
        self.url
            .join(path)
            .map_err(|e| PocketIcError::InvalidConfig(format!("invalid server URL {}: {e}", self.url)))
    }

    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
        endpoint: &str,
    ) -> Result<String, PocketIcError> {
        let response = request.send()?;
        debug!(endpoint, status = response.status().as_u16(), "PocketIC request");
        check_response(response)
    }
}

/// Accepts 200, 201 and 202; any other status is a connection-class error
/// carrying the server's message.
fn check_response(response: Response) -> Result<String, PocketIcError> {
    let status = response.status();
    let text = response.text()?;
    if matches!(
        status,
        StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED
    ) {
        return Ok(text);
    }
    let message = if text.trim().is_empty() {
        status.canonical_reason().unwrap_or_default().to_string()
    } else {
        text
    };
    Err(PocketIcError::Server {
        status: status.as_u16(),
        message,
    })
}

/// Parses a JSON response body; an empty body is read as `null`.
pub(crate) fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, PocketIcError> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text)
        .map_err(|e| PocketIcError::protocol_violation(format!("unexpected response: {e}"), text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn port_file_is_parsed_into_a_localhost_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pocket_ic_1.port");
        std::fs::write(&path, "40123\n").unwrap();
        let url = read_port_file(&path).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:40123/");
    }

    #[test]
    fn garbage_in_the_port_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pocket_ic_1.port");
        std::fs::write(&path, "not a port").unwrap();
        assert_matches!(
            read_port_file(&path),
            Err(PocketIcError::InvalidPortFile { reason, .. }) if reason.contains("not a port")
        );
        assert_matches!(
            read_port_file(&dir.path().join("missing")),
            Err(PocketIcError::InvalidPortFile { .. })
        );
    }

    #[test]
    fn explicit_binary_overrides_the_environment() {
        assert_eq!(
            binary_path(Some(Path::new("/opt/pocket-ic"))),
            PathBuf::from("/opt/pocket-ic")
        );
    }

    #[test]
    fn server_url_gets_a_trailing_slash() {
        let url = Url::parse("http://127.0.0.1:8080/prefix").unwrap();
        let server =
            PocketIcServer::from_url(url, DEFAULT_MAX_REQUEST_TIME_MS, WireProtocol::default())
                .unwrap();
        assert_eq!(
            server.join("instances").unwrap().as_str(),
            "http://127.0.0.1:8080/prefix/instances"
        );
    }

    #[test]
    fn empty_bodies_parse_as_unit() {
        parse_json::<()>("").unwrap();
        parse_json::<()>("null").unwrap();
        assert_matches!(
            parse_json::<u64>("{\"x\":1}"),
            Err(PocketIcError::ProtocolViolation { payload, .. }) if payload == "{\"x\":1}"
        );
    }
}
