use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Endpoints and local paths the client runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: String,
    pub socket_url: String,
    pub request_timeout: Duration,
    pub data_dir: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("client configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Unreadable { path, .. } => {
                format!("Could not read {}. Check its permissions.", path.display())
            }
            Self::Invalid(detail) => {
                format!("Client not configured: {detail}. Update campus.yaml or the CAMPUS_* variables.")
            }
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: derive_socket_url(DEFAULT_API_URL).unwrap_or_default(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            data_dir: default_data_dir(),
        }
    }
}

impl ClientConfig {
    /// Defaults, then `campus.yaml`, then `CAMPUS_*` environment variables
    /// (a `.env` file in the working directory is honoured).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_overriding(None)
    }

    /// Like [`ClientConfig::load`], with `api_url` taking precedence over
    /// every other source. An explicitly configured socket URL is kept;
    /// otherwise the socket URL is derived from the overriding API URL.
    pub fn load_overriding(api_url: Option<String>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let section = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|source| {
                    ConfigError::Unreadable {
                        path: path.clone(),
                        source,
                    }
                })?;
                parse_config(&contents)?
            }
            None => ClientSection::default(),
        };
        resolve(
            section,
            with_api_override(api_url, |key| std::env::var(key).ok()),
        )
    }

    /// Configuration pointing at an explicit API, used by tests and tools.
    pub fn for_api(api_url: impl Into<String>, data_dir: PathBuf) -> Result<Self, ConfigError> {
        let section = ClientSection {
            api_url: Some(api_url.into()),
            data_dir: Some(data_dir),
            ..ClientSection::default()
        };
        resolve(section, |_| None)
    }
}

fn resolve(
    section: ClientSection,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientConfig, ConfigError> {
    let api_url = env("CAMPUS_API_URL")
        .or(section.api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let api_url = api_url.trim().trim_end_matches('/').to_string();
    let parsed = Url::parse(&api_url)
        .map_err(|err| ConfigError::Invalid(format!("api url `{api_url}`: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "api url `{api_url}` must use http or https"
        )));
    }

    let socket_url = match env("CAMPUS_SOCKET_URL").or(section.socket_url) {
        Some(explicit) => explicit.trim().to_string(),
        None => derive_socket_url(&api_url)?,
    };
    let socket = Url::parse(&socket_url)
        .map_err(|err| ConfigError::Invalid(format!("socket url `{socket_url}`: {err}")))?;
    if !matches!(socket.scheme(), "ws" | "wss") {
        return Err(ConfigError::Invalid(format!(
            "socket url `{socket_url}` must use ws or wss"
        )));
    }

    let timeout_secs = match env("CAMPUS_REQUEST_TIMEOUT_SECS") {
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!("request timeout `{raw}` is not a number of seconds"))
        })?,
        None => section.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
    };
    if timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "request timeout must be at least one second".to_string(),
        ));
    }

    let data_dir = env("CAMPUS_DATA_DIR")
        .map(PathBuf::from)
        .or(section.data_dir)
        .unwrap_or_else(default_data_dir);

    Ok(ClientConfig {
        api_url,
        socket_url,
        request_timeout: Duration::from_secs(timeout_secs),
        data_dir,
    })
}

fn with_api_override(
    api_url: Option<String>,
    env: impl Fn(&str) -> Option<String>,
) -> impl Fn(&str) -> Option<String> {
    move |key| match (key, &api_url) {
        ("CAMPUS_API_URL", Some(url)) => Some(url.clone()),
        _ => env(key),
    }
}

/// The realtime endpoint lives at `/ws` on the API origin.
fn derive_socket_url(api_url: &str) -> Result<String, ConfigError> {
    let mut url = Url::parse(api_url)
        .map_err(|err| ConfigError::Invalid(format!("api url `{api_url}`: {err}")))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::Invalid(format!("cannot derive socket url from `{api_url}`")))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

fn parse_config(contents: &str) -> Result<ClientSection, ConfigError> {
    let config: CampusConfig = serde_yaml::from_str(contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid campus.yaml: {err}")))?;
    Ok(config.client.unwrap_or_default())
}

fn default_data_dir() -> PathBuf {
    match BaseDirs::new() {
        Some(base) => base.data_dir().join("campus"),
        None => PathBuf::from(".campus"),
    }
}

fn locate_config_file() -> Option<PathBuf> {
    campus_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn campus_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("campus");
        paths.push(config_dir.join("campus.yaml"));
        paths.push(config_dir.join("campus.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".campus").join("campus.yaml"));
        paths.push(home_dir.join(".campus").join("campus.yml"));
    } else {
        paths.push(PathBuf::from("campus.yaml"));
        paths.push(PathBuf::from("campus.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct CampusConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    socket_url: Option<String>,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    data_dir: Option<PathBuf>,
}
