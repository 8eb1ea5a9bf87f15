//! Runtime configuration: defaults, file loading (YAML/TOML/JSON), and
//! the validation/derivation pass that turns raw fields into the values
//! the rest of the crate consumes (parsed headers, compiled exclude
//! globs, a resolved `Referer`).

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigFormatError, StartupError};
use crate::exclude::ExclusionFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplexMode {
    Auto,
    Full,
    Half,
}

impl std::str::FromStr for DuplexMode {
    type Err = StartupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DuplexMode::Auto),
            "full" => Ok(DuplexMode::Full),
            "half" => Ok(DuplexMode::Half),
            other => Err(StartupError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub method: String,
    pub listen: String,
    pub target: String,
    pub no_auth: bool,
    pub username: String,
    pub password: String,
    pub mode: DuplexModeField,
    pub buffer_size: usize,
    pub timeout_secs: u64,
    pub debug: bool,
    pub upstream_proxy: Vec<String>,
    pub redirect_url: String,
    pub raw_header: Vec<String>,
    pub disable_heartbeat: bool,
    pub disable_gzip: bool,
    pub enable_cookiejar: bool,
    pub exclude_domain: Vec<String>,
    pub forward_target: String,
    pub test_exit: Option<String>,
}

/// Wraps `DuplexMode` so the field can be deserialized from the plain
/// lowercase strings config files use, while the rest of the crate works
/// with the parsed enum via `Config::mode()`.
pub type DuplexModeField = String;

impl Default for Config {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            listen: "127.0.0.1:1111".to_string(),
            target: String::new(),
            no_auth: true,
            username: String::new(),
            password: String::new(),
            mode: "auto".to_string(),
            buffer_size: 1024 * 320,
            timeout_secs: 10,
            debug: false,
            upstream_proxy: Vec::new(),
            redirect_url: String::new(),
            raw_header: vec![
                "User-Agent: Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) \
                 AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.1.2.3"
                    .to_string(),
            ],
            disable_heartbeat: false,
            disable_gzip: false,
            enable_cookiejar: false,
            exclude_domain: Vec::new(),
            forward_target: String::new(),
            test_exit: None,
        }
    }
}

/// The config with every derived value resolved: parsed headers, the
/// compiled exclusion filter, and a bound listen address.
pub struct ResolvedConfig {
    pub raw: Config,
    pub mode: DuplexMode,
    pub listen_addr: SocketAddr,
    pub headers: reqwest::header::HeaderMap,
    pub referer: String,
    pub exclude: ExclusionFilter,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, StartupError> {
        let contents = std::fs::read_to_string(path).map_err(|source| StartupError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;

        let parse = |result: Result<Config, ConfigFormatError>| {
            result.map_err(|source| StartupError::ConfigParse {
                path: path.display().to_string(),
                source,
            })
        };

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                parse(serde_yaml::from_str(&contents).map_err(ConfigFormatError::from))
            }
            Some("toml") => parse(toml::from_str(&contents).map_err(ConfigFormatError::from)),
            Some("json") => {
                parse(serde_json::from_str(&contents).map_err(ConfigFormatError::from))
            }
            _ => Err(StartupError::ConfigParse {
                path: path.display().to_string(),
                source: ConfigFormatError::UnknownExtension,
            }),
        }
    }

    /// Validates fields and derives the values the rest of the crate needs.
    pub fn resolve(self) -> Result<ResolvedConfig, StartupError> {
        let mode: DuplexMode = self.mode.parse()?;

        if !(512..=1_024_000).contains(&self.buffer_size) {
            return Err(StartupError::InvalidBufferSize(self.buffer_size));
        }

        let listen_addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|_| StartupError::InvalidTarget(self.listen.clone(), url::ParseError::EmptyHost))?;

        // Validate the target looks like a URL; the actual request
        // building happens in the transport layer.
        let target_url = url::Url::parse(&self.target)
            .map_err(|e| StartupError::InvalidTarget(self.target.clone(), e))?;

        let exclude = ExclusionFilter::compile(&self.exclude_domain)
            .map_err(|(pattern, e)| StartupError::InvalidExcludePattern(pattern, e))?;

        let mut headers = reqwest::header::HeaderMap::new();
        if self.disable_gzip {
            headers.insert(
                reqwest::header::ACCEPT_ENCODING,
                reqwest::header::HeaderValue::from_static("identity"),
            );
        }
        for entry in &self.raw_header {
            if entry.is_empty() {
                continue;
            }
            let (name, value) = entry
                .split_once(':')
                .ok_or_else(|| StartupError::InvalidTarget(entry.clone(), url::ParseError::EmptyHost))?;
            let name = reqwest::header::HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| StartupError::InvalidTarget(entry.clone(), url::ParseError::EmptyHost))?;
            let value = reqwest::header::HeaderValue::from_str(value.trim())
                .map_err(|_| StartupError::InvalidTarget(entry.clone(), url::ParseError::EmptyHost))?;
            headers.insert(name, value);
        }

        let referer = if headers.contains_key(reqwest::header::REFERER) {
            headers
                .get(reqwest::header::REFERER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        } else {
            default_referer(&target_url)
        };

        Ok(ResolvedConfig {
            raw: self,
            mode,
            listen_addr,
            headers,
            referer,
            exclude,
        })
    }
}

/// Mirrors the upstream behavior of deriving `Referer` from everything in
/// the target URL up to (and including) the last path separator.
fn default_referer(target: &url::Url) -> String {
    let s = target.as_str();
    match s.rfind('/') {
        Some(idx) if idx >= s.find("//").map(|p| p + 2).unwrap_or(0) => s[..=idx].to_string(),
        _ => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.method, "POST");
        assert_eq!(cfg.listen, "127.0.0.1:1111");
        assert_eq!(cfg.buffer_size, 327_680);
        assert!(cfg.no_auth);
        assert!(!cfg.enable_cookiejar);
    }

    #[test]
    fn buffer_size_out_of_range_is_rejected() {
        let mut cfg = Config::default();
        cfg.target = "https://example.com/bs5".to_string();
        cfg.buffer_size = 10;
        assert!(matches!(cfg.resolve(), Err(StartupError::InvalidBufferSize(10))));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut cfg = Config::default();
        cfg.target = "https://example.com/bs5".to_string();
        cfg.mode = "sideways".to_string();
        assert!(matches!(cfg.resolve(), Err(StartupError::InvalidMode(_))));
    }

    #[test]
    fn referer_defaults_to_target_directory() {
        let url = url::Url::parse("https://example.com/app/bs5.jsp").unwrap();
        assert_eq!(default_referer(&url), "https://example.com/app/");
    }

    #[test]
    fn explicit_referer_header_overrides_derivation() {
        let mut cfg = Config::default();
        cfg.target = "https://example.com/bs5".to_string();
        cfg.raw_header.push("Referer: https://other.example/".to_string());
        let resolved = cfg.resolve().unwrap();
        assert_eq!(resolved.referer, "https://other.example/");
    }

    fn write_temp(ext: &str, contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("config.{ext}"));
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_yaml_config_file() {
        let (_dir, path) = write_temp(
            "yaml",
            "target: https://example.com/bs5\nbuffer_size: 4096\nno_auth: false\n",
        );
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.target, "https://example.com/bs5");
        assert_eq!(cfg.buffer_size, 4096);
        assert!(!cfg.no_auth);
    }

    #[test]
    fn loads_toml_config_file() {
        let (_dir, path) = write_temp(
            "toml",
            "target = \"https://example.com/bs5\"\nmethod = \"GET\"\n",
        );
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.target, "https://example.com/bs5");
        assert_eq!(cfg.method, "GET");
    }

    #[test]
    fn loads_json_config_file() {
        let (_dir, path) = write_temp("json", "{\"target\": \"https://example.com/bs5\"}");
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.target, "https://example.com/bs5");
    }

    #[test]
    fn unknown_extension_is_a_parse_error() {
        let (_dir, path) = write_temp("conf", "target: https://example.com/bs5\n");
        assert!(matches!(
            Config::from_file(&path),
            Err(StartupError::ConfigParse { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.yaml");
        assert!(matches!(Config::from_file(&path), Err(StartupError::ConfigRead { .. })));
    }
}
