//! Command-line flags, mirrored after a SOCKS5-over-HTTP tunnel's usual
//! flag set: config file > CLI flags > built-in defaults, in ascending
//! precedence.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;
use crate::error::StartupError;

#[derive(Debug, Parser)]
#[command(name = "tunnelproxy", about = "A SOCKS5-over-HTTP tunnel client", version)]
pub struct Cli {
    /// Path to a config file (.yaml, .yml, .toml, or .json).
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Remote endpoint URL, e.g. http://localhost:8080/tunnel.jsp
    #[arg(short, long)]
    pub target: Option<String>,

    /// Listen address of the local SOCKS5 server.
    #[arg(short, long)]
    pub listen: Option<String>,

    /// HTTP request method used against the remote endpoint.
    #[arg(short, long)]
    pub method: Option<String>,

    /// Redirect URL sent when the remote host doesn't match, to route
    /// around a load balancer.
    #[arg(short, long)]
    pub redirect: Option<String>,

    /// Disable SOCKS5 authentication.
    #[arg(long)]
    pub no_auth: bool,

    /// SOCKS5 credentials as username:password. Auto-generated when auth
    /// is required and this is left empty.
    #[arg(long)]
    pub auth: Option<String>,

    /// Connection mode: auto, full, or half.
    #[arg(long)]
    pub mode: Option<String>,

    /// Overrides the User-Agent header.
    #[arg(long)]
    pub ua: Option<String>,

    /// Extra header, repeatable: -H 'Cookie: abc'
    #[arg(short = 'H', long = "header")]
    pub header: Vec<String>,

    /// Request timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Max request body size in bytes.
    #[arg(long = "buf-size")]
    pub buf_size: Option<usize>,

    /// Upstream proxy, repeatable: socks5://127.0.0.1:7890
    #[arg(short, long)]
    pub proxy: Vec<String>,

    /// Print verbose traffic logging.
    #[arg(short, long)]
    pub debug: bool,

    /// Disable the heartbeat keep-alive sent every 5 seconds.
    #[arg(long = "no-heartbeat")]
    pub no_heartbeat: bool,

    /// Disable gzip, for compatibility with older intermediaries.
    #[arg(long = "no-gzip")]
    pub no_gzip: bool,

    /// Enable a full, unrestricted cookie jar.
    #[arg(short, long)]
    pub jar: bool,

    /// Test a real connection; exit 0 on success, 1 otherwise.
    #[arg(short = 'T', long = "test-exit")]
    pub test_exit: Option<String>,

    /// Exclude a domain from tunneling, repeatable.
    #[arg(short = 'E', long = "exclude-domain")]
    pub exclude_domain: Vec<String>,

    /// Exclude domains listed one per line in a file.
    #[arg(long = "exclude-domain-file")]
    pub exclude_domain_file: Option<PathBuf>,

    /// Forward target address; enables forward mode instead of SOCKS5.
    #[arg(short, long)]
    pub forward: Option<String>,
}

impl Cli {
    /// Builds the effective config: file defaults, overridden by any
    /// flag the user actually passed.
    pub fn into_config(self) -> Result<Config, StartupError> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(target) = self.target {
            cfg.target = target;
        }
        if let Some(listen) = self.listen {
            cfg.listen = listen;
        }
        if let Some(method) = self.method {
            cfg.method = method;
        }
        if let Some(redirect) = self.redirect {
            cfg.redirect_url = redirect;
        }
        if self.no_auth {
            cfg.no_auth = true;
        }
        if let Some(auth) = self.auth.filter(|a| !a.is_empty()) {
            let (user, pass) = auth.split_once(':').ok_or_else(|| {
                StartupError::InvalidTarget(auth.clone(), url::ParseError::EmptyHost)
            })?;
            cfg.username = user.to_string();
            cfg.password = pass.to_string();
            cfg.no_auth = false;
        }
        if let Some(mode) = self.mode {
            cfg.mode = mode;
        }
        if let Some(ua) = self.ua {
            set_user_agent(&mut cfg.raw_header, &ua);
        }
        cfg.raw_header.extend(self.header);
        if let Some(timeout) = self.timeout {
            cfg.timeout_secs = timeout;
        }
        if let Some(buf_size) = self.buf_size {
            cfg.buffer_size = buf_size;
        }
        if !self.proxy.is_empty() {
            cfg.upstream_proxy = self.proxy;
        }
        if self.debug {
            cfg.debug = true;
        }
        if self.no_heartbeat {
            cfg.disable_heartbeat = true;
        }
        if self.no_gzip {
            cfg.disable_gzip = true;
        }
        if self.jar {
            cfg.enable_cookiejar = true;
        }
        if let Some(test_exit) = self.test_exit {
            cfg.test_exit = Some(test_exit);
        }
        cfg.exclude_domain.extend(self.exclude_domain);
        if let Some(path) = self.exclude_domain_file {
            let data = std::fs::read_to_string(&path).map_err(|source| StartupError::ConfigRead {
                path: path.display().to_string(),
                source,
            })?;
            cfg.exclude_domain
                .extend(data.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
        }
        if let Some(forward) = self.forward {
            cfg.forward_target = forward;
        }

        if cfg.username.is_empty() && !cfg.no_auth {
            cfg.username = "suo5".to_string();
            cfg.password = random_password(8);
        }

        Ok(cfg)
    }
}

fn set_user_agent(raw_header: &mut [String], ua: &str) {
    for header in raw_header.iter_mut() {
        if header.to_ascii_lowercase().starts_with("user-agent:") {
            *header = format!("User-Agent: {ua}");
            return;
        }
    }
}

fn random_password(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_user_agent_replaces_existing_header() {
        let mut headers = vec!["User-Agent: old".to_string(), "X-Foo: bar".to_string()];
        set_user_agent(&mut headers, "new");
        assert_eq!(headers[0], "User-Agent: new");
        assert_eq!(headers[1], "X-Foo: bar");
    }

    #[test]
    fn random_password_has_requested_length() {
        assert_eq!(random_password(8).len(), 8);
    }

    #[test]
    fn cli_parses_minimal_invocation() {
        let cli = Cli::parse_from(["tunnelproxy", "-t", "http://host/tun.jsp"]);
        assert_eq!(cli.target.as_deref(), Some("http://host/tun.jsp"));
    }
}
