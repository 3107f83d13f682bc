use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::tunnel::{Role, transport, transport::TlsOptions};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

const CANDIDATES: [&str; 3] = ["drbfire.toml", "drbfire.yaml", "drbfire.yml"];

/// Flag, then `DRBFIRE_CONFIG`, then `drbfire.*` in the working directory,
/// then the OS default.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(explicit_flag_path, Path::new("."))
}

fn resolve_config_path_in(
    explicit_flag_path: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds DRBFIRE_CONFIG into the flag; this covers library callers.
    if let Some(p) = std::env::var_os("DRBFIRE_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(cwd) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CANDIDATES[0])));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/drbfire/drbfire.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("org", "drbfire", "drbfire")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join(CANDIDATES[0]))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&s, path)
}

fn parse_config(s: &str, path: &Path) -> anyhow::Result<Config> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub metrics_addr: String,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub role: Option<Role>,
    pub uri: String,
    pub transport: String,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Outside peer only: evict registrations that saw no traffic for this
    /// long. Zero disables the sweep.
    ///
    /// Idleness is measured by traffic (registration, deliveries, requests),
    /// not by liveness. A healthy inside peer that nobody calls is evicted
    /// too; its signal stream is closed and its `accept` loop ends, which
    /// ends that process. Set this well above the longest expected quiet
    /// period, or leave it at zero when inside peers are long-lived.
    pub idle_timeout: Duration,
    pub tls: TlsOptions,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            role: None,
            uri: String::new(),
            transport: "tcp".into(),
            request_timeout: Duration::from_millis(20_000),
            handshake_timeout: Duration::from_millis(3_000),
            idle_timeout: Duration::ZERO,
            tls: TlsOptions::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    metrics_addr: String,
    logging: Option<FileLogging>,
    tunnel: Option<FileTunnel>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileTunnel {
    role: Option<String>,
    uri: Option<String>,
    transport: Option<String>,
    request_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    tls: Option<FileTls>,
}

#[derive(Debug, Deserialize)]
struct FileTls {
    cert_file: Option<String>,
    key_file: Option<String>,
    ca_file: Option<String>,
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
}

fn trimmed(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    v.map(|ms| Duration::from_millis(ms.max(0) as u64))
        .unwrap_or(default)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            metrics_addr: fc.metrics_addr.trim().to_string(),
            ..Config::default()
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = trimmed(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = trimmed(&l.format) {
                cfg.logging.format = fmt.to_ascii_lowercase();
            }
            if let Some(out) = trimmed(&l.output) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }
        match cfg.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("config: logging.format {other:?} (expected text|json)"),
        }

        // --- Tunnel ---
        if let Some(t) = &fc.tunnel {
            let d = TunnelConfig::default();
            cfg.tunnel.role = trimmed(&t.role)
                .map(|r| r.parse::<Role>())
                .transpose()
                .context("config: tunnel.role")?;
            cfg.tunnel.uri = trimmed(&t.uri).unwrap_or_default();
            cfg.tunnel.transport = transport::parse_transport(t.transport.as_deref().unwrap_or(""))
                .context("config: tunnel.transport")?;
            cfg.tunnel.request_timeout = millis(t.request_timeout_ms, d.request_timeout);
            cfg.tunnel.handshake_timeout = millis(t.handshake_timeout_ms, d.handshake_timeout);
            cfg.tunnel.idle_timeout = millis(t.idle_timeout_ms, d.idle_timeout);

            if let Some(tls) = &t.tls {
                cfg.tunnel.tls = TlsOptions {
                    cert_file: trimmed(&tls.cert_file).unwrap_or_default(),
                    key_file: trimmed(&tls.key_file).unwrap_or_default(),
                    ca_file: trimmed(&tls.ca_file).unwrap_or_default(),
                    server_name: trimmed(&tls.server_name).unwrap_or_default(),
                    insecure_skip_verify: tls.insecure_skip_verify,
                };
            }
        }

        if cfg.tunnel.request_timeout.is_zero() {
            anyhow::bail!("config: tunnel.request_timeout_ms must be positive");
        }
        if cfg.tunnel.handshake_timeout.is_zero() {
            anyhow::bail!("config: tunnel.handshake_timeout_ms must be positive");
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "drbfire_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn full_toml_config() {
        let dir = temp_dir("full_toml");
        let cfg_path = dir.join("drbfire.toml");

        let toml = r#"
metrics_addr = "127.0.0.1:9100"

[tunnel]
role = "Server"
uri = " drbfire://0.0.0.0:7000 "
transport = "TLS"
request_timeout_ms = 1500
idle_timeout_ms = 60000

[tunnel.tls]
cert_file = "cert.pem"
key_file = "key.pem"

[logging]
level = "debug"
format = "JSON"
output = "discard"
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.metrics_addr, "127.0.0.1:9100");
        assert_eq!(cfg.tunnel.role, Some(Role::Server));
        assert_eq!(cfg.tunnel.uri, "drbfire://0.0.0.0:7000");
        assert_eq!(cfg.tunnel.transport, "tls");
        assert_eq!(cfg.tunnel.request_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.tunnel.handshake_timeout, Duration::from_secs(3));
        assert_eq!(cfg.tunnel.idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.tunnel.tls.cert_file, "cert.pem");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.logging.output, "discard");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_config_with_defaults() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("drbfire.yaml");

        let yaml = "tunnel:\n  role: client\n  uri: drbfire://example.com:7000\n";

        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.tunnel.role, Some(Role::Client));
        assert_eq!(cfg.tunnel.transport, "tcp");
        assert_eq!(cfg.tunnel.request_timeout, Duration::from_secs(20));
        assert!(cfg.tunnel.idle_timeout.is_zero());
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "text");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_role_is_left_for_the_caller() {
        let cfg = parse_config("[tunnel]\nuri = \"drbfire://h:1\"\n", Path::new("x.toml")).unwrap();
        assert_eq!(cfg.tunnel.role, None);
    }

    #[test]
    fn reject_unknown_top_level_field() {
        let err = parse_config("listeners = []\n", Path::new("x.toml")).unwrap_err();
        let msg = format!("{err:#}").to_ascii_lowercase();
        assert!(msg.contains("listeners"), "expected error mentioning listeners, got: {msg}");
    }

    #[test]
    fn reject_bad_values() {
        for bad in [
            "[tunnel]\nrole = \"peer\"\n",
            "[tunnel]\ntransport = \"quic\"\n",
            "[tunnel]\nrequest_timeout_ms = 0\n",
            "[logging]\nformat = \"xml\"\n",
        ] {
            assert!(parse_config(bad, Path::new("x.toml")).is_err(), "accepted: {bad}");
        }
        assert!(parse_config("", Path::new("x.ini")).is_err());
    }

    #[test]
    fn resolve_prefers_flag_then_cwd() {
        let dir = temp_dir("resolve");
        std::fs::write(dir.join("drbfire.yml"), "{}").expect("write");

        let r = resolve_config_path_in(Some(dir.join("explicit.toml")), &dir).unwrap();
        assert_eq!(r.source, ConfigPathSource::Flag);
        assert_eq!(r.path, dir.join("explicit.toml"));

        let r = resolve_config_path_in(Some(dir.clone()), &dir).unwrap();
        assert_eq!(r.path, dir.join("drbfire.yml"));

        if std::env::var_os("DRBFIRE_CONFIG").is_none() {
            let r = resolve_config_path_in(None, &dir).unwrap();
            assert_eq!(r.source, ConfigPathSource::Cwd);
            assert_eq!(r.path, dir.join("drbfire.yml"));
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
