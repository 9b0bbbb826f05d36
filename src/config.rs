//! Runtime configuration and the backend composition grammar.
//!
//! The command line carries a small recursive spec selecting the root
//! backend (`-os`, `-zip`, `-sftp`, optionally wrapped by `-shim`); the
//! optional TOML file supplies the engine address, the mount allow-list
//! and the metadata freshness window.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio::task;

use crate::backend::os::OsBackend;
use crate::backend::sftp::SftpBackend;
use crate::backend::zip::ZipBackend;
use crate::backend::{BackendFS, Error};
use crate::shim::{CacheShim, ShimConfig, DEFAULT_METADATA_TTL};

/// Command-line interface of the gateway executable.
#[derive(Debug, Parser)]
#[command(
    name = "nfs-gate",
    about = "User-space NFSv3 gateway over pluggable storage backends",
    after_help = "BACKEND SPEC:\n  \
        -os <root_path>\n  \
        -zip <archive_path>\n  \
        -sftp <user:pass@host:port/path>\n  \
        -shim <scratch_dir> <budget_mib> <nested-spec>"
)]
pub struct Cli {
    /// Address handed to the NFS engine.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Optional TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Metadata freshness window override, in seconds.
    #[arg(long)]
    pub ttl: Option<u64>,

    /// Backend composition, e.g. `-shim /tmp/scratch 32 -os /srv/export`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub backend: Vec<String>,
}

/// Values read from the optional configuration file. Command-line flags
/// win over these.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    /// Client addresses allowed to mount; empty means loopback only.
    #[serde(default)]
    pub allow: Vec<IpAddr>,
    pub metadata_ttl_secs: Option<u64>,
}

/// Errors produced while interpreting configuration inputs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Unparsable {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unrecognized backend flag `{0}`")]
    UnknownFlag(String),
    #[error("missing argument for `{0}`")]
    MissingArgument(&'static str),
    #[error("trailing backend arguments: {0:?}")]
    Trailing(Vec<String>),
    #[error("invalid sftp target `{0}`")]
    BadSftpTarget(String),
    #[error("invalid budget `{0}`")]
    BadBudget(String),
}

/// Load and parse the TOML configuration file.
pub fn load_file(path: &PathBuf) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Unreadable { path: path.clone(), source })?;
    toml::from_str(&text)
        .map_err(|source| ConfigError::Unparsable { path: path.clone(), source })
}

/// Parsed `user:pass@host:port/path` SFTP target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpTarget {
    pub user: String,
    pub pass: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl FromStr for SftpTarget {
    type Err = ConfigError;

    /// Split at `@`, then `:` on each side, then the first `/`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadSftpTarget(s.to_owned());
        let (credentials, location) = s.split_once('@').ok_or_else(bad)?;
        let (user, pass) = match credentials.split_once(':') {
            Some((user, pass)) => (user, pass),
            None => (credentials, ""),
        };
        if user.is_empty() {
            return Err(bad());
        }

        let (endpoint, path) = match location.find('/') {
            Some(idx) => (&location[..idx], &location[idx..]),
            None => (location, "/"),
        };
        let (host, port) = match endpoint.split_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| bad())?),
            None => (endpoint, 22),
        };
        if host.is_empty() {
            return Err(bad());
        }

        Ok(SftpTarget {
            user: user.to_owned(),
            pass: pass.to_owned(),
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }
}

/// Recursive backend selection grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSpec {
    Os { root: PathBuf },
    Zip { archive: PathBuf },
    Sftp { target: SftpTarget },
    Shim { scratch_dir: PathBuf, budget_mib: u64, inner: Box<BackendSpec> },
}

/// Parse the trailing command-line words into a [`BackendSpec`].
pub fn parse_backend_spec(args: &[String]) -> Result<BackendSpec, ConfigError> {
    let (spec, rest) = parse_one(args)?;
    if rest.is_empty() {
        Ok(spec)
    } else {
        Err(ConfigError::Trailing(rest.to_vec()))
    }
}

fn parse_one(args: &[String]) -> Result<(BackendSpec, &[String]), ConfigError> {
    let (flag, rest) = args
        .split_first()
        .ok_or(ConfigError::MissingArgument("backend spec"))?;
    match flag.as_str() {
        "-os" => {
            let (root, rest) =
                rest.split_first().ok_or(ConfigError::MissingArgument("-os"))?;
            Ok((BackendSpec::Os { root: PathBuf::from(root) }, rest))
        }
        "-zip" => {
            let (archive, rest) =
                rest.split_first().ok_or(ConfigError::MissingArgument("-zip"))?;
            Ok((BackendSpec::Zip { archive: PathBuf::from(archive) }, rest))
        }
        "-sftp" => {
            let (target, rest) =
                rest.split_first().ok_or(ConfigError::MissingArgument("-sftp"))?;
            Ok((BackendSpec::Sftp { target: target.parse()? }, rest))
        }
        "-shim" => {
            let (scratch, rest) =
                rest.split_first().ok_or(ConfigError::MissingArgument("-shim"))?;
            let (budget, rest) =
                rest.split_first().ok_or(ConfigError::MissingArgument("-shim"))?;
            let budget_mib = budget
                .parse::<u64>()
                .map_err(|_| ConfigError::BadBudget(budget.clone()))?;
            let (inner, rest) = parse_one(rest)?;
            Ok((
                BackendSpec::Shim {
                    scratch_dir: PathBuf::from(scratch),
                    budget_mib,
                    inner: Box::new(inner),
                },
                rest,
            ))
        }
        other => Err(ConfigError::UnknownFlag(other.to_owned())),
    }
}

/// Construct the backend stack a spec describes. Blocking constructors
/// (archive indexing, the SSH handshake) run here, before serving
/// starts.
pub fn build_backend(spec: BackendSpec, ttl: Duration) -> crate::backend::Result<Box<dyn BackendFS>> {
    match spec {
        BackendSpec::Os { root } => Ok(Box::new(OsBackend::new(root)?)),
        BackendSpec::Zip { archive } => Ok(Box::new(ZipBackend::open(archive)?)),
        BackendSpec::Sftp { target } => Ok(Box::new(SftpBackend::connect(
            &target.user,
            &target.pass,
            &target.host,
            target.port,
            &target.path,
        )?)),
        BackendSpec::Shim { scratch_dir, budget_mib, inner } => {
            let inner = build_backend(*inner, ttl)?;
            let shim = CacheShim::new(
                inner,
                ShimConfig {
                    scratch_dir,
                    scratch_budget: budget_mib * 1024 * 1024,
                    metadata_ttl: ttl,
                },
            )?;
            Ok(Box::new(shim))
        }
    }
}

/// Off-runtime wrapper around [`build_backend`] for the async entry
/// point.
pub async fn build_backend_blocking(
    spec: BackendSpec,
    ttl: Duration,
) -> crate::backend::Result<Box<dyn BackendFS>> {
    task::spawn_blocking(move || build_backend(spec, ttl))
        .await
        .map_err(|err| Error::io(err))?
}

/// Metadata TTL resolved from CLI flag, config file, then the default.
pub fn resolve_ttl(cli_ttl: Option<u64>, file: &FileConfig) -> Duration {
    cli_ttl
        .or(file.metadata_ttl_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_METADATA_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn parses_flat_backends() {
        assert_eq!(
            parse_backend_spec(&words(&["-os", "/srv/export"])).unwrap(),
            BackendSpec::Os { root: PathBuf::from("/srv/export") }
        );
        assert_eq!(
            parse_backend_spec(&words(&["-zip", "/tmp/a.zip"])).unwrap(),
            BackendSpec::Zip { archive: PathBuf::from("/tmp/a.zip") }
        );
    }

    #[test]
    fn parses_nested_shim() {
        let spec =
            parse_backend_spec(&words(&["-shim", "/tmp/scratch", "32", "-os", "/srv"])).unwrap();
        assert_eq!(
            spec,
            BackendSpec::Shim {
                scratch_dir: PathBuf::from("/tmp/scratch"),
                budget_mib: 32,
                inner: Box::new(BackendSpec::Os { root: PathBuf::from("/srv") }),
            }
        );
    }

    #[test]
    fn shims_can_stack() {
        let spec = parse_backend_spec(&words(&[
            "-shim", "/a", "8", "-shim", "/b", "16", "-zip", "/x.zip",
        ]))
        .unwrap();
        let BackendSpec::Shim { inner, .. } = spec else { panic!("outer shim expected") };
        assert!(matches!(*inner, BackendSpec::Shim { .. }));
    }

    #[test]
    fn rejects_bad_grammar() {
        assert!(matches!(
            parse_backend_spec(&words(&["-tape", "/dev/st0"])),
            Err(ConfigError::UnknownFlag(_))
        ));
        assert!(matches!(
            parse_backend_spec(&words(&["-os"])),
            Err(ConfigError::MissingArgument(_))
        ));
        assert!(matches!(
            parse_backend_spec(&words(&["-os", "/srv", "extra"])),
            Err(ConfigError::Trailing(_))
        ));
        assert!(matches!(
            parse_backend_spec(&words(&["-shim", "/s", "lots", "-os", "/srv"])),
            Err(ConfigError::BadBudget(_))
        ));
    }

    #[test]
    fn sftp_target_full_form() {
        let target: SftpTarget = "alice:secret@files.example.net:2222/srv/data".parse().unwrap();
        assert_eq!(target.user, "alice");
        assert_eq!(target.pass, "secret");
        assert_eq!(target.host, "files.example.net");
        assert_eq!(target.port, 2222);
        assert_eq!(target.path, "/srv/data");
    }

    #[test]
    fn sftp_target_defaults() {
        let target: SftpTarget = "bob@host".parse().unwrap();
        assert_eq!(target.pass, "");
        assert_eq!(target.port, 22);
        assert_eq!(target.path, "/");

        let target: SftpTarget = "bob:@host/export".parse().unwrap();
        assert_eq!(target.pass, "");
        assert_eq!(target.path, "/export");
    }

    #[test]
    fn sftp_target_rejects_garbage() {
        assert!("no-at-sign".parse::<SftpTarget>().is_err());
        assert!("@host/path".parse::<SftpTarget>().is_err());
        assert!("user@host:notaport/path".parse::<SftpTarget>().is_err());
    }

    #[test]
    fn ttl_resolution_prefers_cli() {
        let file = FileConfig { metadata_ttl_secs: Some(30), ..FileConfig::default() };
        assert_eq!(resolve_ttl(Some(7), &file), Duration::from_secs(7));
        assert_eq!(resolve_ttl(None, &file), Duration::from_secs(30));
        assert_eq!(resolve_ttl(None, &FileConfig::default()), DEFAULT_METADATA_TTL);
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gate.toml");
        std::fs::write(
            &path,
            "listen = \"0.0.0.0:12049\"\nallow = [\"127.0.0.1\", \"10.0.0.8\"]\nmetadata_ttl_secs = 9\n",
        )
        .unwrap();

        let config = load_file(&path).expect("config parses");
        assert_eq!(config.listen.unwrap().port(), 12049);
        assert_eq!(config.allow.len(), 2);
        assert_eq!(config.metadata_ttl_secs, Some(9));

        assert!(load_file(&dir.path().join("absent.toml")).is_err());
    }
}
