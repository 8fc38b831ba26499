//! certroll — replace one stored certificate and restart what uses it
//!
//! A run:
//! - Locates the certificate record by refid in the configuration store
//! - Imports the new certificate chain and private key into it, in place
//! - Persists the whole configuration atomically, with a change note
//! - Restarts every service bound to that certificate, reporting failures
//!
//! Exit status: 0 success, 1 operational error, 3 refid not found,
//! 4 material rejected or persist failed, 5 one or more restarts failed.

use anyhow::{bail, Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod locator;
mod pipeline;
mod restart;
mod service;
mod store;
mod updater;

#[cfg(test)]
mod test_support;

use config::CertrollConfig;
use pipeline::{UpdateRequest, EXIT_ERROR};
use service::{ServiceManager, SystemServices};
use store::{CertificateMaterial, FileStore};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tool configuration file [default: $CERTROLL_CONFIG or /etc/certroll/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Configuration store to operate on, overriding `store.path`
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Print one JSON result on stdout; log lines go to stderr
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace a certificate and restart the services that use it
    Update {
        /// refid of the certificate record to replace
        #[arg(long, value_parser = NonEmptyStringValueParser::new())]
        refid: String,

        /// PEM file holding the certificate (chain)
        #[arg(long)]
        certificate: PathBuf,

        /// PEM file holding the private key
        #[arg(long)]
        private_key: PathBuf,
    },
    /// List stored certificates and the services bound to each
    List,
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            if args.json {
                emit_json(&json!({
                    "status": "error",
                    "exit_code": EXIT_ERROR,
                    "error": format!("{e:#}"),
                }));
            } else {
                eprintln!("certroll: {e:#}");
            }
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(args: &Args) -> Result<u8> {
    let config_path = config::config_path(args.config.as_deref());
    let loaded = config::load_config(&config_path);

    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.as_str())
        .unwrap_or("info");
    init_logging(level, args.json)?;

    let config = loaded?;
    if !config_path.exists() {
        warn!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
    }

    match &args.command {
        Commands::Update {
            refid,
            certificate,
            private_key,
        } => update(args, &config, refid, certificate, private_key),
        Commands::List => list(args, &config),
    }
}

fn init_logging(level: &str, to_stderr: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level \"{level}\""))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .compact();

    let installed = if to_stderr {
        tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("Failed to set tracing subscriber")?;
    Ok(())
}

fn open_store(args: &Args, config: &CertrollConfig) -> Result<FileStore> {
    let path = args
        .store
        .clone()
        .unwrap_or_else(|| config.store.path.clone());
    FileStore::open(&path, config.store.backup_policy())
        .with_context(|| format!("Failed to open configuration store {}", path.display()))
}

fn update(
    args: &Args,
    config: &CertrollConfig,
    refid: &str,
    certificate: &Path,
    private_key: &Path,
) -> Result<u8> {
    let credentials_dir = std::env::var_os("CREDENTIALS_DIRECTORY");
    let material = CertificateMaterial {
        certificate: read_pem(certificate, credentials_dir.clone(), "certificate")?,
        private_key: read_pem(private_key, credentials_dir, "private key")?,
    };

    let mut store = open_store(args, config)?;
    let services = SystemServices::new(store.document().services.clone(), config.restart.timeout());
    let request = UpdateRequest {
        refid: refid.to_string(),
        material,
    };

    match pipeline::run(&mut store, &services, &request) {
        Ok(report) => {
            let code = report.exit_code();
            if report.restarts.is_success() {
                info!(
                    "Certificate \"{}\" ({}) replaced, {} service(s) restarted",
                    report.certificate.description,
                    report.certificate.refid,
                    report.restarts.restarted.len()
                );
            } else {
                error!(
                    "Certificate \"{}\" ({}) replaced, but {} service(s) failed to restart",
                    report.certificate.description,
                    report.certificate.refid,
                    report.restarts.failed.len()
                );
            }
            if args.json {
                let status = if code == pipeline::EXIT_SUCCESS {
                    "ok"
                } else {
                    "restart_failed"
                };
                emit_json(&json!({
                    "status": status,
                    "exit_code": code,
                    "certificate": report.certificate,
                    "restarts": report.restarts,
                }));
            }
            Ok(code)
        }
        Err(e) => {
            let code = e.exit_code();
            error!("{e}");
            if args.json {
                let status = if code == pipeline::EXIT_NOT_FOUND {
                    "not_found"
                } else {
                    "persist_failed"
                };
                emit_json(&json!({
                    "status": status,
                    "exit_code": code,
                    "refid": refid,
                    "error": e.to_string(),
                }));
            }
            Ok(code)
        }
    }
}

fn list(args: &Args, config: &CertrollConfig) -> Result<u8> {
    let store = open_store(args, config)?;
    let services = SystemServices::new(store.document().services.clone(), config.restart.timeout());

    let entries: Vec<_> = store
        .document()
        .certificates
        .iter()
        .map(|cert| {
            let consumers: Vec<String> = services
                .list_consumers(&cert.refid)
                .into_iter()
                .map(|s| s.name)
                .collect();
            (cert.refid.clone(), cert.description.clone(), consumers)
        })
        .collect();

    if args.json {
        let certificates: Vec<_> = entries
            .iter()
            .map(|(refid, description, consumers)| {
                json!({ "refid": refid, "description": description, "consumers": consumers })
            })
            .collect();
        emit_json(&json!({ "status": "ok", "certificates": certificates }));
    } else if entries.is_empty() {
        println!("No certificates in {}", store.path().display());
    } else {
        for (refid, description, consumers) in &entries {
            let used_by = if consumers.is_empty() {
                "unused".to_string()
            } else {
                consumers.join(", ")
            };
            println!("{refid}\t{description}\t{used_by}");
        }
    }

    Ok(pipeline::EXIT_SUCCESS)
}

/// Expand a leading `$CREDENTIALS_DIRECTORY` component (systemd credentials).
fn resolve_credential_path(path: &Path, credentials_dir: Option<OsString>) -> Result<PathBuf> {
    match path.strip_prefix("$CREDENTIALS_DIRECTORY") {
        Ok(rest) => match credentials_dir {
            Some(dir) => Ok(PathBuf::from(dir).join(rest)),
            None => bail!(
                "$CREDENTIALS_DIRECTORY is referenced in {} yet that environment variable isn't set",
                path.display()
            ),
        },
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn read_pem(path: &Path, credentials_dir: Option<OsString>, what: &str) -> Result<String> {
    let path = resolve_credential_path(path, credentials_dir)?;
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {what} from {}", path.display()))?;
    if content.trim().is_empty() {
        bail!("{what} file {} is empty", path.display());
    }
    Ok(content)
}

fn emit_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("certroll: failed to serialize result: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_update_args() {
        let args = Args::try_parse_from([
            "certroll",
            "--json",
            "update",
            "--refid",
            "5f0c2a",
            "--certificate",
            "fullchain.pem",
            "--private-key",
            "key.pem",
        ])
        .unwrap();
        assert!(args.json);
        match args.command {
            Commands::Update { refid, private_key, .. } => {
                assert_eq!(refid, "5f0c2a");
                assert_eq!(private_key, PathBuf::from("key.pem"));
            }
            Commands::List => panic!("expected update"),
        }
    }

    #[test]
    fn test_empty_refid_rejected() {
        let result = Args::try_parse_from([
            "certroll",
            "update",
            "--refid",
            "",
            "--certificate",
            "a.pem",
            "--private-key",
            "b.pem",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_credential_path_expansion() {
        let expanded = resolve_credential_path(
            Path::new("$CREDENTIALS_DIRECTORY/fullchain.pem"),
            Some(OsString::from("/run/credentials/certroll.service")),
        )
        .unwrap();
        assert_eq!(
            expanded,
            PathBuf::from("/run/credentials/certroll.service/fullchain.pem")
        );

        let plain = resolve_credential_path(Path::new("/etc/ssl/key.pem"), None).unwrap();
        assert_eq!(plain, PathBuf::from("/etc/ssl/key.pem"));

        assert!(resolve_credential_path(Path::new("$CREDENTIALS_DIRECTORY/key.pem"), None).is_err());
    }

    #[test]
    fn test_read_pem_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, "\n").unwrap();
        let err = read_pem(&path, None, "certificate").unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[test]
    fn test_update_against_file_store() {
        use base64::prelude::*;
        use crate::test_support::{TEST_CERT, TEST_KEY};

        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("config.toml");
        fs::write(
            &store_path,
            format!(
                r#"
[[cert]]
refid = "A"
descr = "Router UI"
crt = "{old}"
prv = "{old}"

[[cert]]
refid = "B"
descr = "Mail relay"
crt = "{old}"
prv = "{old}"

[[service]]
name = "relay"
certref = "B"
restart = {{ kind = "command", argv = ["true"] }}
"#,
                old = BASE64_STANDARD.encode("old")
            ),
        )
        .unwrap();
        let cert_path = dir.path().join("fullchain.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, TEST_CERT).unwrap();
        fs::write(&key_path, TEST_KEY).unwrap();

        let argv: Vec<OsString> = vec![
            "certroll".into(),
            "--store".into(),
            store_path.clone().into_os_string(),
            "update".into(),
            "--refid".into(),
            "B".into(),
            "--certificate".into(),
            cert_path.clone().into_os_string(),
            "--private-key".into(),
            key_path.clone().into_os_string(),
        ];
        let args = Args::try_parse_from(argv).unwrap();
        let mut config = CertrollConfig::default();
        config.store.backup_dir = dir.path().join("backup");

        let code = update(&args, &config, "B", &cert_path, &key_path).unwrap();
        assert_eq!(code, pipeline::EXIT_SUCCESS);

        let code = update(&args, &config, "Z", &cert_path, &key_path).unwrap();
        assert_eq!(code, pipeline::EXIT_NOT_FOUND);

        let store = FileStore::open(&store_path, config.store.backup_policy()).unwrap();
        let certs = &store.document().certificates;
        assert_eq!(certs[0].certificate, "old");
        assert_eq!(certs[1].certificate, TEST_CERT);
        assert_eq!(certs[1].private_key, TEST_KEY);
    }
}
