use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use kra_core::migrate::{
    transform, FieldPolicy, IdOffset, NamingContextRewrite, OffsetMode, RewrapOptions,
    TargetPublicKey, TransformOptions, TransformReport,
};
use kra_core::{KraError, SoftwareToken, StorageKeyUnit, SymmetricAlgorithm, WrapAlgorithm};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use zeroize::Zeroizing;

/// Rewrites a KRA LDIF export for import into another KRA
#[derive(Parser)]
#[command(
    name = "kratool",
    version,
    after_long_help = "Records whose requestType is not recognised are copied as generic \
records: their identifiers are not offset and a warning is logged for each one."
)]
struct Cli {
    /// LDIF file exported from the source KRA
    #[arg(long, value_name = "PATH")]
    source_ldif_file: PathBuf,

    /// LDIF file to write for the target KRA
    #[arg(long, value_name = "PATH")]
    target_ldif_file: PathBuf,

    /// Write log output here instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// `kratool.ldif.<recordType>.<field>=true|false` field policy
    #[arg(long, value_name = "PATH")]
    kratool_config_file: Option<PathBuf>,

    /// PEM private key of the source storage unit
    #[arg(long, value_name = "PATH", requires = "target_storage_certificate_file")]
    source_storage_key: Option<PathBuf>,

    /// File whose first line unlocks the source storage key
    #[arg(long, value_name = "PATH", requires = "source_storage_key")]
    source_storage_password_file: Option<PathBuf>,

    /// Password that unlocks the source storage key
    #[arg(
        long,
        env = "KRATOOL_SOURCE_PASSWORD",
        hide_env_values = true,
        conflicts_with = "source_storage_password_file"
    )]
    source_storage_password: Option<String>,

    /// Certificate or public key of the target storage unit
    #[arg(long, value_name = "PATH", requires = "source_storage_key")]
    target_storage_certificate_file: Option<PathBuf>,

    /// Add this offset to every request and key identifier
    #[arg(long, value_name = "N", conflicts_with = "remove_id_offset")]
    append_id_offset: Option<String>,

    /// Subtract this offset from every request and key identifier
    #[arg(long, value_name = "N")]
    remove_id_offset: Option<String>,

    /// Naming context to replace
    #[arg(long, value_name = "DN", requires = "target_kra_naming_context")]
    source_kra_naming_context: Option<String>,

    /// Replacement naming context
    #[arg(long, value_name = "DN", requires = "source_kra_naming_context")]
    target_kra_naming_context: Option<String>,

    /// Drop every record that is neither a request nor a key record
    #[arg(long)]
    process_requests_and_key_records_only: bool,

    /// Wrap session keys with RSA-OAEP instead of PKCS#1 v1.5
    #[arg(long)]
    use_oaep: bool,

    /// Algorithm of the archived session keys
    #[arg(long, value_name = "ALG", default_value = "DES3")]
    unwrap_algorithm: String,

    /// Write the run report as JSON
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Kra(#[from] KraError),

    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Usage(String),

    #[error("failed to write report: {0}")]
    Report(#[from] serde_json::Error),
}

impl CliError {
    fn suggestion(&self) -> Option<&str> {
        match self {
            CliError::Kra(e) => e.suggestion(),
            _ => None,
        }
    }
}

fn open(path: &Path) -> Result<File, CliError> {
    File::open(path).map_err(|source| CliError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn create(path: &Path) -> Result<File, CliError> {
    File::create(path).map_err(|source| CliError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn read_to_string(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn init_logging(log_file: Option<&Path>) -> Result<(), CliError> {
    let (file_layer, stderr_layer) = match log_file {
        Some(path) => {
            let file = create(path)?;
            (
                Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
                None,
            )
        }
        None => (None, Some(fmt::layer().with_writer(std::io::stderr))),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

fn source_password(cli: &Cli) -> Result<Option<Zeroizing<String>>, CliError> {
    if let Some(path) = &cli.source_storage_password_file {
        let contents = Zeroizing::new(read_to_string(path)?);
        let first = contents.lines().next().unwrap_or("").trim_end();
        return Ok(Some(Zeroizing::new(first.to_string())));
    }
    Ok(cli
        .source_storage_password
        .as_ref()
        .map(|password| Zeroizing::new(password.clone())))
}

fn rewrap_options(cli: &Cli) -> Result<Option<RewrapOptions>, CliError> {
    let (Some(key_path), Some(cert_path)) = (
        &cli.source_storage_key,
        &cli.target_storage_certificate_file,
    ) else {
        return Ok(None);
    };

    let pem = Zeroizing::new(read_to_string(key_path)?);
    let password = source_password(cli)?;
    let token = SoftwareToken::from_pem(
        "source storage",
        &pem,
        password.as_ref().map(|p| p.as_str()),
    )?;
    let target = TargetPublicKey::from_pem(&read_to_string(cert_path)?)?;
    info!(bits = target.bits(), "loaded target storage public key");

    let wrap_algorithm = if cli.use_oaep {
        WrapAlgorithm::RsaOaep
    } else {
        WrapAlgorithm::RsaPkcs1
    };
    let options = RewrapOptions::new(Arc::new(StorageKeyUnit::new(token)), target)
        .with_wrap_algorithm(wrap_algorithm)
        .with_unwrap_algorithm(SymmetricAlgorithm::parse(&cli.unwrap_algorithm)?)
        .with_password_file(cli.source_storage_password_file.is_some());
    Ok(Some(options))
}

fn transform_options(cli: &Cli) -> Result<TransformOptions, CliError> {
    let id_offset = match (&cli.append_id_offset, &cli.remove_id_offset) {
        (Some(offset), _) => Some(IdOffset::parse(OffsetMode::Append, offset)?),
        (None, Some(offset)) => Some(IdOffset::parse(OffsetMode::Remove, offset)?),
        (None, None) => None,
    };

    let naming_context = match (&cli.source_kra_naming_context, &cli.target_kra_naming_context) {
        (Some(source), Some(target)) => Some(NamingContextRewrite::new(source, target)),
        _ => None,
    };

    let field_policy = match &cli.kratool_config_file {
        Some(path) => FieldPolicy::parse(&read_to_string(path)?),
        None => FieldPolicy::all_enabled(),
    };

    let options = TransformOptions {
        id_offset,
        requests_and_keys_only: cli.process_requests_and_key_records_only,
        naming_context,
        rewrap: rewrap_options(cli)?,
        field_policy,
        ..TransformOptions::default()
    };
    options.validate()?;
    Ok(options)
}

fn run(cli: &Cli) -> Result<TransformReport, CliError> {
    if cli.source_ldif_file == cli.target_ldif_file {
        return Err(CliError::Usage(
            "source and target LDIF files must differ".to_string(),
        ));
    }

    let options = transform_options(cli)?;
    let input = BufReader::new(open(&cli.source_ldif_file)?);
    let output = BufWriter::new(create(&cli.target_ldif_file)?);

    info!(
        source = %cli.source_ldif_file.display(),
        target = %cli.target_ldif_file.display(),
        "processing LDIF records"
    );
    let report = match transform(input, output, &options) {
        Ok(report) => report,
        Err(e) => {
            error!(
                path = %cli.target_ldif_file.display(),
                "target file is incomplete and must not be imported"
            );
            if let Err(remove) = std::fs::remove_file(&cli.target_ldif_file) {
                error!(path = %cli.target_ldif_file.display(), error = %remove, "could not remove target file");
            }
            return Err(e.into());
        }
    };

    if let Some(path) = &cli.report {
        serde_json::to_writer_pretty(create(path)?, &report)?;
    }
    Ok(report)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_file.as_deref()) {
        eprintln!("kratool: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(report) => {
            info!(
                run_id = %report.run_id,
                records_read = report.records_read,
                records_written = report.records_written,
                records_dropped = report.records_dropped,
                fields_changed = report.fields_changed,
                keys_rewrapped = report.keys_rewrapped,
                "finished processing LDIF records"
            );
            if report.completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "kratool failed");
            eprintln!("kratool: {}", e);
            if let Some(hint) = e.suggestion() {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use kra_core::rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use kra_core::rsa::RsaPrivateKey;
    use kra_core::{cipher, envelope, wrap, SessionKey};
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const ENROLLMENT: &str = "\
dn: cn=273,ou=ca,ou=requests,o=kra-old
objectClass: top
objectClass: request
requestId: 0273
requestType: enrollment
requestState: complete
cn: 273

";

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("kratool").chain(args.iter().copied()))
    }

    fn path_arg(path: &Path) -> String {
        path.display().to_string()
    }

    #[test]
    fn test_offsets_conflict() {
        let result = parse(&[
            "--source-ldif-file",
            "a.ldif",
            "--target-ldif-file",
            "b.ldif",
            "--append-id-offset",
            "10",
            "--remove-id-offset",
            "10",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_naming_contexts_come_in_pairs() {
        let result = parse(&[
            "--source-ldif-file",
            "a.ldif",
            "--target-ldif-file",
            "b.ldif",
            "--source-kra-naming-context",
            "o=kra-old",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rewrap_needs_target_certificate() {
        let result = parse(&[
            "--source-ldif-file",
            "a.ldif",
            "--target-ldif-file",
            "b.ldif",
            "--source-storage-key",
            "storage.pem",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_requires_offset_or_rewrap() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.ldif");
        std::fs::write(&source, ENROLLMENT).unwrap();

        let cli = parse(&[
            "--source-ldif-file",
            &path_arg(&source),
            "--target-ldif-file",
            &path_arg(&dir.path().join("target.ldif")),
        ])
        .unwrap();
        assert!(matches!(
            run(&cli),
            Err(CliError::Kra(KraError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_same_source_and_target_rejected() {
        let cli = parse(&[
            "--source-ldif-file",
            "a.ldif",
            "--target-ldif-file",
            "a.ldif",
            "--append-id-offset",
            "10",
        ])
        .unwrap();
        assert!(matches!(run(&cli), Err(CliError::Usage(_))));
    }

    #[test]
    fn test_append_offset_run() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.ldif");
        let target = dir.path().join("target.ldif");
        let report_path = dir.path().join("report.json");
        std::fs::write(&source, ENROLLMENT).unwrap();

        let cli = parse(&[
            "--source-ldif-file",
            &path_arg(&source),
            "--target-ldif-file",
            &path_arg(&target),
            "--append-id-offset",
            "100000000000",
            "--source-kra-naming-context",
            "o=kra-old",
            "--target-kra-naming-context",
            "o=kra-new",
            "--report",
            &path_arg(&report_path),
        ])
        .unwrap();
        let report = run(&cli).unwrap();
        assert!(report.completed);
        assert_eq!(report.records_written, 1);

        let output = std::fs::read_to_string(&target).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "dn: cn=100000000273,ou=ca,ou=requests,o=kra-new");
        assert!(lines.contains(&"requestId: 12100000000073"));
        assert!(lines.contains(&"cn: 100000000273"));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(json["recordsWritten"], 1);
        assert_eq!(json["completed"], true);
    }

    #[test]
    fn test_offset_violation_fails_run() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.ldif");
        std::fs::write(&source, ENROLLMENT).unwrap();

        let target = dir.path().join("target.ldif");
        let cli = parse(&[
            "--source-ldif-file",
            &path_arg(&source),
            "--target-ldif-file",
            &path_arg(&target),
            "--append-id-offset",
            "100",
        ])
        .unwrap();
        let err = run(&cli).unwrap_err();
        assert!(matches!(
            err,
            CliError::Kra(KraError::OffsetPolicyViolation { .. })
        ));
        assert!(err.suggestion().is_some());
        assert!(!target.exists());
    }

    #[test]
    fn test_help_mentions_generic_fallback() {
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("copied as generic records"));
    }

    #[test]
    fn test_rewrap_run() {
        let dir = TempDir::new().unwrap();
        let mut rng = rand::thread_rng();
        let source_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let target_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let key_path = dir.path().join("storage.pem");
        std::fs::write(
            &key_path,
            source_key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();
        let cert_path = dir.path().join("target.pem");
        std::fs::write(
            &cert_path,
            wrap::public_key_pem(&target_key.to_public_key()).unwrap(),
        )
        .unwrap();
        let password_path = dir.path().join("pwdfile");
        std::fs::write(&password_path, "unused\n").unwrap();

        let session = SessionKey::generate(SymmetricAlgorithm::Des3);
        let payload = cipher::encrypt(&session, b"archived tps key").unwrap();
        let source_unit = StorageKeyUnit::new(SoftwareToken::new("source", source_key));
        let wrapped = source_unit
            .wrap_session_key(&session, WrapAlgorithm::RsaPkcs1)
            .unwrap();
        let blob = envelope::encode(&wrapped, &payload).unwrap();

        let ldif = format!(
            "dn: cn=5,ou=keyRepository,ou=kra,o=kra-old\n\
             serialno: 015\n\
             privateKeyData:: {}\n\
             archivedBy: TPS-host-9443\n\
             cn: 5\n\n",
            BASE64.encode(&blob)
        );
        let source = dir.path().join("source.ldif");
        let target = dir.path().join("target.ldif");
        std::fs::write(&source, ldif).unwrap();

        let cli = parse(&[
            "--source-ldif-file",
            &path_arg(&source),
            "--target-ldif-file",
            &path_arg(&target),
            "--source-storage-key",
            &path_arg(&key_path),
            "--source-storage-password-file",
            &path_arg(&password_path),
            "--target-storage-certificate-file",
            &path_arg(&cert_path),
        ])
        .unwrap();
        let report = run(&cli).unwrap();
        assert_eq!(report.keys_rewrapped, 1);

        let output = std::fs::read_to_string(&target).unwrap();
        let mut encoded = String::new();
        let mut in_key = false;
        for line in output.lines() {
            if let Some(first) = line.strip_prefix("privateKeyData:: ") {
                encoded.push_str(first);
                in_key = true;
            } else if in_key && line.starts_with(' ') {
                encoded.push_str(&line[1..]);
            } else {
                in_key = false;
            }
        }

        let rewrapped = envelope::decode(&BASE64.decode(encoded).unwrap()).unwrap();
        assert_eq!(rewrapped.encrypted_payload, payload);

        let target_unit = StorageKeyUnit::new(SoftwareToken::new("target", target_key));
        let recovered = target_unit
            .unwrap_session_key(
                &rewrapped.encrypted_session_key,
                WrapAlgorithm::RsaPkcs1,
                SymmetricAlgorithm::Des3,
            )
            .unwrap();
        assert_eq!(
            cipher::decrypt(&recovered, &rewrapped.encrypted_payload)
                .unwrap()
                .as_slice(),
            b"archived tps key"
        );
    }
}
