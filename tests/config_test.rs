//! Configuration loading tests

use s3_upload_stream::config::{ByteSize, Config, ConfigError};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
backend:
  bucket: uploads
  region: eu-west-1
  endpoint: http://localhost:9000
  access_key: minio
  secret_key: minio123
upload:
  partition_size: 16MB
  concurrency: 8
  scratch_dir: /var/tmp
"#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.backend.bucket, "uploads");
    assert_eq!(config.backend.endpoint.as_deref(), Some("http://localhost:9000"));
    assert_eq!(config.upload.partition_size, ByteSize::mib(16));
    assert_eq!(config.upload.concurrency, 8);
    assert_eq!(
        config.upload.scratch_dir.as_deref(),
        Some(std::path::Path::new("/var/tmp"))
    );
}

#[test]
fn test_upload_section_defaults() {
    let file = write_config(
        r#"
backend:
  bucket: uploads
  region: us-east-1
"#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.upload.partition_size, ByteSize::mib(64));
    assert_eq!(config.upload.concurrency, 4);
    assert!(config.upload.scratch_dir.is_none());
}

#[test]
#[serial_test::serial]
fn test_env_expansion_in_file() {
    std::env::set_var("UPLOAD_TEST_BUCKET", "from-env");
    std::env::remove_var("UPLOAD_TEST_PARTITION");
    let file = write_config(
        r#"
backend:
  bucket: ${UPLOAD_TEST_BUCKET}
  region: us-east-1
upload:
  partition_size: ${UPLOAD_TEST_PARTITION:-5MB}
"#,
    );

    let config = Config::load(file.path()).unwrap();
    std::env::remove_var("UPLOAD_TEST_BUCKET");

    assert_eq!(config.backend.bucket, "from-env");
    assert_eq!(config.upload.partition_size, ByteSize::mib(5));
}

#[test]
fn test_invalid_yaml_is_parse_error() {
    let file = write_config("backend: [unclosed");
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_zero_concurrency_is_validation_error() {
    let file = write_config(
        r#"
backend:
  bucket: uploads
  region: us-east-1
upload:
  concurrency: 0
"#,
    );
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    assert!(matches!(
        Config::load("/nonexistent/config.yaml"),
        Err(ConfigError::IoError(_))
    ));
}
