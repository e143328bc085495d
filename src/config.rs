//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_DIR: &str = ".oxidrop/storage";
pub const DEFAULT_LEDGER_FILE: &str = ".oxidrop/ledger.json";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 10;

/// Which backend answers list requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListBackend {
    /// Read the JSON ledger document.
    Ledger,
    /// Walk the storage root and synthesize records from filesystem metadata.
    Scan,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "oxidrop", version = VERSION_INFO, about = "Oxidrop file storage backend")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "OXIDROP_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Storage directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'l',
        long,
        env = "OXIDROP_LEDGER_FILE",
        default_value = DEFAULT_LEDGER_FILE,
        help = "Path of the JSON metadata ledger"
    )]
    pub ledger_file: String,
    #[arg(
        long,
        env = "OXIDROP_LIST_BACKEND",
        value_enum,
        default_value_t = ListBackend::Ledger,
        help = "Listing backend: ledger document or storage scan"
    )]
    pub list_backend: ListBackend,
    #[arg(
        short = 'b',
        long,
        env = "OXIDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "OXIDROP_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "OXIDROP_PUBLIC_URL",
        help = "Public base URL for file links (default: relative /uploads paths)"
    )]
    pub public_url: Option<String>,
    #[arg(long, env = "OXIDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "OXIDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
}

/// Runtime configuration shared with request handlers.
#[derive(Debug)]
pub struct ApiConfig {
    pub public_url: Option<String>,
    pub list_backend: ListBackend,
    pub upload_max_size: u64,
}

impl ApiConfig {
    /// 计算某个相对路径对外可访问的 URL。
    pub fn file_url(&self, relative: &str) -> String {
        match self.public_url.as_deref() {
            Some(base) => format!("{}/uploads/{relative}", base.trim_end_matches('/')),
            None => format!("/uploads/{relative}"),
        }
    }
}
