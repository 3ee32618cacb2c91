use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
pub struct CommonConfig {
    pub host: Cow<'static, str>,
    pub port: usize,
    pub log_level: Cow<'static, str>,
    pub concurrency_limit: usize,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18890,
            log_level: "info,reel=debug".into(),
            concurrency_limit: 128,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataBaseConfig {
    pub db_url: Cow<'static, str>,
    pub sqlite_connection_nums: u32,
}

impl Default for DataBaseConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite://data/reel.db".into(),
            sqlite_connection_nums: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for chunk fragments (`<root>/chunks`) and assembled blobs
    /// (`<root>/files`). The process assumes exclusive access to it.
    pub root: PathBuf,
    /// Advisory chunk size hint surfaced to clients; uploads of any size are
    /// accepted per chunk.
    pub chunk_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "/tmp/video-platform".into(),
            chunk_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscodeConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 100,
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub common: CommonConfig,
    pub db: DataBaseConfig,
    pub storage: StorageConfig,
    pub transcode: TranscodeConfig,
}

impl AppConfig {
    pub fn load(cfg_path: &str) -> Result<Self, Box<figment::Error>> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Env::prefixed("REEL_").split("__").global());
        if Path::new(cfg_path).exists() {
            figment = figment.merge(Toml::file(cfg_path));
        }
        figment.extract().map_err(Into::into)
    }
}
