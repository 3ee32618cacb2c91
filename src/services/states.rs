pub mod cache;
pub mod config;
pub mod db;

use crate::services::chunk_store::ChunkStore;
use crate::services::transcoder::{Encoder, TranscoderHandle};
use cache::CacheState;
use config::AppConfig;
use db::DataBaseState;
use std::sync::Arc;

/// Everything a request touches, constructed once at startup and passed by
/// reference. No hidden globals.
pub struct ReelState {
    pub config: Arc<AppConfig>,
    pub db: DataBaseState,
    pub cache: CacheState,
    pub store: ChunkStore,
    pub encoder: Encoder,
    pub transcoder: TranscoderHandle,
}
