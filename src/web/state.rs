use std::path::PathBuf;
use std::sync::Arc;

use crate::broker::Broker;
use crate::config::AppConfig;
use crate::db::DbHandle;
use crate::pagination::Page;
use crate::timefmt::SchoolTz;

/// Shared application state for all handlers.
pub struct AppState {
    pub db: DbHandle,
    pub broker: Broker,
    pub config: AppConfig,
    pub tz: SchoolTz,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: DbHandle, config: AppConfig) -> Self {
        Self {
            db,
            broker: Broker::new(config.live.subscriber_buffer),
            tz: config.school_tz(),
            config,
        }
    }

    /// A page of the configured size from a `?page=` value.
    pub fn page(&self, number: Option<u32>) -> Page {
        Page::new(number, self.config.display.page_size)
    }

    pub fn upload_path(&self, stored_name: &str) -> PathBuf {
        self.config.uploads.dir.join(stored_name)
    }
}
