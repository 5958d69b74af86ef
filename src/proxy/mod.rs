pub mod cache;
pub(crate) mod codec;
mod dispatch;
mod handler;
pub mod listener;
pub mod origin;
mod range;
mod response;
mod stream;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;
use cache::DiskCache;

pub use range::{ByteRange, RangeError, parse_range};
pub use stream::StreamError;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<DiskCache>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: Arc<DiskCache>) -> Self {
        Self { settings, cache }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
