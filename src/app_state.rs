use crate::config::Config;
use crate::db::MongoDB;
use crate::media::CloudinaryHost;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub mongodb: Arc<MongoDB>,
    pub media: Arc<CloudinaryHost>,
    pub config: Config,
}
