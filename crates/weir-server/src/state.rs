use std::sync::Arc;

use weir_channels::ChannelLayer;

use crate::receiver::ReplyRouter;

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub channels: Arc<dyn ChannelLayer>,
    pub replies: ReplyRouter,
    pub debug: bool,
}
