//! Application state: the process-wide collaborators, passed explicitly
//! into request handlers so the test harness can inject stubs at every seam.

use std::sync::Arc;

use crate::catalog::CatalogHandle;
use crate::config::ServerConfig;
use crate::datachannel::DatachannelRouter;
use crate::llm::LlmBackend;
use crate::sessions::SessionRegistry;
use crate::tts::TtsCache;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<DatachannelRouter>,
    pub llm: Arc<dyn LlmBackend>,
    pub tts: Arc<TtsCache>,
    pub catalog: Arc<CatalogHandle>,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<SessionRegistry>,
        router: Arc<DatachannelRouter>,
        llm: Arc<dyn LlmBackend>,
        tts: Arc<TtsCache>,
        catalog: Arc<CatalogHandle>,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            llm,
            tts,
            catalog,
        }
    }
}
