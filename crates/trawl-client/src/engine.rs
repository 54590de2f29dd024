use trawl_core::fetch::{EngineError, EngineResponse, FetchRequest};
use trawl_core::traits::FetchEngine;

#[cfg(feature = "browser")]
use crate::browser::BrowserEngine;
use crate::http::ReqwestEngine;

/// Every engine this crate ships, as one type for the dispatcher's registry.
#[derive(Clone)]
pub enum AnyEngine {
    Http(ReqwestEngine),
    #[cfg(feature = "browser")]
    Browser(BrowserEngine),
}

impl From<ReqwestEngine> for AnyEngine {
    fn from(engine: ReqwestEngine) -> Self {
        AnyEngine::Http(engine)
    }
}

#[cfg(feature = "browser")]
impl From<BrowserEngine> for AnyEngine {
    fn from(engine: BrowserEngine) -> Self {
        AnyEngine::Browser(engine)
    }
}

impl FetchEngine for AnyEngine {
    fn name(&self) -> &str {
        match self {
            AnyEngine::Http(e) => e.name(),
            #[cfg(feature = "browser")]
            AnyEngine::Browser(e) => e.name(),
        }
    }

    async fn perform(&self, request: &FetchRequest) -> Result<EngineResponse, EngineError> {
        match self {
            AnyEngine::Http(e) => e.perform(request).await,
            #[cfg(feature = "browser")]
            AnyEngine::Browser(e) => e.perform(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_delegates() {
        let engine: AnyEngine = ReqwestEngine::new().unwrap().named("plain").into();
        assert_eq!(engine.name(), "plain");
    }
}
