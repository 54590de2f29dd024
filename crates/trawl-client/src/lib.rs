#[cfg(feature = "browser")]
pub mod browser;
pub mod engine;
pub mod export;
pub mod extract;
pub mod http;

#[cfg(feature = "browser")]
pub use browser::BrowserEngine;
pub use engine::AnyEngine;
pub use export::{ExportFormat, FileExporter};
pub use extract::CssExtractor;
pub use http::{HttpProxyProber, ReqwestEngine};
