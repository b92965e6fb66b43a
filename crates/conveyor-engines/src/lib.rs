//! Outbound collaborators: the HTTP scrape engine and the OCR service
//! client. Both implement the engine traits from `conveyor-core` and are
//! pure with respect to system state.

pub mod ocr;
pub mod scraper;

pub use ocr::RemoteOcrEngine;
pub use scraper::HttpScraper;
