//! Trading signals: technical indicators, news sentiment and the
//! recommendation rules built on them.

pub mod catalog;
pub mod indicators;
pub mod recommend;
pub mod sentiment;

pub use catalog::Catalog;
pub use recommend::{RecommendationService, ServicePacing};
pub use sentiment::{AlphaVantageClient, SentimentSource};
