pub mod aggregator;
pub mod feed;

pub use aggregator::CandleAggregator;
pub use feed::{FeedConnector, FeedSettings, FinnhubDialer};
