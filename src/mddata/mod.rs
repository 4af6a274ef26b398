// 数据获取侧：上游通道、取数编排与聚合
pub mod acquisition;
pub mod aggregator;
pub mod history;
pub mod live;

pub use acquisition::{Acquisition, BarAcquisition};
pub use aggregator::aggregate_series;
pub use history::{HistoricalSource, HistoryClient};
pub use live::{LiveBarSource, LiveClient, LiveTradeHandle};
