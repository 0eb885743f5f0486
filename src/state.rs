// =============================================================================
// Central application state
// =============================================================================
//
// Wires the pipeline together: settings, the async provider bridge, the
// trading clock, the subscription hub, the poller, and the history cache.
// Handlers receive it as `Arc<AppState>` via axum's state extractor.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;

use crate::builder::BarBuilder;
use crate::cache::HistoryCache;
use crate::clock::TradingClock;
use crate::config::Settings;
use crate::hub::SubscriptionHub;
use crate::poller::Poller;
use crate::provider::{AsyncProvider, MarketDataProvider};

pub struct AppState {
    pub settings: Settings,
    pub provider: AsyncProvider,
    pub clock: Arc<TradingClock>,
    pub hub: Arc<SubscriptionHub>,
    pub poller: Arc<Poller>,
    pub history_cache: HistoryCache,
}

impl AppState {
    /// Assemble the full pipeline. Fails fast on configuration problems
    /// (currently: an unreachable Redis when the remote cache backend is
    /// selected).
    pub async fn build(
        settings: Settings,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Result<Arc<Self>> {
        let provider = AsyncProvider::new(provider);
        let clock = Arc::new(TradingClock::new(
            settings.timezone,
            settings.trading_sessions.clone(),
            settings.special_trading_sessions.clone(),
            settings.closed_dates.clone(),
        ));
        let hub = Arc::new(SubscriptionHub::new(settings.max_active_symbols));
        let builder = BarBuilder::new(settings.timezone);
        let poller = Arc::new(Poller::new(
            provider.clone(),
            builder,
            Arc::clone(&clock),
            Arc::clone(&hub),
            &settings,
        ));
        let history_cache = HistoryCache::from_settings(&settings).await?;

        Ok(Arc::new(Self {
            settings,
            provider,
            clock,
            hub,
            poller,
            history_cache,
        }))
    }
}
