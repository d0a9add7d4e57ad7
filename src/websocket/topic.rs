//! Typed topics for the Orderly streaming API
//!
//! Topics whose parameters are known in advance get a dedicated variant
//! with typed fields; anything else goes through [`Topic::custom`] with an
//! opaque params map for forward compatibility.

use serde_json::Value;

use crate::types::KlineInterval;

/// A named logical data stream a consumer can subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    // ========== Public market data ==========
    /// Best bid/offer for every symbol
    Bbos,

    /// Trade stream for one symbol
    Trade { symbol: String },

    /// Order book snapshots for one symbol
    Orderbook { symbol: String },

    /// Candlestick stream for one symbol and interval
    Kline {
        symbol: String,
        interval: KlineInterval,
    },

    /// 24h ticker for one symbol
    Ticker { symbol: String },

    /// 24h tickers for all symbols
    Tickers,

    // ========== Private account data (auth required) ==========
    /// Position updates
    Position,

    /// Balance updates
    Balance,

    /// Order status updates
    Order,

    /// Private trade fills
    PrivateTrade,

    /// Liquidation events
    Liquidation,

    /// PnL updates
    Pnl,

    // ========== Fallback ==========
    /// A topic unknown to this crate, with optional opaque subscribe params
    Custom {
        name: String,
        params: Option<Value>,
    },
}

impl Topic {
    // ========== Public topic constructors ==========

    /// Best bid/offer stream
    pub fn bbos() -> Self {
        Topic::Bbos
    }

    /// Trade stream for a symbol, e.g. `PERP_ETH_USDC`
    pub fn trade(symbol: impl Into<String>) -> Self {
        Topic::Trade {
            symbol: symbol.into(),
        }
    }

    /// Order book stream for a symbol
    pub fn orderbook(symbol: impl Into<String>) -> Self {
        Topic::Orderbook {
            symbol: symbol.into(),
        }
    }

    /// Kline stream for a symbol and interval
    pub fn kline(symbol: impl Into<String>, interval: KlineInterval) -> Self {
        Topic::Kline {
            symbol: symbol.into(),
            interval,
        }
    }

    /// 24h ticker for one symbol
    pub fn ticker(symbol: impl Into<String>) -> Self {
        Topic::Ticker {
            symbol: symbol.into(),
        }
    }

    /// 24h tickers for all symbols
    pub fn tickers() -> Self {
        Topic::Tickers
    }

    // ========== Private topic constructors ==========

    /// Position updates
    pub fn position() -> Self {
        Topic::Position
    }

    /// Balance updates
    pub fn balance() -> Self {
        Topic::Balance
    }

    /// Order status updates
    pub fn order() -> Self {
        Topic::Order
    }

    /// Private trade fills
    pub fn private_trade() -> Self {
        Topic::PrivateTrade
    }

    /// Liquidation events
    pub fn liquidation() -> Self {
        Topic::Liquidation
    }

    /// PnL updates
    pub fn pnl() -> Self {
        Topic::Pnl
    }

    /// A topic this crate has no variant for, with optional subscribe params
    pub fn custom(name: impl Into<String>, params: Option<Value>) -> Self {
        Topic::Custom {
            name: name.into(),
            params,
        }
    }

    /// The topic identifier sent on the wire
    pub fn name(&self) -> String {
        match self {
            Topic::Bbos => "bbos".to_string(),
            Topic::Trade { symbol } => format!("{symbol}@trade"),
            Topic::Orderbook { symbol } => format!("{symbol}@orderbook"),
            Topic::Kline { symbol, interval } => format!("{symbol}@kline_{interval}"),
            Topic::Ticker { symbol } => format!("{symbol}@24h_ticker"),
            Topic::Tickers => "24h_tickers".to_string(),
            Topic::Position => "position".to_string(),
            Topic::Balance => "balance".to_string(),
            Topic::Order => "order".to_string(),
            Topic::PrivateTrade => "trade".to_string(),
            Topic::Liquidation => "liquidation".to_string(),
            Topic::Pnl => "pnl".to_string(),
            Topic::Custom { name, .. } => name.clone(),
        }
    }

    /// Subscribe parameters, if any
    pub fn params(&self) -> Option<&Value> {
        match self {
            Topic::Custom { params, .. } => params.as_ref(),
            _ => None,
        }
    }

    /// Whether this topic requires an authenticated private session
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            Topic::Position
                | Topic::Balance
                | Topic::Order
                | Topic::PrivateTrade
                | Topic::Liquidation
                | Topic::Pnl
        )
    }

    /// Whether this is a public market data topic
    pub fn is_market_topic(&self) -> bool {
        matches!(
            self,
            Topic::Bbos
                | Topic::Trade { .. }
                | Topic::Orderbook { .. }
                | Topic::Kline { .. }
                | Topic::Ticker { .. }
                | Topic::Tickers
        )
    }

    /// The symbol this topic is scoped to, if any
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Topic::Trade { symbol }
            | Topic::Orderbook { symbol }
            | Topic::Kline { symbol, .. }
            | Topic::Ticker { symbol } => Some(symbol),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}
