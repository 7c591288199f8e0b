use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The closed set of API canonicals the throttler and resolver branch on.
///
/// This is the *only* place exchange-branching is permitted in workflow code;
/// everywhere else, code depends on interface contracts chosen by the
/// account's canonical, not on this enum directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ApiCanonical {
    Binance,
    Bybit,
    Bitget,
    Kucoin,
    Kraken,
    Taapi,
    #[strum(serialize = "coinmarketcap")]
    #[serde(rename = "coinmarketcap")]
    CoinMarketCap,
    #[strum(serialize = "alternativeme")]
    #[serde(rename = "alternativeme")]
    AlternativeMe,
}

impl ApiCanonical {
    /// The five canonicals that place and manage orders; the remaining three
    /// are market-data-only collaborators and never appear as an account's
    /// exchange.
    pub const EXCHANGES: [ApiCanonical; 5] = [
        ApiCanonical::Binance,
        ApiCanonical::Bybit,
        ApiCanonical::Bitget,
        ApiCanonical::Kucoin,
        ApiCanonical::Kraken,
    ];

    /// Capitalised form used when building a resolved class name, e.g.
    /// `Jobs.Lifecycles.Position.Bybit.DispatchPositionJob`.
    pub fn capitalised(&self) -> &'static str {
        match self {
            ApiCanonical::Binance => "Binance",
            ApiCanonical::Bybit => "Bybit",
            ApiCanonical::Bitget => "Bitget",
            ApiCanonical::Kucoin => "Kucoin",
            ApiCanonical::Kraken => "Kraken",
            ApiCanonical::Taapi => "Taapi",
            ApiCanonical::CoinMarketCap => "CoinMarketCap",
            ApiCanonical::AlternativeMe => "AlternativeMe",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_fromstr() {
        for c in [
            ApiCanonical::Binance,
            ApiCanonical::Bybit,
            ApiCanonical::Bitget,
            ApiCanonical::Kucoin,
            ApiCanonical::Kraken,
            ApiCanonical::Taapi,
            ApiCanonical::CoinMarketCap,
            ApiCanonical::AlternativeMe,
        ] {
            let s = c.to_string();
            let parsed: ApiCanonical = s.parse().unwrap();
            assert_eq!(parsed, c);
        }
    }
}
