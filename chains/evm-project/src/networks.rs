use serde::Deserialize;

/// Multicall3 sits at the same address on every supported network.
pub const MULTICALL3: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Eth,
    Bsc,
    Polygon,
    Arbitrum,
    Optimism,
    Base,
    Avalanche,
}

/// Static facts about a network. Everything here can be overridden in the
/// `[evm]` config table.
#[derive(Debug, Clone, Copy)]
pub struct NetworkPreset {
    pub chain_id: u64,
    pub symbol: &'static str,
    pub wrapped_native: &'static str,
    /// Native amount funded per wallet when the command line gives none.
    pub default_amount: f64,
    pub legacy_gas: bool,
}

impl Network {
    pub fn preset(&self) -> NetworkPreset {
        match self {
            Network::Eth => NetworkPreset {
                chain_id: 1,
                symbol: "ETH",
                wrapped_native: "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
                default_amount: 0.001,
                legacy_gas: false,
            },
            Network::Bsc => NetworkPreset {
                chain_id: 56,
                symbol: "BNB",
                wrapped_native: "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c",
                default_amount: 0.005,
                legacy_gas: true,
            },
            Network::Polygon => NetworkPreset {
                chain_id: 137,
                symbol: "POL",
                wrapped_native: "0x0d500B1d8E8eF31E21C99d1Db9A6444d3ADf1270",
                default_amount: 0.1,
                legacy_gas: false,
            },
            Network::Arbitrum => NetworkPreset {
                chain_id: 42161,
                symbol: "ETH",
                wrapped_native: "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1",
                default_amount: 0.001,
                legacy_gas: false,
            },
            Network::Optimism => NetworkPreset {
                chain_id: 10,
                symbol: "ETH",
                wrapped_native: "0x4200000000000000000000000000000000000006",
                default_amount: 0.001,
                legacy_gas: false,
            },
            Network::Base => NetworkPreset {
                chain_id: 8453,
                symbol: "ETH",
                wrapped_native: "0x4200000000000000000000000000000000000006",
                default_amount: 0.001,
                legacy_gas: false,
            },
            Network::Avalanche => NetworkPreset {
                chain_id: 43114,
                symbol: "AVAX",
                wrapped_native: "0xB31f66AA3C1e785363F0875A1B74E27b85FD66c7",
                default_amount: 0.05,
                legacy_gas: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;
    use std::str::FromStr;

    #[test]
    fn test_preset_addresses_parse() {
        for network in [
            Network::Eth,
            Network::Bsc,
            Network::Polygon,
            Network::Arbitrum,
            Network::Optimism,
            Network::Base,
            Network::Avalanche,
        ] {
            let preset = network.preset();
            assert!(
                Address::from_str(preset.wrapped_native).is_ok(),
                "{:?}",
                network
            );
            assert!(preset.default_amount > 0.0);
        }
        assert!(Address::from_str(MULTICALL3).is_ok());
    }

    #[test]
    fn test_only_bsc_defaults_to_legacy_gas() {
        assert!(Network::Bsc.preset().legacy_gas);
        assert!(!Network::Base.preset().legacy_gas);
        assert_eq!(Network::Optimism.preset().chain_id, 10);
    }
}
