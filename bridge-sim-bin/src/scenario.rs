//! Scenario files replayed by `bridge-sim`.
//!
//! A scenario names its tokens, lists the sandbox venue setup (lending
//! reserves, swap prices and router liquidity), funds the processor and then
//! runs a sequence of steps. Steps refer to assets by symbol; `ETH` is the
//! native asset and `share:<SYMBOL>` the lending bridge's share token for an
//! underlying.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use bridge_runtime::config::{RuntimeConfig, parse_address};
use bridge_runtime::math::RAY;
use bridge_runtime::sandbox::{InMemoryLedger, SandboxLendingPool, SandboxSwapRouter};
use bridge_runtime::{
    AaveLendingBridge, AssetDescriptor, AssetKey, BridgeError, ConvertArgs, EventLog,
    InteractionStatus, Processor, TokenMetadata,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const NATIVE_SYMBOL: &str = "ETH";
const SHARE_PREFIX: &str = "share:";

/// Account the faucet funds before it deposits into the processor.
const DEPOSITOR: Address = Address::repeat_byte(0xd0);

/// Parse a decimal string into a U256.
fn parse_u256(amount: &str) -> Result<U256, BridgeError> {
    U256::from_str_radix(amount, 10)
        .map_err(|e| BridgeError::ConfigError(format!("Invalid amount '{amount}': {e}")))
}

fn default_decimals() -> u8 {
    18
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub tokens: Vec<TokenSpec>,
    #[serde(default)]
    pub reserves: Vec<ReserveSpec>,
    #[serde(default)]
    pub prices: Vec<PriceSpec>,
    /// Router balances available as swap output
    #[serde(default)]
    pub liquidity: Vec<AmountSpec>,
    #[serde(default)]
    pub funding: Vec<AmountSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSpec {
    pub symbol: String,
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveSpec {
    pub underlying: String,
    pub receipt_symbol: String,
    pub receipt_address: String,
    #[serde(default)]
    pub receipt_name: Option<String>,
    /// Initial liquidity index in ray, one ray when absent
    #[serde(default)]
    pub index: Option<String>,
}

/// `numerator` units of `token_in` buy `denominator` units of `token_out`.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceSpec {
    pub token_in: String,
    pub token_out: String,
    pub numerator: String,
    pub denominator: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmountSpec {
    pub asset: String,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Register {
        underlying: String,
    },
    Convert {
        bridge_id: u32,
        input: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_b: Option<String>,
        amount: String,
        nonce: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aux_data: Option<String>,
    },
    Accrue {
        underlying: String,
        index: String,
    },
    Finalise {
        nonce: u64,
    },
}

impl Scenario {
    pub fn from_toml_str(s: &str) -> Result<Self, BridgeError> {
        let scenario: Self = toml::from_str(s)?;
        scenario.runtime.validate()?;
        Ok(scenario)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step: Step,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractionReport {
    pub nonce: u64,
    pub bridge_id: u32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_value_a: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_value_b: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub steps: Vec<StepReport>,
    pub pooled_balances: BTreeMap<String, String>,
    pub interactions: Vec<InteractionReport>,
}

/// Processor, bridges and sandbox venues wired from a scenario.
pub struct Simulation {
    ledger: Arc<InMemoryLedger>,
    processor: Processor,
    pool: Option<Arc<SandboxLendingPool>>,
    aave: Option<Arc<AaveLendingBridge>>,
    symbols: BTreeMap<String, Address>,
    asset_ids: BTreeMap<Address, u32>,
}

impl Simulation {
    pub async fn build(scenario: &Scenario) -> Result<Self, BridgeError> {
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(EventLog::new());
        let processor_address = scenario.runtime.processor.address()?;
        let processor = Processor::new(processor_address, ledger.clone(), events.clone());

        let mut symbols = BTreeMap::new();
        for token in &scenario.tokens {
            let address = parse_address(&token.address)?;
            let name = token.name.clone().unwrap_or_else(|| token.symbol.clone());
            ledger.register_token(
                address,
                TokenMetadata::new(name, token.symbol.clone(), token.decimals),
            )?;
            symbols.insert(token.symbol.clone(), address);
        }

        let mut sim = Self {
            ledger,
            processor,
            pool: None,
            aave: None,
            symbols,
            asset_ids: BTreeMap::new(),
        };

        if let Some(aave) = &scenario.runtime.aave {
            let pool = Arc::new(SandboxLendingPool::new(aave.pool()?, sim.ledger.clone()));
            for reserve in &scenario.reserves {
                let underlying = sim.token(&reserve.underlying)?;
                let receipt = parse_address(&reserve.receipt_address)?;
                let index = match &reserve.index {
                    Some(index) => parse_u256(index)?,
                    None => RAY,
                };
                let decimals = scenario
                    .tokens
                    .iter()
                    .find(|t| t.symbol == reserve.underlying)
                    .map_or(default_decimals(), |t| t.decimals);
                let name = reserve
                    .receipt_name
                    .clone()
                    .unwrap_or_else(|| format!("Aave interest bearing {}", reserve.underlying));
                pool.add_reserve(
                    underlying,
                    receipt,
                    TokenMetadata::new(name, reserve.receipt_symbol.clone(), decimals),
                    index,
                )?;
                sim.symbols.insert(reserve.receipt_symbol.clone(), receipt);
            }
            let bridge = Arc::new(aave.build(
                processor_address,
                sim.ledger.clone(),
                pool.clone(),
                events.clone(),
            )?);
            sim.processor
                .register_bridge(aave.bridge_id, bridge.clone())
                .await?;
            sim.pool = Some(pool);
            sim.aave = Some(bridge);
        } else if !scenario.reserves.is_empty() {
            warn!("Scenario lists lending reserves but no lending bridge, ignoring them");
        }

        if let Some(uniswap) = &scenario.runtime.uniswap {
            let router_address = uniswap.router()?;
            let router = Arc::new(SandboxSwapRouter::new(
                router_address,
                uniswap.wrapped_native()?,
                sim.ledger.clone(),
            )?);
            for price in &scenario.prices {
                router.set_price(
                    sim.token(&price.token_in)?,
                    sim.token(&price.token_out)?,
                    parse_u256(&price.numerator)?,
                    parse_u256(&price.denominator)?,
                )?;
            }
            for liquidity in &scenario.liquidity {
                sim.ledger.faucet(
                    sim.token(&liquidity.asset)?,
                    router_address,
                    parse_u256(&liquidity.amount)?,
                )?;
            }
            let bridge = uniswap.build(processor_address, sim.ledger.clone(), router)?;
            sim.processor
                .register_bridge(uniswap.bridge_id, Arc::new(bridge))
                .await?;
        } else if !scenario.prices.is_empty() || !scenario.liquidity.is_empty() {
            warn!("Scenario lists swap pools but no swap bridge, ignoring them");
        }

        for funding in &scenario.funding {
            let asset = sim.asset(&funding.asset).await?;
            let amount = parse_u256(&funding.amount)?;
            match asset.contract {
                Some(token) => sim.ledger.faucet(token, DEPOSITOR, amount)?,
                None => sim.ledger.faucet_native(DEPOSITOR, amount)?,
            }
            sim.processor.fund(&asset, DEPOSITOR, amount).await?;
        }

        Ok(sim)
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    fn token(&self, symbol: &str) -> Result<Address, BridgeError> {
        self.symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| BridgeError::ConfigError(format!("Unknown token symbol '{symbol}'")))
    }

    fn lending(&self) -> Result<(&Arc<AaveLendingBridge>, &Arc<SandboxLendingPool>), BridgeError> {
        match (&self.aave, &self.pool) {
            (Some(bridge), Some(pool)) => Ok((bridge, pool)),
            _ => Err(BridgeError::ConfigError(
                "Scenario has no lending bridge".into(),
            )),
        }
    }

    fn asset_id(&mut self, token: Address) -> u32 {
        let next = self.asset_ids.len() as u32 + 1;
        *self.asset_ids.entry(token).or_insert(next)
    }

    /// Resolve an asset name used in a scenario.
    pub async fn asset(&mut self, name: &str) -> Result<AssetDescriptor, BridgeError> {
        if name == NATIVE_SYMBOL {
            return Ok(AssetDescriptor::native(0));
        }
        let token = match name.strip_prefix(SHARE_PREFIX) {
            Some(symbol) => {
                let underlying = self.token(symbol)?;
                let (bridge, _) = self.lending()?;
                bridge
                    .share_token(underlying)
                    .await
                    .ok_or(BridgeError::NotRegistered { underlying })?
            }
            None => self.token(name)?,
        };
        Ok(AssetDescriptor::fungible(self.asset_id(token), token))
    }

    async fn apply(&mut self, step: &Step) -> Result<String, BridgeError> {
        match step {
            Step::Register { underlying } => {
                let underlying = self.token(underlying)?;
                let (bridge, _) = self.lending()?;
                let share = bridge.register_underlying(underlying).await?;
                Ok(format!("share token {share}"))
            }
            Step::Convert {
                bridge_id,
                input,
                output,
                output_b,
                amount,
                nonce,
                aux_data,
            } => {
                let input = self.asset(input).await?;
                let output = self.asset(output).await?;
                let mut args = ConvertArgs::new(*bridge_id, input, output, parse_u256(amount)?, *nonce);
                if let Some(aux_data) = aux_data {
                    args = args.with_aux_data(parse_u256(aux_data)?);
                }
                if let Some(output_b) = output_b {
                    args = args.with_output_b(self.asset(output_b).await?);
                }
                let result = self.processor.convert(args).await?;
                Ok(if result.is_async {
                    "pending".to_string()
                } else {
                    format!(
                        "output_a={} output_b={}",
                        result.output_value_a, result.output_value_b
                    )
                })
            }
            Step::Accrue { underlying, index } => {
                let underlying = self.token(underlying)?;
                let index = parse_u256(index)?;
                let (_, pool) = self.lending()?;
                pool.accrue(underlying, index)?;
                Ok(format!("index {index}"))
            }
            Step::Finalise { nonce } => {
                let result = self.processor.finalise(*nonce).await?;
                Ok(format!(
                    "output_a={} output_b={}",
                    result.output_value_a, result.output_value_b
                ))
            }
        }
    }

    /// Replay `steps` in order. A failed step is recorded and the run goes on.
    pub async fn run(&mut self, steps: &[Step]) -> Report {
        let mut reports = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let outcome = self.apply(step).await;
            match &outcome {
                Ok(detail) => info!(step = index, %detail, "Step applied"),
                Err(e) => warn!(step = index, error = %e, "Step failed"),
            }
            reports.push(StepReport {
                index,
                step: step.clone(),
                ok: outcome.is_ok(),
                detail: outcome.unwrap_or_else(|e| e.to_string()),
            });
        }

        Report {
            steps: reports,
            pooled_balances: self.pooled_balances().await,
            interactions: self.interactions().await,
        }
    }

    async fn labels(&self) -> BTreeMap<AssetKey, String> {
        let mut labels: BTreeMap<AssetKey, String> = self
            .symbols
            .iter()
            .map(|(symbol, address)| (AssetKey::Token(*address), symbol.clone()))
            .collect();
        labels.insert(AssetKey::Native, NATIVE_SYMBOL.to_string());
        if let Ok((bridge, _)) = self.lending() {
            for (symbol, address) in &self.symbols {
                if let Some(share) = bridge.share_token(*address).await {
                    labels.insert(AssetKey::Token(share), format!("{SHARE_PREFIX}{symbol}"));
                }
            }
        }
        labels
    }

    pub async fn pooled_balances(&self) -> BTreeMap<String, String> {
        let labels = self.labels().await;
        self.processor
            .pooled_balances()
            .await
            .into_iter()
            .map(|(key, amount)| {
                let label = labels.get(&key).cloned().unwrap_or_else(|| key.to_string());
                (label, amount.to_string())
            })
            .collect()
    }

    async fn interactions(&self) -> Vec<InteractionReport> {
        self.processor
            .interactions()
            .await
            .into_iter()
            .map(|interaction| {
                let (status, a, b) = match interaction.status {
                    InteractionStatus::Pending => ("pending", None, None),
                    InteractionStatus::Completed {
                        output_value_a,
                        output_value_b,
                    } => (
                        "completed",
                        Some(output_value_a.to_string()),
                        Some(output_value_b.to_string()),
                    ),
                    InteractionStatus::Failed => ("failed", None, None),
                };
                InteractionReport {
                    nonce: interaction.nonce,
                    bridge_id: interaction.bridge_id,
                    status: status.to_string(),
                    output_value_a: a,
                    output_value_b: b,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DAI_LENDING: &str = include_str!("../scenarios/dai_lending.toml");

    #[tokio::test]
    async fn test_dai_lending_scenario() {
        let scenario = Scenario::from_toml_str(DAI_LENDING).unwrap();
        let mut sim = Simulation::build(&scenario).await.unwrap();
        let report = sim.run(&scenario.steps).await;

        let failed: Vec<usize> = report
            .steps
            .iter()
            .filter(|s| !s.ok)
            .map(|s| s.index)
            .collect();
        // registering DAI a second time is expected to fail
        assert_eq!(failed, vec![6]);
        assert!(report.steps[6].detail.contains("already has a wrapped share token"));

        assert_eq!(
            report.pooled_balances.get("share:DAI").map(String::as_str),
            Some("0")
        );
        assert_eq!(
            report.pooled_balances.get("DAI").map(String::as_str),
            Some("11092857142857142857142")
        );
        assert_eq!(
            report.pooled_balances.get("USDC").map(String::as_str),
            Some("150000000")
        );
        assert_eq!(
            report.pooled_balances.get("ETH").map(String::as_str),
            Some("1000000000000000000")
        );
        assert_eq!(report.interactions.len(), 6);
        assert!(report.interactions.iter().all(|i| i.status == "completed"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][0]["step"]["action"], "register");
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_config_error() {
        let scenario = Scenario::from_toml_str(DAI_LENDING).unwrap();
        let mut sim = Simulation::build(&scenario).await.unwrap();
        let err = sim.asset("LINK").await.unwrap_err();
        assert!(matches!(err, BridgeError::ConfigError(_)));
        let err = sim.asset("share:DAI").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_pending_steps_without_lending_bridge() {
        let scenario = Scenario::from_toml_str(
            r#"
[runtime.processor]
address = "0x00000000000000000000000000000000000000a1"

[[tokens]]
symbol = "DAI"
address = "0x6B175474E89094C44Da98b954EedeAC495271d0F"

[[steps]]
action = "register"
underlying = "DAI"

[[steps]]
action = "finalise"
nonce = 3
"#,
        )
        .unwrap();
        let mut sim = Simulation::build(&scenario).await.unwrap();
        let report = sim.run(&scenario.steps).await;
        assert!(report.steps.iter().all(|s| !s.ok));
        assert!(report.steps[1].detail.contains("Unknown interaction nonce 3"));
        assert!(report.pooled_balances.is_empty());
    }

    #[test]
    fn test_scenario_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DAI_LENDING.as_bytes()).unwrap();
        let scenario = Scenario::from_file(file.path()).unwrap();
        assert_eq!(scenario.tokens.len(), 4);
        assert_eq!(
            scenario.steps[0],
            Step::Register {
                underlying: "DAI".into()
            }
        );
    }
}
