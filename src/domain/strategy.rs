//! Strategy definition: symbols, timeframes, ordered signal rules, the
//! combination policy and the risk budget.
//!
//! A `Strategy` can only be obtained from `StrategyBuilder::build`, which
//! validates every rule's parameters against its function's schema. Once
//! built it is immutable.

use std::collections::BTreeSet;

use super::combination::CombinationPolicy;
use super::error::BuildError;
use super::params::{validate_params, ParamBag, ParamValue};
use super::risk::RiskBudget;
use super::signals::{SignalFunction, SignalRegistry};
use super::timeframe::Timeframe;

/// Slack allowed on the weight sum for float accumulation.
const WEIGHT_SUM_EPSILON: f64 = 1e-9;

/// A validated rule inside a built strategy.
#[derive(Debug, Clone)]
pub struct SignalRule {
    pub name: String,
    pub function: SignalFunction,
    pub params: ParamBag,
    pub weight: Option<f64>,
    /// Timeframe the rule reads; `None` means the symbol's driving timeframe.
    pub timeframe: Option<Timeframe>,
}

/// An unvalidated rule as handed to the builder.
#[derive(Debug, Clone)]
pub struct RuleDef {
    name: String,
    function: SignalFunction,
    params: ParamBag,
    weight: Option<f64>,
    timeframe: Option<Timeframe>,
}

impl RuleDef {
    pub fn new(name: &str, function: SignalFunction) -> Self {
        RuleDef {
            name: name.trim().to_string(),
            function,
            params: ParamBag::new(),
            weight: None,
            timeframe: None,
        }
    }

    /// Resolve `function` by name in `registry`.
    pub fn from_registry(
        registry: &SignalRegistry,
        name: &str,
        function: &str,
    ) -> Result<Self, BuildError> {
        let resolved = registry
            .get(function.trim())
            .ok_or_else(|| BuildError::UnknownFunction {
                rule: name.to_string(),
                function: function.to_string(),
            })?;
        Ok(Self::new(name, resolved))
    }

    pub fn param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name, value);
        self
    }

    pub fn params(mut self, params: ParamBag) -> Self {
        self.params = params;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Strategy {
    name: String,
    symbols: Vec<String>,
    timeframes: Vec<Timeframe>,
    rules: Vec<SignalRule>,
    policy: CombinationPolicy,
    risk_budget: RiskBudget,
}

impl Strategy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Symbols in declared order.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Timeframes, finest first.
    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    pub fn rules(&self) -> &[SignalRule] {
        &self.rules
    }

    pub fn policy(&self) -> CombinationPolicy {
        self.policy
    }

    pub fn risk_budget(&self) -> &RiskBudget {
        &self.risk_budget
    }
}

#[derive(Debug, Clone)]
pub struct StrategyBuilder {
    name: String,
    symbols: Vec<String>,
    timeframes: Vec<Timeframe>,
    rules: Vec<RuleDef>,
    policy: CombinationPolicy,
    risk_budget: RiskBudget,
}

impl StrategyBuilder {
    pub fn new(name: &str) -> Self {
        StrategyBuilder {
            name: name.to_string(),
            symbols: Vec::new(),
            timeframes: Vec::new(),
            rules: Vec::new(),
            policy: CombinationPolicy::MajorityVote,
            risk_budget: RiskBudget::default(),
        }
    }

    pub fn symbol(mut self, symbol: &str) -> Self {
        self.symbols.push(symbol.trim().to_string());
        self
    }

    pub fn symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.symbols
            .extend(symbols.into_iter().map(|s| s.as_ref().trim().to_string()));
        self
    }

    pub fn timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframes.push(timeframe);
        self
    }

    pub fn timeframes(mut self, timeframes: impl IntoIterator<Item = Timeframe>) -> Self {
        self.timeframes.extend(timeframes);
        self
    }

    pub fn rule(mut self, rule: RuleDef) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn policy(mut self, policy: CombinationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn risk_budget(mut self, budget: RiskBudget) -> Self {
        self.risk_budget = budget;
        self
    }

    pub fn build(self) -> Result<Strategy, BuildError> {
        if self.rules.is_empty() {
            return Err(BuildError::NoSignalRules);
        }
        if self.symbols.is_empty() {
            return Err(BuildError::NoSymbols);
        }
        if self.timeframes.is_empty() {
            return Err(BuildError::NoTimeframes);
        }

        let mut seen = BTreeSet::new();
        for symbol in &self.symbols {
            if !seen.insert(symbol.as_str()) {
                return Err(BuildError::DuplicateSymbol(symbol.clone()));
            }
        }

        let mut timeframes = self.timeframes;
        timeframes.sort();
        timeframes.dedup();

        let mut names = BTreeSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for def in self.rules {
            if !names.insert(def.name.clone()) {
                return Err(BuildError::DuplicateRule(def.name));
            }
            let params = validate_params(&def.name, &def.params, def.function.schema)?;
            if let Some(check) = def.function.check {
                check(&params).map_err(|(param, reason)| BuildError::ParameterRange {
                    rule: def.name.clone(),
                    param: param.to_string(),
                    reason,
                })?;
            }
            if let Some(tf) = def.timeframe {
                if !timeframes.contains(&tf) {
                    return Err(BuildError::UnknownTimeframe {
                        rule: def.name,
                        timeframe: tf,
                    });
                }
            }
            rules.push(SignalRule {
                name: def.name,
                function: def.function,
                params,
                weight: def.weight,
                timeframe: def.timeframe,
            });
        }

        if let CombinationPolicy::Weighted { threshold } = self.policy {
            validate_weights(&rules)?;
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(BuildError::InvalidThreshold(threshold));
            }
        }

        self.risk_budget.validate()?;

        Ok(Strategy {
            name: self.name,
            symbols: self.symbols,
            timeframes,
            rules,
            policy: self.policy,
            risk_budget: self.risk_budget,
        })
    }
}

fn validate_weights(rules: &[SignalRule]) -> Result<(), BuildError> {
    let mut sum = 0.0;
    for rule in rules {
        let weight = rule.weight.ok_or_else(|| BuildError::MissingWeight {
            rule: rule.name.clone(),
        })?;
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(BuildError::InvalidWeight {
                rule: rule.name.clone(),
                weight,
            });
        }
        sum += weight;
    }
    if sum > 1.0 + WEIGHT_SUM_EPSILON {
        return Err(BuildError::WeightSumExceeded { sum });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signals::{MA_CROSSOVER, RSI_THRESHOLD};

    fn crossover() -> RuleDef {
        RuleDef::new("cross", MA_CROSSOVER)
            .param("fast", 5)
            .param("slow", 20)
    }

    fn base() -> StrategyBuilder {
        StrategyBuilder::new("test")
            .symbol("BTCUSDT")
            .timeframe(Timeframe::H1)
    }

    #[test]
    fn builds_valid_strategy() {
        let strategy = base()
            .symbol("ETHUSDT")
            .timeframe(Timeframe::M15)
            .timeframe(Timeframe::H1)
            .rule(crossover())
            .rule(RuleDef::new("rsi", RSI_THRESHOLD).timeframe(Timeframe::H1))
            .build()
            .unwrap();

        assert_eq!(strategy.name(), "test");
        assert_eq!(strategy.symbols(), ["BTCUSDT", "ETHUSDT"]);
        assert_eq!(strategy.timeframes(), [Timeframe::M15, Timeframe::H1]);
        assert_eq!(strategy.rules().len(), 2);
        assert_eq!(strategy.rules()[0].name, "cross");
        assert_eq!(strategy.rules()[0].params.get_str("kind"), Some("sma"));
        assert_eq!(strategy.rules()[1].params.get_usize("period"), Some(14));
        assert_eq!(strategy.policy(), CombinationPolicy::MajorityVote);
    }

    #[test]
    fn zero_rules_rejected() {
        assert_eq!(base().build().unwrap_err(), BuildError::NoSignalRules);
    }

    #[test]
    fn missing_symbols_or_timeframes_rejected() {
        let err = StrategyBuilder::new("t")
            .timeframe(Timeframe::H1)
            .rule(crossover())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::NoSymbols);

        let err = StrategyBuilder::new("t")
            .symbol("BTCUSDT")
            .rule(crossover())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::NoTimeframes);
    }

    #[test]
    fn duplicates_rejected() {
        let err = base().symbol("BTCUSDT").rule(crossover()).build().unwrap_err();
        assert_eq!(err, BuildError::DuplicateSymbol("BTCUSDT".into()));

        let err = base().rule(crossover()).rule(crossover()).build().unwrap_err();
        assert_eq!(err, BuildError::DuplicateRule("cross".into()));
    }

    #[test]
    fn bad_params_rejected() {
        let err = base()
            .rule(crossover().param("window", 3))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownParameter { .. }));

        let err = base()
            .rule(RuleDef::new("x", MA_CROSSOVER).param("fast", 30).param("slow", 10))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::ParameterRange { ref param, .. } if param == "fast"));
    }

    #[test]
    fn rule_timeframe_must_be_declared() {
        let err = base()
            .rule(crossover().timeframe(Timeframe::D1))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            BuildError::UnknownTimeframe {
                rule: "cross".into(),
                timeframe: Timeframe::D1
            }
        );
    }

    #[test]
    fn weighted_requires_weights() {
        let err = base()
            .policy(CombinationPolicy::Weighted { threshold: 0.5 })
            .rule(crossover())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::MissingWeight { rule: "cross".into() });
    }

    #[test]
    fn weighted_weight_bounds() {
        let err = base()
            .policy(CombinationPolicy::Weighted { threshold: 0.5 })
            .rule(crossover().weight(0.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidWeight { .. }));

        let err = base()
            .policy(CombinationPolicy::Weighted { threshold: 0.5 })
            .rule(crossover().weight(0.7))
            .rule(RuleDef::new("rsi", RSI_THRESHOLD).weight(0.6))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::WeightSumExceeded { .. }));
    }

    #[test]
    fn weighted_sum_tolerates_rounding() {
        let strategy = base()
            .policy(CombinationPolicy::Weighted { threshold: 0.5 })
            .rule(RuleDef::new("a", RSI_THRESHOLD).weight(0.1))
            .rule(RuleDef::new("b", RSI_THRESHOLD).weight(0.2))
            .rule(RuleDef::new("c", RSI_THRESHOLD).weight(0.7))
            .build();
        assert!(strategy.is_ok());
    }

    #[test]
    fn weighted_threshold_bounds() {
        let err = base()
            .policy(CombinationPolicy::Weighted { threshold: 0.0 })
            .rule(crossover().weight(1.0))
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::InvalidThreshold(0.0));
    }

    #[test]
    fn risk_budget_validated() {
        let err = base()
            .rule(crossover())
            .risk_budget(RiskBudget {
                stop_loss: 1.5,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidRiskBudget { field: "stop_loss", .. }));
    }

    #[test]
    fn registry_lookup() {
        let registry = SignalRegistry::builtin();
        assert!(RuleDef::from_registry(&registry, "r", "rsi_threshold").is_ok());
        assert_eq!(
            RuleDef::from_registry(&registry, "r", "macd").unwrap_err(),
            BuildError::UnknownFunction {
                rule: "r".into(),
                function: "macd".into()
            }
        );
    }
}
