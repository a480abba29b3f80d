// THEORY:
// The `verdict` module fuses the two per-shape score maps produced by the
// `SimilarityAnalyzer` into one label. Euclidian confidence is the primary signal;
// cosine similarity is used to confirm it or to settle a conflict.
//
// The decision is an ordered table, first matching rule wins:
//
// 1.  **Saturation**: exactly one shape has every kernel matching (100 %) and no other
//     shape is still relevant. Cosine is ignored entirely.
// 2.  **Consensus**: euclidian confidence is good and both metrics pick the same shape.
// 3.  **Conflict**: euclidian confidence is good but the metrics disagree. If the
//     cosine favourite has almost no euclidian support, trust euclidean distance; if it
//     has solid support, trust cosine; otherwise give up.
// 4.  **Moderate**: euclidian confidence sits in the moderate band and both metrics
//     agree.
// 5.  **Default**: "unknown pattern".
//
// Every threshold is a fraction `k / slots` of the kernel count of a shape, so the
// table scales when shapes grow or shrink. The numerators are a tunable policy, not
// a fixed contract. The engine holds no state between calls.

use crate::error::{Result, ShapeVisionError};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Threshold numerators over a common number of kernel slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictPolicy {
    pub slots: usize,
    /// Below this, the cosine favourite has no euclidian support worth trusting.
    pub low: usize,
    /// At or above this, the cosine favourite is trusted in a conflict.
    pub mid: usize,
    /// Other shapes above this block the saturation rule.
    pub relevant: usize,
    /// Euclidian confidence needed for the consensus and conflict rules.
    pub good: usize,
    /// Upper bound of the moderate band.
    pub high: usize,
}

impl VerdictPolicy {
    pub fn for_kernel_count(slots: usize) -> Self {
        Self {
            slots,
            low: 2,
            mid: 3,
            relevant: 4,
            good: 4,
            high: 5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            return Err(ShapeVisionError::InvalidConfig(
                "verdict policy needs at least one kernel slot".to_string(),
            ));
        }
        let ordered = self.low <= self.mid && self.mid <= self.good && self.good <= self.high;
        if !ordered || self.high > self.slots || self.relevant > self.slots {
            return Err(ShapeVisionError::InvalidConfig(format!(
                "verdict thresholds must satisfy low <= mid <= good <= high <= slots, got {:?}",
                self
            )));
        }
        Ok(())
    }

    fn percent(&self, numerator: usize) -> f64 {
        round_percent(numerator as f64 / self.slots as f64)
    }

    pub fn low_percent(&self) -> f64 {
        self.percent(self.low)
    }

    pub fn mid_percent(&self) -> f64 {
        self.percent(self.mid)
    }

    pub fn relevant_percent(&self) -> f64 {
        self.percent(self.relevant)
    }

    pub fn good_percent(&self) -> f64 {
        self.percent(self.good)
    }

    pub fn high_percent(&self) -> f64 {
        self.percent(self.high)
    }
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self::for_kernel_count(7)
    }
}

/// A fraction expressed as a percentage, rounded to two decimals.
pub fn round_percent(fraction: f64) -> f64 {
    (fraction * 100.0 * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Shape(String),
    Unknown,
}

impl Label {
    pub fn shape(&self) -> Option<&str> {
        match self {
            Label::Shape(name) => Some(name),
            Label::Unknown => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Shape(name) => write!(f, "{}", name),
            Label::Unknown => write!(f, "unknown pattern"),
        }
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Which row of the decision table produced the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    Saturation,
    Consensus,
    ConflictTrustEuclidian,
    ConflictTrustCosine,
    ConflictUnresolved,
    Moderate,
    NoRule,
}

/// The final label plus the evidence that led to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub label: Label,
    /// Euclidian confidence (percent) of the chosen shape, 0 when unknown.
    pub confidence: f64,
    pub rule: DecisionRule,
    pub cosine: BTreeMap<String, f64>,
    pub euclidian: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerdictEngine {
    policy: VerdictPolicy,
}

/// First label holding the largest value. Ties resolve to the earliest label.
fn argmax(scores: &BTreeMap<String, f64>) -> Option<&str> {
    let mut best: Option<(&str, f64)> = None;
    for (label, &score) in scores {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((label.as_str(), score)),
        }
    }
    best.map(|(label, _)| label)
}

impl VerdictEngine {
    pub fn new(policy: VerdictPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &VerdictPolicy {
        &self.policy
    }

    pub fn decide(
        &self,
        cosine: BTreeMap<String, f64>,
        euclidian: BTreeMap<String, f64>,
    ) -> Result<Verdict> {
        if cosine.is_empty() || euclidian.is_empty() {
            return Err(ShapeVisionError::EmptyCandidates);
        }
        if !cosine.keys().eq(euclidian.keys()) {
            return Err(ShapeVisionError::MismatchedCandidates(format!(
                "cosine {:?} vs euclidian {:?}",
                cosine.keys().collect::<Vec<_>>(),
                euclidian.keys().collect::<Vec<_>>()
            )));
        }

        let (label, rule) = self.apply_rules(&cosine, &euclidian);
        let confidence = label
            .shape()
            .and_then(|name| euclidian.get(name))
            .map(|&fraction| round_percent(fraction))
            .unwrap_or(0.0);

        Ok(Verdict {
            label,
            confidence,
            rule,
            cosine,
            euclidian,
        })
    }

    fn apply_rules(
        &self,
        cosine: &BTreeMap<String, f64>,
        euclidian: &BTreeMap<String, f64>,
    ) -> (Label, DecisionRule) {
        let (Some(cosine_match), Some(eucl_match)) = (argmax(cosine), argmax(euclidian)) else {
            return (Label::Unknown, DecisionRule::NoRule);
        };
        let percent_of = |name: &str| euclidian.get(name).copied().map(round_percent).unwrap_or(0.0);
        let eucl_percent = percent_of(eucl_match);
        let agree = cosine_match == eucl_match;
        let shape = |name: &str| Label::Shape(name.to_string());

        let saturated: Vec<&str> = euclidian
            .iter()
            .filter(|&(_, &fraction)| round_percent(fraction) == 100.0)
            .map(|(name, _)| name.as_str())
            .collect();
        if let [only] = saturated.as_slice() {
            let others_irrelevant = euclidian
                .iter()
                .filter(|&(name, _)| name != only)
                .all(|(_, &fraction)| round_percent(fraction) <= self.policy.relevant_percent());
            if others_irrelevant {
                return (shape(*only), DecisionRule::Saturation);
            }
        }

        if eucl_percent >= self.policy.good_percent() {
            if agree {
                return (shape(cosine_match), DecisionRule::Consensus);
            }
            let cosine_support = percent_of(cosine_match);
            if cosine_support < self.policy.low_percent() {
                return (shape(eucl_match), DecisionRule::ConflictTrustEuclidian);
            }
            if cosine_support >= self.policy.mid_percent() {
                return (shape(cosine_match), DecisionRule::ConflictTrustCosine);
            }
            return (Label::Unknown, DecisionRule::ConflictUnresolved);
        }

        if agree
            && eucl_percent >= self.policy.low_percent()
            && eucl_percent <= self.policy.high_percent()
        {
            return (shape(cosine_match), DecisionRule::Moderate);
        }

        (Label::Unknown, DecisionRule::NoRule)
    }
}
