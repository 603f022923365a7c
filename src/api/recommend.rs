//! Travel recommendations derived from a prediction and a fare comparison.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::fares_view::FareComparison;
use crate::predict::Prediction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationTag {
    Money,
    Time,
    Balanced,
}

impl RecommendationTag {
    /// Tie-break order: money > time > balanced.
    fn priority(self) -> u8 {
        match self {
            RecommendationTag::Money => 0,
            RecommendationTag::Time => 1,
            RecommendationTag::Balanced => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Recommendation {
    pub option: RecommendationTag,
    pub title: String,
    pub description: String,
    /// Score in [0, 10].
    pub score: f64,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Up to three suggestions ordered by score descending; equal scores keep
/// the money > time > balanced order.
pub fn build_recommendations(
    prediction: &Prediction,
    fares: Option<&FareComparison>,
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    let money_score = fares.and_then(|f| f.savings_percentage).map(|savings_pct| {
        (savings_pct / 10.0).clamp(0.0, 10.0)
    });
    if let (Some(score), Some(fares)) = (money_score, fares) {
        if let (Some(cheapest_type), Some(cheapest_price)) =
            (&fares.cheapest_type, fares.cheapest_price)
        {
            let savings = fares.savings_amount.unwrap_or(0.0);
            recommendations.push(Recommendation {
                option: RecommendationTag::Money,
                title: format!("Save \u{a3}{savings:.2} with a {cheapest_type} ticket"),
                description: format!(
                    "The cheapest admissible fare is \u{a3}{cheapest_price:.2} ({cheapest_type}), {:.1}% below the most expensive option.",
                    fares.savings_percentage.unwrap_or(0.0)
                ),
                score: round1(score),
            });
        }
    }

    let time_score = (prediction.expected_delay_minutes / 6.0).clamp(0.0, 10.0);
    if prediction.expected_delay_minutes > 0.0 {
        recommendations.push(Recommendation {
            option: RecommendationTag::Time,
            title: "Build in time for delays".to_string(),
            description: format!(
                "This service is expected to run about {:.1} minutes late; an earlier departure protects tight connections.",
                prediction.expected_delay_minutes
            ),
            score: round1(time_score),
        });
    }

    if let Some(money) = money_score {
        let balanced = round1(money * 0.5 + time_score * 0.5);
        recommendations.push(Recommendation {
            option: RecommendationTag::Balanced,
            title: "Balance price and punctuality".to_string(),
            description: format!(
                "Weighs the {:.1}-point saving against the {:.1}-point delay risk for this departure.",
                round1(money),
                round1(time_score)
            ),
            score: balanced,
        });
    }

    recommendations.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.option.priority().cmp(&b.option.priority()))
    });
    recommendations.truncate(3);
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::{Confidence, LadderLevel, Prediction};

    fn prediction(expected_delay: f64) -> Prediction {
        Prediction {
            expected_delay_minutes: expected_delay,
            on_time_probability: 0.7,
            ppm5_probability: 0.7,
            ppm15_probability: 0.9,
            severe_delay_probability: 0.02,
            confidence: Confidence::High,
            sample_size: 500,
            level: LadderLevel::Route,
            is_degraded: false,
            degradation_reason: None,
            time_adjustment_factor: 1.0,
            day_adjustment_factor: 1.0,
            explanation: String::new(),
        }
    }

    fn fares(savings_pct: f64) -> FareComparison {
        FareComparison {
            fares: Vec::new(),
            cheapest_type: Some("advance".into()),
            cheapest_price: Some(25.50),
            savings_amount: Some(63.50),
            savings_percentage: Some(savings_pct),
            data_source: "NRDP_REAL".into(),
            last_updated: None,
        }
    }

    #[test]
    fn money_score_is_savings_over_ten_capped() {
        let recs = build_recommendations(&prediction(0.0), Some(&fares(71.3)));
        let money = recs
            .iter()
            .find(|r| r.option == RecommendationTag::Money)
            .unwrap();
        assert!((money.score - 7.1).abs() < 1e-9);

        let recs = build_recommendations(&prediction(0.0), Some(&fares(250.0)));
        let money = recs
            .iter()
            .find(|r| r.option == RecommendationTag::Money)
            .unwrap();
        assert_eq!(money.score, 10.0);
    }

    #[test]
    fn time_score_is_delay_over_six_capped() {
        let recs = build_recommendations(&prediction(12.0), None);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].option, RecommendationTag::Time);
        assert_eq!(recs[0].score, 2.0);

        let recs = build_recommendations(&prediction(90.0), None);
        assert_eq!(recs[0].score, 10.0);
    }

    #[test]
    fn ordering_is_score_then_tag() {
        // savings 60% -> money 6.0; delay 36 -> time 6.0; balanced 6.0.
        let recs = build_recommendations(&prediction(36.0), Some(&fares(60.0)));
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].option, RecommendationTag::Money);
        assert_eq!(recs[1].option, RecommendationTag::Time);
        assert_eq!(recs[2].option, RecommendationTag::Balanced);
    }

    #[test]
    fn no_fares_means_no_money_or_balanced() {
        let recs = build_recommendations(&prediction(6.0), None);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].option, RecommendationTag::Time);
    }
}
